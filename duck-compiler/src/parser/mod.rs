use anyhow::{bail, Result};

use crate::ast::*;
use crate::diagnostics::Diagnostics;
use crate::error::ScriptError;
use crate::lexer::{Keyword, Token, TokenKind};
use crate::source::SourceFile;

#[derive(Copy, Clone, PartialEq, PartialOrd)]
enum Precedence {
    Lowest = 0,
    Assignment,
    Or,
    And,
    Equality,
    Comparison,
    BitOr,
    BitXor,
    BitAnd,
    Term,
    Factor,
    Prefix,
}

impl Precedence {
    fn of(kind: &TokenKind) -> Option<Self> {
        match kind {
            TokenKind::Equal => Some(Precedence::Assignment),
            TokenKind::Keyword(Keyword::Or) => Some(Precedence::Or),
            TokenKind::Keyword(Keyword::And) => Some(Precedence::And),
            TokenKind::DoubleEqual | TokenKind::BangEqual => Some(Precedence::Equality),
            TokenKind::Greater
            | TokenKind::GreaterEqual
            | TokenKind::Less
            | TokenKind::LessEqual => Some(Precedence::Comparison),
            TokenKind::Pipe => Some(Precedence::BitOr),
            TokenKind::Caret => Some(Precedence::BitXor),
            TokenKind::Ampersand => Some(Precedence::BitAnd),
            TokenKind::Plus | TokenKind::Minus => Some(Precedence::Term),
            TokenKind::Star | TokenKind::Slash => Some(Precedence::Factor),
            _ => None,
        }
    }
}

pub struct Parser<'a> {
    _source: &'a SourceFile,
    tokens: Vec<Token>,
    current: usize,
    diagnostics: Diagnostics,
    function_depth: usize,
}

impl<'a> Parser<'a> {
    pub fn new(source: &'a SourceFile, tokens: Vec<Token>) -> Self {
        Self {
            _source: source,
            tokens,
            current: 0,
            diagnostics: Diagnostics::new(),
            function_depth: 0,
        }
    }

    fn span_from_token(token: &Token) -> SourceSpan {
        let len = token.lexeme.chars().count().max(1);
        SourceSpan::new(
            token.line,
            token.column,
            token.line,
            token.column + len.saturating_sub(1),
        )
    }

    fn make_expression(span: SourceSpan, kind: ExpressionKind) -> Expression {
        Expression { span, kind }
    }

    fn union_spans(a: &SourceSpan, b: &SourceSpan) -> SourceSpan {
        SourceSpan::union(a, b)
    }

    /// Parses the whole token stream. The first syntax error stops parsing and is recorded as a
    /// diagnostic at the offending token.
    pub fn parse(&mut self) -> Result<Module> {
        let mut statements = Vec::new();

        while !self.is_at_end() {
            match self.parse_statement() {
                Ok(statement) => statements.push(statement),
                Err(err) => {
                    let span = Self::span_from_token(self.peek());
                    return Err(self
                        .diagnostics
                        .fail(ScriptError::Syntax(err.to_string()), Some(span)));
                }
            }
        }

        Ok(Module::new(statements))
    }

    pub fn into_diagnostics(self) -> Diagnostics {
        self.diagnostics
    }

    fn parse_statement(&mut self) -> Result<Statement> {
        match self.peek_kind() {
            TokenKind::Keyword(Keyword::Var) => self.parse_var(),
            TokenKind::Keyword(Keyword::Struct) => self.parse_struct(),
            TokenKind::Keyword(Keyword::If) => self.parse_conditional(),
            TokenKind::Keyword(Keyword::While) => self.parse_loop(),
            TokenKind::Keyword(Keyword::Return) => self.parse_return(),
            TokenKind::LBrace => {
                let (block, span) = self.parse_braced_block()?;
                Ok(Statement::Block(BlockStatement { span, block }))
            }
            _ => self.parse_expression_statement(),
        }
    }

    fn parse_var(&mut self) -> Result<Statement> {
        let var_token = self.advance().clone();
        let name_token = self.peek().clone();
        self.expect_token(TokenKind::Identifier, "expected variable name after 'var'")?;

        let initializer = if matches!(self.peek_kind(), TokenKind::Equal) {
            self.advance();
            Some(self.parse_expression()?)
        } else {
            None
        };
        self.expect_token(TokenKind::Semicolon, "expected ';' after variable declaration")?;

        let span = Self::union_spans(
            &Self::span_from_token(&var_token),
            &Self::span_from_token(&name_token),
        );
        Ok(Statement::Var(VarStatement {
            name: name_token.lexeme,
            span,
            initializer,
        }))
    }

    fn parse_struct(&mut self) -> Result<Statement> {
        let struct_token = self.advance().clone();
        let name_token = self.peek().clone();
        self.expect_token(TokenKind::Identifier, "expected struct name after 'struct'")?;
        self.expect_token(TokenKind::LBrace, "expected '{' after struct name")?;
        let fields = self.parse_struct_fields()?;
        let closing_token = self.tokens[self.current - 1].clone();
        if matches!(self.peek_kind(), TokenKind::Semicolon) {
            self.advance();
        }

        let span = Self::union_spans(
            &Self::span_from_token(&struct_token),
            &Self::span_from_token(&closing_token),
        );
        Ok(Statement::Struct(StructStatement {
            name: name_token.lexeme,
            span,
            fields,
        }))
    }

    /// Parses `name[: value]` entries up to and including the closing brace. Commas are optional.
    fn parse_struct_fields(&mut self) -> Result<Vec<StructField>> {
        let mut fields = Vec::new();

        loop {
            match self.peek_kind() {
                TokenKind::RBrace => {
                    self.advance();
                    return Ok(fields);
                }
                TokenKind::Comma => {
                    self.advance();
                }
                TokenKind::Identifier => {
                    let name_token = self.advance().clone();
                    let value = if matches!(self.peek_kind(), TokenKind::Colon) {
                        self.advance();
                        Some(self.parse_expression_prec(Precedence::Assignment)?)
                    } else {
                        None
                    };
                    fields.push(StructField {
                        name: name_token.lexeme.clone(),
                        span: Self::span_from_token(&name_token),
                        value,
                    });
                }
                _ => {
                    let token = self.peek().clone();
                    bail!(
                        "expected field name or '}}' at line {}, column {} (found '{}')",
                        token.line,
                        token.column,
                        token.lexeme
                    );
                }
            }
        }
    }

    fn parse_conditional(&mut self) -> Result<Statement> {
        let if_token = self.advance().clone();
        let condition = self.parse_parenthesized_condition("if")?;
        let consequent = self.parse_statement()?;

        let alternative = if matches!(self.peek_kind(), TokenKind::Keyword(Keyword::Else)) {
            self.advance();
            Some(Box::new(self.parse_statement()?))
        } else {
            None
        };

        let end_span = alternative
            .as_ref()
            .map(|statement| statement.span())
            .unwrap_or_else(|| consequent.span());
        Ok(Statement::Conditional(ConditionalStatement {
            span: Self::union_spans(&Self::span_from_token(&if_token), &end_span),
            condition,
            consequent: Box::new(consequent),
            alternative,
        }))
    }

    fn parse_loop(&mut self) -> Result<Statement> {
        let while_token = self.advance().clone();
        let condition = self.parse_parenthesized_condition("while")?;
        let body = self.parse_statement()?;

        Ok(Statement::Loop(LoopStatement {
            span: Self::union_spans(&Self::span_from_token(&while_token), &body.span()),
            condition,
            body: Box::new(body),
        }))
    }

    fn parse_parenthesized_condition(&mut self, keyword: &str) -> Result<Expression> {
        self.expect_token(
            TokenKind::LParen,
            &format!("expected '(' after '{keyword}'"),
        )?;
        let condition = self.parse_expression()?;
        self.expect_token(TokenKind::RParen, "expected ')' after condition")?;
        Ok(condition)
    }

    fn parse_return(&mut self) -> Result<Statement> {
        let return_token = self.advance().clone();
        let span = Self::span_from_token(&return_token);
        if self.function_depth == 0 {
            bail!(
                "'return' outside of a function at line {}, column {}",
                return_token.line,
                return_token.column
            );
        }

        let expression = if matches!(self.peek_kind(), TokenKind::Semicolon) {
            None
        } else {
            Some(self.parse_expression()?)
        };
        self.expect_token(TokenKind::Semicolon, "expected ';' after return statement")?;

        Ok(Statement::Return(ReturnStatement { span, expression }))
    }

    fn parse_expression_statement(&mut self) -> Result<Statement> {
        let expression = self.parse_expression()?;
        self.expect_token(TokenKind::Semicolon, "expected ';' after expression")?;
        Ok(Statement::Expression(ExpressionStatement { expression }))
    }

    fn parse_braced_block(&mut self) -> Result<(Block, SourceSpan)> {
        let open_token = self.peek().clone();
        self.expect_token(TokenKind::LBrace, "expected '{' to start block")?;

        let mut statements = Vec::new();
        while !matches!(self.peek_kind(), TokenKind::RBrace) {
            if self.is_at_end() {
                bail!(
                    "unterminated block starting at line {}, column {}",
                    open_token.line,
                    open_token.column
                );
            }
            statements.push(self.parse_statement()?);
        }
        let closing_token = self.advance().clone();

        let span = Self::union_spans(
            &Self::span_from_token(&open_token),
            &Self::span_from_token(&closing_token),
        );
        Ok((Block { statements }, span))
    }

    fn parse_expression(&mut self) -> Result<Expression> {
        self.parse_expression_prec(Precedence::Lowest)
    }

    fn parse_expression_prec(&mut self, precedence: Precedence) -> Result<Expression> {
        let mut expr = self.parse_prefix_expression()?;

        loop {
            match self.peek_kind() {
                TokenKind::LParen => {
                    expr = self.finish_call(expr)?;
                    continue;
                }
                TokenKind::LBracket => {
                    expr = self.finish_index(expr)?;
                    continue;
                }
                TokenKind::Dot => {
                    expr = self.finish_member(expr)?;
                    continue;
                }
                _ => {}
            }

            let next_precedence = match Precedence::of(self.peek_kind()) {
                Some(p) => p,
                None => break,
            };

            if precedence >= next_precedence {
                break;
            }

            expr = self.parse_infix_expression(expr, next_precedence)?;
        }

        Ok(expr)
    }

    fn parse_prefix_expression(&mut self) -> Result<Expression> {
        let token = self.advance().clone();
        let token_span = Self::span_from_token(&token);
        match token.kind {
            TokenKind::Identifier => Ok(Self::make_expression(
                token_span,
                ExpressionKind::Identifier(Identifier {
                    name: token.lexeme,
                    span: token_span,
                }),
            )),
            TokenKind::NumberLiteral(value) => Ok(Self::make_expression(
                token_span,
                ExpressionKind::Literal(Literal::Number(value)),
            )),
            TokenKind::StringLiteral(ref string) => Ok(Self::make_expression(
                token_span,
                ExpressionKind::Literal(Literal::String(string.clone())),
            )),
            TokenKind::BooleanLiteral(value) => Ok(Self::make_expression(
                token_span,
                ExpressionKind::Literal(Literal::Boolean(value)),
            )),
            TokenKind::Keyword(Keyword::Nil) => Ok(Self::make_expression(
                token_span,
                ExpressionKind::Literal(Literal::Nil),
            )),
            TokenKind::Minus => self.finish_unary(token_span, UnaryOperator::Negative),
            TokenKind::Keyword(Keyword::Not) => self.finish_unary(token_span, UnaryOperator::Not),
            TokenKind::Tilde => self.finish_unary(token_span, UnaryOperator::BitNot),
            TokenKind::Keyword(Keyword::Ref) => {
                let operand = self.parse_expression_prec(Precedence::Prefix)?;
                let span = Self::union_spans(&token_span, &operand.span);
                Ok(Self::make_expression(
                    span,
                    ExpressionKind::Reference(Box::new(operand)),
                ))
            }
            TokenKind::LParen => {
                let expr = self.parse_expression()?;
                let closing_token = self.peek().clone();
                self.expect_token(TokenKind::RParen, "expected ')' after expression")?;
                let closing_span = Self::span_from_token(&closing_token);
                let span =
                    Self::union_spans(&token_span, &Self::union_spans(&expr.span, &closing_span));
                Ok(Self::make_expression(
                    span,
                    ExpressionKind::Grouping(Box::new(expr)),
                ))
            }
            TokenKind::LBracket => self.parse_array_literal(token_span),
            TokenKind::LBrace => {
                let fields = self.parse_struct_fields()?;
                let closing_span = Self::span_from_token(&self.tokens[self.current - 1]);
                Ok(Self::make_expression(
                    Self::union_spans(&token_span, &closing_span),
                    ExpressionKind::Struct(StructLiteral { fields }),
                ))
            }
            TokenKind::Keyword(Keyword::Fn) => self.parse_function_literal(token_span),
            TokenKind::Eof => bail!(
                "unexpected end of input at line {}, column {}",
                token.line,
                token.column
            ),
            _ => bail!(
                "unexpected token '{}' at line {}, column {}",
                token.lexeme,
                token.line,
                token.column
            ),
        }
    }

    fn finish_unary(&mut self, token_span: SourceSpan, operator: UnaryOperator) -> Result<Expression> {
        let operand = self.parse_expression_prec(Precedence::Prefix)?;
        let span = Self::union_spans(&token_span, &operand.span);
        Ok(Self::make_expression(
            span,
            ExpressionKind::Unary(UnaryExpression {
                operator,
                operand: Box::new(operand),
            }),
        ))
    }

    fn parse_array_literal(&mut self, opening_span: SourceSpan) -> Result<Expression> {
        let mut elements = Vec::new();

        if !matches!(self.peek_kind(), TokenKind::RBracket) {
            loop {
                elements.push(self.parse_expression()?);
                if matches!(self.peek_kind(), TokenKind::Comma) {
                    self.advance();
                    if matches!(self.peek_kind(), TokenKind::RBracket) {
                        break;
                    }
                } else {
                    break;
                }
            }
        }

        let closing_token = self.peek().clone();
        self.expect_token(TokenKind::RBracket, "expected ']' after array elements")?;
        let span = Self::union_spans(&opening_span, &Self::span_from_token(&closing_token));
        Ok(Self::make_expression(
            span,
            ExpressionKind::Array(ArrayLiteral { elements }),
        ))
    }

    fn parse_function_literal(&mut self, fn_span: SourceSpan) -> Result<Expression> {
        self.expect_token(TokenKind::LParen, "expected '(' after 'fn'")?;

        let mut parameters = Vec::new();
        if !matches!(self.peek_kind(), TokenKind::RParen) {
            loop {
                let name_token = self.peek().clone();
                self.expect_token(TokenKind::Identifier, "expected parameter name")?;
                parameters.push(Identifier {
                    name: name_token.lexeme.clone(),
                    span: Self::span_from_token(&name_token),
                });
                if matches!(self.peek_kind(), TokenKind::Comma) {
                    self.advance();
                } else {
                    break;
                }
            }
        }
        self.expect_token(TokenKind::RParen, "expected ')' after parameters")?;

        self.function_depth += 1;
        let body = self.parse_braced_block();
        self.function_depth -= 1;
        let (body, body_span) = body?;

        Ok(Self::make_expression(
            Self::union_spans(&fn_span, &body_span),
            ExpressionKind::Function(FunctionExpression { parameters, body }),
        ))
    }

    fn parse_infix_expression(
        &mut self,
        left: Expression,
        precedence: Precedence,
    ) -> Result<Expression> {
        let operator_token = self.advance().clone();
        let operator_span = Self::span_from_token(&operator_token);
        match operator_token.kind {
            TokenKind::Equal => {
                if !matches!(
                    left.kind,
                    ExpressionKind::Identifier(_)
                        | ExpressionKind::Index(_)
                        | ExpressionKind::Member(_)
                ) {
                    bail!(
                        "invalid assignment target at line {}, column {}",
                        operator_token.line,
                        operator_token.column
                    );
                }
                // Right associative: `a = b = c` assigns `b` first.
                let value = self.parse_expression_prec(Precedence::Lowest)?;
                let span =
                    Self::union_spans(&Self::union_spans(&left.span, &operator_span), &value.span);
                Ok(Self::make_expression(
                    span,
                    ExpressionKind::Assignment(AssignmentExpression {
                        target: Box::new(left),
                        value: Box::new(value),
                    }),
                ))
            }
            ref kind => {
                let operator = binary_operator_from_token(kind)?;
                let right = self.parse_expression_prec(precedence)?;
                let span =
                    Self::union_spans(&Self::union_spans(&left.span, &operator_span), &right.span);
                Ok(Self::make_expression(
                    span,
                    ExpressionKind::Binary(BinaryExpression {
                        operator,
                        left: Box::new(left),
                        right: Box::new(right),
                    }),
                ))
            }
        }
    }

    fn expect_token(&mut self, expected: TokenKind, message: &str) -> Result<()> {
        if std::mem::discriminant(self.peek_kind()) == std::mem::discriminant(&expected) {
            self.advance();
            Ok(())
        } else {
            let token = self.peek().clone();
            bail!(
                "{} at line {}, column {} (found '{}')",
                message,
                token.line,
                token.column,
                token.lexeme
            );
        }
    }

    fn finish_call(&mut self, callee: Expression) -> Result<Expression> {
        self.expect_token(TokenKind::LParen, "expected '(' to start argument list")?;

        let mut arguments = Vec::new();
        if !matches!(self.peek_kind(), TokenKind::RParen) {
            loop {
                arguments.push(self.parse_expression()?);
                if matches!(self.peek_kind(), TokenKind::Comma) {
                    self.advance();
                } else {
                    break;
                }
            }
        }

        let closing_token = self.peek().clone();
        self.expect_token(TokenKind::RParen, "expected ')' after arguments")?;
        let span = Self::union_spans(&callee.span, &Self::span_from_token(&closing_token));
        Ok(Self::make_expression(
            span,
            ExpressionKind::Call(CallExpression {
                callee: Box::new(callee),
                arguments,
            }),
        ))
    }

    fn finish_index(&mut self, object: Expression) -> Result<Expression> {
        self.expect_token(TokenKind::LBracket, "expected '[' for index expression")?;
        let index = self.parse_expression()?;
        let closing_token = self.peek().clone();
        self.expect_token(TokenKind::RBracket, "expected ']' after index expression")?;

        let span = Self::union_spans(&object.span, &Self::span_from_token(&closing_token));
        Ok(Self::make_expression(
            span,
            ExpressionKind::Index(IndexExpression {
                object: Box::new(object),
                index: Box::new(index),
            }),
        ))
    }

    fn finish_member(&mut self, object: Expression) -> Result<Expression> {
        self.expect_token(TokenKind::Dot, "expected '.' for member access")?;
        let name_token = self.peek().clone();
        self.expect_token(TokenKind::Identifier, "expected field name after '.'")?;
        let property_span = Self::span_from_token(&name_token);

        let span = Self::union_spans(&object.span, &property_span);
        Ok(Self::make_expression(
            span,
            ExpressionKind::Member(MemberExpression {
                object: Box::new(object),
                property: name_token.lexeme,
                property_span,
            }),
        ))
    }

    fn peek(&self) -> &Token {
        &self.tokens[self.current]
    }

    fn peek_kind(&self) -> &TokenKind {
        &self.tokens[self.current].kind
    }

    fn advance(&mut self) -> &Token {
        if !self.is_at_end() {
            self.current += 1;
            return &self.tokens[self.current - 1];
        }
        &self.tokens[self.current]
    }

    fn is_at_end(&self) -> bool {
        matches!(self.peek_kind(), TokenKind::Eof)
    }
}

fn binary_operator_from_token(kind: &TokenKind) -> Result<BinaryOperator> {
    let operator = match kind {
        TokenKind::Plus => BinaryOperator::Add,
        TokenKind::Minus => BinaryOperator::Subtract,
        TokenKind::Star => BinaryOperator::Multiply,
        TokenKind::Slash => BinaryOperator::Divide,
        TokenKind::DoubleEqual => BinaryOperator::Equal,
        TokenKind::BangEqual => BinaryOperator::NotEqual,
        TokenKind::Greater => BinaryOperator::Greater,
        TokenKind::GreaterEqual => BinaryOperator::GreaterEqual,
        TokenKind::Less => BinaryOperator::Less,
        TokenKind::LessEqual => BinaryOperator::LessEqual,
        TokenKind::Keyword(Keyword::And) => BinaryOperator::And,
        TokenKind::Keyword(Keyword::Or) => BinaryOperator::Or,
        TokenKind::Ampersand => BinaryOperator::BitAnd,
        TokenKind::Pipe => BinaryOperator::BitOr,
        TokenKind::Caret => BinaryOperator::BitXor,
        other => bail!("unsupported binary operator {:?}", other),
    };
    Ok(operator)
}
