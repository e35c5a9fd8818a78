use anyhow::{bail, Context, Result};

use crate::source::SourceFile;

#[derive(Debug, Clone)]
pub struct Token {
    pub kind: TokenKind,
    pub lexeme: String,
    pub line: usize,
    pub column: usize,
}

impl Token {
    fn new(kind: TokenKind, lexeme: String, line: usize, column: usize) -> Self {
        Self {
            kind,
            lexeme,
            line,
            column,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    Identifier,
    NumberLiteral(f64),
    StringLiteral(String),
    BooleanLiteral(bool),
    Keyword(Keyword),
    LParen,
    RParen,
    LBrace,
    RBrace,
    LBracket,
    RBracket,
    Comma,
    Dot,
    Colon,
    Semicolon,
    Equal,
    DoubleEqual,
    BangEqual,
    Greater,
    GreaterEqual,
    Less,
    LessEqual,
    Plus,
    Minus,
    Star,
    Slash,
    Ampersand,
    Pipe,
    Caret,
    Tilde,
    Eof,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Keyword {
    Var,
    If,
    Else,
    While,
    Fn,
    Return,
    Struct,
    Ref,
    And,
    Or,
    Not,
    Nil,
}

pub struct Lexer<'a> {
    input: &'a str,
    position: usize,
    line: usize,
    column: usize,
}

impl<'a> Lexer<'a> {
    pub fn new(source: &'a SourceFile) -> Result<Self> {
        Ok(Self {
            input: &source.contents,
            position: 0,
            line: 1,
            column: 1,
        })
    }

    pub fn tokenize(&mut self) -> Result<Vec<Token>> {
        let mut tokens = Vec::new();

        while let Some(ch) = self.peek_char() {
            match ch {
                ' ' | '\t' | '\r' | '\n' => {
                    self.advance_char();
                }
                '#' => {
                    self.skip_comment();
                }
                '"' => {
                    let token = self.lex_string()?;
                    tokens.push(token);
                }
                '0'..='9' => {
                    let token = self.lex_number()?;
                    tokens.push(token);
                }
                'a'..='z' | 'A'..='Z' | '_' => {
                    let token = self.lex_identifier_or_keyword();
                    tokens.push(token);
                }
                '(' => tokens.push(self.simple_token(TokenKind::LParen)),
                ')' => tokens.push(self.simple_token(TokenKind::RParen)),
                '{' => tokens.push(self.simple_token(TokenKind::LBrace)),
                '}' => tokens.push(self.simple_token(TokenKind::RBrace)),
                '[' => tokens.push(self.simple_token(TokenKind::LBracket)),
                ']' => tokens.push(self.simple_token(TokenKind::RBracket)),
                ',' => tokens.push(self.simple_token(TokenKind::Comma)),
                '.' => tokens.push(self.simple_token(TokenKind::Dot)),
                ';' => tokens.push(self.simple_token(TokenKind::Semicolon)),
                ':' => tokens.push(self.simple_token(TokenKind::Colon)),
                '+' => tokens.push(self.simple_token(TokenKind::Plus)),
                '-' => tokens.push(self.simple_token(TokenKind::Minus)),
                '*' => tokens.push(self.simple_token(TokenKind::Star)),
                '/' => tokens.push(self.simple_token(TokenKind::Slash)),
                '&' => tokens.push(self.simple_token(TokenKind::Ampersand)),
                '|' => tokens.push(self.simple_token(TokenKind::Pipe)),
                '^' => tokens.push(self.simple_token(TokenKind::Caret)),
                '~' => tokens.push(self.simple_token(TokenKind::Tilde)),
                '=' => {
                    let token = self.lex_with_equal(TokenKind::Equal, TokenKind::DoubleEqual);
                    tokens.push(token);
                }
                '>' => {
                    let token = self.lex_with_equal(TokenKind::Greater, TokenKind::GreaterEqual);
                    tokens.push(token);
                }
                '<' => {
                    let token = self.lex_with_equal(TokenKind::Less, TokenKind::LessEqual);
                    tokens.push(token);
                }
                '!' if self.peek_next_char() == Some('=') => {
                    let start_line = self.line;
                    let start_column = self.column;
                    self.advance_char();
                    self.advance_char();
                    tokens.push(Token::new(
                        TokenKind::BangEqual,
                        "!=".to_string(),
                        start_line,
                        start_column,
                    ));
                }
                other => {
                    bail!(
                        "Unexpected character '{}' at line {}, column {}",
                        other,
                        self.line,
                        self.column
                    );
                }
            }
        }

        tokens.push(Token::new(
            TokenKind::Eof,
            String::new(),
            self.line,
            self.column,
        ));

        Ok(tokens)
    }

    fn skip_comment(&mut self) {
        while let Some(ch) = self.peek_char() {
            if ch == '\n' {
                break;
            }
            self.advance_char();
        }
    }

    fn lex_string(&mut self) -> Result<Token> {
        let start = self.position;
        let start_line = self.line;
        let start_column = self.column;
        self.advance_char(); // opening quote

        let mut value = String::new();
        while let Some(ch) = self.peek_char() {
            match ch {
                '"' => {
                    self.advance_char();
                    let lexeme = self.slice(start, self.position);
                    return Ok(Token::new(
                        TokenKind::StringLiteral(value),
                        lexeme.to_string(),
                        start_line,
                        start_column,
                    ));
                }
                '\\' => {
                    self.advance_char();
                    let escaped = self
                        .peek_char()
                        .context("Unterminated escape sequence in string literal")?;
                    let escaped_char = match escaped {
                        '"' => '"',
                        '\\' => '\\',
                        'n' => '\n',
                        'r' => '\r',
                        't' => '\t',
                        other => bail!(
                            "Unknown escape sequence '\\{}' at line {}, column {}",
                            other,
                            self.line,
                            self.column
                        ),
                    };
                    value.push(escaped_char);
                    self.advance_char();
                }
                _ => {
                    value.push(ch);
                    self.advance_char();
                }
            }
        }

        bail!(
            "Unterminated string literal starting at line {}, column {}",
            start_line,
            start_column
        );
    }

    fn lex_number(&mut self) -> Result<Token> {
        let start = self.position;
        let start_line = self.line;
        let start_column = self.column;

        self.consume_digits();
        if self.peek_char() == Some('.') {
            if !matches!(self.peek_next_char(), Some('0'..='9')) {
                bail!(
                    "Expected digits after '.' in number literal at line {}, column {}",
                    start_line,
                    start_column
                );
            }
            self.advance_char();
            self.consume_digits();
        }

        let lexeme = self.slice(start, self.position).to_string();
        let value = lexeme.parse::<f64>().with_context(|| {
            format!(
                "Failed to parse number literal '{}' at line {}, column {}",
                lexeme, start_line, start_column
            )
        })?;
        Ok(Token::new(
            TokenKind::NumberLiteral(value),
            lexeme,
            start_line,
            start_column,
        ))
    }

    fn consume_digits(&mut self) {
        while matches!(self.peek_char(), Some('0'..='9')) {
            self.advance_char();
        }
    }

    fn lex_identifier_or_keyword(&mut self) -> Token {
        let start = self.position;
        let start_line = self.line;
        let start_column = self.column;
        self.advance_char();

        while let Some(ch) = self.peek_char() {
            if ch.is_ascii_alphanumeric() || ch == '_' {
                self.advance_char();
            } else {
                break;
            }
        }

        let lexeme = self.slice(start, self.position).to_string();
        let kind = match lexeme.as_str() {
            "true" => TokenKind::BooleanLiteral(true),
            "false" => TokenKind::BooleanLiteral(false),
            other => keyword_from_lexeme(other)
                .map(TokenKind::Keyword)
                .unwrap_or(TokenKind::Identifier),
        };
        Token::new(kind, lexeme, start_line, start_column)
    }

    fn lex_with_equal(&mut self, single: TokenKind, with_equal: TokenKind) -> Token {
        let start_line = self.line;
        let start_column = self.column;
        let start = self.position;
        self.advance_char();

        let kind = if self.peek_char() == Some('=') {
            self.advance_char();
            with_equal
        } else {
            single
        };
        Token::new(
            kind,
            self.slice(start, self.position).to_string(),
            start_line,
            start_column,
        )
    }

    fn simple_token(&mut self, kind: TokenKind) -> Token {
        let start_line = self.line;
        let start_column = self.column;
        let start = self.position;
        self.advance_char();
        Token::new(
            kind,
            self.slice(start, self.position).to_string(),
            start_line,
            start_column,
        )
    }

    fn peek_char(&self) -> Option<char> {
        self.input[self.position..].chars().next()
    }

    fn peek_next_char(&self) -> Option<char> {
        let mut iter = self.input[self.position..].chars();
        iter.next()?;
        iter.next()
    }

    fn advance_char(&mut self) -> Option<char> {
        let ch = self.peek_char()?;
        self.position += ch.len_utf8();
        if ch == '\n' {
            self.line += 1;
            self.column = 1;
        } else if ch != '\r' {
            self.column += 1;
        }
        Some(ch)
    }

    fn slice(&self, start: usize, end: usize) -> &str {
        &self.input[start..end]
    }
}

fn keyword_from_lexeme(lexeme: &str) -> Option<Keyword> {
    match lexeme {
        "var" => Some(Keyword::Var),
        "if" => Some(Keyword::If),
        "else" => Some(Keyword::Else),
        "while" => Some(Keyword::While),
        "fn" => Some(Keyword::Fn),
        "return" => Some(Keyword::Return),
        "struct" => Some(Keyword::Struct),
        "ref" => Some(Keyword::Ref),
        "and" => Some(Keyword::And),
        "or" => Some(Keyword::Or),
        "not" => Some(Keyword::Not),
        "nil" => Some(Keyword::Nil),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::SourceId;

    fn kinds(source: &str) -> Result<Vec<TokenKind>> {
        let file = SourceFile::anonymous(SourceId(0), source);
        let mut lexer = Lexer::new(&file)?;
        Ok(lexer
            .tokenize()?
            .into_iter()
            .map(|token| token.kind)
            .collect())
    }

    #[test]
    fn lexes_operators_and_keywords() -> Result<()> {
        let kinds = kinds("var x = ref a[1] != ~b & c;")?;
        assert_eq!(
            kinds,
            vec![
                TokenKind::Keyword(Keyword::Var),
                TokenKind::Identifier,
                TokenKind::Equal,
                TokenKind::Keyword(Keyword::Ref),
                TokenKind::Identifier,
                TokenKind::LBracket,
                TokenKind::NumberLiteral(1.0),
                TokenKind::RBracket,
                TokenKind::BangEqual,
                TokenKind::Tilde,
                TokenKind::Identifier,
                TokenKind::Ampersand,
                TokenKind::Identifier,
                TokenKind::Semicolon,
                TokenKind::Eof,
            ]
        );
        Ok(())
    }

    #[test]
    fn skips_comments_and_tracks_lines() -> Result<()> {
        let file = SourceFile::anonymous(SourceId(0), "# header\nx = 2.5; # trailing\n  \"a\\n\"");
        let tokens = Lexer::new(&file)?.tokenize()?;
        assert_eq!(tokens[0].lexeme, "x");
        assert_eq!((tokens[0].line, tokens[0].column), (2, 1));
        assert_eq!(tokens[2].kind, TokenKind::NumberLiteral(2.5));
        assert_eq!(tokens[4].kind, TokenKind::StringLiteral("a\n".into()));
        assert_eq!((tokens[4].line, tokens[4].column), (3, 3));
        Ok(())
    }

    #[test]
    fn rejects_bad_input() {
        assert!(kinds("\"open").is_err());
        assert!(kinds("1.").is_err());
        let error = kinds("x = $;").unwrap_err();
        assert_eq!(
            error.to_string(),
            "Unexpected character '$' at line 1, column 5"
        );
    }
}
