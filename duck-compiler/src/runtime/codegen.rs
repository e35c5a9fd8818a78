use std::collections::{HashMap, HashSet};
use std::rc::Rc;

use anyhow::{bail, Result};
use log::debug;

use crate::ast::{
    AssignmentExpression, BinaryExpression, BinaryOperator, Block, CallExpression,
    ConditionalStatement, Expression, ExpressionKind, FunctionExpression, Literal,
    LoopStatement, Module, ReturnStatement, SourceSpan, Statement, StructField, StructStatement,
    UnaryExpression, UnaryOperator, VarStatement,
};
use crate::diagnostics::Diagnostics;
use crate::error::ScriptError;
use crate::resolver::{ScopeKind, Symbol, SymbolScope, SymbolTable};

use super::bytecode::{Chunk, Function, Instruction};
use super::value::{Closure, Value};

/// Lowers one module to a main function, consulting and extending the session's symbols.
pub struct CodeGenerator<'a> {
    symbols: &'a mut SymbolTable,
    diagnostics: Diagnostics,
    line: usize,
    single_bindings: HashSet<String>,
}

impl<'a> CodeGenerator<'a> {
    pub fn new(symbols: &'a mut SymbolTable) -> Self {
        Self {
            symbols,
            diagnostics: Diagnostics::new(),
            line: 1,
            single_bindings: HashSet::new(),
        }
    }

    pub fn into_diagnostics(self) -> Diagnostics {
        self.diagnostics
    }

    pub fn compile_module(&mut self, module: &Module) -> Result<Function> {
        self.symbols.begin_module();
        self.single_bindings = collect_single_bindings(module);

        let mut chunk = Chunk::new();
        self.compile_statements(&module.statements, &mut chunk)?;
        self.emit(&mut chunk, Instruction::Return(0));

        debug!(
            "compiled module: {} instructions, {} globals, {} top-level locals",
            chunk.len(),
            self.symbols.global_count(),
            self.symbols.local_count()
        );
        Ok(Function {
            name: Some("<script>".to_string()),
            arity: 0,
            local_count: self.symbols.local_count(),
            captures: Vec::new(),
            chunk,
        })
    }

    fn emit(&self, chunk: &mut Chunk, instruction: Instruction) -> usize {
        chunk.emit(instruction, self.line)
    }

    fn emit_constant(&self, chunk: &mut Chunk, value: Value) -> usize {
        let index = chunk.add_constant(value);
        self.emit(chunk, Instruction::Constant(index))
    }

    fn fail(&mut self, span: SourceSpan, error: ScriptError) -> anyhow::Error {
        self.diagnostics.fail(error, Some(span))
    }

    fn compile_statements(&mut self, statements: &[Statement], chunk: &mut Chunk) -> Result<()> {
        let mut returned = false;
        for statement in statements {
            if returned {
                self.diagnostics
                    .warn("unreachable statement", Some(statement.span()));
                returned = false;
            }
            self.compile_statement(statement, chunk)?;
            if matches!(statement, Statement::Return(_)) {
                returned = true;
            }
        }
        Ok(())
    }

    fn compile_statement(&mut self, statement: &Statement, chunk: &mut Chunk) -> Result<()> {
        self.line = statement.span().line;
        match statement {
            Statement::Var(var) => self.compile_var(var, chunk),
            Statement::Struct(structure) => self.compile_struct(structure, chunk),
            Statement::Conditional(conditional) => self.compile_conditional(conditional, chunk),
            Statement::Loop(loop_stmt) => self.compile_loop(loop_stmt, chunk),
            Statement::Return(ret) => self.compile_return(ret, chunk),
            Statement::Block(block) => self.compile_block(&block.block, chunk),
            Statement::Expression(expr) => {
                self.compile_expression(&expr.expression, chunk)?;
                self.emit(chunk, Instruction::Pop);
                Ok(())
            }
        }
    }

    fn define(&mut self, name: &str, is_struct: bool, span: SourceSpan) -> Result<Symbol> {
        self.symbols
            .define(name, is_struct)
            .map_err(|err| match err.downcast::<ScriptError>() {
                Ok(error) => self.diagnostics.fail(error, Some(span)),
                Err(other) => other,
            })
    }

    fn emit_define(&self, chunk: &mut Chunk, symbol: &Symbol) {
        let instruction = match symbol.scope {
            SymbolScope::Global => Instruction::DefGlobal(symbol.index),
            _ => Instruction::DefLocal(symbol.index),
        };
        self.emit(chunk, instruction);
    }

    /// Defines `name` ahead of a function literal so the body can call itself.
    fn define_function_binding(
        &mut self,
        name: &str,
        function: &FunctionExpression,
        span: SourceSpan,
        chunk: &mut Chunk,
    ) -> Result<()> {
        let symbol = self.define(name, false, span)?;
        if self.single_bindings.contains(name) {
            self.symbols
                .set_arity(&symbol, Some(function.parameters.len()));
        }
        self.compile_function(function, Some(name.to_string()), chunk)?;
        self.emit_define(chunk, &symbol);
        Ok(())
    }

    fn compile_var(&mut self, statement: &VarStatement, chunk: &mut Chunk) -> Result<()> {
        match &statement.initializer {
            Some(Expression {
                kind: ExpressionKind::Function(function),
                ..
            }) => {
                self.define_function_binding(&statement.name, function, statement.span, chunk)?;
            }
            Some(initializer) => {
                self.compile_expression(initializer, chunk)?;
                let symbol = self.define(&statement.name, false, statement.span)?;
                self.emit_define(chunk, &symbol);
            }
            None => {
                self.emit_constant(chunk, Value::Nil);
                let symbol = self.define(&statement.name, false, statement.span)?;
                self.emit_define(chunk, &symbol);
            }
        }
        self.emit(chunk, Instruction::Pop);
        Ok(())
    }

    /// A struct declaration becomes a zero-argument constructor that builds a fresh instance.
    fn compile_struct(&mut self, statement: &StructStatement, chunk: &mut Chunk) -> Result<()> {
        let symbol = self.define(&statement.name, true, statement.span)?;

        self.symbols.enter_scope(ScopeKind::Function);
        let mut body = Chunk::new();
        let built = self.compile_struct_fields(&statement.fields, &mut body);
        let layout = self.symbols.exit_scope().unwrap_or_default();
        built?;
        self.emit(&mut body, Instruction::Return(1));

        let constructor = Function {
            name: Some(statement.name.clone()),
            arity: 0,
            local_count: layout.local_count,
            captures: layout.captures,
            chunk: body,
        };
        self.emit_closure(chunk, constructor);
        self.emit_define(chunk, &symbol);
        self.emit(chunk, Instruction::Pop);
        Ok(())
    }

    fn compile_struct_fields(&mut self, fields: &[StructField], chunk: &mut Chunk) -> Result<()> {
        for field in fields {
            self.emit_constant(chunk, Value::Str(field.name.clone()));
            match &field.value {
                Some(value) => self.compile_expression(value, chunk)?,
                None => {
                    self.emit_constant(chunk, Value::Nil);
                }
            }
        }
        self.emit(chunk, Instruction::MakeStruct(fields.len()));
        Ok(())
    }

    fn compile_conditional(
        &mut self,
        statement: &ConditionalStatement,
        chunk: &mut Chunk,
    ) -> Result<()> {
        self.compile_expression(&statement.condition, chunk)?;
        let then_jump = self.emit_jump(chunk, Instruction::JumpIfFalse(usize::MAX));
        self.compile_statement(&statement.consequent, chunk)?;

        let else_jump = if statement.alternative.is_some() {
            Some(self.emit_jump(chunk, Instruction::Jump(usize::MAX)))
        } else {
            None
        };

        self.patch_jump(chunk, then_jump)?;

        if let Some(alternative) = &statement.alternative {
            self.compile_statement(alternative, chunk)?;
            if let Some(jump) = else_jump {
                self.patch_jump(chunk, jump)?;
            }
        }

        Ok(())
    }

    fn compile_loop(&mut self, statement: &LoopStatement, chunk: &mut Chunk) -> Result<()> {
        let loop_start = chunk.len();
        self.compile_expression(&statement.condition, chunk)?;
        let exit_jump = self.emit_jump(chunk, Instruction::JumpIfFalse(usize::MAX));
        self.compile_statement(&statement.body, chunk)?;
        self.line = statement.span.line;
        self.emit(chunk, Instruction::Jump(loop_start));
        self.patch_jump(chunk, exit_jump)?;
        Ok(())
    }

    fn compile_return(&mut self, statement: &ReturnStatement, chunk: &mut Chunk) -> Result<()> {
        match &statement.expression {
            Some(expression) => {
                self.compile_expression(expression, chunk)?;
                self.emit(chunk, Instruction::Return(1));
            }
            None => {
                self.emit(chunk, Instruction::Return(0));
            }
        }
        Ok(())
    }

    fn compile_block(&mut self, block: &Block, chunk: &mut Chunk) -> Result<()> {
        self.symbols.enter_scope(ScopeKind::Block);
        let result = self.compile_statements(&block.statements, chunk);
        self.symbols.exit_scope();
        result
    }

    fn compile_expression(&mut self, expression: &Expression, chunk: &mut Chunk) -> Result<()> {
        match &expression.kind {
            ExpressionKind::Literal(literal) => {
                self.compile_literal(literal, chunk);
                Ok(())
            }
            ExpressionKind::Identifier(identifier) => {
                self.compile_load(&identifier.name, expression.span, chunk)
            }
            ExpressionKind::Grouping(inner) => self.compile_expression(inner, chunk),
            ExpressionKind::Array(array) => {
                for element in &array.elements {
                    self.compile_expression(element, chunk)?;
                }
                self.emit(chunk, Instruction::MakeArray(array.elements.len()));
                Ok(())
            }
            ExpressionKind::Struct(literal) => self.compile_struct_fields(&literal.fields, chunk),
            ExpressionKind::Unary(unary) => self.compile_unary(unary, chunk),
            ExpressionKind::Binary(binary) => self.compile_binary(binary, chunk),
            ExpressionKind::Call(call) => self.compile_call(call, expression.span, chunk),
            ExpressionKind::Member(member) => {
                self.compile_expression(&member.object, chunk)?;
                self.emit_constant(chunk, Value::Str(member.property.clone()));
                self.emit(chunk, Instruction::GetField);
                Ok(())
            }
            ExpressionKind::Index(index) => {
                self.compile_expression(&index.object, chunk)?;
                self.compile_expression(&index.index, chunk)?;
                self.emit(chunk, Instruction::GetIndex);
                Ok(())
            }
            ExpressionKind::Reference(operand) => {
                self.compile_reference(operand, expression.span, chunk)
            }
            ExpressionKind::Function(function) => self.compile_function(function, None, chunk),
            ExpressionKind::Assignment(assignment) => {
                self.compile_assignment(assignment, expression.span, chunk)
            }
        }
    }

    fn compile_literal(&mut self, literal: &Literal, chunk: &mut Chunk) {
        let value = match literal {
            Literal::Number(value) => Value::Number(*value),
            Literal::String(value) => Value::Str(value.clone()),
            Literal::Boolean(value) => Value::Bool(*value),
            Literal::Nil => Value::Nil,
        };
        self.emit_constant(chunk, value);
    }

    fn resolve(&mut self, name: &str, span: SourceSpan) -> Result<Symbol> {
        match self.symbols.resolve(name) {
            Some(symbol) => Ok(symbol),
            None => Err(self.fail(span, ScriptError::UndefinedVariable { name: name.into() })),
        }
    }

    fn compile_load(&mut self, name: &str, span: SourceSpan, chunk: &mut Chunk) -> Result<()> {
        let symbol = self.resolve(name, span)?;
        let instruction = match symbol.scope {
            SymbolScope::Global => Instruction::GetGlobal(symbol.index),
            SymbolScope::Local => Instruction::GetLocal(symbol.index),
            SymbolScope::Upvalue => Instruction::GetUpvalue(symbol.index),
            SymbolScope::Builtin => Instruction::GetBuiltin(symbol.index),
        };
        self.emit(chunk, instruction);
        if symbol.is_struct {
            self.emit(chunk, Instruction::Call(0));
        }
        Ok(())
    }

    fn compile_unary(&mut self, expression: &UnaryExpression, chunk: &mut Chunk) -> Result<()> {
        self.compile_expression(&expression.operand, chunk)?;
        let instruction = match expression.operator {
            UnaryOperator::Negative => Instruction::Minus,
            UnaryOperator::Not => Instruction::Not,
            UnaryOperator::BitNot => Instruction::BitNot,
        };
        self.emit(chunk, instruction);
        Ok(())
    }

    /// Operands are pushed right first so the VM pops the left operand first.
    fn compile_binary(&mut self, expression: &BinaryExpression, chunk: &mut Chunk) -> Result<()> {
        self.compile_expression(&expression.right, chunk)?;
        self.compile_expression(&expression.left, chunk)?;

        let (instruction, negate) = match expression.operator {
            BinaryOperator::Add => (Instruction::Add, false),
            BinaryOperator::Subtract => (Instruction::Sub, false),
            BinaryOperator::Multiply => (Instruction::Mul, false),
            BinaryOperator::Divide => (Instruction::Div, false),
            BinaryOperator::Equal => (Instruction::Equal, false),
            BinaryOperator::NotEqual => (Instruction::Equal, true),
            BinaryOperator::Greater => (Instruction::Greater, false),
            BinaryOperator::GreaterEqual => (Instruction::Less, true),
            BinaryOperator::Less => (Instruction::Less, false),
            BinaryOperator::LessEqual => (Instruction::Greater, true),
            BinaryOperator::And => (Instruction::And, false),
            BinaryOperator::Or => (Instruction::Or, false),
            BinaryOperator::BitAnd => (Instruction::BitAnd, false),
            BinaryOperator::BitOr => (Instruction::BitOr, false),
            BinaryOperator::BitXor => (Instruction::BitXor, false),
        };
        self.emit(chunk, instruction);
        if negate {
            self.emit(chunk, Instruction::Not);
        }
        Ok(())
    }

    fn compile_call(
        &mut self,
        call: &CallExpression,
        span: SourceSpan,
        chunk: &mut Chunk,
    ) -> Result<()> {
        if let ExpressionKind::Identifier(identifier) = &call.callee.kind {
            if let Some(expected) = self
                .symbols
                .resolve(&identifier.name)
                .and_then(|symbol| symbol.arity)
            {
                if expected != call.arguments.len() {
                    return Err(self.fail(
                        span,
                        ScriptError::ArityMismatch {
                            expected,
                            found: call.arguments.len(),
                        },
                    ));
                }
            }
        }

        self.compile_expression(&call.callee, chunk)?;
        for argument in &call.arguments {
            self.compile_expression(argument, chunk)?;
        }
        self.emit(chunk, Instruction::Call(call.arguments.len()));
        Ok(())
    }

    fn compile_reference(
        &mut self,
        operand: &Expression,
        span: SourceSpan,
        chunk: &mut Chunk,
    ) -> Result<()> {
        match &operand.kind {
            ExpressionKind::Grouping(inner) => self.compile_reference(inner, span, chunk),
            ExpressionKind::Identifier(identifier) => {
                let symbol = self.resolve(&identifier.name, operand.span)?;
                let instruction = match symbol.scope {
                    SymbolScope::Global => Instruction::RefGlobal(symbol.index),
                    SymbolScope::Local => Instruction::RefLocal(symbol.index),
                    SymbolScope::Upvalue => Instruction::RefUpvalue(symbol.index),
                    SymbolScope::Builtin => {
                        return Err(self.fail(
                            span,
                            ScriptError::invalid_reference(format!(
                                "cannot reference builtin '{}'",
                                identifier.name
                            )),
                        ))
                    }
                };
                // The binding may now change behind the name.
                self.symbols.set_arity(&symbol, None);
                self.emit(chunk, instruction);
                Ok(())
            }
            ExpressionKind::Index(index) => {
                let ExpressionKind::Identifier(identifier) = &index.object.kind else {
                    return Err(self.fail(
                        span,
                        ScriptError::invalid_reference("indexed references need a variable"),
                    ));
                };
                let symbol = self.resolve(&identifier.name, index.object.span)?;
                let instruction = match symbol.scope {
                    SymbolScope::Global => Instruction::RefIndexGlobal(symbol.index),
                    SymbolScope::Local => Instruction::RefIndexLocal(symbol.index),
                    SymbolScope::Upvalue => Instruction::RefIndexUpvalue(symbol.index),
                    SymbolScope::Builtin => {
                        return Err(self.fail(
                            span,
                            ScriptError::invalid_reference(format!(
                                "cannot reference builtin '{}'",
                                identifier.name
                            )),
                        ))
                    }
                };
                self.compile_expression(&index.index, chunk)?;
                self.emit(chunk, instruction);
                Ok(())
            }
            ExpressionKind::Member(member) => {
                self.compile_expression(&member.object, chunk)?;
                self.emit_constant(chunk, Value::Str(member.property.clone()));
                self.emit(chunk, Instruction::RefField);
                Ok(())
            }
            _ => Err(self.fail(
                span,
                ScriptError::invalid_reference(
                    "only variables, array elements and struct fields can be referenced",
                ),
            )),
        }
    }

    fn compile_assignment(
        &mut self,
        assignment: &AssignmentExpression,
        span: SourceSpan,
        chunk: &mut Chunk,
    ) -> Result<()> {
        match &assignment.target.kind {
            ExpressionKind::Identifier(identifier) => {
                let name = identifier.name.as_str();
                match self.symbols.resolve(name) {
                    None => match &assignment.value.kind {
                        ExpressionKind::Function(function) => {
                            self.define_function_binding(name, function, span, chunk)
                        }
                        _ => {
                            self.compile_expression(&assignment.value, chunk)?;
                            let symbol = self.define(name, false, span)?;
                            self.emit_define(chunk, &symbol);
                            Ok(())
                        }
                    },
                    Some(symbol) => {
                        self.compile_expression(&assignment.value, chunk)?;
                        let instruction = match symbol.scope {
                            SymbolScope::Global => Instruction::SetGlobal(symbol.index),
                            SymbolScope::Local => Instruction::SetLocal(symbol.index),
                            SymbolScope::Upvalue => Instruction::SetUpvalue(symbol.index),
                            SymbolScope::Builtin => {
                                return Err(self.fail(
                                    span,
                                    ScriptError::type_mismatch(format!(
                                        "cannot assign to builtin '{name}'"
                                    )),
                                ))
                            }
                        };
                        self.symbols.set_arity(&symbol, None);
                        self.emit(chunk, instruction);
                        Ok(())
                    }
                }
            }
            ExpressionKind::Index(index) => {
                self.compile_expression(&assignment.value, chunk)?;
                self.compile_expression(&index.object, chunk)?;
                self.compile_expression(&index.index, chunk)?;
                self.emit(chunk, Instruction::SetIndex);
                Ok(())
            }
            ExpressionKind::Member(member) => {
                self.compile_expression(&assignment.value, chunk)?;
                self.compile_expression(&member.object, chunk)?;
                self.emit_constant(chunk, Value::Str(member.property.clone()));
                self.emit(chunk, Instruction::SetField);
                Ok(())
            }
            _ => Err(self.fail(
                span,
                ScriptError::Syntax("invalid assignment target".to_string()),
            )),
        }
    }

    fn compile_function(
        &mut self,
        function: &FunctionExpression,
        name: Option<String>,
        chunk: &mut Chunk,
    ) -> Result<()> {
        let saved_line = self.line;
        self.symbols.enter_scope(ScopeKind::Function);
        let mut body = Chunk::new();
        let compiled = self.compile_function_body(function, &mut body);
        let layout = self.symbols.exit_scope().unwrap_or_default();
        self.line = saved_line;
        compiled?;

        let prototype = Function {
            name,
            arity: function.parameters.len(),
            local_count: layout.local_count,
            captures: layout.captures,
            chunk: body,
        };
        self.emit_closure(chunk, prototype);
        Ok(())
    }

    fn compile_function_body(
        &mut self,
        function: &FunctionExpression,
        body: &mut Chunk,
    ) -> Result<()> {
        for parameter in &function.parameters {
            self.define(&parameter.name, false, parameter.span)?;
        }
        self.compile_statements(&function.body.statements, body)?;
        if !matches!(function.body.statements.last(), Some(Statement::Return(_))) {
            self.emit(body, Instruction::Return(0));
        }
        Ok(())
    }

    fn emit_closure(&self, chunk: &mut Chunk, prototype: Function) {
        let constant = chunk.add_constant(Value::Function(Rc::new(Closure::new(
            Rc::new(prototype),
            Vec::new(),
        ))));
        self.emit(chunk, Instruction::Closure(constant));
    }

    fn emit_jump(&mut self, chunk: &mut Chunk, instruction: Instruction) -> usize {
        self.emit(chunk, instruction)
    }

    fn patch_jump(&mut self, chunk: &mut Chunk, index: usize) -> Result<()> {
        let target = chunk.len();
        match chunk.instructions.get_mut(index) {
            Some(Instruction::Jump(slot)) | Some(Instruction::JumpIfFalse(slot)) => {
                *slot = target;
                Ok(())
            }
            _ => bail!("invalid jump patch location"),
        }
    }
}

/// Names bound exactly once in the module. Only those get a statically checked arity.
fn collect_single_bindings(module: &Module) -> HashSet<String> {
    let mut counts = HashMap::new();
    for statement in &module.statements {
        count_statement_bindings(statement, &mut counts);
    }
    counts
        .into_iter()
        .filter(|(_, count)| *count == 1)
        .map(|(name, _)| name)
        .collect()
}

fn count_statement_bindings(statement: &Statement, counts: &mut HashMap<String, usize>) {
    match statement {
        Statement::Var(var) => {
            *counts.entry(var.name.clone()).or_default() += 1;
            if let Some(initializer) = &var.initializer {
                count_expression_bindings(initializer, counts);
            }
        }
        Statement::Struct(structure) => {
            *counts.entry(structure.name.clone()).or_default() += 1;
            for field in &structure.fields {
                if let Some(value) = &field.value {
                    count_expression_bindings(value, counts);
                }
            }
        }
        Statement::Conditional(conditional) => {
            count_expression_bindings(&conditional.condition, counts);
            count_statement_bindings(&conditional.consequent, counts);
            if let Some(alternative) = &conditional.alternative {
                count_statement_bindings(alternative, counts);
            }
        }
        Statement::Loop(loop_stmt) => {
            count_expression_bindings(&loop_stmt.condition, counts);
            count_statement_bindings(&loop_stmt.body, counts);
        }
        Statement::Return(ret) => {
            if let Some(expression) = &ret.expression {
                count_expression_bindings(expression, counts);
            }
        }
        Statement::Block(block) => {
            for statement in &block.block.statements {
                count_statement_bindings(statement, counts);
            }
        }
        Statement::Expression(expr) => count_expression_bindings(&expr.expression, counts),
    }
}

fn count_expression_bindings(expression: &Expression, counts: &mut HashMap<String, usize>) {
    match &expression.kind {
        ExpressionKind::Identifier(_) | ExpressionKind::Literal(_) => {}
        ExpressionKind::Grouping(inner) => count_expression_bindings(inner, counts),
        ExpressionKind::Reference(inner) => {
            // A referenced name can be rebound through the alias.
            if let ExpressionKind::Identifier(identifier) = &inner.kind {
                *counts.entry(identifier.name.clone()).or_default() += 2;
            }
            count_expression_bindings(inner, counts);
        }
        ExpressionKind::Array(array) => {
            for element in &array.elements {
                count_expression_bindings(element, counts);
            }
        }
        ExpressionKind::Struct(literal) => {
            for field in &literal.fields {
                if let Some(value) = &field.value {
                    count_expression_bindings(value, counts);
                }
            }
        }
        ExpressionKind::Unary(unary) => count_expression_bindings(&unary.operand, counts),
        ExpressionKind::Binary(binary) => {
            count_expression_bindings(&binary.left, counts);
            count_expression_bindings(&binary.right, counts);
        }
        ExpressionKind::Call(call) => {
            count_expression_bindings(&call.callee, counts);
            for argument in &call.arguments {
                count_expression_bindings(argument, counts);
            }
        }
        ExpressionKind::Member(member) => count_expression_bindings(&member.object, counts),
        ExpressionKind::Index(index) => {
            count_expression_bindings(&index.object, counts);
            count_expression_bindings(&index.index, counts);
        }
        ExpressionKind::Function(function) => {
            for parameter in &function.parameters {
                *counts.entry(parameter.name.clone()).or_default() += 1;
            }
            for statement in &function.body.statements {
                count_statement_bindings(statement, counts);
            }
        }
        ExpressionKind::Assignment(assignment) => {
            if let ExpressionKind::Identifier(identifier) = &assignment.target.kind {
                *counts.entry(identifier.name.clone()).or_default() += 1;
            } else {
                count_expression_bindings(&assignment.target, counts);
            }
            count_expression_bindings(&assignment.value, counts);
        }
    }
}
