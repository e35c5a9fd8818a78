mod ast;
mod compiler;
mod diagnostics;
mod error;
mod lexer;
mod parser;
mod resolver;
mod source;

pub use crate::ast::{
    ArrayLiteral, AssignmentExpression, BinaryExpression, BinaryOperator, Block, BlockStatement,
    CallExpression, ConditionalStatement, Expression, ExpressionKind, ExpressionStatement,
    FunctionExpression, Identifier, IndexExpression, Literal, LoopStatement, MemberExpression,
    Module, ReturnStatement, SourceSpan, Statement, StructField, StructLiteral, StructStatement,
    UnaryExpression, UnaryOperator, VarStatement,
};
pub use crate::compiler::{Compilation, CompileOptions, Compiler};
pub use crate::diagnostics::{Diagnostic, DiagnosticLevel, Diagnostics};
pub use crate::error::ScriptError;
pub use crate::lexer::{Keyword, Lexer, Token, TokenKind};
pub use crate::parser::Parser;
pub use crate::resolver::{
    CaptureSource, FunctionLayout, ScopeKind, Symbol, SymbolScope, SymbolTable,
};
pub use crate::source::{SourceFile, SourceId};

pub mod runtime;
