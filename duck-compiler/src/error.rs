use thiserror::Error;

/// Fatal error kinds raised while compiling or running a script.
///
/// Errors travel as `anyhow::Error`; use `downcast_ref::<ScriptError>()` to recover the kind.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ScriptError {
    #[error("syntax error: {0}")]
    Syntax(String),
    #[error("'{name}' is already defined in this scope")]
    DuplicateDefinition { name: String },
    #[error("builtin '{name}' is already registered")]
    DuplicateBuiltin { name: String },
    #[error("undefined variable '{name}'")]
    UndefinedVariable { name: String },
    #[error("type mismatch: {message}")]
    TypeMismatch { message: String },
    #[error("expected {expected} arguments but got {found}")]
    ArityMismatch { expected: usize, found: usize },
    #[error("index {index} out of range for length {len}")]
    IndexOutOfRange { index: i64, len: usize },
    #[error("unknown struct field '{field}'")]
    UnknownStructField { field: String },
    #[error("invalid reference target: {message}")]
    InvalidReferenceTarget { message: String },
    #[error("stack overflow: more than {limit}")]
    StackOverflow { limit: String },
}

impl ScriptError {
    pub fn type_mismatch(message: impl Into<String>) -> Self {
        ScriptError::TypeMismatch {
            message: message.into(),
        }
    }

    pub fn invalid_reference(message: impl Into<String>) -> Self {
        ScriptError::InvalidReferenceTarget {
            message: message.into(),
        }
    }

    /// Short tag shown next to diagnostics, e.g. `error[undefined-variable]`.
    pub fn kind_name(&self) -> &'static str {
        match self {
            ScriptError::Syntax(_) => "syntax",
            ScriptError::DuplicateDefinition { .. } => "duplicate-definition",
            ScriptError::DuplicateBuiltin { .. } => "duplicate-builtin",
            ScriptError::UndefinedVariable { .. } => "undefined-variable",
            ScriptError::TypeMismatch { .. } => "type-mismatch",
            ScriptError::ArityMismatch { .. } => "arity-mismatch",
            ScriptError::IndexOutOfRange { .. } => "index-out-of-range",
            ScriptError::UnknownStructField { .. } => "unknown-field",
            ScriptError::InvalidReferenceTarget { .. } => "invalid-reference",
            ScriptError::StackOverflow { .. } => "stack-overflow",
        }
    }
}
