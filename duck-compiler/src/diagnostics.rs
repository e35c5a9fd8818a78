use crate::ast::SourceSpan;
use crate::error::ScriptError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagnosticLevel {
    Error,
    Warning,
}

/// A compile-time finding tied to a place in the source.
///
/// Errors keep the `ScriptError` that stopped the compile so callers can branch on its kind.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub level: DiagnosticLevel,
    pub message: String,
    pub span: Option<SourceSpan>,
    pub error: Option<ScriptError>,
}

impl Diagnostic {
    pub fn error(error: ScriptError, span: Option<SourceSpan>) -> Self {
        let message = match &error {
            ScriptError::Syntax(detail) => detail.clone(),
            other => other.to_string(),
        };
        Self {
            level: DiagnosticLevel::Error,
            message,
            span,
            error: Some(error),
        }
    }

    pub fn warning(message: impl Into<String>, span: Option<SourceSpan>) -> Self {
        Self {
            level: DiagnosticLevel::Warning,
            message: message.into(),
            span,
            error: None,
        }
    }

    /// `error[<kind>]` for errors, `warning` otherwise.
    pub fn label(&self) -> String {
        match (&self.level, &self.error) {
            (DiagnosticLevel::Error, Some(error)) => format!("error[{}]", error.kind_name()),
            (DiagnosticLevel::Error, None) => "error".to_string(),
            (DiagnosticLevel::Warning, _) => "warning".to_string(),
        }
    }
}

#[derive(Debug, Default)]
pub struct Diagnostics {
    entries: Vec<Diagnostic>,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `error` and hands it back for propagation.
    pub fn fail(&mut self, error: ScriptError, span: Option<SourceSpan>) -> anyhow::Error {
        self.entries.push(Diagnostic::error(error.clone(), span));
        error.into()
    }

    pub fn warn(&mut self, message: impl Into<String>, span: Option<SourceSpan>) {
        self.entries.push(Diagnostic::warning(message, span));
    }

    pub fn extend(&mut self, other: Diagnostics) {
        self.entries.extend(other.entries);
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn has_errors(&self) -> bool {
        self.first_error().is_some()
    }

    /// Kind of the error that ended the last compile.
    pub fn first_error(&self) -> Option<&ScriptError> {
        self.entries
            .iter()
            .find_map(|diagnostic| diagnostic.error.as_ref())
    }

    pub fn entries(&self) -> &[Diagnostic] {
        &self.entries
    }
}
