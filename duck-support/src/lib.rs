use std::borrow::Cow;
use std::fmt;

fn escape_single_quotes(input: &str) -> Cow<'_, str> {
    if input.contains('\'') {
        Cow::Owned(input.replace('\'', "\\'"))
    } else {
        Cow::Borrowed(input)
    }
}

fn format_operation_error(
    module: &str,
    operation: &str,
    target: Option<&str>,
    error: impl fmt::Display,
) -> String {
    match target {
        Some(target) => {
            let escaped = escape_single_quotes(target);
            format!("{module}.{operation}('{}') failed: {error}", escaped)
        }
        None => format!("{module}.{operation} failed: {error}"),
    }
}

/// Message for a native builtin that rejected its arguments.
pub fn builtin_error(name: &str, error: impl fmt::Display) -> String {
    format_operation_error("builtin", name, None, error)
}

pub fn registry_error(operation: &str, name: &str, error: impl fmt::Display) -> String {
    format_operation_error("builtins", operation, Some(name), error)
}

pub fn cli_error(operation: &str, error: impl fmt::Display) -> String {
    format_operation_error("cli", operation, None, error)
}

pub fn cli_target_error(operation: &str, target: &str, error: impl fmt::Display) -> String {
    format_operation_error("cli", operation, Some(target), error)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_builtin_errors() {
        assert_eq!(
            builtin_error("insert", "index out of range"),
            "builtin.insert failed: index out of range"
        );
    }

    #[test]
    fn escapes_quoted_targets() {
        assert_eq!(
            cli_target_error("read", "it's.duck", "missing"),
            "cli.read('it\\'s.duck') failed: missing"
        );
    }
}
