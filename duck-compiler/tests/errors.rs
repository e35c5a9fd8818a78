use std::path::PathBuf;

use anyhow::Result;
use duck_compiler::runtime::{SharedOutput, Vm};
use duck_compiler::{CompileOptions, Compiler, DiagnosticLevel, ScriptError, SourceFile, SourceId};

fn run(source: &str) -> Result<String> {
    let mut compiler = Compiler::new(CompileOptions::default());
    let source_file = SourceFile::new(SourceId(0), PathBuf::from("errors.duck"), source.to_string());
    let compilation = compiler.compile(&source_file)?;
    let output = SharedOutput::new();
    let mut vm = Vm::with_output(&compilation.program, Box::new(output.clone()));
    vm.run()?;
    Ok(output.contents())
}

fn script_error(source: &str) -> (ScriptError, String) {
    let error = run(source).expect_err("program should fail");
    let kind = error
        .downcast_ref::<ScriptError>()
        .cloned()
        .unwrap_or_else(|| panic!("expected a script error, found {error:#}"));
    (kind, format!("{error:#}"))
}

#[test]
fn mixing_kinds_in_arithmetic_is_a_type_mismatch() {
    let (kind, rendered) = script_error("var a = 1;\nprintln(a + \"x\");");
    assert!(matches!(kind, ScriptError::TypeMismatch { .. }));
    assert_eq!(rendered, "[line 2]: type mismatch: cannot add number and string");
}

#[test]
fn conditions_must_be_bools() {
    let (kind, _) = script_error("if (1) println(1);");
    assert_eq!(
        kind,
        ScriptError::TypeMismatch {
            message: "condition must be a bool, found number".into()
        }
    );
}

#[test]
fn indexing_checks_bounds() {
    let (kind, rendered) = script_error("var a = [1, 2];\n\nprintln(a[5]);");
    assert_eq!(kind, ScriptError::IndexOutOfRange { index: 5, len: 2 });
    assert!(rendered.starts_with("[line 3]"));

    let (kind, _) = script_error("println(\"ab\"[0 - 1]);");
    assert_eq!(kind, ScriptError::IndexOutOfRange { index: -1, len: 2 });

    let (kind, _) = script_error("var a = [1];\na[1] = 2;");
    assert_eq!(kind, ScriptError::IndexOutOfRange { index: 1, len: 1 });
}

#[test]
fn calling_a_non_function_fails() {
    let (kind, _) = script_error("var x = 1;\nx();");
    assert_eq!(
        kind,
        ScriptError::TypeMismatch {
            message: "number is not callable".into()
        }
    );
}

#[test]
fn strings_are_immutable() {
    let (kind, _) = script_error("var s = \"abc\";\ns[0] = \"x\";");
    assert!(matches!(kind, ScriptError::TypeMismatch { .. }));
}

#[test]
fn output_before_the_failure_is_kept() {
    let output = SharedOutput::new();
    let mut compiler = Compiler::new(CompileOptions::default());
    let source = SourceFile::anonymous(SourceId(0), "println(\"before\");\nprintln(nil + 1);");
    let compilation = compiler.compile(&source).expect("compiles");
    let mut vm = Vm::with_output(&compilation.program, Box::new(output.clone()));
    assert!(vm.run().is_err());
    assert_eq!(output.contents(), "before\n");
}

#[test]
fn compile_errors_are_reported_as_diagnostics() {
    let mut compiler = Compiler::new(CompileOptions::default());
    let source = SourceFile::anonymous(SourceId(0), "var a = 1;\nprintln(b);");
    assert!(compiler.compile(&source).is_err());

    let diagnostics = compiler.diagnostics().entries();
    assert_eq!(diagnostics.len(), 1);
    assert_eq!(diagnostics[0].level, DiagnosticLevel::Error);
    assert_eq!(diagnostics[0].message, "undefined variable 'b'");
    assert_eq!(
        diagnostics[0].error,
        Some(ScriptError::UndefinedVariable { name: "b".into() })
    );
    assert_eq!(diagnostics[0].label(), "error[undefined-variable]");
    assert_eq!(diagnostics[0].span.map(|span| span.line), Some(2));
}

#[test]
fn unreachable_statements_only_warn() -> Result<()> {
    let mut compiler = Compiler::new(CompileOptions::default());
    let source = SourceFile::anonymous(
        SourceId(0),
        "var f = fn() {\n  return 1;\n  println(2);\n};\nprintln(f());",
    );
    let compilation = compiler.compile(&source)?;
    let diagnostics = compiler.diagnostics();
    assert!(!diagnostics.has_errors());
    assert_eq!(diagnostics.entries()[0].level, DiagnosticLevel::Warning);

    let output = SharedOutput::new();
    let mut vm = Vm::with_output(&compilation.program, Box::new(output.clone()));
    vm.run()?;
    assert_eq!(output.contents(), "1\n");
    Ok(())
}

#[test]
fn runaway_recursion_is_a_stack_overflow() {
    let (kind, rendered) = script_error("var f = fn(n) {\n  return f(n + 1);\n};\nf(0);");
    assert!(matches!(kind, ScriptError::StackOverflow { .. }));
    assert!(rendered.starts_with("[line 2]: stack overflow"), "{rendered}");
}

#[test]
fn bounded_recursion_stays_under_the_frame_limit() -> Result<()> {
    let output = run(
        "var depth = fn(n) {\n  if (n == 0) return 0;\n  return depth(n - 1) + 1;\n};\nprintln(depth(400));",
    )?;
    assert_eq!(output, "400\n");
    Ok(())
}
