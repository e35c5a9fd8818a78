use std::path::PathBuf;

use anyhow::Result;
use duck_compiler::runtime::{SharedOutput, Vm};
use duck_compiler::{CompileOptions, Compiler, ScriptError, SourceFile, SourceId};

fn run(source: &str) -> Result<String> {
    let mut compiler = Compiler::new(CompileOptions::default());
    let source_file =
        SourceFile::new(SourceId(0), PathBuf::from("functions.duck"), source.to_string());
    let compilation = compiler.compile(&source_file)?;
    let output = SharedOutput::new();
    let mut vm = Vm::with_output(&compilation.program, Box::new(output.clone()));
    vm.run()?;
    Ok(output.contents())
}

#[test]
fn matching_arity_returns_the_result() -> Result<()> {
    let output = run("var add = fn(a, b) { return a + b; };\nprintln(add(1, 2));")?;
    assert_eq!(output, "3\n");
    Ok(())
}

#[test]
fn arity_of_single_bindings_is_checked_at_compile_time() {
    let mut compiler = Compiler::new(CompileOptions::default());
    let source = SourceFile::anonymous(
        SourceId(0),
        "var add = fn(a, b) { return a + b; };\nadd(1);",
    );
    let error = compiler.compile(&source).err().expect("arity error");
    assert_eq!(
        error.downcast_ref::<ScriptError>(),
        Some(&ScriptError::ArityMismatch {
            expected: 2,
            found: 1
        })
    );
    let span = compiler.diagnostics().entries()[0].span.expect("span");
    assert_eq!(span.line, 2);
}

#[test]
fn arity_of_rebound_names_is_checked_at_runtime() {
    let error = run(
        r#"
var f = fn(a) { return a; };
f = fn(a, b) { return a; };
f(1);
"#,
    )
    .expect_err("arity error");
    assert_eq!(
        error.downcast_ref::<ScriptError>(),
        Some(&ScriptError::ArityMismatch {
            expected: 2,
            found: 1
        })
    );
    assert_eq!(error.to_string(), "[line 4]");
}

#[test]
fn functions_without_return_yield_nil() -> Result<()> {
    let output = run(
        r#"
var quiet = fn() { var x = 1; };
var bare = fn() { return; };
println(quiet(), bare());
"#,
    )?;
    assert_eq!(output, "nil nil\n");
    Ok(())
}

#[test]
fn functions_are_values() -> Result<()> {
    let output = run(
        r#"
var twice = fn(f, x) { return f(f(x)); };
var inc = fn(n) { return n + 1; };
println(twice(inc, 5), inc, fn() {});
"#,
    )?;
    assert_eq!(output, "7 <fn inc> <fn>\n");
    Ok(())
}

#[test]
fn global_functions_can_recurse() -> Result<()> {
    let output = run(
        r#"
var fact = fn(n) {
  if (n < 2) return 1;
  return n * fact(n - 1);
};
println(fact(5));
"#,
    )?;
    assert_eq!(output, "120\n");
    Ok(())
}

#[test]
fn top_level_return_is_a_syntax_error() {
    let mut compiler = Compiler::new(CompileOptions::default());
    let source = SourceFile::anonymous(SourceId(0), "return 1;");
    let error = compiler.compile(&source).err().expect("syntax error");
    assert!(matches!(
        error.downcast_ref::<ScriptError>(),
        Some(ScriptError::Syntax(_))
    ));
}
