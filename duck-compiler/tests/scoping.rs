use std::path::PathBuf;

use anyhow::Result;
use duck_compiler::runtime::{SharedOutput, Vm};
use duck_compiler::{Compilation, CompileOptions, Compiler, ScriptError, SourceFile, SourceId};

fn compile_program(compiler: &mut Compiler, source: &str) -> Result<Compilation> {
    let source_file = SourceFile::new(SourceId(0), PathBuf::from("scoping.duck"), source.to_string());
    match compiler.compile(&source_file) {
        Ok(compilation) => {
            assert!(
                !compiler.diagnostics().has_errors(),
                "expected no errors, found {:?}",
                compiler.diagnostics()
            );
            Ok(compilation)
        }
        Err(error) => {
            eprintln!("diagnostics: {:?}", compiler.diagnostics());
            Err(error)
        }
    }
}

fn run(source: &str) -> Result<String> {
    let mut compiler = Compiler::new(CompileOptions::default());
    let compilation = compile_program(&mut compiler, source)?;
    let output = SharedOutput::new();
    let mut vm = Vm::with_output(&compilation.program, Box::new(output.clone()));
    vm.run()?;
    Ok(output.contents())
}

fn compile_error(source: &str) -> ScriptError {
    let mut compiler = Compiler::new(CompileOptions::default());
    let source_file = SourceFile::new(SourceId(0), PathBuf::from("scoping.duck"), source.to_string());
    let error = compiler
        .compile(&source_file)
        .err()
        .expect("compilation should fail");
    assert!(compiler.diagnostics().has_errors());
    error
        .downcast_ref::<ScriptError>()
        .cloned()
        .expect("script error")
}

#[test]
fn block_locals_are_not_visible_after_the_block() {
    let error = compile_error("{ var inner = 1; }\nprintln(inner);");
    assert_eq!(
        error,
        ScriptError::UndefinedVariable {
            name: "inner".into()
        }
    );
}

#[test]
fn redeclaring_in_the_same_scope_fails() {
    let error = compile_error("var a = 1;\nvar a = 2;");
    assert_eq!(error, ScriptError::DuplicateDefinition { name: "a".into() });

    let error = compile_error("var f = fn() { var x = 1; var x = 2; };");
    assert_eq!(error, ScriptError::DuplicateDefinition { name: "x".into() });
}

#[test]
fn inner_blocks_shadow_outer_bindings() -> Result<()> {
    let output = run(
        r#"
var a = 1;
{
  var a = 2;
  println(a);
}
println(a);
"#,
    )?;
    assert_eq!(output, "2\n1\n");
    Ok(())
}

#[test]
fn assigning_an_unknown_name_defines_it() -> Result<()> {
    let output = run(
        r#"
total = 40;
var add = fn(value) {
  extra = 2;
  return total + value + extra;
};
println(add(0));
"#,
    )?;
    assert_eq!(output, "42\n");
    Ok(())
}

#[test]
fn while_loops_update_outer_variables() -> Result<()> {
    let output = run(
        r#"
var i = 0;
var sum = 0;
while (i < 5) {
  sum = sum + i;
  i = i + 1;
}
println(sum, i);
"#,
    )?;
    assert_eq!(output, "10 5\n");
    Ok(())
}

#[test]
fn conditionals_pick_one_branch() -> Result<()> {
    let output = run(
        r#"
var describe = fn(n) {
  if (n > 0) return "positive";
  else if (n < 0) return "negative";
  return "zero";
};
println(describe(3), describe(0 - 3), describe(0));
"#,
    )?;
    assert_eq!(output, "positive negative zero\n");
    Ok(())
}

#[test]
fn definitions_carry_over_between_compilations() -> Result<()> {
    let mut compiler = Compiler::new(CompileOptions::default());
    let first = compile_program(&mut compiler, "var total = 1;")?;
    let output = SharedOutput::new();
    let mut vm = Vm::with_output(&first.program, Box::new(output.clone()));
    vm.run()?;

    let second = compile_program(&mut compiler, "total = total + 41;\nprintln(total);")?;
    vm.load(&second.program);
    vm.run()?;
    assert_eq!(output.contents(), "42\n");

    compiler.reset();
    vm.reset();
    let source = SourceFile::anonymous(SourceId(2), "println(total);");
    assert!(compiler.compile(&source).is_err());
    Ok(())
}
