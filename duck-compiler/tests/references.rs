use std::path::PathBuf;

use anyhow::Result;
use duck_compiler::runtime::{SharedOutput, Vm};
use duck_compiler::{CompileOptions, Compiler, ScriptError, SourceFile, SourceId};

fn run(source: &str) -> Result<String> {
    let mut compiler = Compiler::new(CompileOptions::default());
    let source_file =
        SourceFile::new(SourceId(0), PathBuf::from("references.duck"), source.to_string());
    let compilation = compiler.compile(&source_file)?;
    let output = SharedOutput::new();
    let mut vm = Vm::with_output(&compilation.program, Box::new(output.clone()));
    vm.run()?;
    Ok(output.contents())
}

fn listing(source: &str) -> Result<String> {
    let mut compiler = Compiler::new(CompileOptions::default());
    let compilation = compiler.compile(&SourceFile::anonymous(SourceId(0), source))?;
    Ok(compilation.program.disassemble())
}

fn runtime_error(source: &str) -> ScriptError {
    let error = run(source).expect_err("program should fail");
    error
        .downcast_ref::<ScriptError>()
        .cloned()
        .unwrap_or_else(|| panic!("expected a script error, found {error:#}"))
}

#[test]
fn assigning_through_a_reference_updates_the_target() -> Result<()> {
    let output = run("var a = 1;\nvar b = ref a;\nb = 2;\nprintln(a, b);")?;
    assert_eq!(output, "2 2\n");
    Ok(())
}

#[test]
fn element_references_write_into_the_array() -> Result<()> {
    let output = run("var arr = [1, 2, 3];\nvar r = ref arr[1];\nr = 99;\nprintln(arr);")?;
    assert_eq!(output, "[1, 99, 3]\n");
    Ok(())
}

#[test]
fn plain_assignment_rebinds_without_touching_aliases() -> Result<()> {
    let output = run(
        r#"
var a = [1, 2];
var b = a;
a = [3];
println(a, b);
var c = b;
c[0] = 7;
println(b);
"#,
    )?;
    assert_eq!(output, "[3] [1, 2]\n[7, 2]\n");
    Ok(())
}

#[test]
fn functions_can_update_caller_variables() -> Result<()> {
    let output = run(
        r#"
var bump = fn(target) { target = target + 1; };
var n = 1;
bump(ref n);
var outer = fn() {
  var v = 5;
  bump(ref v);
  return v;
};
println(n, outer());
"#,
    )?;
    assert_eq!(output, "2 6\n");
    Ok(())
}

#[test]
fn field_references_write_into_the_struct() -> Result<()> {
    let output = run(
        r#"
var p = {x: 1, y: 2};
var px = ref p.x;
px = 10;
var rp = ref p;
println(p.x, rp.y);
"#,
    )?;
    assert_eq!(output, "10 2\n");
    Ok(())
}

#[test]
fn assigning_a_reference_rebinds_the_alias() -> Result<()> {
    let output = run(
        r#"
var a = 1;
var b = 2;
var r = ref a;
r = ref b;
r = 5;
println(a, b);
"#,
    )?;
    assert_eq!(output, "1 5\n");
    Ok(())
}

#[test]
fn chains_are_followed_to_the_final_slot() -> Result<()> {
    let output = run("var a = 1;\nvar b = ref a;\nvar c = ref b;\nc = 3;\nprintln(a);")?;
    assert_eq!(output, "3\n");
    Ok(())
}

#[test]
fn references_to_captured_locals_share_the_cell() -> Result<()> {
    let output = run(
        r#"
var make = fn() {
  var n = 1;
  var get = fn() { return n; };
  var r = ref n;
  r = 42;
  return get();
};
println(make());
"#,
    )?;
    assert_eq!(output, "42\n");
    Ok(())
}

#[test]
fn references_outliving_their_frame_are_rejected() {
    let error = runtime_error(
        r#"
var leak = fn() {
  var v = 1;
  return ref v;
};
var r = leak();
println(r);
"#,
    );
    assert!(matches!(error, ScriptError::InvalidReferenceTarget { .. }));
}

#[test]
fn reference_cycles_are_rejected() {
    let error = runtime_error("var a = 1;\nvar b = ref a;\na = ref b;\nprintln(a);");
    assert!(matches!(error, ScriptError::InvalidReferenceTarget { .. }));
}

#[test]
fn only_addressable_expressions_can_be_referenced() {
    let mut compiler = Compiler::new(CompileOptions::default());
    let source = SourceFile::anonymous(SourceId(0), "var r = ref (1 + 2);");
    let error = compiler.compile(&source).err().expect("compile error");
    assert!(matches!(
        error.downcast_ref::<ScriptError>(),
        Some(ScriptError::InvalidReferenceTarget { .. })
    ));
    assert!(compiler.diagnostics().has_errors());
}

#[test]
fn element_references_to_locals_write_into_the_array() -> Result<()> {
    let source = r#"
var fill = fn() {
  var arr = [1, 2, 3];
  var r = ref arr[1];
  r = 99;
  return arr;
};
println(fill());
"#;
    assert!(listing(source)?.contains("REF_INDEX_LOCAL"));
    assert_eq!(run(source)?, "[1, 99, 3]\n");
    Ok(())
}

#[test]
fn element_references_to_captured_arrays_write_into_the_array() -> Result<()> {
    let source = r#"
var make = fn() {
  var arr = [1, 2, 3];
  var set = fn(v) {
    var r = ref arr[2];
    r = v;
  };
  set(7);
  return arr;
};
println(make());
"#;
    assert!(listing(source)?.contains("REF_INDEX_UPVALUE"));
    assert_eq!(run(source)?, "[1, 2, 7]\n");
    Ok(())
}

#[test]
fn references_to_upvalues_write_into_the_cell() -> Result<()> {
    let source = r#"
var make = fn() {
  var n = 1;
  var bump = fn() {
    var r = ref n;
    r = r + 7;
  };
  bump();
  return n;
};
println(make());
"#;
    assert!(listing(source)?.contains("REF_UPVALUE"));
    assert_eq!(run(source)?, "8\n");
    Ok(())
}

#[test]
fn element_references_need_an_array() {
    let error = runtime_error("var x = 5;\nvar r = ref x[0];");
    assert!(matches!(error, ScriptError::InvalidReferenceTarget { .. }));
}

#[test]
fn element_references_are_bounds_checked() {
    let error = runtime_error("var arr = [1];\nvar r = ref arr[3];");
    assert_eq!(error, ScriptError::IndexOutOfRange { index: 3, len: 1 });
}

#[test]
fn equality_looks_through_nested_references() -> Result<()> {
    let output = run(
        r#"
var a = 1;
var x = [ref a];
var s = {v: ref a};
println(x == [1], x[0] == 1, s == {v: 1});
a = 2;
println(x == [1], x == [2], s == {v: 2});
"#,
    )?;
    assert_eq!(output, "true true true\nfalse true true\n");
    Ok(())
}
