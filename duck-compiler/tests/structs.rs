use std::path::PathBuf;

use anyhow::Result;
use duck_compiler::runtime::{SharedOutput, Vm};
use duck_compiler::{CompileOptions, Compiler, ScriptError, SourceFile, SourceId};

fn run(source: &str) -> Result<String> {
    let mut compiler = Compiler::new(CompileOptions::default());
    let source_file =
        SourceFile::new(SourceId(0), PathBuf::from("structs.duck"), source.to_string());
    let compilation = compiler.compile(&source_file)?;
    let output = SharedOutput::new();
    let mut vm = Vm::with_output(&compilation.program, Box::new(output.clone()));
    vm.run()?;
    Ok(output.contents())
}

#[test]
fn each_constructor_use_builds_a_fresh_instance() -> Result<()> {
    let output = run(
        r#"
struct Point { x: 0, y: 0 }
var p = Point;
p.x = 3;
var q = Point;
println(p.x, q.x);
"#,
    )?;
    assert_eq!(output, "3 0\n");
    Ok(())
}

#[test]
fn equality_is_structural() -> Result<()> {
    let output = run(
        r#"
struct Point { x: 0, y: 0 }
var p = Point;
p.x = 3;
println(p == {x: 3, y: 0}, p == Point);
var twin = Point;
twin.x = 3;
println(p == twin);
twin.y = 1;
println(p == twin);
println({a: 1, b: 2} == {b: 2, a: 1}, {a: 1} == {a: 1, b: nil});
"#,
    )?;
    assert_eq!(output, "true false\ntrue\nfalse\ntrue false\n");
    Ok(())
}

#[test]
fn setting_a_missing_field_inserts_it() -> Result<()> {
    let output = run(
        r#"
var p = {x: 3};
p.z = 9;
println(p);
"#,
    )?;
    assert_eq!(output, "{x: 3, z: 9}\n");
    Ok(())
}

#[test]
fn instances_alias_on_copy() -> Result<()> {
    let output = run(
        r#"
struct Point { x: 0, y: 0 }
var a = Point;
var b = a;
b.x = 5;
println(a.x);
"#,
    )?;
    assert_eq!(output, "5\n");
    Ok(())
}

#[test]
fn fields_without_values_start_nil() -> Result<()> {
    let output = run(
        r#"
struct Node {
  value
  next
}
var n = Node;
println(n.value, n.next);
"#,
    )?;
    assert_eq!(output, "nil nil\n");
    Ok(())
}

#[test]
fn field_defaults_are_evaluated_per_instance() -> Result<()> {
    let output = run(
        r#"
struct Bag { items: [] }
var a = Bag;
var b = Bag;
insert(a.items, 0, 1);
println(sizeof(a.items), sizeof(b.items));
"#,
    )?;
    assert_eq!(output, "1 0\n");
    Ok(())
}

#[test]
fn struct_defaults_can_capture_locals() -> Result<()> {
    let output = run(
        r#"
var build = fn(k) {
  struct Scaled { value: k * 2 }
  return Scaled;
};
println(build(4).value);
"#,
    )?;
    assert_eq!(output, "8\n");
    Ok(())
}

#[test]
fn unknown_fields_fail_at_runtime() {
    let error = run("var p = {x: 1};\nprintln(p.w);").expect_err("missing field");
    assert_eq!(
        error.downcast_ref::<ScriptError>(),
        Some(&ScriptError::UnknownStructField { field: "w".into() })
    );
}
