use std::cell::RefCell;
use std::path::PathBuf;
use std::rc::Rc;

use anyhow::{bail, Result};
use duck_compiler::runtime::{Builtins, SharedOutput, Value, Vm};
use duck_compiler::{CompileOptions, Compiler, ScriptError, SourceFile, SourceId};

fn run_with(builtins: &Builtins, source: &str) -> Result<String> {
    let mut compiler = Compiler::with_builtins(CompileOptions::default(), builtins);
    let source_file =
        SourceFile::new(SourceId(0), PathBuf::from("builtins.duck"), source.to_string());
    let compilation = compiler.compile(&source_file)?;
    let output = SharedOutput::new();
    let mut vm = Vm::with_output(&compilation.program, Box::new(output.clone()));
    vm.run()?;
    Ok(output.contents())
}

fn run(source: &str) -> Result<String> {
    run_with(&Builtins::standard(), source)
}

#[test]
fn print_joins_arguments_with_spaces() -> Result<()> {
    let output = run(r#"print("a", 1, true); print(nil); println(); println([1, "x"]);"#)?;
    assert_eq!(output, "a 1 truenil\n[1, x]\n");
    Ok(())
}

#[test]
fn sizeof_counts_elements_and_characters() -> Result<()> {
    assert_eq!(run(r#"println(sizeof([1, 2, 3]), sizeof("duck"));"#)?, "3 4\n");
    assert!(run("sizeof(1);").is_err());
    Ok(())
}

#[test]
fn insert_and_erase_edit_arrays_in_place() -> Result<()> {
    let output = run(
        r#"
var items = [1, 3];
insert(items, 1, 2);
insert(items, 3, 4);
erase(items, 0);
println(items);
"#,
    )?;
    assert_eq!(output, "[2, 3, 4]\n");
    Ok(())
}

#[test]
fn insert_and_erase_return_new_strings() -> Result<()> {
    let output = run(
        r#"
var word = "dck";
println(insert(word, 1, "u"), erase(word, 0), word);
"#,
    )?;
    assert_eq!(output, "duck ck dck\n");
    Ok(())
}

#[test]
fn string_edits_write_back_through_references() -> Result<()> {
    let output = run(
        r#"
var word = "dk";
insert(ref word, 1, "uc");
var shout = fn(text) { insert(text, sizeof(text), "!"); };
shout(ref word);
var names = ["xduck"];
erase(ref names[0], 0);
println(word, names[0]);
"#,
    )?;
    assert_eq!(output, "duck! duck\n");
    Ok(())
}

#[test]
fn out_of_range_positions_fail() {
    let error = run("erase([1], 1);").expect_err("out of range");
    assert_eq!(
        error.downcast_ref::<ScriptError>(),
        Some(&ScriptError::IndexOutOfRange { index: 1, len: 1 })
    );
}

#[test]
fn natives_see_through_references() -> Result<()> {
    let output = run("var items = [1];\nvar alias = ref items;\ninsert(alias, 1, 2);\nprintln(sizeof(alias), items);")?;
    assert_eq!(output, "2 [1, 2]\n");
    Ok(())
}

#[test]
fn hosts_can_register_functions_and_variables() -> Result<()> {
    let calls = Rc::new(RefCell::new(Vec::new()));
    let seen = Rc::clone(&calls);

    let mut builtins = Builtins::standard();
    builtins.register_variable("answer", Value::Number(42.0))?;
    builtins.register_function("record", Some(1), move |_, args| {
        seen.borrow_mut().push(args[0].to_string());
        Ok(None)
    })?;
    builtins.register_function("double", Some(1), |_, args| match &args[0] {
        Value::Number(n) => Ok(Some(Value::Number(n * 2.0))),
        other => bail!(ScriptError::type_mismatch(format!(
            "double expects a number, found {}",
            other.type_name()
        ))),
    })?;

    let output = run_with(
        &builtins,
        "record(answer);\nvar r = record(\"x\");\nprintln(double(answer), r);",
    )?;
    assert_eq!(output, "84 nil\n");
    assert_eq!(*calls.borrow(), vec!["42".to_string(), "x".to_string()]);
    Ok(())
}

#[test]
fn builtin_arity_is_enforced() {
    let error = run("sizeof(1, 2);").expect_err("arity");
    assert_eq!(
        error.downcast_ref::<ScriptError>(),
        Some(&ScriptError::ArityMismatch {
            expected: 1,
            found: 2
        })
    );
}

#[test]
fn builtins_cannot_be_reassigned() {
    let mut compiler = Compiler::new(CompileOptions::default());
    let source = SourceFile::anonymous(SourceId(0), "print = 1;");
    let error = compiler.compile(&source).err().expect("compile error");
    assert!(matches!(
        error.downcast_ref::<ScriptError>(),
        Some(ScriptError::TypeMismatch { .. })
    ));
}

#[test]
fn self_containing_values_print_and_compare() -> Result<()> {
    let output = run(
        r#"
var a = [1];
a[0] = a;
println(sizeof(a));
println(a);
var b = [1];
b[0] = b;
println(a == b);
var node = {next: nil};
node.next = node;
println(node);
"#,
    )?;
    assert_eq!(output, "1\n[[...]]\ntrue\n{next: {...}}\n");
    Ok(())
}
