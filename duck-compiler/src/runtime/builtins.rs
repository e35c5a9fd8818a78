use std::any::Any;
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::io::Write;
use std::rc::Rc;
use std::time::Instant;

use anyhow::{bail, Result};
use duck_support::{builtin_error, registry_error};
use log::debug;

use super::value::Value;
use crate::error::ScriptError;

/// Native calling convention: output sink plus dereferenced arguments.
/// `Ok(None)` means the native produced no value; the call then evaluates to nil.
pub type NativeFn = dyn Fn(&mut dyn Write, &[Value]) -> Result<Option<Value>>;

pub struct NativeFunction {
    pub name: String,
    pub arity: Option<usize>,
    /// When the first argument is passed with `ref`, a returned value is stored back through it.
    pub updates_target: bool,
    callable: Box<NativeFn>,
}

impl NativeFunction {
    pub fn call(&self, output: &mut dyn Write, args: &[Value]) -> Result<Option<Value>> {
        if let Some(expected) = self.arity {
            if args.len() != expected {
                bail!(ScriptError::ArityMismatch {
                    expected,
                    found: args.len(),
                });
            }
        }
        (self.callable)(output, args)
    }
}

impl fmt::Debug for NativeFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeFunction")
            .field("name", &self.name)
            .field("arity", &self.arity)
            .field("updates_target", &self.updates_target)
            .finish()
    }
}

type Destructor = Box<dyn FnMut(&mut dyn Any)>;

/// Opaque host resource exposed to scripts. The destructor runs once the last handle drops.
pub struct NativeData {
    pub name: String,
    payload: RefCell<Box<dyn Any>>,
    destructor: Option<Destructor>,
}

impl NativeData {
    pub fn new<T: Any>(name: impl Into<String>, payload: T) -> Self {
        Self {
            name: name.into(),
            payload: RefCell::new(Box::new(payload)),
            destructor: None,
        }
    }

    pub fn with_destructor(mut self, destructor: impl FnMut(&mut dyn Any) + 'static) -> Self {
        self.destructor = Some(Box::new(destructor));
        self
    }

    pub fn with_payload<T: Any, R>(&self, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        let mut payload = self.payload.borrow_mut();
        payload.downcast_mut::<T>().map(f)
    }
}

impl Drop for NativeData {
    fn drop(&mut self) {
        if let Some(mut destructor) = self.destructor.take() {
            debug!("releasing native data '{}'", self.name);
            destructor(self.payload.get_mut().as_mut());
        }
    }
}

impl fmt::Debug for NativeData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeData").field("name", &self.name).finish()
    }
}

#[derive(Debug, Clone)]
pub enum Builtin {
    Function(Rc<NativeFunction>),
    Variable(Rc<Value>),
    Data(Rc<NativeData>),
}

impl Builtin {
    pub fn same_entry(&self, other: &Builtin) -> bool {
        match (self, other) {
            (Builtin::Function(a), Builtin::Function(b)) => Rc::ptr_eq(a, b),
            (Builtin::Variable(a), Builtin::Variable(b)) => Rc::ptr_eq(a, b),
            (Builtin::Data(a), Builtin::Data(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl fmt::Display for Builtin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Builtin::Function(function) => write!(f, "<builtin {}>", function.name),
            Builtin::Variable(value) => write!(f, "{value}"),
            Builtin::Data(data) => write!(f, "<data {}>", data.name),
        }
    }
}

/// Name to builtin table. Slot numbers follow registration order and are shared by the
/// compiler (`GET_BUILTIN i`) and the VM.
#[derive(Debug, Clone, Default)]
pub struct Builtins {
    entries: Vec<(String, Builtin)>,
    name_index: HashMap<String, usize>,
}

impl Builtins {
    pub fn new() -> Self {
        Self::default()
    }

    /// print, println, sizeof, insert, erase and clock.
    pub fn standard() -> Self {
        let mut builtins = Self::new();
        builtins.register_standard();
        builtins
    }

    fn register_standard(&mut self) {
        let started = Instant::now();
        self.insert_native("print", None, false, Box::new(native_print));
        self.insert_native("println", None, false, Box::new(native_println));
        self.insert_native("sizeof", Some(1), false, Box::new(native_sizeof));
        self.insert_native("insert", Some(3), true, Box::new(native_insert));
        self.insert_native("erase", Some(2), true, Box::new(native_erase));
        self.insert_native(
            "clock",
            Some(0),
            false,
            Box::new(
                move |_: &mut dyn Write, _: &[Value]| -> Result<Option<Value>> {
                    Ok(Some(Value::Number(started.elapsed().as_secs_f64())))
                },
            ),
        );
    }

    fn insert_native(
        &mut self,
        name: &str,
        arity: Option<usize>,
        updates_target: bool,
        callable: Box<NativeFn>,
    ) {
        self.insert(
            name,
            Builtin::Function(Rc::new(NativeFunction {
                name: name.to_string(),
                arity,
                updates_target,
                callable,
            })),
        );
    }

    pub fn register_function(
        &mut self,
        name: &str,
        arity: Option<usize>,
        callable: impl Fn(&mut dyn Write, &[Value]) -> Result<Option<Value>> + 'static,
    ) -> Result<usize> {
        self.ensure_unique(name)?;
        self.insert_native(name, arity, false, Box::new(callable));
        Ok(self.entries.len() - 1)
    }

    pub fn register_variable(&mut self, name: &str, value: Value) -> Result<usize> {
        self.ensure_unique(name)?;
        Ok(self.insert(name, Builtin::Variable(Rc::new(value))))
    }

    pub fn register_data(&mut self, name: &str, data: NativeData) -> Result<usize> {
        self.ensure_unique(name)?;
        Ok(self.insert(name, Builtin::Data(Rc::new(data))))
    }

    fn ensure_unique(&self, name: &str) -> Result<()> {
        if self.name_index.contains_key(name) {
            let error = ScriptError::DuplicateBuiltin { name: name.into() };
            let message = registry_error("register", name, &error);
            return Err(anyhow::Error::new(error).context(message));
        }
        Ok(())
    }

    fn insert(&mut self, name: &str, builtin: Builtin) -> usize {
        let index = self.entries.len();
        self.entries.push((name.to_string(), builtin));
        self.name_index.insert(name.to_string(), index);
        index
    }

    pub fn lookup(&self, name: &str) -> Option<usize> {
        self.name_index.get(name).copied()
    }

    pub fn get(&self, index: usize) -> Option<&Builtin> {
        self.entries.get(index).map(|(_, builtin)| builtin)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(name, _)| name.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn write_joined(output: &mut dyn Write, args: &[Value]) -> Result<()> {
    for (index, value) in args.iter().enumerate() {
        if index > 0 {
            write!(output, " ")?;
        }
        write!(output, "{value}")?;
    }
    Ok(())
}

fn native_print(output: &mut dyn Write, args: &[Value]) -> Result<Option<Value>> {
    write_joined(output, args)?;
    Ok(None)
}

fn native_println(output: &mut dyn Write, args: &[Value]) -> Result<Option<Value>> {
    write_joined(output, args)?;
    writeln!(output)?;
    Ok(None)
}

fn native_sizeof(_: &mut dyn Write, args: &[Value]) -> Result<Option<Value>> {
    let size = match &args[0] {
        Value::Array(elements) => elements.borrow().len(),
        Value::Str(text) => text.chars().count(),
        other => bail!(ScriptError::type_mismatch(builtin_error(
            "sizeof",
            format!("expected an array or string, found {}", other.type_name())
        ))),
    };
    Ok(Some(Value::Number(size as f64)))
}

/// Validates a position argument against `limit` (inclusive when inserting).
fn position_argument(name: &str, value: &Value, len: usize, inclusive: bool) -> Result<usize> {
    let Value::Number(number) = value else {
        bail!(ScriptError::type_mismatch(builtin_error(
            name,
            format!("index must be a number, found {}", value.type_name())
        )));
    };
    if number.fract() != 0.0 {
        bail!(ScriptError::type_mismatch(builtin_error(
            name,
            format!("index must be an integer, found {number}")
        )));
    }
    let index = *number as i64;
    let upper = if inclusive { len } else { len.saturating_sub(1) };
    if index < 0 || index as usize > upper || (!inclusive && len == 0) {
        bail!(ScriptError::IndexOutOfRange { index, len });
    }
    Ok(index as usize)
}

fn native_insert(_: &mut dyn Write, args: &[Value]) -> Result<Option<Value>> {
    match &args[0] {
        Value::Array(elements) => {
            let len = elements.borrow().len();
            let index = position_argument("insert", &args[1], len, true)?;
            elements.borrow_mut().insert(index, args[2].clone());
            Ok(None)
        }
        Value::Str(text) => {
            let mut chars: Vec<char> = text.chars().collect();
            let index = position_argument("insert", &args[1], chars.len(), true)?;
            let inserted = args[2].to_string();
            chars.splice(index..index, inserted.chars());
            Ok(Some(Value::Str(chars.into_iter().collect())))
        }
        other => bail!(ScriptError::type_mismatch(builtin_error(
            "insert",
            format!("expected an array or string, found {}", other.type_name())
        ))),
    }
}

fn native_erase(_: &mut dyn Write, args: &[Value]) -> Result<Option<Value>> {
    match &args[0] {
        Value::Array(elements) => {
            let len = elements.borrow().len();
            let index = position_argument("erase", &args[1], len, false)?;
            elements.borrow_mut().remove(index);
            Ok(None)
        }
        Value::Str(text) => {
            let mut chars: Vec<char> = text.chars().collect();
            let index = position_argument("erase", &args[1], chars.len(), false)?;
            chars.remove(index);
            Ok(Some(Value::Str(chars.into_iter().collect())))
        }
        other => bail!(ScriptError::type_mismatch(builtin_error(
            "erase",
            format!("expected an array or string, found {}", other.type_name())
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(builtins: &Builtins, name: &str, args: &[Value]) -> Result<Option<Value>> {
        let index = builtins.lookup(name).expect("registered");
        let Some(Builtin::Function(function)) = builtins.get(index) else {
            panic!("{name} is not a function");
        };
        let mut sink = Vec::new();
        function.call(&mut sink, args)
    }

    #[test]
    fn standard_table_has_stable_slots() {
        let builtins = Builtins::standard();
        let names: Vec<_> = builtins.names().collect();
        assert_eq!(
            names,
            vec!["print", "println", "sizeof", "insert", "erase", "clock"]
        );
    }

    #[test]
    fn insert_mutates_arrays_in_place() -> Result<()> {
        let builtins = Builtins::standard();
        let array = Value::array(vec![Value::Number(1.0), Value::Number(3.0)]);
        call(&builtins, "insert", &[array.clone(), Value::Number(1.0), Value::Number(2.0)])?;
        call(&builtins, "insert", &[array.clone(), Value::Number(3.0), Value::Number(4.0)])?;
        assert_eq!(array.to_string(), "[1, 2, 3, 4]");

        let error = call(&builtins, "erase", &[array, Value::Number(4.0)]).unwrap_err();
        assert_eq!(
            error.downcast_ref::<ScriptError>(),
            Some(&ScriptError::IndexOutOfRange { index: 4, len: 4 })
        );
        Ok(())
    }

    #[test]
    fn string_edits_return_new_strings() -> Result<()> {
        let builtins = Builtins::standard();
        let inserted = call(
            &builtins,
            "insert",
            &[Value::Str("duk".into()), Value::Number(2.0), Value::Str("c".into())],
        )?;
        assert_eq!(inserted, Some(Value::Str("duck".into())));
        let erased = call(&builtins, "erase", &[Value::Str("duck".into()), Value::Number(0.0)])?;
        assert_eq!(erased, Some(Value::Str("uck".into())));
        Ok(())
    }

    #[test]
    fn only_editing_natives_update_their_target() {
        let builtins = Builtins::standard();
        let flagged: Vec<_> = builtins
            .entries
            .iter()
            .filter_map(|(name, builtin)| match builtin {
                Builtin::Function(native) if native.updates_target => Some(name.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(flagged, vec!["insert", "erase"]);
    }

    #[test]
    fn duplicate_registration_fails() {
        let mut builtins = Builtins::standard();
        let error = builtins
            .register_variable("print", Value::Nil)
            .unwrap_err();
        assert!(matches!(
            error.downcast_ref::<ScriptError>(),
            Some(ScriptError::DuplicateBuiltin { name }) if name == "print"
        ));
        assert_eq!(
            error.to_string(),
            "builtins.register('print') failed: builtin 'print' is already registered"
        );
    }

    #[test]
    fn native_data_runs_destructor_on_drop() -> Result<()> {
        let released = Rc::new(RefCell::new(false));
        let flag = Rc::clone(&released);
        let mut builtins = Builtins::new();
        builtins.register_data(
            "handle",
            NativeData::new("handle", 7_u32).with_destructor(move |_| *flag.borrow_mut() = true),
        )?;
        let index = builtins.lookup("handle").expect("registered");
        if let Some(Builtin::Data(data)) = builtins.get(index) {
            assert_eq!(data.with_payload(|value: &mut u32| *value), Some(7));
        }
        drop(builtins);
        assert!(*released.borrow());
        Ok(())
    }
}
