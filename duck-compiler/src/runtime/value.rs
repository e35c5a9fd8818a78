use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use anyhow::Result;

use super::builtins::Builtin;
use super::bytecode::Function;

pub type Cell = Rc<RefCell<Value>>;
pub type ArrayHandle = Rc<RefCell<Vec<Value>>>;
pub type StructHandle = Rc<RefCell<StructInstance>>;

/// Field storage of a struct. Field order follows insertion and only matters for display.
#[derive(Debug, Clone, Default)]
pub struct StructInstance {
    fields: Vec<(String, Value)>,
}

impl StructInstance {
    pub fn new(fields: Vec<(String, Value)>) -> Self {
        let mut instance = Self::default();
        for (name, value) in fields {
            instance.set(&name, value);
        }
        instance
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields
            .iter()
            .find(|(field, _)| field == name)
            .map(|(_, value)| value)
    }

    /// Overwrites the field, inserting it when missing.
    pub fn set(&mut self, name: &str, value: Value) {
        match self.fields.iter_mut().find(|(field, _)| field == name) {
            Some((_, slot)) => *slot = value,
            None => self.fields.push((name.to_string(), value)),
        }
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.fields
            .iter()
            .map(|(name, value)| (name.as_str(), value))
    }
}

/// A function prototype paired with the cells it captured.
#[derive(Debug)]
pub struct Closure {
    pub function: Rc<Function>,
    pub upvalues: Vec<Cell>,
}

impl Closure {
    pub fn new(function: Rc<Function>, upvalues: Vec<Cell>) -> Self {
        Self { function, upvalues }
    }
}

/// Stable address of a storage slot.
#[derive(Debug, Clone)]
pub enum Locator {
    Global(usize),
    /// Slot of the frame at `depth`; `frame_id` catches references that outlived the frame.
    Local {
        depth: usize,
        frame_id: usize,
        slot: usize,
    },
    Cell(Cell),
    Element(ArrayHandle, usize),
    Field(StructHandle, String),
}

impl PartialEq for Locator {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Locator::Global(a), Locator::Global(b)) => a == b,
            (
                Locator::Local {
                    frame_id: a_frame,
                    slot: a_slot,
                    ..
                },
                Locator::Local {
                    frame_id: b_frame,
                    slot: b_slot,
                    ..
                },
            ) => a_frame == b_frame && a_slot == b_slot,
            (Locator::Cell(a), Locator::Cell(b)) => Rc::ptr_eq(a, b),
            (Locator::Element(a, i), Locator::Element(b, j)) => Rc::ptr_eq(a, b) && i == j,
            (Locator::Field(a, x), Locator::Field(b, y)) => Rc::ptr_eq(a, b) && x == y,
            _ => false,
        }
    }
}

#[derive(Debug, Clone)]
pub enum Value {
    Nil,
    Number(f64),
    Bool(bool),
    Str(String),
    Array(ArrayHandle),
    Struct(StructHandle),
    Function(Rc<Closure>),
    Builtin(Builtin),
    Reference(Locator),
}

impl Value {
    pub fn array(elements: Vec<Value>) -> Self {
        Value::Array(Rc::new(RefCell::new(elements)))
    }

    pub fn structure(instance: StructInstance) -> Self {
        Value::Struct(Rc::new(RefCell::new(instance)))
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Nil => "nil",
            Value::Number(_) => "number",
            Value::Bool(_) => "bool",
            Value::Str(_) => "string",
            Value::Array(_) => "array",
            Value::Struct(_) => "struct",
            Value::Function(_) => "function",
            Value::Builtin(_) => "builtin",
            Value::Reference(_) => "reference",
        }
    }
}

fn format_number(f: &mut fmt::Formatter<'_>, value: f64) -> fmt::Result {
    if value.is_finite() && value.fract() == 0.0 && value.abs() < 1e15 {
        write!(f, "{}", value as i64)
    } else {
        write!(f, "{value}")
    }
}

/// Identity of a shared handle, used to spot values that contain themselves.
fn handle_id<T>(handle: &Rc<RefCell<T>>) -> usize {
    Rc::as_ptr(handle) as *const () as usize
}

fn write_value(f: &mut fmt::Formatter<'_>, value: &Value, open: &mut Vec<usize>) -> fmt::Result {
    match value {
        Value::Nil => write!(f, "nil"),
        Value::Number(value) => format_number(f, *value),
        Value::Bool(value) => write!(f, "{value}"),
        Value::Str(value) => write!(f, "{value}"),
        Value::Array(elements) => {
            let id = handle_id(elements);
            if open.contains(&id) {
                return write!(f, "[...]");
            }
            open.push(id);
            write!(f, "[")?;
            for (index, element) in elements.borrow().iter().enumerate() {
                if index > 0 {
                    write!(f, ", ")?;
                }
                write_value(f, element, open)?;
            }
            open.pop();
            write!(f, "]")
        }
        Value::Struct(instance) => {
            let id = handle_id(instance);
            if open.contains(&id) {
                return write!(f, "{{...}}");
            }
            open.push(id);
            write!(f, "{{")?;
            for (index, (name, field)) in instance.borrow().iter().enumerate() {
                if index > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{name}: ")?;
                write_value(f, field, open)?;
            }
            open.pop();
            write!(f, "}}")
        }
        Value::Function(closure) => match &closure.function.name {
            Some(name) => write!(f, "<fn {name}>"),
            None => write!(f, "<fn>"),
        },
        Value::Builtin(builtin) => write!(f, "{builtin}"),
        Value::Reference(_) => write!(f, "<ref>"),
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_value(f, self, &mut Vec::new())
    }
}

/// Structural equality. `resolve` is applied to both sides and to every nested element
/// and field before they are compared, so the VM can look through references.
///
/// A pair of handles that is already being compared further up counts as equal, which
/// keeps self-containing values from recursing forever.
pub fn structural_eq<F>(left: &Value, right: &Value, resolve: &F) -> Result<bool>
where
    F: Fn(Value) -> Result<Value>,
{
    equal_values(left, right, resolve, &mut Vec::new())
}

fn equal_values<F>(
    left: &Value,
    right: &Value,
    resolve: &F,
    open: &mut Vec<(usize, usize)>,
) -> Result<bool>
where
    F: Fn(Value) -> Result<Value>,
{
    let left = resolve(left.clone())?;
    let right = resolve(right.clone())?;
    let equal = match (&left, &right) {
        (Value::Nil, Value::Nil) => true,
        (Value::Number(a), Value::Number(b)) => a == b,
        (Value::Bool(a), Value::Bool(b)) => a == b,
        (Value::Str(a), Value::Str(b)) => a == b,
        (Value::Array(a), Value::Array(b)) => {
            let pair = (handle_id(a), handle_id(b));
            if Rc::ptr_eq(a, b) || open.contains(&pair) {
                return Ok(true);
            }
            let (a, b) = (a.borrow(), b.borrow());
            if a.len() != b.len() {
                return Ok(false);
            }
            open.push(pair);
            let mut equal = true;
            for (x, y) in a.iter().zip(b.iter()) {
                if !equal_values(x, y, resolve, open)? {
                    equal = false;
                    break;
                }
            }
            open.pop();
            equal
        }
        (Value::Struct(a), Value::Struct(b)) => {
            let pair = (handle_id(a), handle_id(b));
            if Rc::ptr_eq(a, b) || open.contains(&pair) {
                return Ok(true);
            }
            let (a, b) = (a.borrow(), b.borrow());
            if a.len() != b.len() {
                return Ok(false);
            }
            open.push(pair);
            let mut equal = true;
            for (name, x) in a.iter() {
                let matched = match b.get(name) {
                    Some(y) => equal_values(x, y, resolve, open)?,
                    None => false,
                };
                if !matched {
                    equal = false;
                    break;
                }
            }
            open.pop();
            equal
        }
        (Value::Function(a), Value::Function(b)) => Rc::ptr_eq(a, b),
        (Value::Builtin(a), Value::Builtin(b)) => a.same_entry(b),
        (Value::Reference(a), Value::Reference(b)) => a == b,
        _ => false,
    };
    Ok(equal)
}

/// Compares without following references; references are equal when they name the same slot.
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        matches!(structural_eq(self, other, &|value| Ok(value)), Ok(true))
    }
}
