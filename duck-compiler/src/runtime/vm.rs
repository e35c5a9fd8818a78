use std::cell::RefCell;
use std::io::{self, Write};
use std::rc::Rc;

use anyhow::{bail, Context, Result};
use log::{debug, trace};

use super::builtins::{Builtin, Builtins};
use super::bytecode::{Function, Instruction, Program};
use super::value::{structural_eq, Cell, Closure, Locator, StructInstance, Value};
use crate::error::ScriptError;
use crate::resolver::CaptureSource;

/// Longest reference chain followed before it is treated as a cycle.
const MAX_REFERENCE_HOPS: usize = 64;
/// Deepest call nesting, the top-level frame included.
const MAX_FRAMES: usize = 512;
/// Value stack capacity shared by every live frame.
const MAX_STACK: usize = MAX_FRAMES * 256;

/// Faults in the bytecode itself rather than in the script.
#[derive(Debug)]
pub enum VmError {
    Runtime(String),
}

impl std::fmt::Display for VmError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VmError::Runtime(message) => write!(f, "{message}"),
        }
    }
}

impl std::error::Error for VmError {}

/// In-memory program output that stays readable after the VM took a handle to it.
#[derive(Debug, Clone, Default)]
pub struct SharedOutput(Rc<RefCell<Vec<u8>>>);

impl SharedOutput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.borrow()).into_owned()
    }
}

impl Write for SharedOutput {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.borrow_mut().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

struct Frame {
    closure: Rc<Closure>,
    ip: usize,
    /// Stack index of local slot 0, right after the callee.
    base: usize,
    id: usize,
    /// Cells opened for locals captured by closures, indexed by slot.
    open_cells: Vec<Option<Cell>>,
}

pub struct Vm {
    main: Rc<Function>,
    builtins: Builtins,
    stack: Vec<Value>,
    globals: Vec<Value>,
    frames: Vec<Frame>,
    next_frame_id: usize,
    output: Box<dyn Write>,
}

impl Vm {
    pub fn new(program: &Program) -> Self {
        Self::with_output(program, Box::new(io::stdout()))
    }

    pub fn with_output(program: &Program, output: Box<dyn Write>) -> Self {
        Self {
            main: Rc::clone(&program.main),
            builtins: program.builtins.clone(),
            stack: Vec::new(),
            globals: vec![Value::Nil; program.global_count],
            frames: Vec::new(),
            next_frame_id: 0,
            output,
        }
    }

    /// Swaps in the next program of a session. Existing globals keep their values.
    pub fn load(&mut self, program: &Program) {
        self.main = Rc::clone(&program.main);
        self.builtins = program.builtins.clone();
        if self.globals.len() < program.global_count {
            self.globals.resize(program.global_count, Value::Nil);
        }
    }

    pub fn reset(&mut self) {
        self.globals.clear();
        self.stack.clear();
        self.frames.clear();
    }

    pub fn globals(&self) -> &[Value] {
        &self.globals
    }

    pub fn run(&mut self) -> Result<()> {
        debug!(
            "vm start: {} globals, {} builtins",
            self.globals.len(),
            self.builtins.len()
        );
        self.stack.clear();
        self.frames.clear();

        let closure = Rc::new(Closure::new(Rc::clone(&self.main), Vec::new()));
        self.stack.push(Value::Function(Rc::clone(&closure)));
        let result = self
            .push_frame(closure, 1)
            .and_then(|()| self.execute());
        if result.is_err() {
            self.stack.clear();
            self.frames.clear();
        }
        self.output.flush()?;
        debug!("vm stop: ok={}", result.is_ok());
        result
    }

    fn execute(&mut self) -> Result<()> {
        while let Some(frame) = self.frames.last_mut() {
            let chunk = &frame.closure.function.chunk;
            let Some(instruction) = chunk.instructions.get(frame.ip).copied() else {
                bail!(VmError::Runtime(
                    "instruction pointer out of bounds".to_string()
                ));
            };
            let line = chunk.line(frame.ip);
            trace!("{:04} {:>4} {}", frame.ip, line, instruction);
            frame.ip += 1;

            self.step(instruction)
                .with_context(|| format!("[line {line}]"))?;
        }
        Ok(())
    }

    fn step(&mut self, instruction: Instruction) -> Result<()> {
        let frame_index = self.frames.len() - 1;
        match instruction {
            Instruction::Constant(index) => {
                let value = self.constant(frame_index, index)?;
                self.stack.push(value);
            }
            Instruction::Add => {
                let (left, right) = self.pop_operands()?;
                let result = match (left, right) {
                    (Value::Number(a), Value::Number(b)) => Value::Number(a + b),
                    (Value::Str(a), Value::Str(b)) => Value::Str(a + &b),
                    (left, right) => bail!(ScriptError::type_mismatch(format!(
                        "cannot add {} and {}",
                        left.type_name(),
                        right.type_name()
                    ))),
                };
                self.stack.push(result);
            }
            Instruction::Sub => self.perform_numeric_binary("subtract", |a, b| a - b)?,
            Instruction::Mul => self.perform_numeric_binary("multiply", |a, b| a * b)?,
            Instruction::Div => self.perform_numeric_binary("divide", |a, b| a / b)?,
            Instruction::Greater => self.perform_numeric_comparison(|a, b| a > b)?,
            Instruction::Less => self.perform_numeric_comparison(|a, b| a < b)?,
            Instruction::Equal => {
                let (left, right) = self.pop_operands()?;
                let equal = structural_eq(&left, &right, &|value| self.deref(value))?;
                self.stack.push(Value::Bool(equal));
            }
            Instruction::And => self.perform_logical("and", |a, b| a && b)?,
            Instruction::Or => self.perform_logical("or", |a, b| a || b)?,
            Instruction::Not => match self.pop_operand()? {
                Value::Bool(value) => self.stack.push(Value::Bool(!value)),
                other => bail!(ScriptError::type_mismatch(format!(
                    "'not' expects a bool, found {}",
                    other.type_name()
                ))),
            },
            Instruction::Minus => match self.pop_operand()? {
                Value::Number(value) => self.stack.push(Value::Number(-value)),
                other => bail!(ScriptError::type_mismatch(format!(
                    "cannot negate {}",
                    other.type_name()
                ))),
            },
            Instruction::BitAnd => self.perform_bitwise(|a, b| a & b)?,
            Instruction::BitOr => self.perform_bitwise(|a, b| a | b)?,
            Instruction::BitXor => self.perform_bitwise(|a, b| a ^ b)?,
            Instruction::BitNot => {
                let operand = self.pop_operand()?;
                let value = integer_operand(&operand)?;
                self.stack.push(Value::Number(!value as f64));
            }
            Instruction::Jump(target) => self.frames[frame_index].ip = target,
            Instruction::JumpIfFalse(target) => match self.pop_operand()? {
                Value::Bool(true) => {}
                Value::Bool(false) => self.frames[frame_index].ip = target,
                other => bail!(ScriptError::type_mismatch(format!(
                    "condition must be a bool, found {}",
                    other.type_name()
                ))),
            },
            Instruction::DefGlobal(slot) => {
                let value = self.peek()?.clone();
                if slot >= self.globals.len() {
                    self.globals.resize(slot + 1, Value::Nil);
                }
                self.globals[slot] = value;
            }
            Instruction::SetGlobal(slot) => {
                let value = self.peek()?.clone();
                self.assign(Locator::Global(slot), value)?;
            }
            Instruction::GetGlobal(slot) => {
                let value = self.read_locator(&Locator::Global(slot))?;
                self.stack.push(value);
            }
            Instruction::DefLocal(slot) => {
                let value = self.peek()?.clone();
                self.store_local(frame_index, slot, value)?;
            }
            Instruction::SetLocal(slot) => {
                let value = self.peek()?.clone();
                let locator = self.local_locator(frame_index, slot);
                self.assign(locator, value)?;
            }
            Instruction::GetLocal(slot) => {
                let value = self.read_local(frame_index, slot)?;
                self.stack.push(value);
            }
            Instruction::SetUpvalue(index) => {
                let value = self.peek()?.clone();
                let cell = self.upvalue(frame_index, index)?;
                self.assign(Locator::Cell(cell), value)?;
            }
            Instruction::GetUpvalue(index) => {
                let value = self.upvalue(frame_index, index)?.borrow().clone();
                self.stack.push(value);
            }
            Instruction::GetBuiltin(index) => {
                let builtin = self.builtins.get(index).cloned().ok_or_else(|| {
                    VmError::Runtime(format!("invalid builtin index {index}"))
                })?;
                self.stack.push(Value::Builtin(builtin));
            }
            Instruction::MakeArray(count) => {
                let elements = self.pop_n(count)?;
                self.stack.push(Value::array(elements));
            }
            Instruction::GetIndex => {
                let index = self.pop_operand()?;
                let container = self.pop_operand()?;
                let value = match container {
                    Value::Array(elements) => {
                        let elements = elements.borrow();
                        let position = element_index(&index, elements.len())?;
                        elements[position].clone()
                    }
                    Value::Str(text) => {
                        let chars: Vec<char> = text.chars().collect();
                        let position = element_index(&index, chars.len())?;
                        Value::Str(chars[position].to_string())
                    }
                    other => bail!(ScriptError::type_mismatch(format!(
                        "cannot index into {}",
                        other.type_name()
                    ))),
                };
                self.stack.push(value);
            }
            Instruction::SetIndex => {
                let index = self.pop_operand()?;
                let container = self.pop_operand()?;
                let value = self.peek()?.clone();
                let elements = match container {
                    Value::Array(elements) => elements,
                    other => bail!(ScriptError::type_mismatch(format!(
                        "cannot assign into an element of {}",
                        other.type_name()
                    ))),
                };
                let position = element_index(&index, elements.borrow().len())?;
                self.assign(Locator::Element(elements, position), value)?;
            }
            Instruction::MakeStruct(count) => {
                let values = self.pop_n(count * 2)?;
                let mut fields = Vec::with_capacity(count);
                let mut entries = values.into_iter();
                while let (Some(name), Some(value)) = (entries.next(), entries.next()) {
                    fields.push((field_name(name)?, value));
                }
                self.stack.push(Value::structure(StructInstance::new(fields)));
            }
            Instruction::GetField => {
                let name = field_name(self.pop()?)?;
                let value = match self.pop_operand()? {
                    Value::Struct(instance) => instance
                        .borrow()
                        .get(&name)
                        .cloned()
                        .ok_or(ScriptError::UnknownStructField { field: name })?,
                    other => bail!(ScriptError::type_mismatch(format!(
                        "cannot read field '{}' of {}",
                        name,
                        other.type_name()
                    ))),
                };
                self.stack.push(value);
            }
            Instruction::SetField => {
                let name = field_name(self.pop()?)?;
                let target = self.pop_operand()?;
                let value = self.peek()?.clone();
                let instance = match target {
                    Value::Struct(instance) => instance,
                    other => bail!(ScriptError::type_mismatch(format!(
                        "cannot set field '{}' on {}",
                        name,
                        other.type_name()
                    ))),
                };
                self.assign(Locator::Field(instance, name), value)?;
            }
            Instruction::RefGlobal(slot) => {
                self.stack.push(Value::Reference(Locator::Global(slot)));
            }
            Instruction::RefLocal(slot) => {
                let locator = self.local_locator(frame_index, slot);
                self.stack.push(Value::Reference(locator));
            }
            Instruction::RefUpvalue(index) => {
                let cell = self.upvalue(frame_index, index)?;
                self.stack.push(Value::Reference(Locator::Cell(cell)));
            }
            Instruction::RefIndexGlobal(slot) => {
                let container = self.read_locator(&Locator::Global(slot))?;
                self.push_element_reference(container)?;
            }
            Instruction::RefIndexLocal(slot) => {
                let container = self.read_local(frame_index, slot)?;
                self.push_element_reference(container)?;
            }
            Instruction::RefIndexUpvalue(index) => {
                let container = self.upvalue(frame_index, index)?.borrow().clone();
                self.push_element_reference(container)?;
            }
            Instruction::RefField => {
                let name = field_name(self.pop()?)?;
                match self.pop_operand()? {
                    Value::Struct(instance) => {
                        self.stack
                            .push(Value::Reference(Locator::Field(instance, name)));
                    }
                    other => bail!(ScriptError::invalid_reference(format!(
                        "cannot reference field '{}' of {}",
                        name,
                        other.type_name()
                    ))),
                }
            }
            Instruction::Closure(index) => {
                let closure = self.make_closure(frame_index, index)?;
                self.stack.push(Value::Function(closure));
            }
            Instruction::Call(arg_count) => self.call_value(arg_count)?,
            Instruction::Return(count) => {
                let value = if count == 0 { Value::Nil } else { self.pop()? };
                let frame = self
                    .frames
                    .pop()
                    .ok_or_else(|| VmError::Runtime("no active frame".to_string()))?;
                self.stack.truncate(frame.base.saturating_sub(1));
                if self.frames.is_empty() {
                    self.stack.clear();
                } else {
                    self.stack.push(value);
                }
            }
            Instruction::Pop => {
                self.pop()?;
            }
        }
        Ok(())
    }

    fn push_frame(&mut self, closure: Rc<Closure>, base: usize) -> Result<()> {
        if self.frames.len() >= MAX_FRAMES {
            bail!(ScriptError::StackOverflow {
                limit: format!("{MAX_FRAMES} nested calls"),
            });
        }
        let local_count = closure.function.local_count;
        if base + local_count > MAX_STACK {
            bail!(ScriptError::StackOverflow {
                limit: format!("{MAX_STACK} stack slots"),
            });
        }
        if self.stack.len() < base + local_count {
            self.stack.resize(base + local_count, Value::Nil);
        }
        let id = self.next_frame_id;
        self.next_frame_id += 1;
        self.frames.push(Frame {
            closure,
            ip: 0,
            base,
            id,
            open_cells: vec![None; local_count],
        });
        Ok(())
    }

    fn call_value(&mut self, arg_count: usize) -> Result<()> {
        let callee_index = self
            .stack
            .len()
            .checked_sub(arg_count + 1)
            .ok_or_else(|| VmError::Runtime("call stack underflow".to_string()))?;
        let callee = self.deref(self.stack[callee_index].clone())?;

        match callee {
            Value::Function(closure) => {
                let expected = closure.function.arity;
                if expected != arg_count {
                    bail!(ScriptError::ArityMismatch {
                        expected,
                        found: arg_count,
                    });
                }
                self.push_frame(closure, callee_index + 1)
            }
            Value::Builtin(Builtin::Function(native)) => {
                let raw = self.stack.split_off(callee_index + 1);
                self.stack.truncate(callee_index);
                let target = match raw.first() {
                    Some(Value::Reference(locator)) if native.updates_target => {
                        Some(locator.clone())
                    }
                    _ => None,
                };
                let args = raw
                    .into_iter()
                    .map(|value| self.deref(value))
                    .collect::<Result<Vec<_>>>()?;
                let result = native.call(self.output.as_mut(), &args)?;
                if let (Some(locator), Some(updated)) = (target, &result) {
                    self.assign(locator, updated.clone())?;
                }
                self.stack.push(result.unwrap_or(Value::Nil));
                Ok(())
            }
            other => bail!(ScriptError::type_mismatch(format!(
                "{} is not callable",
                other.type_name()
            ))),
        }
    }

    fn make_closure(&mut self, frame_index: usize, index: usize) -> Result<Rc<Closure>> {
        let prototype = match self.constant(frame_index, index)? {
            Value::Function(prototype) => prototype,
            _ => bail!(VmError::Runtime(format!(
                "constant {index} is not a function"
            ))),
        };
        let function = Rc::clone(&prototype.function);
        let mut upvalues = Vec::with_capacity(function.captures.len());
        for capture in &function.captures {
            let cell = match *capture {
                CaptureSource::ParentLocal(slot) => self.capture_local(frame_index, slot)?,
                CaptureSource::ParentUpvalue(upvalue) => self.upvalue(frame_index, upvalue)?,
            };
            upvalues.push(cell);
        }
        Ok(Rc::new(Closure::new(function, upvalues)))
    }

    /// Opens (or reuses) the cell that lets closures share a local of a live frame.
    fn capture_local(&mut self, frame_index: usize, slot: usize) -> Result<Cell> {
        if let Some(cell) = self.open_cell(frame_index, slot) {
            return Ok(cell);
        }
        let value = self.read_local(frame_index, slot)?;
        let cell = Rc::new(RefCell::new(value));
        let frame = &mut self.frames[frame_index];
        if slot >= frame.open_cells.len() {
            frame.open_cells.resize(slot + 1, None);
        }
        frame.open_cells[slot] = Some(Rc::clone(&cell));
        Ok(cell)
    }

    fn open_cell(&self, frame_index: usize, slot: usize) -> Option<Cell> {
        self.frames
            .get(frame_index)?
            .open_cells
            .get(slot)?
            .as_ref()
            .map(Rc::clone)
    }

    fn local_locator(&self, frame_index: usize, slot: usize) -> Locator {
        match self.open_cell(frame_index, slot) {
            Some(cell) => Locator::Cell(cell),
            None => Locator::Local {
                depth: frame_index,
                frame_id: self.frames[frame_index].id,
                slot,
            },
        }
    }

    fn local_index(&self, frame_index: usize, slot: usize) -> Result<usize> {
        let frame = self
            .frames
            .get(frame_index)
            .ok_or_else(|| VmError::Runtime("no active frame".to_string()))?;
        let index = frame.base + slot;
        if index >= self.stack.len() {
            bail!(VmError::Runtime(format!("invalid local index {slot}")));
        }
        Ok(index)
    }

    fn read_local(&self, frame_index: usize, slot: usize) -> Result<Value> {
        if let Some(cell) = self.open_cell(frame_index, slot) {
            return Ok(cell.borrow().clone());
        }
        let index = self.local_index(frame_index, slot)?;
        Ok(self.stack[index].clone())
    }

    fn store_local(&mut self, frame_index: usize, slot: usize, value: Value) -> Result<()> {
        if let Some(cell) = self.open_cell(frame_index, slot) {
            *cell.borrow_mut() = value.clone();
        }
        let index = self.local_index(frame_index, slot)?;
        self.stack[index] = value;
        Ok(())
    }

    fn upvalue(&self, frame_index: usize, index: usize) -> Result<Cell> {
        self.frames[frame_index]
            .closure
            .upvalues
            .get(index)
            .cloned()
            .ok_or_else(|| VmError::Runtime(format!("invalid upvalue index {index}")).into())
    }

    fn constant(&self, frame_index: usize, index: usize) -> Result<Value> {
        self.frames[frame_index]
            .closure
            .function
            .chunk
            .constants
            .get(index)
            .cloned()
            .ok_or_else(|| VmError::Runtime(format!("invalid constant index {index}")).into())
    }

    fn push_element_reference(&mut self, container: Value) -> Result<()> {
        let index = self.pop_operand()?;
        match self.deref(container)? {
            Value::Array(elements) => {
                let position = element_index(&index, elements.borrow().len())?;
                self.stack
                    .push(Value::Reference(Locator::Element(elements, position)));
                Ok(())
            }
            other => bail!(ScriptError::invalid_reference(format!(
                "cannot reference an element of {}",
                other.type_name()
            ))),
        }
    }

    fn read_locator(&self, locator: &Locator) -> Result<Value> {
        match locator {
            Locator::Global(slot) => self
                .globals
                .get(*slot)
                .cloned()
                .ok_or_else(|| VmError::Runtime(format!("invalid global index {slot}")).into()),
            Locator::Local {
                depth,
                frame_id,
                slot,
            } => {
                self.check_frame(*depth, *frame_id)?;
                self.read_local(*depth, *slot)
            }
            Locator::Cell(cell) => Ok(cell.borrow().clone()),
            Locator::Element(elements, index) => {
                let elements = elements.borrow();
                elements.get(*index).cloned().ok_or_else(|| {
                    ScriptError::IndexOutOfRange {
                        index: *index as i64,
                        len: elements.len(),
                    }
                    .into()
                })
            }
            Locator::Field(instance, name) => instance.borrow().get(name).cloned().ok_or_else(|| {
                ScriptError::UnknownStructField {
                    field: name.clone(),
                }
                .into()
            }),
        }
    }

    fn write_locator(&mut self, locator: &Locator, value: Value) -> Result<()> {
        match locator {
            Locator::Global(slot) => {
                let target = self.globals.get_mut(*slot).ok_or_else(|| {
                    VmError::Runtime(format!("invalid global index {slot}"))
                })?;
                *target = value;
            }
            Locator::Local {
                depth,
                frame_id,
                slot,
            } => {
                self.check_frame(*depth, *frame_id)?;
                self.store_local(*depth, *slot, value)?;
            }
            Locator::Cell(cell) => *cell.borrow_mut() = value,
            Locator::Element(elements, index) => {
                let mut elements = elements.borrow_mut();
                let len = elements.len();
                let target = elements
                    .get_mut(*index)
                    .ok_or(ScriptError::IndexOutOfRange {
                        index: *index as i64,
                        len,
                    })?;
                *target = value;
            }
            Locator::Field(instance, name) => instance.borrow_mut().set(name, value),
        }
        Ok(())
    }

    fn check_frame(&self, depth: usize, frame_id: usize) -> Result<()> {
        match self.frames.get(depth) {
            Some(frame) if frame.id == frame_id => Ok(()),
            _ => bail!(ScriptError::invalid_reference(
                "referenced local no longer exists"
            )),
        }
    }

    /// Stores `value` at `destination`, writing through a reference held there unless the
    /// new value is itself a reference.
    fn assign(&mut self, destination: Locator, value: Value) -> Result<()> {
        if matches!(value, Value::Reference(_)) {
            return self.write_locator(&destination, value);
        }

        let mut target = destination;
        for _ in 0..MAX_REFERENCE_HOPS {
            let current = match &target {
                Locator::Field(instance, name) => instance.borrow().get(name).cloned(),
                other => Some(self.read_locator(other)?),
            };
            match current {
                Some(Value::Reference(next)) => target = next,
                _ => return self.write_locator(&target, value),
            }
        }
        bail!(ScriptError::invalid_reference(
            "reference chain is too long or cyclic"
        ))
    }

    /// Follows references and builtin variables to the value they stand for.
    fn deref(&self, value: Value) -> Result<Value> {
        let mut current = value;
        for _ in 0..MAX_REFERENCE_HOPS {
            current = match current {
                Value::Reference(locator) => self.read_locator(&locator)?,
                Value::Builtin(Builtin::Variable(inner)) => (*inner).clone(),
                other => return Ok(other),
            };
        }
        bail!(ScriptError::invalid_reference(
            "reference chain is too long or cyclic"
        ))
    }

    fn peek(&self) -> Result<&Value> {
        self.stack.last().ok_or_else(|| {
            anyhow::Error::new(VmError::Runtime(
                "attempted to peek an empty stack".to_string(),
            ))
        })
    }

    fn pop(&mut self) -> Result<Value> {
        self.stack.pop().ok_or_else(|| {
            anyhow::Error::new(VmError::Runtime(
                "attempted to pop from empty stack".to_string(),
            ))
        })
    }

    fn pop_operand(&mut self) -> Result<Value> {
        let value = self.pop()?;
        self.deref(value)
    }

    /// Left operand sits on top: binary operators push right first.
    fn pop_operands(&mut self) -> Result<(Value, Value)> {
        let left = self.pop_operand()?;
        let right = self.pop_operand()?;
        Ok((left, right))
    }

    fn pop_n(&mut self, count: usize) -> Result<Vec<Value>> {
        if self.stack.len() < count {
            bail!(VmError::Runtime(
                "not enough values on stack".to_string()
            ));
        }
        Ok(self.stack.split_off(self.stack.len() - count))
    }

    fn perform_numeric_binary<F>(&mut self, verb: &str, op: F) -> Result<()>
    where
        F: FnOnce(f64, f64) -> f64,
    {
        let result = match self.pop_operands()? {
            (Value::Number(a), Value::Number(b)) => op(a, b),
            (left, right) => bail!(ScriptError::type_mismatch(format!(
                "cannot {} {} and {}",
                verb,
                left.type_name(),
                right.type_name()
            ))),
        };
        self.stack.push(Value::Number(result));
        Ok(())
    }

    fn perform_numeric_comparison<F>(&mut self, op: F) -> Result<()>
    where
        F: FnOnce(f64, f64) -> bool,
    {
        let result = match self.pop_operands()? {
            (Value::Number(a), Value::Number(b)) => op(a, b),
            (left, right) => bail!(ScriptError::type_mismatch(format!(
                "cannot compare {} with {}",
                left.type_name(),
                right.type_name()
            ))),
        };
        self.stack.push(Value::Bool(result));
        Ok(())
    }

    fn perform_logical<F>(&mut self, operator: &str, op: F) -> Result<()>
    where
        F: FnOnce(bool, bool) -> bool,
    {
        let result = match self.pop_operands()? {
            (Value::Bool(a), Value::Bool(b)) => op(a, b),
            (left, right) => bail!(ScriptError::type_mismatch(format!(
                "'{}' expects bools, found {} and {}",
                operator,
                left.type_name(),
                right.type_name()
            ))),
        };
        self.stack.push(Value::Bool(result));
        Ok(())
    }

    fn perform_bitwise<F>(&mut self, op: F) -> Result<()>
    where
        F: FnOnce(i64, i64) -> i64,
    {
        let (left, right) = self.pop_operands()?;
        let result = op(integer_operand(&left)?, integer_operand(&right)?);
        self.stack.push(Value::Number(result as f64));
        Ok(())
    }
}

fn integer_operand(value: &Value) -> Result<i64> {
    match value {
        Value::Number(number) => Ok(*number as i64),
        other => bail!(ScriptError::type_mismatch(format!(
            "bitwise operators expect numbers, found {}",
            other.type_name()
        ))),
    }
}

fn element_index(index: &Value, len: usize) -> Result<usize> {
    let Value::Number(number) = index else {
        bail!(ScriptError::type_mismatch(format!(
            "index must be a number, found {}",
            index.type_name()
        )));
    };
    if number.fract() != 0.0 {
        bail!(ScriptError::type_mismatch(format!(
            "index must be an integer, found {number}"
        )));
    }
    let index = *number as i64;
    if index < 0 || index as usize >= len {
        bail!(ScriptError::IndexOutOfRange { index, len });
    }
    Ok(index as usize)
}

fn field_name(value: Value) -> Result<String> {
    match value {
        Value::Str(name) => Ok(name),
        other => bail!(VmError::Runtime(format!(
            "field name must be a string constant, found {}",
            other.type_name()
        ))),
    }
}
