use std::fmt;
use std::rc::Rc;
use std::str::FromStr;

use anyhow::{anyhow, bail, Context, Result};

use super::builtins::Builtins;
use super::value::{Closure, Value};
use crate::resolver::CaptureSource;

#[derive(Debug, Clone)]
pub struct Program {
    pub main: Rc<Function>,
    pub global_count: usize,
    pub builtins: Builtins,
}

impl Program {
    pub fn new(main: Function, global_count: usize, builtins: Builtins) -> Self {
        Self {
            main: Rc::new(main),
            global_count,
            builtins,
        }
    }

    /// Listing of the main chunk followed by every nested function.
    pub fn disassemble(&self) -> String {
        let mut listing = String::new();
        self.main.disassemble_into(&mut listing);
        listing
    }

    /// Rebuilds every chunk from its textual listing.
    pub fn reassemble(&self) -> Result<Program> {
        Ok(Program {
            main: Rc::new(self.main.reassemble()?),
            global_count: self.global_count,
            builtins: self.builtins.clone(),
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct Chunk {
    pub instructions: Vec<Instruction>,
    pub constants: Vec<Value>,
    pub lines: Vec<usize>,
}

impl Chunk {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn emit(&mut self, instruction: Instruction, line: usize) -> usize {
        let index = self.instructions.len();
        self.instructions.push(instruction);
        self.lines.push(line);
        index
    }

    pub fn add_constant(&mut self, value: Value) -> usize {
        self.constants.push(value);
        self.constants.len() - 1
    }

    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }

    pub fn line(&self, index: usize) -> usize {
        self.lines.get(index).copied().unwrap_or(0)
    }

    /// One `index line INSTRUCTION` row per instruction.
    pub fn disassemble(&self) -> String {
        let mut listing = String::new();
        for (index, instruction) in self.instructions.iter().enumerate() {
            listing.push_str(&format!(
                "{:04} {:>4} {}\n",
                index,
                self.line(index),
                instruction
            ));
        }
        listing
    }

    /// Inverse of [`Chunk::disassemble`]. Constants are not part of the listing.
    pub fn assemble(listing: &str, constants: Vec<Value>) -> Result<Chunk> {
        let mut chunk = Chunk {
            constants,
            ..Chunk::default()
        };
        for (row, text) in listing.lines().enumerate() {
            if text.trim().is_empty() {
                continue;
            }
            let mut parts = text.split_whitespace();
            let _index = parts.next();
            let line = parts
                .next()
                .ok_or_else(|| anyhow!("missing line number in row {}", row + 1))?
                .parse::<usize>()
                .with_context(|| format!("invalid line number in row {}", row + 1))?;
            let instruction = parts.collect::<Vec<_>>().join(" ").parse::<Instruction>()?;
            chunk.emit(instruction, line);
        }
        Ok(chunk)
    }
}

/// Compiled function prototype. Closures pair it with captured cells at runtime.
#[derive(Debug, Clone)]
pub struct Function {
    pub name: Option<String>,
    pub arity: usize,
    pub local_count: usize,
    pub captures: Vec<CaptureSource>,
    pub chunk: Chunk,
}

impl Function {
    fn label(&self) -> &str {
        self.name.as_deref().unwrap_or("<anonymous>")
    }

    fn disassemble_into(&self, listing: &mut String) {
        listing.push_str(&format!(
            "== {} (arity {}, locals {}) ==\n",
            self.label(),
            self.arity,
            self.local_count
        ));
        listing.push_str(&self.chunk.disassemble());
        for constant in &self.chunk.constants {
            if let Value::Function(closure) = constant {
                closure.function.disassemble_into(listing);
            }
        }
    }

    fn reassemble(&self) -> Result<Function> {
        let constants = self
            .chunk
            .constants
            .iter()
            .map(|constant| match constant {
                Value::Function(closure) => Ok(Value::Function(Rc::new(Closure::new(
                    Rc::new(closure.function.reassemble()?),
                    Vec::new(),
                )))),
                other => Ok(other.clone()),
            })
            .collect::<Result<Vec<_>>>()?;
        let chunk = Chunk::assemble(&self.chunk.disassemble(), constants)
            .with_context(|| format!("failed to reassemble {}", self.label()))?;
        Ok(Function {
            chunk,
            ..self.clone()
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Instruction {
    Constant(usize),
    Add,
    Sub,
    Mul,
    Div,
    Equal,
    Greater,
    Less,
    Not,
    Minus,
    And,
    Or,
    BitAnd,
    BitOr,
    BitXor,
    BitNot,
    Jump(usize),
    JumpIfFalse(usize),
    DefGlobal(usize),
    SetGlobal(usize),
    GetGlobal(usize),
    DefLocal(usize),
    SetLocal(usize),
    GetLocal(usize),
    SetUpvalue(usize),
    GetUpvalue(usize),
    GetBuiltin(usize),
    MakeArray(usize),
    GetIndex,
    SetIndex,
    MakeStruct(usize),
    GetField,
    SetField,
    RefGlobal(usize),
    RefLocal(usize),
    RefUpvalue(usize),
    RefIndexGlobal(usize),
    RefIndexLocal(usize),
    RefIndexUpvalue(usize),
    RefField,
    Closure(usize),
    Call(usize),
    Return(usize),
    Pop,
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Instruction::Constant(index) => write!(f, "CONSTANT {index}"),
            Instruction::Add => write!(f, "ADD"),
            Instruction::Sub => write!(f, "SUB"),
            Instruction::Mul => write!(f, "MUL"),
            Instruction::Div => write!(f, "DIV"),
            Instruction::Equal => write!(f, "EQUAL"),
            Instruction::Greater => write!(f, "GREATER"),
            Instruction::Less => write!(f, "LESS"),
            Instruction::Not => write!(f, "NOT"),
            Instruction::Minus => write!(f, "MINUS"),
            Instruction::And => write!(f, "AND"),
            Instruction::Or => write!(f, "OR"),
            Instruction::BitAnd => write!(f, "BIT_AND"),
            Instruction::BitOr => write!(f, "BIT_OR"),
            Instruction::BitXor => write!(f, "BIT_XOR"),
            Instruction::BitNot => write!(f, "BIT_NOT"),
            Instruction::Jump(target) => write!(f, "JUMP {target}"),
            Instruction::JumpIfFalse(target) => write!(f, "JUMP_IF_FALSE {target}"),
            Instruction::DefGlobal(slot) => write!(f, "DEF_GLOBAL {slot}"),
            Instruction::SetGlobal(slot) => write!(f, "SET_GLOBAL {slot}"),
            Instruction::GetGlobal(slot) => write!(f, "GET_GLOBAL {slot}"),
            Instruction::DefLocal(slot) => write!(f, "DEF_LOCAL {slot}"),
            Instruction::SetLocal(slot) => write!(f, "SET_LOCAL {slot}"),
            Instruction::GetLocal(slot) => write!(f, "GET_LOCAL {slot}"),
            Instruction::SetUpvalue(index) => write!(f, "SET_UPVALUE {index}"),
            Instruction::GetUpvalue(index) => write!(f, "GET_UPVALUE {index}"),
            Instruction::GetBuiltin(index) => write!(f, "GET_BUILTIN {index}"),
            Instruction::MakeArray(count) => write!(f, "ARRAY {count}"),
            Instruction::GetIndex => write!(f, "GET_INDEX"),
            Instruction::SetIndex => write!(f, "SET_INDEX"),
            Instruction::MakeStruct(count) => write!(f, "STRUCT {count}"),
            Instruction::GetField => write!(f, "GET_STRUCT"),
            Instruction::SetField => write!(f, "SET_STRUCT"),
            Instruction::RefGlobal(slot) => write!(f, "REF_GLOBAL {slot}"),
            Instruction::RefLocal(slot) => write!(f, "REF_LOCAL {slot}"),
            Instruction::RefUpvalue(index) => write!(f, "REF_UPVALUE {index}"),
            Instruction::RefIndexGlobal(slot) => write!(f, "REF_INDEX_GLOBAL {slot}"),
            Instruction::RefIndexLocal(slot) => write!(f, "REF_INDEX_LOCAL {slot}"),
            Instruction::RefIndexUpvalue(index) => write!(f, "REF_INDEX_UPVALUE {index}"),
            Instruction::RefField => write!(f, "REF_STRUCT"),
            Instruction::Closure(index) => write!(f, "CLOSURE {index}"),
            Instruction::Call(args) => write!(f, "CALL {args}"),
            Instruction::Return(count) => write!(f, "RETURN {count}"),
            Instruction::Pop => write!(f, "POP"),
        }
    }
}

impl FromStr for Instruction {
    type Err = anyhow::Error;

    fn from_str(text: &str) -> Result<Self> {
        let mut parts = text.split_whitespace();
        let mnemonic = parts
            .next()
            .ok_or_else(|| anyhow!("empty instruction"))?;
        let operand = parts.next();
        if let Some(extra) = parts.next() {
            bail!("unexpected operand '{}' in '{}'", extra, text);
        }

        let argument = || -> Result<usize> {
            let operand = operand.ok_or_else(|| anyhow!("{} expects an operand", mnemonic))?;
            operand
                .parse::<usize>()
                .with_context(|| format!("invalid operand '{}' for {}", operand, mnemonic))
        };

        let instruction = match mnemonic {
            "CONSTANT" => Instruction::Constant(argument()?),
            "JUMP" => Instruction::Jump(argument()?),
            "JUMP_IF_FALSE" => Instruction::JumpIfFalse(argument()?),
            "DEF_GLOBAL" => Instruction::DefGlobal(argument()?),
            "SET_GLOBAL" => Instruction::SetGlobal(argument()?),
            "GET_GLOBAL" => Instruction::GetGlobal(argument()?),
            "DEF_LOCAL" => Instruction::DefLocal(argument()?),
            "SET_LOCAL" => Instruction::SetLocal(argument()?),
            "GET_LOCAL" => Instruction::GetLocal(argument()?),
            "SET_UPVALUE" => Instruction::SetUpvalue(argument()?),
            "GET_UPVALUE" => Instruction::GetUpvalue(argument()?),
            "GET_BUILTIN" => Instruction::GetBuiltin(argument()?),
            "ARRAY" => Instruction::MakeArray(argument()?),
            "STRUCT" => Instruction::MakeStruct(argument()?),
            "REF_GLOBAL" => Instruction::RefGlobal(argument()?),
            "REF_LOCAL" => Instruction::RefLocal(argument()?),
            "REF_UPVALUE" => Instruction::RefUpvalue(argument()?),
            "REF_INDEX_GLOBAL" => Instruction::RefIndexGlobal(argument()?),
            "REF_INDEX_LOCAL" => Instruction::RefIndexLocal(argument()?),
            "REF_INDEX_UPVALUE" => Instruction::RefIndexUpvalue(argument()?),
            "CLOSURE" => Instruction::Closure(argument()?),
            "CALL" => Instruction::Call(argument()?),
            "RETURN" => Instruction::Return(argument()?),
            other => {
                if operand.is_some() {
                    bail!("{} takes no operand", other);
                }
                match other {
                    "ADD" => Instruction::Add,
                    "SUB" => Instruction::Sub,
                    "MUL" => Instruction::Mul,
                    "DIV" => Instruction::Div,
                    "EQUAL" => Instruction::Equal,
                    "GREATER" => Instruction::Greater,
                    "LESS" => Instruction::Less,
                    "NOT" => Instruction::Not,
                    "MINUS" => Instruction::Minus,
                    "AND" => Instruction::And,
                    "OR" => Instruction::Or,
                    "BIT_AND" => Instruction::BitAnd,
                    "BIT_OR" => Instruction::BitOr,
                    "BIT_XOR" => Instruction::BitXor,
                    "BIT_NOT" => Instruction::BitNot,
                    "GET_INDEX" => Instruction::GetIndex,
                    "SET_INDEX" => Instruction::SetIndex,
                    "GET_STRUCT" => Instruction::GetField,
                    "SET_STRUCT" => Instruction::SetField,
                    "REF_STRUCT" => Instruction::RefField,
                    "POP" => Instruction::Pop,
                    unknown => bail!("unknown instruction '{}'", unknown),
                }
            }
        };
        Ok(instruction)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mnemonics_parse_back() -> Result<()> {
        let instructions = [
            Instruction::Constant(0),
            Instruction::JumpIfFalse(7),
            Instruction::RefIndexUpvalue(2),
            Instruction::GetField,
            Instruction::Return(1),
            Instruction::Pop,
        ];
        for instruction in instructions {
            assert_eq!(instruction.to_string().parse::<Instruction>()?, instruction);
        }
        Ok(())
    }

    #[test]
    fn rejects_malformed_rows() {
        assert!("JUMP".parse::<Instruction>().is_err());
        assert!("POP 3".parse::<Instruction>().is_err());
        assert!("CONSTANT x".parse::<Instruction>().is_err());
        assert!("HALT".parse::<Instruction>().is_err());
    }

    #[test]
    fn listing_keeps_line_table() -> Result<()> {
        let mut chunk = Chunk::new();
        let constant = chunk.add_constant(Value::Number(1.0));
        chunk.emit(Instruction::Constant(constant), 3);
        chunk.emit(Instruction::Pop, 4);
        assert_eq!(chunk.disassemble(), "0000    3 CONSTANT 0\n0001    4 POP\n");

        let rebuilt = Chunk::assemble(&chunk.disassemble(), chunk.constants.clone())?;
        assert_eq!(rebuilt.instructions, chunk.instructions);
        assert_eq!(rebuilt.lines, vec![3, 4]);
        Ok(())
    }
}
