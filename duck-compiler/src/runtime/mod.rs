mod builtins;
mod bytecode;
mod codegen;
mod value;
mod vm;

pub use builtins::{Builtin, Builtins, NativeData, NativeFn, NativeFunction};
pub use bytecode::{Chunk, Function, Instruction, Program};
pub use codegen::CodeGenerator;
pub use value::{Cell, Closure, Locator, StructInstance, Value};
pub use vm::{SharedOutput, Vm, VmError};
