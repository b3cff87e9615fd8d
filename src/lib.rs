mod chunk;
mod compiler;
mod debug;
mod heap;
mod interpreter;
mod object;
mod scanner;
mod table;
mod value;
mod vm;

pub use chunk::{Chunk, Op};
pub use compiler::compile;
pub use debug::{disassemble_chunk, disassemble_instruction};
pub use heap::{Heap, HeapSettings};
pub use object::{Function, NativeFn, Obj, ObjKind};
pub use scanner::{Scanner, Token, TokenKind};
pub use table::Table;
pub use value::{Gc, Value};
pub use vm::{InterpretResult, RuntimeError, TraceFrame, Vm, FRAMES_MAX, STACK_MAX};
