//! Chunk disassembly, for tests and the CLI's `--dump` flag. Kept out of
//! the dispatch loop entirely.

use std::fmt::Write;

use crate::chunk::{Chunk, Op};
use crate::value::Value;

/// Render a whole chunk under a header.
pub fn disassemble_chunk(chunk: &Chunk, name: &str) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "== {name} ==");
    let mut offset = 0;
    while offset < chunk.code.len() {
        offset = disassemble_instruction(&mut out, chunk, offset);
    }
    out
}

/// Render one instruction; returns the offset of the next one.
pub fn disassemble_instruction(out: &mut String, chunk: &Chunk, offset: usize) -> usize {
    let _ = write!(out, "{offset:04} ");
    if offset > 0 && chunk.line(offset) == chunk.line(offset - 1) {
        let _ = write!(out, "   | ");
    } else {
        let _ = write!(out, "{:4} ", chunk.line(offset));
    }

    // SAFETY: disassembly walks compiler-produced code
    let op = unsafe { Op::from_u8(chunk.code[offset]) };
    match op {
        Op::Constant => constant_instruction(out, "CONSTANT", chunk, offset),
        Op::Nil => simple_instruction(out, "NIL", offset),
        Op::True => simple_instruction(out, "TRUE", offset),
        Op::False => simple_instruction(out, "FALSE", offset),
        Op::Pop => simple_instruction(out, "POP", offset),
        Op::GetLocal => byte_instruction(out, "GET_LOCAL", chunk, offset),
        Op::SetLocal => byte_instruction(out, "SET_LOCAL", chunk, offset),
        Op::GetGlobal => constant_instruction(out, "GET_GLOBAL", chunk, offset),
        Op::DefineGlobal => constant_instruction(out, "DEFINE_GLOBAL", chunk, offset),
        Op::SetGlobal => constant_instruction(out, "SET_GLOBAL", chunk, offset),
        Op::GetUpvalue => byte_instruction(out, "GET_UPVALUE", chunk, offset),
        Op::SetUpvalue => byte_instruction(out, "SET_UPVALUE", chunk, offset),
        Op::GetProperty => constant_instruction(out, "GET_PROPERTY", chunk, offset),
        Op::SetProperty => constant_instruction(out, "SET_PROPERTY", chunk, offset),
        Op::GetSuper => constant_instruction(out, "GET_SUPER", chunk, offset),
        Op::Equal => simple_instruction(out, "EQUAL", offset),
        Op::Greater => simple_instruction(out, "GREATER", offset),
        Op::Less => simple_instruction(out, "LESS", offset),
        Op::Add => simple_instruction(out, "ADD", offset),
        Op::Subtract => simple_instruction(out, "SUBTRACT", offset),
        Op::Multiply => simple_instruction(out, "MULTIPLY", offset),
        Op::Divide => simple_instruction(out, "DIVIDE", offset),
        Op::Not => simple_instruction(out, "NOT", offset),
        Op::Negate => simple_instruction(out, "NEGATE", offset),
        Op::Print => simple_instruction(out, "PRINT", offset),
        Op::Jump => jump_instruction(out, "JUMP", 1, chunk, offset),
        Op::JumpIfFalse => jump_instruction(out, "JUMP_IF_FALSE", 1, chunk, offset),
        Op::Loop => jump_instruction(out, "LOOP", -1, chunk, offset),
        Op::Call => byte_instruction(out, "CALL", chunk, offset),
        Op::Invoke => invoke_instruction(out, "INVOKE", chunk, offset),
        Op::SuperInvoke => invoke_instruction(out, "SUPER_INVOKE", chunk, offset),
        Op::Closure => closure_instruction(out, chunk, offset),
        Op::CloseUpvalue => simple_instruction(out, "CLOSE_UPVALUE", offset),
        Op::Return => simple_instruction(out, "RETURN", offset),
        Op::Class => constant_instruction(out, "CLASS", chunk, offset),
        Op::Inherit => simple_instruction(out, "INHERIT", offset),
        Op::Method => constant_instruction(out, "METHOD", chunk, offset),
    }
}

fn simple_instruction(out: &mut String, name: &str, offset: usize) -> usize {
    let _ = writeln!(out, "{name}");
    offset + 1
}

fn byte_instruction(out: &mut String, name: &str, chunk: &Chunk, offset: usize) -> usize {
    let slot = chunk.code[offset + 1];
    let _ = writeln!(out, "{name:<16} {slot:4}");
    offset + 2
}

fn constant_instruction(out: &mut String, name: &str, chunk: &Chunk, offset: usize) -> usize {
    let constant = chunk.code[offset + 1];
    let value = chunk.constants[constant as usize];
    let _ = writeln!(out, "{name:<16} {constant:4} '{value}'");
    offset + 2
}

fn invoke_instruction(out: &mut String, name: &str, chunk: &Chunk, offset: usize) -> usize {
    let constant = chunk.code[offset + 1];
    let argc = chunk.code[offset + 2];
    let value = chunk.constants[constant as usize];
    let _ = writeln!(out, "{name:<16} ({argc} args) {constant:4} '{value}'");
    offset + 3
}

fn jump_instruction(
    out: &mut String,
    name: &str,
    sign: i64,
    chunk: &Chunk,
    offset: usize,
) -> usize {
    let jump = u16::from_be_bytes([chunk.code[offset + 1], chunk.code[offset + 2]]) as i64;
    let target = offset as i64 + 3 + sign * jump;
    let _ = writeln!(out, "{name:<16} {offset:4} -> {target}");
    offset + 3
}

fn closure_instruction(out: &mut String, chunk: &Chunk, offset: usize) -> usize {
    let mut offset = offset + 1;
    let constant = chunk.code[offset];
    offset += 1;
    let value = chunk.constants[constant as usize];
    let _ = writeln!(out, "{:<16} {constant:4} {value}", "CLOSURE");

    let upvalue_count = match value {
        // SAFETY: closure constants are live functions
        Value::Obj(obj) => unsafe { obj.as_ref() }.as_function().upvalue_count,
        _ => 0,
    };
    for _ in 0..upvalue_count {
        let is_local = chunk.code[offset] != 0;
        let index = chunk.code[offset + 1];
        let _ = writeln!(
            out,
            "{:04}      |                     {} {index}",
            offset,
            if is_local { "local" } else { "upvalue" },
        );
        offset += 2;
    }
    offset
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::compile;
    use crate::vm::Vm;

    #[test]
    fn disassembles_a_simple_script() {
        let mut vm = Vm::default();
        let function = compile(&mut vm, "print 1 + 2;").expect("compiles");
        // SAFETY: nothing allocates (so nothing collects) before the VM drops
        let chunk = &unsafe { function.as_ref() }.as_function().chunk;

        let listing = disassemble_chunk(chunk, "script");
        assert!(listing.starts_with("== script =="));
        assert!(listing.contains("CONSTANT"));
        assert!(listing.contains("ADD"));
        assert!(listing.contains("PRINT"));
        assert!(listing.contains("RETURN"));
    }

    #[test]
    fn closure_listing_annotates_captures() {
        let mut vm = Vm::default();
        let function = compile(
            &mut vm,
            "fun outer() { var x = 1; fun inner() { return x; } return inner; }",
        )
        .expect("compiles");
        // SAFETY: nothing allocates (so nothing collects) before the VM drops
        let chunk = &unsafe { function.as_ref() }.as_function().chunk;

        // the outer function lives in the script's constant pool; its own
        // chunk carries the CLOSURE over `inner` with one local capture
        let outer = chunk
            .constants
            .iter()
            .find_map(|value| match value {
                // SAFETY: constants are live
                Value::Obj(obj) => match &unsafe { obj.as_ref() }.kind {
                    crate::object::ObjKind::Function(f) => Some(f),
                    _ => None,
                },
                _ => None,
            })
            .expect("outer function constant");

        let listing = disassemble_chunk(&outer.chunk, "outer");
        assert!(listing.contains("CLOSURE"));
        assert!(listing.contains("local 1"));
    }
}
