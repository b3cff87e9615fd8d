//! Heap objects.
//!
//! Every managed allocation is an [`Obj`]: a small header (mark flags and
//! the intrusive allocation-list link the sweeper walks) followed by a
//! tagged payload. The payload is a sum over the eight object kinds, so
//! tracing, sizing, freeing and printing all dispatch with one exhaustive
//! match instead of downcasts.

use std::fmt;
use std::mem;

use bitflags::bitflags;

use crate::chunk::Chunk;
use crate::table::Table;
use crate::value::{Gc, Value};
use crate::vm::Vm;

bitflags! {
    /// Per-object header flags.
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub struct ObjFlags: u8 {
        /// Reached during the current mark phase.
        const MARKED = 1 << 0;
    }
}

/// A heap object: header plus tagged payload.
#[derive(Debug)]
pub struct Obj {
    pub flags: ObjFlags,
    /// Next object on the global allocation list. Used only by the sweeper.
    pub next: Option<Gc>,
    pub kind: ObjKind,
}

#[derive(Debug)]
pub enum ObjKind {
    String(VmString),
    Function(Function),
    Native(Native),
    Closure(Closure),
    Upvalue(Upvalue),
    Class(Class),
    Instance(Instance),
    BoundMethod(BoundMethod),
}

/// An immutable, interned string with its precomputed hash.
///
/// Any two strings with equal bytes share one object, so equality is
/// identity and table keys compare by pointer.
#[derive(Debug)]
pub struct VmString {
    pub hash: u32,
    pub chars: Box<str>,
}

/// A compiled function: arity, captured-variable count, bytecode, and the
/// name it was declared with (`None` for the top-level script).
#[derive(Debug)]
pub struct Function {
    pub arity: usize,
    pub upvalue_count: usize,
    pub chunk: Chunk,
    pub name: Option<Gc>,
}

/// Host function exposed to scripts. Receives the calling VM (read-only,
/// so host state like the clock origin needs no process globals) and the
/// argument slice; must not allocate through the managed heap.
pub type NativeFn = fn(vm: &Vm, args: &[Value]) -> Value;

pub struct Native {
    pub function: NativeFn,
}

/// A function paired with its captured upvalues. `upvalues` has exactly
/// `function.upvalue_count` entries; the slots are `None` only while the
/// CLOSURE instruction that builds the closure is still executing.
#[derive(Debug)]
pub struct Closure {
    pub function: Gc,
    pub upvalues: Vec<Option<Gc>>,
}

/// A captured-variable cell.
///
/// Open while the variable still lives on the operand stack (the cell
/// records the absolute stack slot), closed once the slot is popped (the
/// cell owns the value). Open upvalues form an intrusive list sorted by
/// strictly decreasing stack slot, threaded through `next`.
#[derive(Debug)]
pub struct Upvalue {
    pub cell: UpvalueCell,
    pub next: Option<Gc>,
}

#[derive(Debug, Copy, Clone)]
pub enum UpvalueCell {
    Open(usize),
    Closed(Value),
}

#[derive(Debug)]
pub struct Class {
    pub name: Gc,
    pub methods: Table,
}

#[derive(Debug)]
pub struct Instance {
    pub class: Gc,
    pub fields: Table,
}

/// A method fused with the receiver it was accessed on.
#[derive(Debug)]
pub struct BoundMethod {
    pub receiver: Value,
    pub method: Gc,
}

impl Obj {
    pub fn new(kind: ObjKind) -> Self {
        Self {
            flags: ObjFlags::empty(),
            next: None,
            kind,
        }
    }

    #[inline]
    pub fn is_marked(&self) -> bool {
        self.flags.contains(ObjFlags::MARKED)
    }

    #[inline]
    pub fn set_marked(&mut self, marked: bool) {
        self.flags.set(ObjFlags::MARKED, marked);
    }

    /// Bytes this object accounts for against the GC trigger: the header
    /// plus the payload's owned allocations, at their current capacity.
    pub fn heap_size(&self) -> usize {
        mem::size_of::<Obj>() + self.kind.payload_size()
    }

    pub fn as_string(&self) -> &VmString {
        match &self.kind {
            ObjKind::String(s) => s,
            _ => unreachable!("object is not a string"),
        }
    }

    pub fn as_function(&self) -> &Function {
        match &self.kind {
            ObjKind::Function(f) => f,
            _ => unreachable!("object is not a function"),
        }
    }

    pub fn as_closure(&self) -> &Closure {
        match &self.kind {
            ObjKind::Closure(c) => c,
            _ => unreachable!("object is not a closure"),
        }
    }

    pub fn as_closure_mut(&mut self) -> &mut Closure {
        match &mut self.kind {
            ObjKind::Closure(c) => c,
            _ => unreachable!("object is not a closure"),
        }
    }

    pub fn as_upvalue(&self) -> &Upvalue {
        match &self.kind {
            ObjKind::Upvalue(u) => u,
            _ => unreachable!("object is not an upvalue"),
        }
    }

    pub fn as_upvalue_mut(&mut self) -> &mut Upvalue {
        match &mut self.kind {
            ObjKind::Upvalue(u) => u,
            _ => unreachable!("object is not an upvalue"),
        }
    }

    pub fn as_class(&self) -> &Class {
        match &self.kind {
            ObjKind::Class(c) => c,
            _ => unreachable!("object is not a class"),
        }
    }

    pub fn as_class_mut(&mut self) -> &mut Class {
        match &mut self.kind {
            ObjKind::Class(c) => c,
            _ => unreachable!("object is not a class"),
        }
    }

    pub fn as_instance(&self) -> &Instance {
        match &self.kind {
            ObjKind::Instance(i) => i,
            _ => unreachable!("object is not an instance"),
        }
    }

    pub fn as_instance_mut(&mut self) -> &mut Instance {
        match &mut self.kind {
            ObjKind::Instance(i) => i,
            _ => unreachable!("object is not an instance"),
        }
    }
}

impl ObjKind {
    /// Owned payload bytes outside the `Obj` itself.
    pub fn payload_size(&self) -> usize {
        match self {
            ObjKind::String(s) => s.chars.len(),
            ObjKind::Function(f) => f.chunk.byte_size(),
            ObjKind::Native(_) => 0,
            ObjKind::Closure(c) => {
                c.upvalues.capacity() * mem::size_of::<Option<Gc>>()
            }
            ObjKind::Upvalue(_) => 0,
            ObjKind::Class(c) => c.methods.byte_size(),
            ObjKind::Instance(i) => i.fields.byte_size(),
            ObjKind::BoundMethod(_) => 0,
        }
    }
}

impl Upvalue {
    /// The stack slot this upvalue still watches, if open.
    #[inline]
    pub fn open_slot(&self) -> Option<usize> {
        match self.cell {
            UpvalueCell::Open(slot) => Some(slot),
            UpvalueCell::Closed(_) => None,
        }
    }
}

impl fmt::Debug for Native {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Native").finish_non_exhaustive()
    }
}

fn write_function_name(f: &mut fmt::Formatter<'_>, function: &Function) -> fmt::Result {
    match function.name {
        // SAFETY: a function's name string outlives the function
        Some(name) => write!(f, "<fn {}>", unsafe { name.as_ref() }.as_string().chars),
        None => write!(f, "<script>"),
    }
}

impl fmt::Display for Obj {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            ObjKind::String(s) => write!(f, "{}", s.chars),
            ObjKind::Function(function) => write_function_name(f, function),
            ObjKind::Native(_) => write!(f, "<native fn>"),
            ObjKind::Closure(closure) => {
                // SAFETY: a closure's function outlives the closure
                write_function_name(f, unsafe { closure.function.as_ref() }.as_function())
            }
            ObjKind::Upvalue(_) => write!(f, "upvalue"),
            ObjKind::Class(class) => {
                // SAFETY: a class's name string outlives the class
                write!(f, "{}", unsafe { class.name.as_ref() }.as_string().chars)
            }
            ObjKind::Instance(instance) => {
                // SAFETY: the instance keeps its class alive
                let class = unsafe { instance.class.as_ref() }.as_class();
                // SAFETY: the class keeps its name alive
                write!(f, "{} instance", unsafe { class.name.as_ref() }.as_string().chars)
            }
            ObjKind::BoundMethod(bound) => {
                // SAFETY: the bound method keeps its closure alive
                let closure = unsafe { bound.method.as_ref() }.as_closure();
                // SAFETY: the closure keeps its function alive
                write_function_name(f, unsafe { closure.function.as_ref() }.as_function())
            }
        }
    }
}
