//! VM state and call machinery.
//!
//! One [`Vm`] owns everything: the operand stack, the frame stack, the
//! global environment, the string intern table, the managed heap, and the
//! open-upvalue list. It is an explicit context threaded through the hot
//! path; nothing lives in process globals. The language itself is single
//! threaded and non-reentrant, but separate `Vm` values are independent.

use std::fmt;
use std::io::{self, Write};
use std::mem;
use std::time::Instant;

use tracing::debug;

use crate::compiler;
use crate::heap::{Heap, HeapSettings};
use crate::object::{
    BoundMethod, Closure, Instance, Native, NativeFn, Obj, ObjKind, Upvalue, UpvalueCell,
};
use crate::table::Table;
use crate::value::{Gc, Value};

pub const FRAMES_MAX: usize = 64;
pub const STACK_MAX: usize = FRAMES_MAX * 256;

/// Outcome of [`Vm::interpret`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum InterpretResult {
    Ok,
    CompileError,
    RuntimeError,
}

/// A runtime fault with the stack trace captured at the point of failure,
/// innermost frame first.
#[derive(Debug)]
pub struct RuntimeError {
    pub message: String,
    pub trace: Vec<TraceFrame>,
}

#[derive(Debug)]
pub struct TraceFrame {
    pub line: u32,
    /// `None` for the top-level script.
    pub function: Option<String>,
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.message)?;
        for frame in &self.trace {
            match &frame.function {
                Some(name) => writeln!(f, "[line {}] in {}()", frame.line, name)?,
                None => writeln!(f, "[line {}] in script", frame.line)?,
            }
        }
        Ok(())
    }
}

/// One call record: the closure being executed, the saved instruction
/// offset into its chunk, and the frame's base slot on the operand stack.
/// Slot `slots` holds the callable itself; arguments follow it.
#[derive(Debug, Copy, Clone)]
pub struct CallFrame {
    pub closure: Gc,
    pub ip: usize,
    pub slots: usize,
}

pub struct Vm {
    pub(crate) stack: Box<[Value]>,
    pub(crate) stack_top: usize,
    pub(crate) frames: Vec<CallFrame>,
    pub(crate) globals: Table,
    /// Intern table. Keys are weak: unmarked strings are removed between
    /// the trace and sweep phases of a collection.
    pub(crate) strings: Table,
    /// Head of the open-upvalue list, sorted by decreasing stack slot.
    pub(crate) open_upvalues: Option<Gc>,
    /// The interned `"init"`, looked up on every class call. Interned
    /// after the table exists, since interning mutates it.
    pub(crate) init_string: Option<Gc>,
    /// Objects the compiler (or other transient machinery) has allocated
    /// but not yet connected to anything a root can see.
    pub(crate) temp_roots: Vec<Value>,
    pub(crate) heap: Heap,
    /// Origin for the `clock` native: this VM's construction time.
    created_at: Instant,
    pub(crate) out: Box<dyn Write>,
}

fn clock_native(vm: &Vm, _args: &[Value]) -> Value {
    Value::Number(vm.created_at.elapsed().as_secs_f64())
}

impl Default for Vm {
    fn default() -> Self {
        Self::new(HeapSettings::default())
    }
}

impl Vm {
    pub fn new(settings: HeapSettings) -> Self {
        Self::with_output(settings, Box::new(io::stdout()))
    }

    /// Build a VM whose `print` statement writes to `out` instead of
    /// stdout. Used by the test suite to capture program output.
    pub fn with_output(settings: HeapSettings, out: Box<dyn Write>) -> Self {
        let mut vm = Self {
            stack: vec![Value::Nil; STACK_MAX].into_boxed_slice(),
            stack_top: 0,
            frames: Vec::with_capacity(FRAMES_MAX),
            globals: Table::new(),
            strings: Table::new(),
            open_upvalues: None,
            init_string: None,
            temp_roots: Vec::new(),
            heap: Heap::new(settings),
            created_at: Instant::now(),
            out,
        };
        vm.init_string = Some(vm.copy_string("init"));
        vm.define_native("clock", clock_native);
        vm
    }

    /// Compile and run a program. A runtime fault prints its stack trace
    /// to stderr and leaves the VM reusable for the next call.
    pub fn interpret(&mut self, source: &str) -> InterpretResult {
        let function = match compiler::compile(self, source) {
            Some(function) => function,
            None => return InterpretResult::CompileError,
        };

        // anchor the function while the closure wrapping it is allocated
        self.push(Value::Obj(function));
        let closure = self.allocate(ObjKind::Closure(Closure {
            function,
            upvalues: Vec::new(),
        }));
        self.pop();
        self.push(Value::Obj(closure));

        if let Err(error) = self.call_closure(closure, 0) {
            eprint!("{error}");
            return InterpretResult::RuntimeError;
        }

        match self.run() {
            Ok(()) => InterpretResult::Ok,
            Err(error) => {
                eprint!("{error}");
                InterpretResult::RuntimeError
            }
        }
    }

    /// Register a host function under `name` before running any program.
    pub fn define_native(&mut self, name: &str, function: NativeFn) {
        // both objects ride the stack across the second allocation
        let name = self.copy_string(name);
        self.push(Value::Obj(name));
        let native = self.allocate(ObjKind::Native(Native { function }));
        self.push(Value::Obj(native));
        self.globals.set(name, Value::Obj(native));
        self.pop();
        self.pop();
    }

    // ── operand stack ─────────────────────────────────────────────────

    #[inline]
    pub(crate) fn push(&mut self, value: Value) {
        debug_assert!(self.stack_top < STACK_MAX, "operand stack overflow");
        self.stack[self.stack_top] = value;
        self.stack_top += 1;
    }

    #[inline]
    pub(crate) fn pop(&mut self) -> Value {
        debug_assert!(self.stack_top > 0, "operand stack underflow");
        self.stack_top -= 1;
        self.stack[self.stack_top]
    }

    #[inline]
    pub(crate) fn peek(&self, distance: usize) -> Value {
        self.stack[self.stack_top - 1 - distance]
    }

    fn reset_stack(&mut self) {
        self.stack_top = 0;
        self.frames.clear();
        self.open_upvalues = None;
    }

    // ── allocation and collection ─────────────────────────────────────

    /// Allocate a heap object, first running a collection if the byte
    /// charge crosses the trigger (or always, under stress mode). Any
    /// `Gc` inside `kind` must already be reachable from a root.
    pub(crate) fn allocate(&mut self, kind: ObjKind) -> Gc {
        self.heap.account(mem::size_of::<Obj>() + kind.payload_size());
        if self.heap.should_collect() {
            self.collect_garbage();
        }
        self.heap.allocate(kind)
    }

    pub(crate) fn collect_garbage(&mut self) {
        debug!(target: "gc", bytes = self.heap.bytes_allocated(), "cycle start");

        let Vm {
            heap,
            stack,
            stack_top,
            frames,
            globals,
            strings,
            open_upvalues,
            init_string,
            temp_roots,
            ..
        } = self;

        // roots: every stack slot, every live frame's closure, the open
        // upvalues, the globals, the cached init string, and whatever the
        // compiler has in flight
        for value in &stack[..*stack_top] {
            heap.mark_value(*value);
        }
        for frame in frames.iter() {
            heap.mark_object(frame.closure);
        }
        let mut upvalue = *open_upvalues;
        while let Some(current) = upvalue {
            heap.mark_object(current);
            // SAFETY: list entries are live
            upvalue = unsafe { current.as_ref() }.as_upvalue().next;
        }
        heap.mark_table(globals);
        if let Some(init) = *init_string {
            heap.mark_object(init);
        }
        for value in temp_roots.iter() {
            heap.mark_value(*value);
        }

        heap.trace_references();
        // weak intern keys go before the sweep frees them
        strings.remove_white();
        heap.sweep();
        heap.retune();
    }

    pub(crate) fn push_temp_root(&mut self, value: Value) {
        self.temp_roots.push(value);
    }

    pub(crate) fn truncate_temp_roots(&mut self, len: usize) {
        self.temp_roots.truncate(len);
    }

    // ── string interning ──────────────────────────────────────────────

    /// Intern a borrowed byte sequence, copying it only on a miss.
    pub(crate) fn copy_string(&mut self, chars: &str) -> Gc {
        let hash = crate::table::hash_string(chars);
        if let Some(interned) = self.strings.find_string(chars, hash) {
            return interned;
        }
        self.allocate_string(chars.into(), hash)
    }

    /// Intern an owned buffer; on a hit the buffer is simply dropped.
    pub(crate) fn take_string(&mut self, chars: String) -> Gc {
        let hash = crate::table::hash_string(&chars);
        if let Some(interned) = self.strings.find_string(&chars, hash) {
            return interned;
        }
        self.allocate_string(chars.into_boxed_str(), hash)
    }

    fn allocate_string(&mut self, chars: Box<str>, hash: u32) -> Gc {
        let string = self.allocate(ObjKind::String(crate::object::VmString { hash, chars }));
        // the value is irrelevant; the table holds its keys weakly
        self.strings.set(string, Value::Nil);
        string
    }

    /// String `+`: both operands stay on the stack until the result is an
    /// object, so a collection inside `take_string` cannot free them.
    pub(crate) fn concatenate(&mut self) {
        // SAFETY: both operands were just type-checked as live strings
        let b = unsafe { self.peek(0).as_obj().unwrap_unchecked().as_ref() };
        // SAFETY: as above
        let a = unsafe { self.peek(1).as_obj().unwrap_unchecked().as_ref() };
        let a = &a.as_string().chars;
        let b = &b.as_string().chars;

        let mut chars = String::with_capacity(a.len() + b.len());
        chars.push_str(a);
        chars.push_str(b);
        let result = self.take_string(chars);

        self.pop();
        self.pop();
        self.push(Value::Obj(result));
    }

    // ── calls ─────────────────────────────────────────────────────────

    /// Dispatch a call to whatever sits beneath the arguments.
    pub(crate) fn call_value(&mut self, callee: Value, argc: usize) -> Result<(), RuntimeError> {
        if let Value::Obj(obj) = callee {
            // SAFETY: the callee is live on the stack
            match &unsafe { obj.as_ref() }.kind {
                ObjKind::Closure(_) => return self.call_closure(obj, argc),
                ObjKind::BoundMethod(bound) => {
                    let receiver = bound.receiver;
                    let method = bound.method;
                    // the receiver takes the callee slot, becoming `this`
                    self.stack[self.stack_top - argc - 1] = receiver;
                    return self.call_closure(method, argc);
                }
                ObjKind::Class(_) => {
                    let instance = self.allocate(ObjKind::Instance(Instance {
                        class: obj,
                        fields: Table::new(),
                    }));
                    self.stack[self.stack_top - argc - 1] = Value::Obj(instance);

                    // SAFETY: the class is live via the new instance
                    let class = unsafe { obj.as_ref() }.as_class();
                    let initializer = self
                        .init_string
                        .and_then(|init| class.methods.get(init));
                    match initializer {
                        Some(Value::Obj(init)) => return self.call_closure(init, argc),
                        Some(_) => unreachable!("initializer is always a closure"),
                        None if argc != 0 => {
                            return Err(self.runtime_error(format!(
                                "Expected 0 arguments but got {argc}."
                            )));
                        }
                        None => return Ok(()),
                    }
                }
                ObjKind::Native(native) => {
                    let function = native.function;
                    let args_start = self.stack_top - argc;
                    let result = function(self, &self.stack[args_start..self.stack_top]);
                    // pop callee and arguments in one cut, push the result
                    self.stack_top -= argc + 1;
                    self.push(result);
                    return Ok(());
                }
                _ => {}
            }
        }
        Err(self.runtime_error(format!(
            "Can only call functions and classes, but got {}.",
            callee.type_name()
        )))
    }

    /// Arity-check `closure` and push its frame. The callee is already at
    /// `stack_top - argc - 1`; the frame bases there.
    pub(crate) fn call_closure(&mut self, closure: Gc, argc: usize) -> Result<(), RuntimeError> {
        // SAFETY: the closure is live (on the stack or in a method table)
        let function = unsafe { closure.as_ref() }.as_closure().function;
        // SAFETY: a closure keeps its function alive
        let arity = unsafe { function.as_ref() }.as_function().arity;

        if argc != arity {
            return Err(self.runtime_error(format!(
                "Expected {arity} arguments but got {argc}."
            )));
        }
        if self.frames.len() == FRAMES_MAX {
            return Err(self.runtime_error("Stack overflow.".to_string()));
        }

        self.frames.push(CallFrame {
            closure,
            ip: 0,
            slots: self.stack_top - argc - 1,
        });
        Ok(())
    }

    /// Fused property-access-and-call. A field that shadows a method wins
    /// and is called as an ordinary value.
    pub(crate) fn invoke(&mut self, name: Gc, argc: usize) -> Result<(), RuntimeError> {
        let receiver = self.peek(argc);
        let instance = match receiver.as_obj() {
            // SAFETY: the receiver is live on the stack
            Some(obj) if matches!(unsafe { obj.as_ref() }.kind, ObjKind::Instance(_)) => obj,
            _ => return Err(self.runtime_error("Only instances have methods.".to_string())),
        };

        // SAFETY: checked above
        let instance_ref = unsafe { instance.as_ref() }.as_instance();
        if let Some(field) = instance_ref.fields.get(name) {
            self.stack[self.stack_top - argc - 1] = field;
            return self.call_value(field, argc);
        }
        self.invoke_from_class(instance_ref.class, name, argc)
    }

    /// Method dispatch that skips the intermediate bound-method object.
    pub(crate) fn invoke_from_class(
        &mut self,
        class: Gc,
        name: Gc,
        argc: usize,
    ) -> Result<(), RuntimeError> {
        // SAFETY: the class is live via the receiver
        let method = unsafe { class.as_ref() }.as_class().methods.get(name);
        match method {
            Some(Value::Obj(method)) => self.call_closure(method, argc),
            Some(_) => unreachable!("methods are always closures"),
            None => {
                // SAFETY: the name is a live constant
                let name = unsafe { name.as_ref() }.as_string().chars.to_string();
                Err(self.runtime_error(format!("Undefined property '{name}'.")))
            }
        }
    }

    /// Replace the receiver at `peek(0)` with the named method bound to
    /// it, or fail if the class has no such method.
    pub(crate) fn bind_method(&mut self, class: Gc, name: Gc) -> Result<(), RuntimeError> {
        // SAFETY: the class is live via the receiver on the stack
        let method = unsafe { class.as_ref() }.as_class().methods.get(name);
        let method = match method {
            Some(Value::Obj(method)) => method,
            Some(_) => unreachable!("methods are always closures"),
            None => {
                // SAFETY: the name is a live constant
                let name = unsafe { name.as_ref() }.as_string().chars.to_string();
                return Err(self.runtime_error(format!("Undefined property '{name}'.")));
            }
        };

        let bound = self.allocate(ObjKind::BoundMethod(BoundMethod {
            receiver: self.peek(0),
            method,
        }));
        self.pop();
        self.push(Value::Obj(bound));
        Ok(())
    }

    // ── upvalues ──────────────────────────────────────────────────────

    /// Find or create the open upvalue watching `slot`. Reuse keeps two
    /// closures capturing the same variable sharing one cell. The list is
    /// sorted by strictly decreasing slot, so the scan stops early.
    pub(crate) fn capture_upvalue(&mut self, slot: usize) -> Gc {
        let mut prev: Option<Gc> = None;
        let mut current = self.open_upvalues;
        while let Some(upvalue) = current {
            // SAFETY: open-list entries are live
            let upvalue_ref = unsafe { upvalue.as_ref() }.as_upvalue();
            match upvalue_ref.open_slot() {
                Some(existing) if existing > slot => {
                    prev = current;
                    current = upvalue_ref.next;
                }
                Some(existing) if existing == slot => return upvalue,
                _ => break,
            }
        }

        let created = self.allocate(ObjKind::Upvalue(Upvalue {
            cell: UpvalueCell::Open(slot),
            next: current,
        }));
        match prev {
            // SAFETY: prev is on the open list, hence live
            Some(prev) => unsafe { prev.as_mut() }.as_upvalue_mut().next = Some(created),
            None => self.open_upvalues = Some(created),
        }
        created
    }

    /// Close every open upvalue watching slot `last` or above: copy the
    /// stack value into the cell and drop the upvalue from the open list.
    pub(crate) fn close_upvalues(&mut self, last: usize) {
        while let Some(upvalue) = self.open_upvalues {
            // SAFETY: open-list entries are live
            let upvalue_ref = unsafe { upvalue.as_mut() }.as_upvalue_mut();
            match upvalue_ref.open_slot() {
                Some(slot) if slot >= last => {
                    upvalue_ref.cell = UpvalueCell::Closed(self.stack[slot]);
                    self.open_upvalues = upvalue_ref.next.take();
                }
                _ => break,
            }
        }
    }

    // ── failure ───────────────────────────────────────────────────────

    /// Capture the stack trace for a fault and unwind the VM so the next
    /// `interpret` starts clean. The interpreter flushes its cached ip to
    /// the frame record before any path that can land here.
    pub(crate) fn runtime_error(&mut self, message: String) -> RuntimeError {
        let mut trace = Vec::with_capacity(self.frames.len());
        for frame in self.frames.iter().rev() {
            // SAFETY: frames hold live closures
            let closure = unsafe { frame.closure.as_ref() }.as_closure();
            // SAFETY: a closure keeps its function alive
            let function = unsafe { closure.function.as_ref() }.as_function();
            let offset = frame.ip.saturating_sub(1);
            trace.push(TraceFrame {
                line: function.chunk.line(offset),
                function: function
                    .name
                    // SAFETY: the function keeps its name alive
                    .map(|name| unsafe { name.as_ref() }.as_string().chars.to_string()),
            });
        }
        self.reset_stack();
        RuntimeError { message, trace }
    }
}

impl Drop for Vm {
    fn drop(&mut self) {
        // the cached string must not survive as a root into teardown
        self.init_string = None;
        self.heap.free_all();
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Shared harness for end-to-end tests: run a source string, capture
    //! everything `print` wrote.

    use std::cell::RefCell;
    use std::io::Write;
    use std::rc::Rc;

    use super::*;

    #[derive(Clone, Default)]
    pub struct SharedOutput(Rc<RefCell<Vec<u8>>>);

    impl SharedOutput {
        pub fn contents(&self) -> String {
            String::from_utf8(self.0.borrow().clone()).expect("utf-8 program output")
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

    pub fn run_with(settings: HeapSettings, source: &str) -> (InterpretResult, String) {
        let output = SharedOutput::default();
        let mut vm = Vm::with_output(settings, Box::new(output.clone()));
        let result = vm.interpret(source);
        (result, output.contents())
    }

    pub fn run(source: &str) -> (InterpretResult, String) {
        run_with(HeapSettings::default(), source)
    }

    /// Every end-to-end test also passes with a collection before every
    /// allocation.
    pub fn run_stressed(source: &str) -> (InterpretResult, String) {
        run_with(
            HeapSettings {
                stress_gc: true,
                ..Default::default()
            },
            source,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::hash_string;

    #[test]
    fn interning_twice_yields_the_same_object() {
        let mut vm = Vm::default();
        let a = vm.copy_string("wick");
        let b = vm.copy_string("wick");
        assert_eq!(a, b);

        let c = vm.take_string(String::from("wick"));
        assert_eq!(a, c);
    }

    #[test]
    fn unreachable_strings_leave_the_intern_table() {
        let mut vm = Vm::default();
        vm.copy_string("transient");
        let hash = hash_string("transient");
        assert!(vm.strings.find_string("transient", hash).is_some());

        // nothing roots it; one cycle removes it from the weak table
        vm.collect_garbage();
        assert!(vm.strings.find_string("transient", hash).is_none());

        // re-interning after the sweep must succeed with a fresh object
        let again = vm.copy_string("transient");
        assert!(vm.strings.find_string("transient", hash) == Some(again));
    }

    #[test]
    fn rooted_strings_survive_collection() {
        let mut vm = Vm::default();
        let rooted = vm.copy_string("rooted");
        vm.push(Value::Obj(rooted));

        vm.collect_garbage();
        let hash = hash_string("rooted");
        assert_eq!(vm.strings.find_string("rooted", hash), Some(rooted));
    }

    #[test]
    fn temp_roots_protect_compiler_allocations() {
        let mut vm = Vm::default();
        let mark = vm.temp_roots.len();
        let protected = vm.copy_string("protected");
        vm.push_temp_root(Value::Obj(protected));

        vm.collect_garbage();
        let hash = hash_string("protected");
        assert_eq!(vm.strings.find_string("protected", hash), Some(protected));

        vm.truncate_temp_roots(mark);
        vm.collect_garbage();
        assert_eq!(vm.strings.find_string("protected", hash), None);
    }

    #[test]
    fn init_string_survives_every_cycle() {
        let mut vm = Vm::default();
        vm.collect_garbage();
        let hash = hash_string("init");
        assert_eq!(vm.strings.find_string("init", hash), vm.init_string);
    }

    #[test]
    fn natives_are_reachable_through_globals() {
        let mut vm = Vm::default();
        vm.collect_garbage();

        let clock = vm.copy_string("clock");
        let value = vm.globals.get(clock).expect("clock is defined");
        // SAFETY: just looked up from a root
        assert!(matches!(
            unsafe { value.as_obj().unwrap().as_ref() }.kind,
            ObjKind::Native(_)
        ));
    }

    #[test]
    fn clock_native_reports_nonnegative_seconds() {
        let vm = Vm::default();
        match clock_native(&vm, &[]) {
            Value::Number(seconds) => assert!(seconds >= 0.0),
            other => panic!("clock returned {other:?}"),
        }
    }

    #[test]
    fn each_vm_clocks_from_its_own_construction() {
        let older = Vm::default();
        std::thread::sleep(std::time::Duration::from_millis(5));
        let newer = Vm::default();

        let older_seconds = match clock_native(&older, &[]) {
            Value::Number(seconds) => seconds,
            other => panic!("clock returned {other:?}"),
        };
        let newer_seconds = match clock_native(&newer, &[]) {
            Value::Number(seconds) => seconds,
            other => panic!("clock returned {other:?}"),
        };
        assert!(newer_seconds < older_seconds);
    }

    #[test]
    fn object_values_report_their_type_name() {
        let mut vm = Vm::default();
        let string = vm.copy_string("text");
        assert_eq!(Value::Obj(string).type_name(), "string");

        let clock = vm.copy_string("clock");
        let native = vm.globals.get(clock).expect("clock is defined");
        assert_eq!(native.type_name(), "native function");
    }

    #[test]
    fn calling_a_non_callable_names_the_type() {
        let mut vm = Vm::default();
        vm.push(Value::Number(1.0));
        let error = vm
            .call_value(Value::Number(1.0), 0)
            .expect_err("numbers are not callable");
        assert_eq!(
            error.message,
            "Can only call functions and classes, but got number."
        );
    }
}
