//! The dispatch loop.
//!
//! A flat match over one-byte opcodes. The instruction pointer lives in an
//! [`ExecutionContext`] of raw pointers held in locals across iterations;
//! it is flushed back to the frame record before any operation that can
//! allocate, raise a runtime error, or switch frames, and reloaded after a
//! frame switch. Stack traces and GC root scans therefore always see a
//! consistent frame state, while the fast path touches no frame memory.

use std::io::Write;

use tracing::trace;

use crate::chunk::Op;
use crate::object::{Closure, ObjKind, UpvalueCell};
use crate::value::{Gc, Value};
use crate::vm::{RuntimeError, Vm};

/// Raw cursors into the current frame's chunk. Valid until the frame
/// changes; the heap does not move objects, and the frame's closure roots
/// the chunk.
struct ExecutionContext {
    ip: *const u8,
    base: *const u8,
    constants: *const Value,
    /// The frame's base slot on the operand stack.
    slots: usize,
}

impl ExecutionContext {
    #[inline(always)]
    fn read_byte(&mut self) -> u8 {
        // SAFETY: the compiler never emits a truncated instruction, so ip
        // stays inside the code buffer until the frame's RETURN
        unsafe {
            let byte = *self.ip;
            self.ip = self.ip.add(1);
            byte
        }
    }

    /// 16-bit big-endian operand.
    #[inline(always)]
    fn read_short(&mut self) -> u16 {
        let hi = self.read_byte();
        let lo = self.read_byte();
        u16::from_be_bytes([hi, lo])
    }

    #[inline(always)]
    fn read_constant(&mut self) -> Value {
        let index = self.read_byte() as usize;
        // SAFETY: constant operands index the pool they were compiled for
        unsafe { *self.constants.add(index) }
    }

    /// A constant operand the compiler guarantees to be a string.
    #[inline(always)]
    fn read_string(&mut self) -> Gc {
        match self.read_constant() {
            Value::Obj(obj) => obj,
            _ => unreachable!("name constant is always a string"),
        }
    }
}

impl Vm {
    /// Rebuild the cursor cache from the innermost frame. Called on entry
    /// and after every frame switch.
    fn reload_context(&self) -> ExecutionContext {
        let frame = self.frames.last().expect("an active frame");
        // SAFETY: frames hold live closures
        let closure = unsafe { frame.closure.as_ref() }.as_closure();
        // SAFETY: a closure keeps its function alive
        let chunk = &unsafe { closure.function.as_ref() }.as_function().chunk;
        let base = chunk.code.as_ptr();
        ExecutionContext {
            // SAFETY: the saved offset is within the code buffer
            ip: unsafe { base.add(frame.ip) },
            base,
            constants: chunk.constants.as_ptr(),
            slots: frame.slots,
        }
    }

    /// Flush the cached ip into the frame record.
    fn sync_context(&mut self, ctx: &ExecutionContext) {
        let frame = self.frames.last_mut().expect("an active frame");
        // SAFETY: ip and base point into the same code buffer
        frame.ip = unsafe { ctx.ip.offset_from(ctx.base) } as usize;
    }

    /// Pop two numbers for a binary operator, or fail naming the offending
    /// types. The caller has already synced the context.
    #[inline]
    fn numeric_operands(&mut self) -> Result<(f64, f64), RuntimeError> {
        match (self.peek(1), self.peek(0)) {
            (Value::Number(a), Value::Number(b)) => {
                self.pop();
                self.pop();
                Ok((a, b))
            }
            (a, b) => Err(self.runtime_error(format!(
                "Operands must be numbers, but got {} and {}.",
                a.type_name(),
                b.type_name()
            ))),
        }
    }

    /// Execute until the outermost frame returns.
    pub(crate) fn run(&mut self) -> Result<(), RuntimeError> {
        let mut ctx = self.reload_context();

        loop {
            // SAFETY: the compiler only emits valid opcodes
            let op = unsafe { Op::from_u8(ctx.read_byte()) };
            trace!(target: "vm", ?op, depth = self.stack_top);

            match op {
                Op::Constant => {
                    let constant = ctx.read_constant();
                    self.push(constant);
                }
                Op::Nil => self.push(Value::Nil),
                Op::True => self.push(Value::Bool(true)),
                Op::False => self.push(Value::Bool(false)),
                Op::Pop => {
                    self.pop();
                }

                Op::GetLocal => {
                    let slot = ctx.read_byte() as usize;
                    self.push(self.stack[ctx.slots + slot]);
                }
                Op::SetLocal => {
                    let slot = ctx.read_byte() as usize;
                    // assignment is an expression; the value stays put
                    self.stack[ctx.slots + slot] = self.peek(0);
                }

                Op::GetGlobal => {
                    let name = ctx.read_string();
                    match self.globals.get(name) {
                        Some(value) => self.push(value),
                        None => {
                            self.sync_context(&ctx);
                            // SAFETY: name constants are live strings
                            let name = unsafe { name.as_ref() }.as_string().chars.to_string();
                            return Err(
                                self.runtime_error(format!("Undefined variable '{name}'."))
                            );
                        }
                    }
                }
                Op::DefineGlobal => {
                    let name = ctx.read_string();
                    let value = self.peek(0);
                    self.globals.set(name, value);
                    self.pop();
                }
                Op::SetGlobal => {
                    let name = ctx.read_string();
                    let value = self.peek(0);
                    if self.globals.set(name, value) {
                        // a fresh key means the variable never existed;
                        // undo the insert before reporting
                        self.globals.delete(name);
                        self.sync_context(&ctx);
                        // SAFETY: name constants are live strings
                        let name = unsafe { name.as_ref() }.as_string().chars.to_string();
                        return Err(self.runtime_error(format!("Undefined variable '{name}'.")));
                    }
                }

                Op::GetUpvalue => {
                    let slot = ctx.read_byte() as usize;
                    let value = self.read_through_upvalue(slot);
                    self.push(value);
                }
                Op::SetUpvalue => {
                    let slot = ctx.read_byte() as usize;
                    let value = self.peek(0);
                    self.write_through_upvalue(slot, value);
                }

                Op::GetProperty => {
                    self.sync_context(&ctx);
                    let instance = match self.peek(0).as_obj() {
                        // SAFETY: stack values are live
                        Some(obj)
                            if matches!(unsafe { obj.as_ref() }.kind, ObjKind::Instance(_)) =>
                        {
                            obj
                        }
                        _ => {
                            return Err(self
                                .runtime_error("Only instances have properties.".to_string()));
                        }
                    };
                    let name = ctx.read_string();

                    // SAFETY: checked above
                    let instance_ref = unsafe { instance.as_ref() }.as_instance();
                    if let Some(value) = instance_ref.fields.get(name) {
                        self.pop();
                        self.push(value);
                    } else {
                        // fields shadow methods; only fall through here
                        self.bind_method(instance_ref.class, name)?;
                    }
                }
                Op::SetProperty => {
                    self.sync_context(&ctx);
                    let instance = match self.peek(1).as_obj() {
                        // SAFETY: stack values are live
                        Some(obj)
                            if matches!(unsafe { obj.as_ref() }.kind, ObjKind::Instance(_)) =>
                        {
                            obj
                        }
                        _ => {
                            return Err(self
                                .runtime_error("Only instances have properties.".to_string()));
                        }
                    };
                    let name = ctx.read_string();
                    let value = self.peek(0);
                    // SAFETY: checked above
                    unsafe { instance.as_mut() }
                        .as_instance_mut()
                        .fields
                        .set(name, value);
                    // a set expression yields the assigned value
                    let value = self.pop();
                    self.pop();
                    self.push(value);
                }
                Op::GetSuper => {
                    self.sync_context(&ctx);
                    let name = ctx.read_string();
                    let superclass = match self.pop() {
                        Value::Obj(obj) => obj,
                        _ => unreachable!("compiler loads a class for super"),
                    };
                    self.bind_method(superclass, name)?;
                }

                Op::Equal => {
                    let b = self.pop();
                    let a = self.pop();
                    self.push(Value::Bool(a == b));
                }
                Op::Greater => {
                    self.sync_context(&ctx);
                    let (a, b) = self.numeric_operands()?;
                    self.push(Value::Bool(a > b));
                }
                Op::Less => {
                    self.sync_context(&ctx);
                    let (a, b) = self.numeric_operands()?;
                    self.push(Value::Bool(a < b));
                }
                Op::Add => {
                    self.sync_context(&ctx);
                    if self.is_string(self.peek(0)) && self.is_string(self.peek(1)) {
                        self.concatenate();
                    } else {
                        match (self.peek(1), self.peek(0)) {
                            (Value::Number(a), Value::Number(b)) => {
                                self.pop();
                                self.pop();
                                self.push(Value::Number(a + b));
                            }
                            (a, b) => {
                                return Err(self.runtime_error(format!(
                                    "Operands must be either two numbers or two strings, \
                                     but got {} and {}.",
                                    a.type_name(),
                                    b.type_name()
                                )));
                            }
                        }
                    }
                }
                Op::Subtract => {
                    self.sync_context(&ctx);
                    let (a, b) = self.numeric_operands()?;
                    self.push(Value::Number(a - b));
                }
                Op::Multiply => {
                    self.sync_context(&ctx);
                    let (a, b) = self.numeric_operands()?;
                    self.push(Value::Number(a * b));
                }
                Op::Divide => {
                    self.sync_context(&ctx);
                    let (a, b) = self.numeric_operands()?;
                    // IEEE-754: 0/0 is NaN, x/0 is an infinity
                    self.push(Value::Number(a / b));
                }
                Op::Not => {
                    let value = self.pop();
                    self.push(Value::Bool(value.is_falsy()));
                }
                Op::Negate => {
                    self.sync_context(&ctx);
                    match self.peek(0) {
                        Value::Number(n) => {
                            self.pop();
                            self.push(Value::Number(-n));
                        }
                        other => {
                            return Err(self.runtime_error(format!(
                                "Operand must be a number, but got {}.",
                                other.type_name()
                            )));
                        }
                    }
                }

                Op::Print => {
                    let value = self.pop();
                    let _ = writeln!(self.out, "{value}");
                }

                Op::Jump => {
                    let offset = ctx.read_short() as usize;
                    // SAFETY: jump targets stay inside the code buffer
                    ctx.ip = unsafe { ctx.ip.add(offset) };
                }
                Op::JumpIfFalse => {
                    let offset = ctx.read_short() as usize;
                    if self.peek(0).is_falsy() {
                        // SAFETY: jump targets stay inside the code buffer
                        ctx.ip = unsafe { ctx.ip.add(offset) };
                    }
                }
                Op::Loop => {
                    let offset = ctx.read_short() as usize;
                    // SAFETY: loop targets stay inside the code buffer
                    ctx.ip = unsafe { ctx.ip.sub(offset) };
                }

                Op::Call => {
                    let argc = ctx.read_byte() as usize;
                    self.sync_context(&ctx);
                    self.call_value(self.peek(argc), argc)?;
                    ctx = self.reload_context();
                }
                Op::Invoke => {
                    let name = ctx.read_string();
                    let argc = ctx.read_byte() as usize;
                    self.sync_context(&ctx);
                    self.invoke(name, argc)?;
                    ctx = self.reload_context();
                }
                Op::SuperInvoke => {
                    let name = ctx.read_string();
                    let argc = ctx.read_byte() as usize;
                    self.sync_context(&ctx);
                    let superclass = match self.pop() {
                        Value::Obj(obj) => obj,
                        _ => unreachable!("compiler loads a class for super"),
                    };
                    self.invoke_from_class(superclass, name, argc)?;
                    ctx = self.reload_context();
                }

                Op::Closure => {
                    let function = match ctx.read_constant() {
                        Value::Obj(obj) => obj,
                        _ => unreachable!("closure constant is always a function"),
                    };
                    self.sync_context(&ctx);
                    // SAFETY: constants are live
                    let upvalue_count = unsafe { function.as_ref() }.as_function().upvalue_count;

                    let closure = self.allocate(ObjKind::Closure(Closure {
                        function,
                        upvalues: vec![None; upvalue_count],
                    }));
                    // on the stack before the captures below can collect
                    self.push(Value::Obj(closure));

                    for index in 0..upvalue_count {
                        let is_local = ctx.read_byte() != 0;
                        let operand = ctx.read_byte() as usize;
                        let upvalue = if is_local {
                            self.capture_upvalue(ctx.slots + operand)
                        } else {
                            let enclosing = self.frames.last().expect("an active frame").closure;
                            // SAFETY: the enclosing closure is live in its frame;
                            // the compiler resolved this upvalue, so the slot is filled
                            unsafe {
                                enclosing.as_ref().as_closure().upvalues[operand]
                                    .unwrap_unchecked()
                            }
                        };
                        // SAFETY: the new closure is live on the stack
                        unsafe { closure.as_mut() }.as_closure_mut().upvalues[index] =
                            Some(upvalue);
                    }
                }
                Op::CloseUpvalue => {
                    self.close_upvalues(self.stack_top - 1);
                    self.pop();
                }

                Op::Return => {
                    let result = self.pop();
                    // locals the callee captured must outlive its frame
                    self.close_upvalues(ctx.slots);
                    self.frames.pop();
                    if self.frames.is_empty() {
                        // pop the script closure and halt
                        self.pop();
                        return Ok(());
                    }
                    self.stack_top = ctx.slots;
                    self.push(result);
                    ctx = self.reload_context();
                }

                Op::Class => {
                    let name = ctx.read_string();
                    self.sync_context(&ctx);
                    let class = self.allocate(ObjKind::Class(crate::object::Class {
                        name,
                        methods: crate::table::Table::new(),
                    }));
                    self.push(Value::Obj(class));
                }
                Op::Inherit => {
                    self.sync_context(&ctx);
                    let superclass = match self.peek(1).as_obj() {
                        // SAFETY: stack values are live
                        Some(obj) if matches!(unsafe { obj.as_ref() }.kind, ObjKind::Class(_)) => {
                            obj
                        }
                        _ => {
                            return Err(
                                self.runtime_error("Superclass must be a class.".to_string())
                            );
                        }
                    };
                    let subclass = match self.peek(0) {
                        Value::Obj(obj) => obj,
                        _ => unreachable!("compiler leaves the subclass on top"),
                    };
                    // methods are copied down, so later overrides shadow
                    // without a lookup chain at call time
                    // SAFETY: both classes are live on the stack
                    let methods = &unsafe { superclass.as_ref() }.as_class().methods;
                    unsafe { subclass.as_mut() }
                        .as_class_mut()
                        .methods
                        .add_all_from(methods);
                    self.pop();
                }
                Op::Method => {
                    let name = ctx.read_string();
                    let method = self.peek(0);
                    let class = match self.peek(1) {
                        Value::Obj(obj) => obj,
                        _ => unreachable!("compiler leaves the class beneath the method"),
                    };
                    // SAFETY: the class is live on the stack
                    unsafe { class.as_mut() }.as_class_mut().methods.set(name, method);
                    self.pop();
                }
            }
        }
    }

    #[inline]
    fn is_string(&self, value: Value) -> bool {
        match value {
            // SAFETY: stack values are live
            Value::Obj(obj) => matches!(unsafe { obj.as_ref() }.kind, ObjKind::String(_)),
            _ => false,
        }
    }

    /// Read the current closure's upvalue `slot`, through the stack when
    /// still open.
    #[inline]
    fn read_through_upvalue(&self, slot: usize) -> Value {
        let closure = self.frames.last().expect("an active frame").closure;
        // SAFETY: the frame keeps its closure alive; the compiler resolved
        // this slot, so it is filled
        let upvalue =
            unsafe { closure.as_ref().as_closure().upvalues[slot].unwrap_unchecked() };
        // SAFETY: the closure keeps its upvalues alive
        match unsafe { upvalue.as_ref() }.as_upvalue().cell {
            UpvalueCell::Open(stack_slot) => self.stack[stack_slot],
            UpvalueCell::Closed(value) => value,
        }
    }

    #[inline]
    fn write_through_upvalue(&mut self, slot: usize, value: Value) {
        let closure = self.frames.last().expect("an active frame").closure;
        // SAFETY: as in read_through_upvalue
        let upvalue =
            unsafe { closure.as_ref().as_closure().upvalues[slot].unwrap_unchecked() };
        // SAFETY: the closure keeps its upvalues alive
        match &mut unsafe { upvalue.as_mut() }.as_upvalue_mut().cell {
            UpvalueCell::Open(stack_slot) => self.stack[*stack_slot] = value,
            UpvalueCell::Closed(cell) => *cell = value,
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::vm::testing::{run, run_stressed};
    use crate::vm::InterpretResult;

    fn expect_output(source: &str, expected: &str) {
        let (result, output) = run(source);
        assert_eq!(result, InterpretResult::Ok, "program failed:\n{source}");
        assert_eq!(output, expected, "wrong output for:\n{source}");

        // the same program must survive a collection per allocation
        let (result, output) = run_stressed(source);
        assert_eq!(result, InterpretResult::Ok, "stressed program failed:\n{source}");
        assert_eq!(output, expected, "wrong stressed output for:\n{source}");
    }

    fn expect_runtime_error(source: &str) {
        let (result, _) = run(source);
        assert_eq!(result, InterpretResult::RuntimeError, "expected fault:\n{source}");
    }

    #[test]
    fn arithmetic() {
        expect_output("print 1 + 2;", "3\n");
        expect_output("print 2 + 3 * 4;", "14\n");
        expect_output("print (2 + 3) * 4;", "20\n");
        expect_output("print 1 - 2 - 3;", "-4\n");
        expect_output("print 10 / 4;", "2.5\n");
        expect_output("print -(-3);", "3\n");
    }

    #[test]
    fn ieee_arithmetic() {
        expect_output("print 0 / 0 == 0 / 0;", "false\n");
        expect_output("print 1 / 0;", "inf\n");
        expect_output("print 0.1 + 0.2 == 0.3;", "false\n");
    }

    #[test]
    fn comparison_and_equality() {
        expect_output("print 1 < 2;", "true\n");
        expect_output("print 2 > 2;", "false\n");
        expect_output("print 1 <= 1;", "true\n");
        expect_output("print nil == nil;", "true\n");
        expect_output("print nil == false;", "false\n");
        expect_output("print \"a\" == \"a\";", "true\n");
        expect_output("print 1 == \"1\";", "false\n");
    }

    #[test]
    fn truthiness() {
        expect_output("print !nil;", "true\n");
        expect_output("print !false;", "true\n");
        expect_output("print !0;", "false\n");
        expect_output("print !\"\";", "false\n");
    }

    #[test]
    fn string_concatenation_interns() {
        expect_output(
            "var a = \"st\"; var b = \"ring\"; print a + b == \"string\";",
            "true\n",
        );
        expect_output("print \"ab\" + \"c\" == \"a\" + \"bc\";", "true\n");
    }

    #[test]
    fn globals() {
        expect_output("var a = 1; a = a + 1; print a;", "2\n");
        expect_output("var a; print a;", "nil\n");
        expect_output("var a = 1; var b = a = 3; print b;", "3\n");
        expect_runtime_error("print undefined_variable;");
        expect_runtime_error("undefined_variable = 1;");
    }

    #[test]
    fn locals_and_scopes() {
        expect_output(
            "var a = \"global\"; { var a = \"local\"; print a; } print a;",
            "local\nglobal\n",
        );
        expect_output("{ var a = 1; { var b = a + 1; print b; } }", "2\n");
    }

    #[test]
    fn control_flow() {
        expect_output("if (true) print \"then\"; else print \"else\";", "then\n");
        expect_output("if (false) print \"then\"; else print \"else\";", "else\n");
        expect_output("if (0) print \"truthy\";", "truthy\n");
        expect_output(
            "var i = 0; while (i < 3) { print i; i = i + 1; }",
            "0\n1\n2\n",
        );
        expect_output(
            "for (var i = 0; i < 3; i = i + 1) print i;",
            "0\n1\n2\n",
        );
        expect_output("print true and 2;", "2\n");
        expect_output("print false and 2;", "false\n");
        expect_output("print nil or \"fallback\";", "fallback\n");
        expect_output("print 1 or 2;", "1\n");
    }

    #[test]
    fn functions_and_returns() {
        expect_output(
            "fun add(a, b) { return a + b; } print add(1, 2);",
            "3\n",
        );
        expect_output("fun noop() {} print noop();", "nil\n");
        expect_output("fun f() { return; print \"dead\"; } print f();", "nil\n");
        expect_output("fun f() {} print f;", "<fn f>\n");
        expect_output("print clock() >= 0;", "true\n");
        expect_output("print clock;", "<native fn>\n");
    }

    #[test]
    fn recursion() {
        expect_output(
            "fun fib(n) { if (n < 2) return n; return fib(n - 2) + fib(n - 1); } print fib(10);",
            "55\n",
        );
    }

    #[test]
    fn closures_share_open_upvalues() {
        expect_output(
            "fun make() { var i = 0; fun inc() { i = i + 1; return i; } return inc; } \
             var f = make(); print f(); print f(); print f();",
            "1\n2\n3\n",
        );
        // two siblings capture one cell
        expect_output(
            "var get; var set; \
             fun make() { var x = \"initial\"; \
               fun g() { return x; } \
               fun s(v) { x = v; } \
               get = g; set = s; } \
             make(); set(\"updated\"); print get();",
            "updated\n",
        );
    }

    #[test]
    fn closures_capture_by_variable_not_value() {
        expect_output(
            "var f; { var x = 1; fun g() { print x; } f = g; x = 2; } f();",
            "2\n",
        );
        // closed after scope exit: the cell keeps the value at close time
        expect_output(
            "var f; { var x = \"closed\"; fun g() { print x; } f = g; } \
             var x = \"shadow\"; f();",
            "closed\n",
        );
    }

    #[test]
    fn classes_and_instances() {
        expect_output("class C {} print C;", "C\n");
        expect_output("class C {} print C();", "C instance\n");
        expect_output(
            "class C {} var c = C(); c.field = 42; print c.field;",
            "42\n",
        );
        expect_output(
            "class C { init(x) { this.x = x; } } print C(42).x;",
            "42\n",
        );
        expect_output(
            "class C { m() { return \"method\"; } } print C().m();",
            "method\n",
        );
        expect_output(
            "class C { m() { return this.x; } } var c = C(); c.x = 7; print c.m();",
            "7\n",
        );
    }

    #[test]
    fn bound_methods_carry_their_receiver() {
        expect_output(
            "class C { init(x) { this.x = x; } get() { return this.x; } } \
             var bound = C(9).get; print bound();",
            "9\n",
        );
        expect_output(
            "class C { m() {} } print C().m;",
            "<fn m>\n",
        );
    }

    #[test]
    fn fields_shadow_methods_but_not_super() {
        expect_output(
            "class C { m() { return \"method\"; } } \
             var c = C(); c.m = \"field\"; print c.m;",
            "field\n",
        );
        // a callable field shadows the method for invocation too
        expect_output(
            "fun shadow() { return \"field fn\"; } \
             class C { m() { return \"method\"; } } \
             var c = C(); c.m = shadow; print c.m();",
            "field fn\n",
        );
        // super dispatch ignores fields and always resolves on the class
        expect_output(
            "class A { m() { return \"super method\"; } } \
             class B < A { call_super() { return super.m(); } } \
             var b = B(); b.m = \"field\"; print b.call_super();",
            "super method\n",
        );
    }

    #[test]
    fn inheritance() {
        expect_output(
            "class A { greet() { print \"hi\"; } } \
             class B < A { greet() { super.greet(); print \"there\"; } } \
             B().greet();",
            "hi\nthere\n",
        );
        expect_output(
            "class A { m() { return \"A\"; } } class B < A {} print B().m();",
            "A\n",
        );
        expect_output(
            "class A { init() { this.x = 1; } } class B < A {} print B().x;",
            "1\n",
        );
        expect_runtime_error("var NotAClass = 1; class B < NotAClass {}");
    }

    #[test]
    fn initializer_returns_the_instance() {
        expect_output(
            "class C { init() { this.x = 1; } } var c = C(); print c.init().x;",
            "1\n",
        );
        expect_output(
            "class C { init() { if (true) return; this.dead = 1; } } print C();",
            "C instance\n",
        );
    }

    #[test]
    fn arity_is_checked() {
        expect_runtime_error("fun f(a) {} f();");
        expect_runtime_error("fun f(a) {} f(1, 2);");
        expect_runtime_error("class C { init(a) {} } C();");
        expect_runtime_error("class C {} C(1);");
    }

    #[test]
    fn calling_non_callables_fails() {
        expect_runtime_error("var x = 1; x();");
        expect_runtime_error("\"string\"();");
        expect_runtime_error("nil();");
    }

    #[test]
    fn type_errors_fault() {
        expect_runtime_error("print 1 + \"one\";");
        expect_runtime_error("print \"one\" + 1;");
        expect_runtime_error("print -\"one\";");
        expect_runtime_error("print 1 < \"one\";");
        expect_runtime_error("var x = 1; print x.field;");
        expect_runtime_error("var x = 1; x.field = 2;");
        expect_runtime_error("class C {} C().missing();");
        expect_runtime_error("class C {} print C().missing;");
    }

    #[test]
    fn unbounded_recursion_faults_cleanly() {
        expect_runtime_error("fun f() { f(); } f();");
    }

    #[test]
    fn vm_survives_a_runtime_error() {
        use crate::heap::HeapSettings;
        use crate::vm::Vm;

        let mut vm = Vm::new(HeapSettings::default());
        assert_eq!(vm.interpret("nil();"), InterpretResult::RuntimeError);
        // stacks were reset; the next program runs normally
        assert_eq!(vm.interpret("var a = 1; print a;"), InterpretResult::Ok);
    }

    #[test]
    fn gc_stress_over_object_churn() {
        let (result, output) = run_stressed(
            "class Node { init(value) { this.value = value; this.next = nil; } } \
             var head = nil; \
             for (var i = 0; i < 50; i = i + 1) { \
               var node = Node(i); node.next = head; head = node; \
             } \
             var sum = 0; \
             while (head != nil) { sum = sum + head.value; head = head.next; } \
             print sum;",
        );
        assert_eq!(result, InterpretResult::Ok);
        assert_eq!(output, "1225\n");
    }

    #[test]
    fn gc_stress_over_string_churn() {
        let (result, output) = run_stressed(
            "var s = \"\"; \
             for (var i = 0; i < 40; i = i + 1) { s = s + \"x\"; } \
             print s == \"\" + \"xxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxx\";",
        );
        assert_eq!(result, InterpretResult::Ok);
        assert_eq!(output, "true\n");
    }

    #[test]
    fn gc_stress_over_closures() {
        let (result, output) = run_stressed(
            "fun counter() { var n = 0; fun tick() { n = n + 1; return n; } return tick; } \
             var a = counter(); var b = counter(); \
             a(); a(); b(); \
             print a(); print b();",
        );
        assert_eq!(result, InterpretResult::Ok);
        assert_eq!(output, "3\n2\n");
    }
}
