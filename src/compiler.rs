//! The bytecode compiler: a single-pass Pratt-precedence parser that
//! emits instructions as it goes, with no intermediate tree.
//!
//! One [`FunctionCompiler`] per function being compiled, stacked through
//! `enclosing`; resolving a variable walks outward and converts hits in
//! enclosing functions into upvalues. Every object the compiler allocates
//! (interned names, literals, finished functions) is pushed onto the VM's
//! temporary-root stack so a collection triggered mid-compile cannot free
//! work in progress; `compile` truncates the stack on the way out.

use std::mem;

use crate::chunk::{Chunk, Op};
use crate::object::{Function, ObjKind};
use crate::scanner::{Scanner, Token, TokenKind};
use crate::value::{Gc, Value};
use crate::vm::Vm;

const MAX_LOCALS: usize = 256;
const MAX_UPVALUES: usize = 256;

/// Compile `source` into the top-level script function, or `None` if any
/// compile error was reported (to stderr).
pub fn compile(vm: &mut Vm, source: &str) -> Option<Gc> {
    let root_mark = vm.temp_roots.len();

    let mut parser = Parser::new(vm, source);
    parser.advance();
    while !parser.matches(TokenKind::Eof) {
        parser.declaration();
    }
    let (function, _) = parser.finish_compiler();
    let had_error = parser.had_error;

    vm.truncate_temp_roots(root_mark);
    if had_error {
        None
    } else {
        Some(function)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum FunctionKind {
    Script,
    Function,
    Method,
    Initializer,
}

#[derive(Debug)]
struct Local<'src> {
    name: &'src str,
    /// `None` until the initializer has run; reading it before that is
    /// the `var a = a;` error.
    depth: Option<usize>,
    is_captured: bool,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
struct CompilerUpvalue {
    index: u8,
    is_local: bool,
}

struct FunctionCompiler<'src> {
    enclosing: Option<Box<FunctionCompiler<'src>>>,
    kind: FunctionKind,
    chunk: Chunk,
    arity: usize,
    name: Option<Gc>,
    locals: Vec<Local<'src>>,
    upvalues: Vec<CompilerUpvalue>,
    scope_depth: usize,
}

impl<'src> FunctionCompiler<'src> {
    fn new(kind: FunctionKind, name: Option<Gc>) -> Self {
        // slot 0 belongs to the callable itself; inside methods it is
        // addressable as `this`
        let slot_zero = Local {
            name: if matches!(kind, FunctionKind::Method | FunctionKind::Initializer) {
                "this"
            } else {
                ""
            },
            depth: Some(0),
            is_captured: false,
        };
        Self {
            enclosing: None,
            kind,
            chunk: Chunk::new(),
            arity: 0,
            name,
            locals: vec![slot_zero],
            upvalues: Vec::new(),
            scope_depth: 0,
        }
    }
}

struct ClassCompiler {
    enclosing: Option<Box<ClassCompiler>>,
    has_superclass: bool,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
enum Precedence {
    None,
    Assignment, // =
    Or,         // or
    And,        // and
    Equality,   // == !=
    Comparison, // < > <= >=
    Term,       // + -
    Factor,     // * /
    Unary,      // ! -
    Call,       // . ()
    Primary,
}

impl Precedence {
    fn next(self) -> Self {
        match self {
            Precedence::None => Precedence::Assignment,
            Precedence::Assignment => Precedence::Or,
            Precedence::Or => Precedence::And,
            Precedence::And => Precedence::Equality,
            Precedence::Equality => Precedence::Comparison,
            Precedence::Comparison => Precedence::Term,
            Precedence::Term => Precedence::Factor,
            Precedence::Factor => Precedence::Unary,
            Precedence::Unary => Precedence::Call,
            Precedence::Call | Precedence::Primary => Precedence::Primary,
        }
    }
}

type ParseFn<'src, 'vm> = fn(&mut Parser<'src, 'vm>, bool);

struct ParseRule<'src, 'vm> {
    prefix: Option<ParseFn<'src, 'vm>>,
    infix: Option<ParseFn<'src, 'vm>>,
    precedence: Precedence,
}

fn rule<'src, 'vm>(kind: TokenKind) -> ParseRule<'src, 'vm> {
    use TokenKind::*;

    let (prefix, infix, precedence): (
        Option<ParseFn<'src, 'vm>>,
        Option<ParseFn<'src, 'vm>>,
        Precedence,
    ) = match kind {
        LeftParen => (Some(Parser::grouping), Some(Parser::call), Precedence::Call),
        Dot => (None, Some(Parser::dot), Precedence::Call),
        Minus => (Some(Parser::unary), Some(Parser::binary), Precedence::Term),
        Plus => (None, Some(Parser::binary), Precedence::Term),
        Slash | Star => (None, Some(Parser::binary), Precedence::Factor),
        Bang => (Some(Parser::unary), None, Precedence::None),
        BangEqual | EqualEqual => (None, Some(Parser::binary), Precedence::Equality),
        Greater | GreaterEqual | Less | LessEqual => {
            (None, Some(Parser::binary), Precedence::Comparison)
        }
        Identifier => (Some(Parser::variable), None, Precedence::None),
        String => (Some(Parser::string), None, Precedence::None),
        Number => (Some(Parser::number), None, Precedence::None),
        And => (None, Some(Parser::and_), Precedence::And),
        Or => (None, Some(Parser::or_), Precedence::Or),
        False | Nil | True => (Some(Parser::literal), None, Precedence::None),
        Super => (Some(Parser::super_), None, Precedence::None),
        This => (Some(Parser::this_), None, Precedence::None),
        _ => (None, None, Precedence::None),
    };
    ParseRule {
        prefix,
        infix,
        precedence,
    }
}

struct Parser<'src, 'vm> {
    vm: &'vm mut Vm,
    scanner: Scanner<'src>,
    current: Token<'src>,
    previous: Token<'src>,
    had_error: bool,
    panic_mode: bool,
    compiler: Box<FunctionCompiler<'src>>,
    class_compiler: Option<Box<ClassCompiler>>,
}

impl<'src, 'vm> Parser<'src, 'vm> {
    fn new(vm: &'vm mut Vm, source: &'src str) -> Self {
        let placeholder = Token {
            kind: TokenKind::Eof,
            lexeme: "",
            line: 0,
        };
        Self {
            vm,
            scanner: Scanner::new(source),
            current: placeholder,
            previous: placeholder,
            had_error: false,
            panic_mode: false,
            compiler: Box::new(FunctionCompiler::new(FunctionKind::Script, None)),
            class_compiler: None,
        }
    }

    // ── token plumbing ────────────────────────────────────────────────

    fn advance(&mut self) {
        self.previous = self.current;
        loop {
            self.current = self.scanner.next_token();
            if self.current.kind != TokenKind::Error {
                break;
            }
            let message = self.current.lexeme;
            self.error_at_current(message);
        }
    }

    fn consume(&mut self, kind: TokenKind, message: &str) {
        if self.current.kind == kind {
            self.advance();
        } else {
            self.error_at_current(message);
        }
    }

    fn check(&self, kind: TokenKind) -> bool {
        self.current.kind == kind
    }

    fn matches(&mut self, kind: TokenKind) -> bool {
        if self.check(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    // ── error reporting ───────────────────────────────────────────────

    fn error_at(&mut self, token: Token<'src>, message: &str) {
        // one diagnostic per panic; synchronize clears the mode
        if self.panic_mode {
            return;
        }
        self.panic_mode = true;
        self.had_error = true;

        eprint!("[line {}] Error", token.line);
        match token.kind {
            TokenKind::Eof => eprint!(" at end"),
            TokenKind::Error => {}
            _ => eprint!(" at '{}'", token.lexeme),
        }
        eprintln!(": {message}");
    }

    fn error(&mut self, message: &str) {
        self.error_at(self.previous, message);
    }

    fn error_at_current(&mut self, message: &str) {
        self.error_at(self.current, message);
    }

    /// Skip to a likely statement boundary after a parse error.
    fn synchronize(&mut self) {
        self.panic_mode = false;
        while self.current.kind != TokenKind::Eof {
            if self.previous.kind == TokenKind::Semicolon {
                return;
            }
            match self.current.kind {
                TokenKind::Class
                | TokenKind::Fun
                | TokenKind::Var
                | TokenKind::For
                | TokenKind::If
                | TokenKind::While
                | TokenKind::Print
                | TokenKind::Return => return,
                _ => self.advance(),
            }
        }
    }

    // ── emission ──────────────────────────────────────────────────────

    fn emit_byte(&mut self, byte: u8) {
        let line = self.previous.line;
        self.compiler.chunk.write(byte, line);
    }

    fn emit_op(&mut self, op: Op) {
        self.emit_byte(op as u8);
    }

    fn emit_bytes(&mut self, first: u8, second: u8) {
        self.emit_byte(first);
        self.emit_byte(second);
    }

    fn emit_return(&mut self) {
        if self.compiler.kind == FunctionKind::Initializer {
            // an initializer always hands back its instance
            self.emit_bytes(Op::GetLocal as u8, 0);
        } else {
            self.emit_op(Op::Nil);
        }
        self.emit_op(Op::Return);
    }

    fn make_constant(&mut self, value: Value) -> u8 {
        let index = self.compiler.chunk.add_constant(value);
        if index > u8::MAX as usize {
            self.error("Too many constants in one chunk.");
            return 0;
        }
        index as u8
    }

    fn emit_constant(&mut self, value: Value) {
        let constant = self.make_constant(value);
        self.emit_bytes(Op::Constant as u8, constant);
    }

    /// Emit a forward jump with a placeholder offset; returns the offset
    /// operand's position for [`Parser::patch_jump`].
    fn emit_jump(&mut self, op: Op) -> usize {
        self.emit_op(op);
        self.emit_byte(0xff);
        self.emit_byte(0xff);
        self.compiler.chunk.code.len() - 2
    }

    fn patch_jump(&mut self, operand: usize) {
        // the jump lands after the two offset bytes
        let distance = self.compiler.chunk.code.len() - operand - 2;
        if distance > u16::MAX as usize {
            self.error("Too much code to jump over.");
        }
        let [hi, lo] = (distance as u16).to_be_bytes();
        self.compiler.chunk.code[operand] = hi;
        self.compiler.chunk.code[operand + 1] = lo;
    }

    fn emit_loop(&mut self, loop_start: usize) {
        self.emit_op(Op::Loop);
        // +2 skips over this instruction's own operand
        let distance = self.compiler.chunk.code.len() - loop_start + 2;
        if distance > u16::MAX as usize {
            self.error("Loop body too large.");
        }
        let [hi, lo] = (distance as u16).to_be_bytes();
        self.emit_byte(hi);
        self.emit_byte(lo);
    }

    // ── compiler stack ────────────────────────────────────────────────

    /// Seal the innermost function: emit its implicit return, allocate
    /// the function object, and pop back to the enclosing compiler (or a
    /// fresh placeholder for the script itself).
    fn finish_compiler(&mut self) -> (Gc, Vec<CompilerUpvalue>) {
        self.emit_return();

        let enclosing = self.compiler.enclosing.take();
        let finished = match enclosing {
            Some(enclosing) => mem::replace(&mut self.compiler, enclosing),
            None => mem::replace(
                &mut self.compiler,
                Box::new(FunctionCompiler::new(FunctionKind::Script, None)),
            ),
        };
        let FunctionCompiler {
            chunk,
            arity,
            name,
            upvalues,
            ..
        } = *finished;

        let function = self.vm.allocate(ObjKind::Function(Function {
            arity,
            upvalue_count: upvalues.len(),
            chunk,
            name,
        }));
        self.vm.push_temp_root(Value::Obj(function));
        (function, upvalues)
    }

    // ── declarations ──────────────────────────────────────────────────

    fn declaration(&mut self) {
        if self.matches(TokenKind::Class) {
            self.class_declaration();
        } else if self.matches(TokenKind::Fun) {
            self.fun_declaration();
        } else if self.matches(TokenKind::Var) {
            self.var_declaration();
        } else {
            self.statement();
        }

        if self.panic_mode {
            self.synchronize();
        }
    }

    fn class_declaration(&mut self) {
        self.consume(TokenKind::Identifier, "Expect class name.");
        let class_name = self.previous;
        let name_constant = self.identifier_constant(class_name);
        self.declare_variable();

        self.emit_bytes(Op::Class as u8, name_constant);
        self.define_variable(name_constant);

        self.class_compiler = Some(Box::new(ClassCompiler {
            enclosing: self.class_compiler.take(),
            has_superclass: false,
        }));

        if self.matches(TokenKind::Less) {
            self.consume(TokenKind::Identifier, "Expect superclass name.");
            self.named_variable(self.previous, false);
            if class_name.lexeme == self.previous.lexeme {
                self.error("A class can't inherit from itself.");
            }

            // `super` lives in a scope of its own so sibling classes
            // each capture their own superclass
            self.begin_scope();
            self.add_local("super");
            self.define_variable(0);

            self.named_variable(class_name, false);
            self.emit_op(Op::Inherit);
            self.class_compiler
                .as_mut()
                .expect("class compiler just pushed")
                .has_superclass = true;
        }

        self.named_variable(class_name, false);
        self.consume(TokenKind::LeftBrace, "Expect '{' before class body.");
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.method();
        }
        self.consume(TokenKind::RightBrace, "Expect '}' after class body.");
        self.emit_op(Op::Pop);

        let class_compiler = self.class_compiler.take().expect("class compiler");
        if class_compiler.has_superclass {
            self.end_scope();
        }
        self.class_compiler = class_compiler.enclosing;
    }

    fn method(&mut self) {
        self.consume(TokenKind::Identifier, "Expect method name.");
        let constant = self.identifier_constant(self.previous);
        let kind = if self.previous.lexeme == "init" {
            FunctionKind::Initializer
        } else {
            FunctionKind::Method
        };
        self.function(kind);
        self.emit_bytes(Op::Method as u8, constant);
    }

    fn fun_declaration(&mut self) {
        let global = self.parse_variable("Expect function name.");
        // initialized immediately, so the body may recurse
        self.mark_initialized();
        self.function(FunctionKind::Function);
        self.define_variable(global);
    }

    fn function(&mut self, kind: FunctionKind) {
        self.push_function_compiler(kind);
        self.begin_scope();

        self.consume(TokenKind::LeftParen, "Expect '(' after function name.");
        if !self.check(TokenKind::RightParen) {
            loop {
                self.compiler.arity += 1;
                if self.compiler.arity > 255 {
                    self.error_at_current("Can't have more than 255 parameters.");
                }
                let constant = self.parse_variable("Expect parameter name.");
                self.define_variable(constant);
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expect ')' after parameters.");
        self.consume(TokenKind::LeftBrace, "Expect '{' before function body.");
        self.block();

        // no end_scope: the frame teardown discards the whole window
        let (function, upvalues) = self.finish_compiler();
        let constant = self.make_constant(Value::Obj(function));
        self.emit_bytes(Op::Closure as u8, constant);
        for upvalue in upvalues {
            self.emit_byte(upvalue.is_local as u8);
            self.emit_byte(upvalue.index);
        }
    }

    fn push_function_compiler(&mut self, kind: FunctionKind) {
        let name = self.vm.copy_string(self.previous.lexeme);
        self.vm.push_temp_root(Value::Obj(name));

        let new = Box::new(FunctionCompiler::new(kind, Some(name)));
        let enclosing = mem::replace(&mut self.compiler, new);
        self.compiler.enclosing = Some(enclosing);
    }

    fn var_declaration(&mut self) {
        let global = self.parse_variable("Expect variable name.");
        if self.matches(TokenKind::Equal) {
            self.expression();
        } else {
            self.emit_op(Op::Nil);
        }
        self.consume(
            TokenKind::Semicolon,
            "Expect ';' after variable declaration.",
        );
        self.define_variable(global);
    }

    // ── variables ─────────────────────────────────────────────────────

    fn parse_variable(&mut self, message: &str) -> u8 {
        self.consume(TokenKind::Identifier, message);
        self.declare_variable();
        if self.compiler.scope_depth > 0 {
            return 0;
        }
        self.identifier_constant(self.previous)
    }

    fn identifier_constant(&mut self, token: Token<'src>) -> u8 {
        let name = self.vm.copy_string(token.lexeme);
        self.vm.push_temp_root(Value::Obj(name));
        self.make_constant(Value::Obj(name))
    }

    fn declare_variable(&mut self) {
        if self.compiler.scope_depth == 0 {
            return;
        }
        let name = self.previous.lexeme;
        let shadowed = self.compiler.locals.iter().rev().any(|local| {
            local.depth.is_none_or(|depth| depth >= self.compiler.scope_depth)
                && local.name == name
        });
        if shadowed {
            self.error("Already a variable with this name in this scope.");
        }
        self.add_local(name);
    }

    fn add_local(&mut self, name: &'src str) {
        if self.compiler.locals.len() == MAX_LOCALS {
            self.error("Too many local variables in function.");
            return;
        }
        self.compiler.locals.push(Local {
            name,
            depth: None,
            is_captured: false,
        });
    }

    fn mark_initialized(&mut self) {
        if self.compiler.scope_depth == 0 {
            return;
        }
        let depth = self.compiler.scope_depth;
        if let Some(local) = self.compiler.locals.last_mut() {
            local.depth = Some(depth);
        }
    }

    fn define_variable(&mut self, global: u8) {
        if self.compiler.scope_depth > 0 {
            self.mark_initialized();
            return;
        }
        self.emit_bytes(Op::DefineGlobal as u8, global);
    }

    fn named_variable(&mut self, name: Token<'src>, can_assign: bool) {
        let (get_op, set_op, arg) = match resolve_local(&self.compiler, name.lexeme) {
            Err(message) => {
                self.error(message);
                return;
            }
            Ok(Some(slot)) => (Op::GetLocal, Op::SetLocal, slot),
            Ok(None) => match resolve_upvalue(&mut self.compiler, name.lexeme) {
                Err(message) => {
                    self.error(message);
                    return;
                }
                Ok(Some(slot)) => (Op::GetUpvalue, Op::SetUpvalue, slot),
                Ok(None) => {
                    let constant = self.identifier_constant(name);
                    (Op::GetGlobal, Op::SetGlobal, constant)
                }
            },
        };

        if can_assign && self.matches(TokenKind::Equal) {
            self.expression();
            self.emit_bytes(set_op as u8, arg);
        } else {
            self.emit_bytes(get_op as u8, arg);
        }
    }

    // ── scopes ────────────────────────────────────────────────────────

    fn begin_scope(&mut self) {
        self.compiler.scope_depth += 1;
    }

    fn end_scope(&mut self) {
        self.compiler.scope_depth -= 1;
        loop {
            let Some(local) = self.compiler.locals.last() else {
                break;
            };
            if local.depth.is_none_or(|depth| depth <= self.compiler.scope_depth) {
                break;
            }
            let captured = local.is_captured;
            self.compiler.locals.pop();
            if captured {
                // the closure cell outlives the slot
                self.emit_op(Op::CloseUpvalue);
            } else {
                self.emit_op(Op::Pop);
            }
        }
    }

    // ── statements ────────────────────────────────────────────────────

    fn statement(&mut self) {
        if self.matches(TokenKind::Print) {
            self.print_statement();
        } else if self.matches(TokenKind::For) {
            self.for_statement();
        } else if self.matches(TokenKind::If) {
            self.if_statement();
        } else if self.matches(TokenKind::Return) {
            self.return_statement();
        } else if self.matches(TokenKind::While) {
            self.while_statement();
        } else if self.matches(TokenKind::LeftBrace) {
            self.begin_scope();
            self.block();
            self.end_scope();
        } else {
            self.expression_statement();
        }
    }

    fn block(&mut self) {
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.declaration();
        }
        self.consume(TokenKind::RightBrace, "Expect '}' after block.");
    }

    fn print_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Semicolon, "Expect ';' after value.");
        self.emit_op(Op::Print);
    }

    fn expression_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Semicolon, "Expect ';' after expression.");
        self.emit_op(Op::Pop);
    }

    fn if_statement(&mut self) {
        self.consume(TokenKind::LeftParen, "Expect '(' after 'if'.");
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after condition.");

        let then_jump = self.emit_jump(Op::JumpIfFalse);
        self.emit_op(Op::Pop);
        self.statement();
        let else_jump = self.emit_jump(Op::Jump);

        self.patch_jump(then_jump);
        self.emit_op(Op::Pop);
        if self.matches(TokenKind::Else) {
            self.statement();
        }
        self.patch_jump(else_jump);
    }

    fn while_statement(&mut self) {
        let loop_start = self.compiler.chunk.code.len();
        self.consume(TokenKind::LeftParen, "Expect '(' after 'while'.");
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after condition.");

        let exit_jump = self.emit_jump(Op::JumpIfFalse);
        self.emit_op(Op::Pop);
        self.statement();
        self.emit_loop(loop_start);

        self.patch_jump(exit_jump);
        self.emit_op(Op::Pop);
    }

    fn for_statement(&mut self) {
        // the loop variable lives in its own scope
        self.begin_scope();
        self.consume(TokenKind::LeftParen, "Expect '(' after 'for'.");
        if self.matches(TokenKind::Semicolon) {
            // no initializer
        } else if self.matches(TokenKind::Var) {
            self.var_declaration();
        } else {
            self.expression_statement();
        }

        let mut loop_start = self.compiler.chunk.code.len();
        let mut exit_jump = None;
        if !self.matches(TokenKind::Semicolon) {
            self.expression();
            self.consume(TokenKind::Semicolon, "Expect ';' after loop condition.");
            exit_jump = Some(self.emit_jump(Op::JumpIfFalse));
            self.emit_op(Op::Pop);
        }

        if !self.matches(TokenKind::RightParen) {
            // the increment textually precedes the body but runs after
            // it: jump over it, run the body, loop back to it
            let body_jump = self.emit_jump(Op::Jump);
            let increment_start = self.compiler.chunk.code.len();
            self.expression();
            self.emit_op(Op::Pop);
            self.consume(TokenKind::RightParen, "Expect ')' after for clauses.");

            self.emit_loop(loop_start);
            loop_start = increment_start;
            self.patch_jump(body_jump);
        }

        self.statement();
        self.emit_loop(loop_start);

        if let Some(exit_jump) = exit_jump {
            self.patch_jump(exit_jump);
            self.emit_op(Op::Pop);
        }
        self.end_scope();
    }

    fn return_statement(&mut self) {
        if self.compiler.kind == FunctionKind::Script {
            self.error("Can't return from top-level code.");
        }
        if self.matches(TokenKind::Semicolon) {
            self.emit_return();
        } else {
            if self.compiler.kind == FunctionKind::Initializer {
                self.error("Can't return a value from an initializer.");
            }
            self.expression();
            self.consume(TokenKind::Semicolon, "Expect ';' after return value.");
            self.emit_op(Op::Return);
        }
    }

    // ── expressions ───────────────────────────────────────────────────

    fn expression(&mut self) {
        self.parse_precedence(Precedence::Assignment);
    }

    fn parse_precedence(&mut self, precedence: Precedence) {
        self.advance();
        let Some(prefix) = rule(self.previous.kind).prefix else {
            self.error("Expect expression.");
            return;
        };

        // assignment binds loosest; only there may `=` follow a target
        let can_assign = precedence <= Precedence::Assignment;
        prefix(self, can_assign);

        while precedence <= rule(self.current.kind).precedence {
            self.advance();
            let infix = rule(self.previous.kind).infix.expect("infix rule");
            infix(self, can_assign);
        }

        if can_assign && self.matches(TokenKind::Equal) {
            self.error("Invalid assignment target.");
        }
    }

    fn grouping(&mut self, _can_assign: bool) {
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after expression.");
    }

    fn number(&mut self, _can_assign: bool) {
        let value: f64 = self.previous.lexeme.parse().expect("scanned number");
        self.emit_constant(Value::Number(value));
    }

    fn string(&mut self, _can_assign: bool) {
        let lexeme = self.previous.lexeme;
        let contents = &lexeme[1..lexeme.len() - 1];
        let string = self.vm.copy_string(contents);
        self.vm.push_temp_root(Value::Obj(string));
        self.emit_constant(Value::Obj(string));
    }

    fn literal(&mut self, _can_assign: bool) {
        match self.previous.kind {
            TokenKind::False => self.emit_op(Op::False),
            TokenKind::Nil => self.emit_op(Op::Nil),
            TokenKind::True => self.emit_op(Op::True),
            _ => unreachable!("literal rule"),
        }
    }

    fn variable(&mut self, can_assign: bool) {
        self.named_variable(self.previous, can_assign);
    }

    fn unary(&mut self, _can_assign: bool) {
        let operator = self.previous.kind;
        self.parse_precedence(Precedence::Unary);
        match operator {
            TokenKind::Minus => self.emit_op(Op::Negate),
            TokenKind::Bang => self.emit_op(Op::Not),
            _ => unreachable!("unary rule"),
        }
    }

    fn binary(&mut self, _can_assign: bool) {
        let operator = self.previous.kind;
        let next = rule::<'src, 'vm>(operator).precedence.next();
        self.parse_precedence(next);
        match operator {
            TokenKind::BangEqual => {
                self.emit_op(Op::Equal);
                self.emit_op(Op::Not);
            }
            TokenKind::EqualEqual => self.emit_op(Op::Equal),
            TokenKind::Greater => self.emit_op(Op::Greater),
            TokenKind::GreaterEqual => {
                self.emit_op(Op::Less);
                self.emit_op(Op::Not);
            }
            TokenKind::Less => self.emit_op(Op::Less),
            TokenKind::LessEqual => {
                self.emit_op(Op::Greater);
                self.emit_op(Op::Not);
            }
            TokenKind::Plus => self.emit_op(Op::Add),
            TokenKind::Minus => self.emit_op(Op::Subtract),
            TokenKind::Star => self.emit_op(Op::Multiply),
            TokenKind::Slash => self.emit_op(Op::Divide),
            _ => unreachable!("binary rule"),
        }
    }

    fn and_(&mut self, _can_assign: bool) {
        let end_jump = self.emit_jump(Op::JumpIfFalse);
        self.emit_op(Op::Pop);
        self.parse_precedence(Precedence::And);
        self.patch_jump(end_jump);
    }

    fn or_(&mut self, _can_assign: bool) {
        let else_jump = self.emit_jump(Op::JumpIfFalse);
        let end_jump = self.emit_jump(Op::Jump);
        self.patch_jump(else_jump);
        self.emit_op(Op::Pop);
        self.parse_precedence(Precedence::Or);
        self.patch_jump(end_jump);
    }

    fn call(&mut self, _can_assign: bool) {
        let argc = self.argument_list();
        self.emit_bytes(Op::Call as u8, argc);
    }

    fn dot(&mut self, can_assign: bool) {
        self.consume(TokenKind::Identifier, "Expect property name after '.'.");
        let name = self.identifier_constant(self.previous);

        if can_assign && self.matches(TokenKind::Equal) {
            self.expression();
            self.emit_bytes(Op::SetProperty as u8, name);
        } else if self.matches(TokenKind::LeftParen) {
            // immediate call: fuse access and invocation
            let argc = self.argument_list();
            self.emit_bytes(Op::Invoke as u8, name);
            self.emit_byte(argc);
        } else {
            self.emit_bytes(Op::GetProperty as u8, name);
        }
    }

    fn this_(&mut self, _can_assign: bool) {
        if self.class_compiler.is_none() {
            self.error("Can't use 'this' outside of a class.");
            return;
        }
        self.variable(false);
    }

    fn super_(&mut self, _can_assign: bool) {
        match &self.class_compiler {
            None => self.error("Can't use 'super' outside of a class."),
            Some(class) if !class.has_superclass => {
                self.error("Can't use 'super' in a class with no superclass.");
            }
            Some(_) => {}
        }

        self.consume(TokenKind::Dot, "Expect '.' after 'super'.");
        self.consume(TokenKind::Identifier, "Expect superclass method name.");
        let name = self.identifier_constant(self.previous);

        let this_token = Token {
            kind: TokenKind::This,
            lexeme: "this",
            line: self.previous.line,
        };
        let super_token = Token {
            kind: TokenKind::Super,
            lexeme: "super",
            line: self.previous.line,
        };

        self.named_variable(this_token, false);
        if self.matches(TokenKind::LeftParen) {
            let argc = self.argument_list();
            self.named_variable(super_token, false);
            self.emit_bytes(Op::SuperInvoke as u8, name);
            self.emit_byte(argc);
        } else {
            self.named_variable(super_token, false);
            self.emit_bytes(Op::GetSuper as u8, name);
        }
    }

    fn argument_list(&mut self) -> u8 {
        let mut argc: usize = 0;
        if !self.check(TokenKind::RightParen) {
            loop {
                self.expression();
                if argc == 255 {
                    self.error("Can't have more than 255 arguments.");
                }
                argc += 1;
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expect ')' after arguments.");
        argc.min(255) as u8
    }
}

// Variable resolution walks the compiler chain directly; these are free
// functions so they can recurse on `enclosing` without re-borrowing the
// parser.

fn resolve_local(compiler: &FunctionCompiler, name: &str) -> Result<Option<u8>, &'static str> {
    for (slot, local) in compiler.locals.iter().enumerate().rev() {
        if local.name == name {
            if local.depth.is_none() {
                return Err("Can't read local variable in its own initializer.");
            }
            return Ok(Some(slot as u8));
        }
    }
    Ok(None)
}

fn resolve_upvalue(
    compiler: &mut FunctionCompiler,
    name: &str,
) -> Result<Option<u8>, &'static str> {
    let Some(enclosing) = compiler.enclosing.as_deref_mut() else {
        return Ok(None);
    };

    if let Some(slot) = resolve_local(enclosing, name)? {
        enclosing.locals[slot as usize].is_captured = true;
        return add_upvalue(compiler, slot, true).map(Some);
    }
    // transitive capture: the variable lives even further out; the
    // enclosing function captures it first, and we capture its upvalue
    if let Some(slot) = resolve_upvalue(enclosing, name)? {
        return add_upvalue(compiler, slot, false).map(Some);
    }
    Ok(None)
}

fn add_upvalue(
    compiler: &mut FunctionCompiler,
    index: u8,
    is_local: bool,
) -> Result<u8, &'static str> {
    let upvalue = CompilerUpvalue { index, is_local };
    // sibling references to one variable share a single slot
    if let Some(existing) = compiler.upvalues.iter().position(|&u| u == upvalue) {
        return Ok(existing as u8);
    }
    if compiler.upvalues.len() == MAX_UPVALUES {
        return Err("Too many closure variables in function.");
    }
    compiler.upvalues.push(upvalue);
    Ok((compiler.upvalues.len() - 1) as u8)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::Vm;

    fn compiles(source: &str) -> bool {
        let mut vm = Vm::default();
        compile(&mut vm, source).is_some()
    }

    #[test]
    fn valid_programs_compile() {
        assert!(compiles("print 1 + 2;"));
        assert!(compiles("var a = 1; { var b = a; print b; }"));
        assert!(compiles("fun f(a, b) { return a + b; } f(1, 2);"));
        assert!(compiles(
            "class A { init() {} m() { return this; } } class B < A { m() { return super.m(); } }"
        ));
        assert!(compiles("for (var i = 0; i < 10; i = i + 1) print i;"));
        assert!(compiles("while (false) {} if (true) {} else {}"));
        assert!(compiles("fun outer() { var x = 1; fun inner() { return x; } return inner; }"));
    }

    #[test]
    fn syntax_errors_fail_compilation() {
        assert!(!compiles("print 1 +;"));
        assert!(!compiles("var;"));
        assert!(!compiles("{"));
        assert!(!compiles("fun f( {}"));
        assert!(!compiles("1 + 2"));
    }

    #[test]
    fn resolution_errors_fail_compilation() {
        assert!(!compiles("{ var a = a; }"));
        assert!(!compiles("{ var a = 1; var a = 2; }"));
        assert!(!compiles("return 1;"));
        assert!(!compiles("print this;"));
        assert!(!compiles("class A {} print super.m;"));
        assert!(!compiles("class A { m() { return super.m(); } }"));
        assert!(!compiles("class A < A {}"));
        assert!(!compiles("fun f() { class A { init() { return 1; } } }"));
        assert!(!compiles("1 = 2;"));
        assert!(!compiles("var a = 1; var b = 2; a + b = 3;"));
    }

    #[test]
    fn script_function_shape() {
        let mut vm = Vm::default();
        let function = compile(&mut vm, "print 1;").expect("compiles");
        // SAFETY: nothing allocates (so nothing collects) before the VM drops
        let function = unsafe { function.as_ref() }.as_function();
        assert_eq!(function.arity, 0);
        assert_eq!(function.upvalue_count, 0);
        assert!(function.name.is_none());
        assert!(!function.chunk.code.is_empty());
    }

    #[test]
    fn too_many_constants_is_a_compile_error() {
        // 257 distinct number literals overflow the one-byte pool index
        let mut source = String::from("print 0");
        for i in 1..=257 {
            source.push_str(&format!(" + {i}"));
        }
        source.push(';');
        assert!(!compiles(&source));
    }

    #[test]
    fn sibling_closures_share_one_upvalue_slot() {
        assert!(compiles(
            "fun outer() { var x = 1; fun inner() { return x + x; } return inner; }"
        ));
    }
}
