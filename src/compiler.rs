// File: src/compiler.rs
//
// Single-pass bytecode compiler for Quill: a recursive-descent parser with
// Pratt expression parsing that emits into the current function's chunk as it
// goes. No AST is built. Variable references resolve to locals, upvalues, or
// globals at parse time; nested function bodies compile on a stack of
// function-compiler records.

use crate::bytecode::OpCode;
use crate::errors::CompileErrorReport;
use crate::lexer::{Lexer, Token, TokenKind};
use crate::object::{Obj, ObjFunction, ObjHandle};
use crate::value::Value;
use crate::vm::Vm;

const MAX_LOCALS: usize = u8::MAX as usize + 1;
const MAX_UPVALUES: usize = u8::MAX as usize + 1;

/// Compile a source buffer into the top-level script function. On failure
/// every diagnostic gathered before synchronization is returned; no function
/// is produced.
pub fn compile(source: &str, vm: &mut Vm) -> Result<ObjHandle, CompileErrorReport> {
    let mut compiler = Compiler::new(source, vm);
    compiler.begin_function(FunctionType::Script);
    compiler.advance();
    while !compiler.matches(TokenKind::Eof) {
        compiler.declaration();
    }
    let (function, _) = compiler.end_function();
    if compiler.parser.had_error {
        Err(CompileErrorReport { diagnostics: compiler.diagnostics })
    } else {
        Ok(function)
    }
}

/// Binding power, low to high. Parsing at precedence p consumes every infix
/// operator whose precedence is >= p.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
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
    fn next(self) -> Precedence {
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

type ParseFn<'src, 'vm> = fn(&mut Compiler<'src, 'vm>, bool);

struct ParseRule<'src, 'vm> {
    prefix: Option<ParseFn<'src, 'vm>>,
    infix: Option<ParseFn<'src, 'vm>>,
    precedence: Precedence,
}

/// The static Pratt table: {prefix rule, infix rule, precedence} per token
/// kind. `can_assign` flows from parse_precedence into the rules so only
/// assignment-position expressions may consume `=`.
fn rule<'src, 'vm>(kind: TokenKind) -> ParseRule<'src, 'vm> {
    use TokenKind::*;
    let (prefix, infix, precedence): (
        Option<ParseFn<'src, 'vm>>,
        Option<ParseFn<'src, 'vm>>,
        Precedence,
    ) = match kind {
        LeftParen => (Some(Compiler::grouping), Some(Compiler::call), Precedence::Call),
        Dot => (None, Some(Compiler::dot), Precedence::Call),
        Minus => (Some(Compiler::unary), Some(Compiler::binary), Precedence::Term),
        Plus => (None, Some(Compiler::binary), Precedence::Term),
        Slash | Star => (None, Some(Compiler::binary), Precedence::Factor),
        Bang => (Some(Compiler::unary), None, Precedence::None),
        BangEqual | EqualEqual => (None, Some(Compiler::binary), Precedence::Equality),
        Greater | GreaterEqual | Less | LessEqual => {
            (None, Some(Compiler::binary), Precedence::Comparison)
        }
        Identifier => (Some(Compiler::variable), None, Precedence::None),
        String => (Some(Compiler::string), None, Precedence::None),
        Number => (Some(Compiler::number), None, Precedence::None),
        And => (None, Some(Compiler::and_op), Precedence::And),
        Or => (None, Some(Compiler::or_op), Precedence::Or),
        False | Nil | True => (Some(Compiler::literal), None, Precedence::None),
        Super => (Some(Compiler::super_expr), None, Precedence::None),
        This => (Some(Compiler::this_expr), None, Precedence::None),
        _ => (None, None, Precedence::None),
    };
    ParseRule { prefix, infix, precedence }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FunctionType {
    Script,
    Function,
    Method,
    Initializer,
}

struct Local<'src> {
    name: &'src str,
    // -1 while declared but not yet initialized.
    depth: i32,
    is_captured: bool,
}

#[derive(Clone, Copy, PartialEq, Eq)]
struct CompilerUpvalue {
    index: u8,
    is_local: bool,
}

/// Per-function compilation state. Nested functions push a new record; the
/// innermost is always last.
struct FnCompiler<'src> {
    function: ObjHandle,
    fn_type: FunctionType,
    locals: Vec<Local<'src>>,
    upvalues: Vec<CompilerUpvalue>,
    scope_depth: i32,
}

/// Per-class compilation state, for `this`/`super` legality checks.
struct ClassCompiler {
    has_superclass: bool,
}

struct Parser<'src> {
    current: Token<'src>,
    previous: Token<'src>,
    had_error: bool,
    panic_mode: bool,
}

struct Compiler<'src, 'vm> {
    lexer: Lexer<'src>,
    parser: Parser<'src>,
    vm: &'vm mut Vm,
    fns: Vec<FnCompiler<'src>>,
    classes: Vec<ClassCompiler>,
    diagnostics: Vec<String>,
}

impl<'src, 'vm> Compiler<'src, 'vm> {
    fn new(source: &'src str, vm: &'vm mut Vm) -> Self {
        let placeholder = Token { kind: TokenKind::Eof, lexeme: "", line: 0 };
        Self {
            lexer: Lexer::new(source),
            parser: Parser {
                current: placeholder,
                previous: placeholder,
                had_error: false,
                panic_mode: false,
            },
            vm,
            fns: Vec::new(),
            classes: Vec::new(),
            diagnostics: Vec::new(),
        }
    }

    // === Token plumbing ===

    fn advance(&mut self) {
        self.parser.previous = self.parser.current;
        loop {
            self.parser.current = self.lexer.next_token();
            if self.parser.current.kind != TokenKind::Error {
                break;
            }
            let message = self.parser.current.lexeme;
            self.error_at_current(message);
        }
    }

    fn consume(&mut self, kind: TokenKind, message: &str) {
        if self.parser.current.kind == kind {
            self.advance();
            return;
        }
        self.error_at_current(message);
    }

    fn check(&self, kind: TokenKind) -> bool {
        self.parser.current.kind == kind
    }

    fn matches(&mut self, kind: TokenKind) -> bool {
        if !self.check(kind) {
            return false;
        }
        self.advance();
        true
    }

    // === Error reporting ===

    fn error_at(&mut self, token: Token<'src>, message: &str) {
        // Panic mode swallows everything until the parser synchronizes.
        if self.parser.panic_mode {
            return;
        }
        self.parser.panic_mode = true;
        let mut diagnostic = format!("[line {}] Error", token.line);
        match token.kind {
            TokenKind::Eof => diagnostic.push_str(" at end"),
            TokenKind::Error => {}
            _ => diagnostic.push_str(&format!(" at '{}'", token.lexeme)),
        }
        diagnostic.push_str(&format!(": {}", message));
        self.diagnostics.push(diagnostic);
        self.parser.had_error = true;
    }

    fn error(&mut self, message: &str) {
        self.error_at(self.parser.previous, message);
    }

    fn error_at_current(&mut self, message: &str) {
        self.error_at(self.parser.current, message);
    }

    fn synchronize(&mut self) {
        self.parser.panic_mode = false;
        while self.parser.current.kind != TokenKind::Eof {
            if self.parser.previous.kind == TokenKind::Semicolon {
                return;
            }
            match self.parser.current.kind {
                TokenKind::Class
                | TokenKind::Fun
                | TokenKind::Var
                | TokenKind::For
                | TokenKind::If
                | TokenKind::While
                | TokenKind::Print
                | TokenKind::Return => return,
                _ => {}
            }
            self.advance();
        }
    }

    // === Bytecode emission ===

    fn fn_compiler(&self) -> &FnCompiler<'src> {
        self.fns.last().expect("no active function compiler")
    }

    fn fn_compiler_mut(&mut self) -> &mut FnCompiler<'src> {
        self.fns.last_mut().expect("no active function compiler")
    }

    fn chunk_len(&self) -> usize {
        let function = self.fn_compiler().function;
        self.vm.heap.function(function).chunk.code.len()
    }

    fn emit_byte(&mut self, byte: u8) {
        let line = self.parser.previous.line;
        let function = self.fn_compiler().function;
        self.vm.heap.function_mut(function).chunk.write(byte, line);
    }

    fn emit_op(&mut self, op: OpCode) {
        self.emit_byte(op.into());
    }

    fn emit_ops(&mut self, first: OpCode, second: OpCode) {
        self.emit_op(first);
        self.emit_op(second);
    }

    fn emit_op_byte(&mut self, op: OpCode, byte: u8) {
        self.emit_op(op);
        self.emit_byte(byte);
    }

    fn emit_return(&mut self) {
        // An initializer's implicit return value is `this` (slot 0).
        if self.fn_compiler().fn_type == FunctionType::Initializer {
            self.emit_op_byte(OpCode::GetLocal, 0);
        } else {
            self.emit_op(OpCode::Nil);
        }
        self.emit_op(OpCode::Return);
    }

    fn make_constant(&mut self, value: Value) -> u8 {
        let function = self.fn_compiler().function;
        let index = self.vm.heap.function_mut(function).chunk.add_constant(value);
        if index > u8::MAX as usize {
            self.error("Too many constants in one chunk.");
            return 0;
        }
        index as u8
    }

    fn emit_constant(&mut self, value: Value) {
        let constant = self.make_constant(value);
        self.emit_op_byte(OpCode::Constant, constant);
    }

    /// Emit a forward jump with a placeholder offset; returns the offset's
    /// position for patch_jump.
    fn emit_jump(&mut self, op: OpCode) -> usize {
        self.emit_op(op);
        self.emit_byte(0xff);
        self.emit_byte(0xff);
        self.chunk_len() - 2
    }

    fn patch_jump(&mut self, offset: usize) {
        // -2 adjusts for the operand bytes themselves.
        let jump = self.chunk_len() - offset - 2;
        if jump > u16::MAX as usize {
            self.error("Too much code to jump over.");
        }
        let function = self.fn_compiler().function;
        let code = &mut self.vm.heap.function_mut(function).chunk.code;
        code[offset] = ((jump >> 8) & 0xff) as u8;
        code[offset + 1] = (jump & 0xff) as u8;
    }

    fn emit_loop(&mut self, loop_start: usize) {
        self.emit_op(OpCode::Loop);
        let offset = self.chunk_len() - loop_start + 2;
        if offset > u16::MAX as usize {
            self.error("Loop body too large.");
        }
        self.emit_byte(((offset >> 8) & 0xff) as u8);
        self.emit_byte((offset & 0xff) as u8);
    }

    // === Function compiler stack ===

    fn begin_function(&mut self, fn_type: FunctionType) {
        // Root the new function for the whole compilation: nothing else
        // reaches it until it becomes a constant of its enclosing function.
        let function = self.vm.alloc(Obj::Function(ObjFunction::new(None)));
        self.vm.heap.push_compiler_root(function);
        if fn_type != FunctionType::Script {
            let name = self.vm.intern(self.parser.previous.lexeme);
            self.vm.heap.function_mut(function).name = Some(name);
        }

        // Slot 0 is reserved: it holds `this` in methods and initializers.
        let slot_zero_name = match fn_type {
            FunctionType::Method | FunctionType::Initializer => "this",
            _ => "",
        };
        self.fns.push(FnCompiler {
            function,
            fn_type,
            locals: vec![Local { name: slot_zero_name, depth: 0, is_captured: false }],
            upvalues: Vec::new(),
            scope_depth: 0,
        });
    }

    fn end_function(&mut self) -> (ObjHandle, Vec<CompilerUpvalue>) {
        self.emit_return();
        let fc = self.fns.pop().expect("no active function compiler");
        let function = fc.function;
        self.vm.heap.function_mut(function).upvalue_count = fc.upvalues.len();

        if self.vm.options.disassemble && !self.parser.had_error {
            let name = match self.vm.heap.function(function).name {
                Some(name) => self.vm.heap.string(name).chars.to_string(),
                None => "<script>".to_string(),
            };
            crate::debug::disassemble_chunk(
                &self.vm.heap,
                &self.vm.heap.function(function).chunk,
                &name,
            );
        }

        self.vm.heap.pop_compiler_root();
        (function, fc.upvalues)
    }

    // === Scopes and variables ===

    fn begin_scope(&mut self) {
        self.fn_compiler_mut().scope_depth += 1;
    }

    fn end_scope(&mut self) {
        self.fn_compiler_mut().scope_depth -= 1;
        loop {
            let captured = {
                let fc = self.fn_compiler();
                match fc.locals.last() {
                    Some(local) if local.depth > fc.scope_depth => local.is_captured,
                    _ => break,
                }
            };
            self.fn_compiler_mut().locals.pop();
            // A captured local is hoisted to the heap instead of discarded.
            if captured {
                self.emit_op(OpCode::CloseUpvalue);
            } else {
                self.emit_op(OpCode::Pop);
            }
        }
    }

    fn identifier_constant(&mut self, name: &str) -> u8 {
        let handle = self.vm.intern(name);
        self.make_constant(Value::object(handle))
    }

    fn add_local(&mut self, name: &'src str) {
        if self.fn_compiler().locals.len() == MAX_LOCALS {
            self.error("Too many local variables in function.");
            return;
        }
        self.fn_compiler_mut().locals.push(Local { name, depth: -1, is_captured: false });
    }

    fn declare_variable(&mut self) {
        if self.fn_compiler().scope_depth == 0 {
            return;
        }
        let name = self.parser.previous.lexeme;
        let mut duplicate = false;
        {
            let fc = self.fn_compiler();
            for local in fc.locals.iter().rev() {
                if local.depth != -1 && local.depth < fc.scope_depth {
                    break;
                }
                if local.name == name {
                    duplicate = true;
                    break;
                }
            }
        }
        if duplicate {
            self.error("Already a variable with this name in this scope.");
        }
        self.add_local(name);
    }

    fn parse_variable(&mut self, message: &str) -> u8 {
        self.consume(TokenKind::Identifier, message);
        self.declare_variable();
        if self.fn_compiler().scope_depth > 0 {
            return 0;
        }
        self.identifier_constant(self.parser.previous.lexeme)
    }

    fn mark_initialized(&mut self) {
        let fc = self.fn_compiler_mut();
        if fc.scope_depth == 0 {
            return;
        }
        let depth = fc.scope_depth;
        if let Some(local) = fc.locals.last_mut() {
            local.depth = depth;
        }
    }

    fn define_variable(&mut self, global: u8) {
        if self.fn_compiler().scope_depth > 0 {
            self.mark_initialized();
            return;
        }
        self.emit_op_byte(OpCode::DefineGlobal, global);
    }

    fn resolve_local(&mut self, fn_index: usize, name: &str) -> Option<usize> {
        let mut uninitialized = false;
        let mut found = None;
        for (i, local) in self.fns[fn_index].locals.iter().enumerate().rev() {
            if local.name == name {
                if local.depth == -1 {
                    uninitialized = true;
                }
                found = Some(i);
                break;
            }
        }
        if uninitialized {
            self.error("Can't read local variable in its own initializer.");
        }
        found
    }

    /// Resolve `name` as an upvalue of fns[fn_index]: capture a local of the
    /// enclosing function, or chain through the enclosing function's own
    /// upvalues. Returns the upvalue index.
    fn resolve_upvalue(&mut self, fn_index: usize, name: &str) -> Option<usize> {
        if fn_index == 0 {
            return None;
        }
        if let Some(local) = self.resolve_local(fn_index - 1, name) {
            self.fns[fn_index - 1].locals[local].is_captured = true;
            return Some(self.add_upvalue(fn_index, local as u8, true));
        }
        if let Some(upvalue) = self.resolve_upvalue(fn_index - 1, name) {
            return Some(self.add_upvalue(fn_index, upvalue as u8, false));
        }
        None
    }

    fn add_upvalue(&mut self, fn_index: usize, index: u8, is_local: bool) -> usize {
        let candidate = CompilerUpvalue { index, is_local };
        // Each capture is recorded once per function.
        if let Some(existing) =
            self.fns[fn_index].upvalues.iter().position(|uv| *uv == candidate)
        {
            return existing;
        }
        if self.fns[fn_index].upvalues.len() == MAX_UPVALUES {
            self.error("Too many closure variables in function.");
            return 0;
        }
        self.fns[fn_index].upvalues.push(candidate);
        self.fns[fn_index].upvalues.len() - 1
    }

    fn named_variable(&mut self, name: &str, can_assign: bool) {
        let fn_index = self.fns.len() - 1;
        let (get_op, set_op, arg) = if let Some(slot) = self.resolve_local(fn_index, name) {
            (OpCode::GetLocal, OpCode::SetLocal, slot as u8)
        } else if let Some(upvalue) = self.resolve_upvalue(fn_index, name) {
            (OpCode::GetUpvalue, OpCode::SetUpvalue, upvalue as u8)
        } else {
            let constant = self.identifier_constant(name);
            (OpCode::GetGlobal, OpCode::SetGlobal, constant)
        };

        if can_assign && self.matches(TokenKind::Equal) {
            self.expression();
            self.emit_op_byte(set_op, arg);
        } else {
            self.emit_op_byte(get_op, arg);
        }
    }

    // === Expressions ===

    fn parse_precedence(&mut self, precedence: Precedence) {
        self.advance();
        let prefix = match rule(self.parser.previous.kind).prefix {
            Some(prefix) => prefix,
            None => {
                self.error("Expect expression.");
                return;
            }
        };
        let can_assign = precedence <= Precedence::Assignment;
        prefix(self, can_assign);

        while precedence <= rule(self.parser.current.kind).precedence {
            self.advance();
            if let Some(infix) = rule(self.parser.previous.kind).infix {
                infix(self, can_assign);
            }
        }

        // A leftover `=` here means the prefix was not a valid target.
        if can_assign && self.matches(TokenKind::Equal) {
            self.error("Invalid assignment target.");
        }
    }

    fn expression(&mut self) {
        self.parse_precedence(Precedence::Assignment);
    }

    fn number(&mut self, _can_assign: bool) {
        let n: f64 = self.parser.previous.lexeme.parse().unwrap_or(0.0);
        self.emit_constant(Value::number(n));
    }

    fn string(&mut self, _can_assign: bool) {
        let lexeme = self.parser.previous.lexeme;
        // Trim the surrounding quotes; the contents are copied verbatim.
        let handle = self.vm.intern(&lexeme[1..lexeme.len() - 1]);
        self.emit_constant(Value::object(handle));
    }

    fn literal(&mut self, _can_assign: bool) {
        match self.parser.previous.kind {
            TokenKind::False => self.emit_op(OpCode::False),
            TokenKind::Nil => self.emit_op(OpCode::Nil),
            TokenKind::True => self.emit_op(OpCode::True),
            _ => unreachable!(),
        }
    }

    fn grouping(&mut self, _can_assign: bool) {
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after expression.");
    }

    fn unary(&mut self, _can_assign: bool) {
        let operator = self.parser.previous.kind;
        self.parse_precedence(Precedence::Unary);
        match operator {
            TokenKind::Minus => self.emit_op(OpCode::Negate),
            TokenKind::Bang => self.emit_op(OpCode::Not),
            _ => unreachable!(),
        }
    }

    fn binary(&mut self, _can_assign: bool) {
        let operator = self.parser.previous.kind;
        self.parse_precedence(rule(operator).precedence.next());
        match operator {
            TokenKind::BangEqual => self.emit_ops(OpCode::Equal, OpCode::Not),
            TokenKind::EqualEqual => self.emit_op(OpCode::Equal),
            TokenKind::Greater => self.emit_op(OpCode::Greater),
            TokenKind::GreaterEqual => self.emit_ops(OpCode::Less, OpCode::Not),
            TokenKind::Less => self.emit_op(OpCode::Less),
            TokenKind::LessEqual => self.emit_ops(OpCode::Greater, OpCode::Not),
            TokenKind::Plus => self.emit_op(OpCode::Add),
            TokenKind::Minus => self.emit_op(OpCode::Subtract),
            TokenKind::Star => self.emit_op(OpCode::Multiply),
            TokenKind::Slash => self.emit_op(OpCode::Divide),
            _ => unreachable!(),
        }
    }

    fn and_op(&mut self, _can_assign: bool) {
        let end_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.parse_precedence(Precedence::And);
        self.patch_jump(end_jump);
    }

    fn or_op(&mut self, _can_assign: bool) {
        let else_jump = self.emit_jump(OpCode::JumpIfFalse);
        let end_jump = self.emit_jump(OpCode::Jump);
        self.patch_jump(else_jump);
        self.emit_op(OpCode::Pop);
        self.parse_precedence(Precedence::Or);
        self.patch_jump(end_jump);
    }

    fn call(&mut self, _can_assign: bool) {
        let arg_count = self.argument_list();
        self.emit_op_byte(OpCode::Call, arg_count);
    }

    fn dot(&mut self, can_assign: bool) {
        self.consume(TokenKind::Identifier, "Expect property name after '.'.");
        let name = self.identifier_constant(self.parser.previous.lexeme);
        if can_assign && self.matches(TokenKind::Equal) {
            self.expression();
            self.emit_op_byte(OpCode::SetProperty, name);
        } else if self.matches(TokenKind::LeftParen) {
            // Property call: fuse the load and the call.
            let arg_count = self.argument_list();
            self.emit_op_byte(OpCode::Invoke, name);
            self.emit_byte(arg_count);
        } else {
            self.emit_op_byte(OpCode::GetProperty, name);
        }
    }

    fn variable(&mut self, can_assign: bool) {
        self.named_variable(self.parser.previous.lexeme, can_assign);
    }

    fn this_expr(&mut self, _can_assign: bool) {
        if self.classes.is_empty() {
            self.error("Can't use 'this' outside of a class.");
            return;
        }
        self.variable(false);
    }

    fn super_expr(&mut self, _can_assign: bool) {
        match self.classes.last() {
            None => self.error("Can't use 'super' outside of a class."),
            Some(class) if !class.has_superclass => {
                self.error("Can't use 'super' in a class with no superclass.");
            }
            Some(_) => {}
        }
        self.consume(TokenKind::Dot, "Expect '.' after 'super'.");
        self.consume(TokenKind::Identifier, "Expect superclass method name.");
        let name = self.identifier_constant(self.parser.previous.lexeme);

        self.named_variable("this", false);
        if self.matches(TokenKind::LeftParen) {
            let arg_count = self.argument_list();
            self.named_variable("super", false);
            self.emit_op_byte(OpCode::SuperInvoke, name);
            self.emit_byte(arg_count);
        } else {
            self.named_variable("super", false);
            self.emit_op_byte(OpCode::GetSuper, name);
        }
    }

    fn argument_list(&mut self) -> u8 {
        let mut arg_count: usize = 0;
        if !self.check(TokenKind::RightParen) {
            loop {
                self.expression();
                if arg_count == 255 {
                    self.error("Can't have more than 255 arguments.");
                }
                arg_count += 1;
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expect ')' after arguments.");
        arg_count as u8
    }

    // === Declarations and statements ===

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

        if self.parser.panic_mode {
            self.synchronize();
        }
    }

    fn class_declaration(&mut self) {
        self.consume(TokenKind::Identifier, "Expect class name.");
        let class_name = self.parser.previous.lexeme;
        let name_constant = self.identifier_constant(class_name);
        self.declare_variable();

        self.emit_op_byte(OpCode::Class, name_constant);
        self.define_variable(name_constant);

        self.classes.push(ClassCompiler { has_superclass: false });

        if self.matches(TokenKind::Less) {
            self.consume(TokenKind::Identifier, "Expect superclass name.");
            self.variable(false);
            if class_name == self.parser.previous.lexeme {
                self.error("A class can't inherit from itself.");
            }
            // `super` lives in its own scope so each subclass body sees the
            // right superclass.
            self.begin_scope();
            self.add_local("super");
            self.define_variable(0);

            self.named_variable(class_name, false);
            self.emit_op(OpCode::Inherit);
            self.classes.last_mut().expect("class compiler just pushed").has_superclass = true;
        }

        self.named_variable(class_name, false);
        self.consume(TokenKind::LeftBrace, "Expect '{' before class body.");
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.method();
        }
        self.consume(TokenKind::RightBrace, "Expect '}' after class body.");
        self.emit_op(OpCode::Pop);

        if self.classes.last().map(|c| c.has_superclass).unwrap_or(false) {
            self.end_scope();
        }
        self.classes.pop();
    }

    fn method(&mut self) {
        self.consume(TokenKind::Identifier, "Expect method name.");
        let constant = self.identifier_constant(self.parser.previous.lexeme);
        let fn_type = if self.parser.previous.lexeme == "init" {
            FunctionType::Initializer
        } else {
            FunctionType::Method
        };
        self.function(fn_type);
        self.emit_op_byte(OpCode::Method, constant);
    }

    fn fun_declaration(&mut self) {
        let global = self.parse_variable("Expect function name.");
        // A function may refer to itself; it is initialized before its body.
        self.mark_initialized();
        self.function(FunctionType::Function);
        self.define_variable(global);
    }

    fn function(&mut self, fn_type: FunctionType) {
        self.begin_function(fn_type);
        self.begin_scope();

        self.consume(TokenKind::LeftParen, "Expect '(' after function name.");
        if !self.check(TokenKind::RightParen) {
            loop {
                let function = self.fn_compiler().function;
                let arity = {
                    let f = self.vm.heap.function_mut(function);
                    f.arity += 1;
                    f.arity
                };
                if arity > 255 {
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

        // No end_scope: the frame teardown discards the locals, and the
        // closure emission below needs the upvalue list intact.
        let (function, upvalues) = self.end_function();
        let constant = self.make_constant(Value::object(function));
        self.emit_op_byte(OpCode::Closure, constant);
        for upvalue in upvalues {
            self.emit_byte(upvalue.is_local as u8);
            self.emit_byte(upvalue.index);
        }
    }

    fn var_declaration(&mut self) {
        let global = self.parse_variable("Expect variable name.");
        if self.matches(TokenKind::Equal) {
            self.expression();
        } else {
            self.emit_op(OpCode::Nil);
        }
        self.consume(TokenKind::Semicolon, "Expect ';' after variable declaration.");
        self.define_variable(global);
    }

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
        self.emit_op(OpCode::Print);
    }

    fn expression_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Semicolon, "Expect ';' after expression.");
        self.emit_op(OpCode::Pop);
    }

    fn if_statement(&mut self) {
        self.consume(TokenKind::LeftParen, "Expect '(' after 'if'.");
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after condition.");

        let then_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.statement();
        let else_jump = self.emit_jump(OpCode::Jump);

        self.patch_jump(then_jump);
        self.emit_op(OpCode::Pop);
        if self.matches(TokenKind::Else) {
            self.statement();
        }
        self.patch_jump(else_jump);
    }

    fn while_statement(&mut self) {
        let loop_start = self.chunk_len();
        self.consume(TokenKind::LeftParen, "Expect '(' after 'while'.");
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after condition.");

        let exit_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.statement();
        self.emit_loop(loop_start);

        self.patch_jump(exit_jump);
        self.emit_op(OpCode::Pop);
    }

    fn for_statement(&mut self) {
        // The whole clause opens a scope so a `var` initializer is loop-local.
        self.begin_scope();
        self.consume(TokenKind::LeftParen, "Expect '(' after 'for'.");
        if self.matches(TokenKind::Semicolon) {
            // No initializer.
        } else if self.matches(TokenKind::Var) {
            self.var_declaration();
        } else {
            self.expression_statement();
        }

        let mut loop_start = self.chunk_len();
        let mut exit_jump = None;
        if !self.matches(TokenKind::Semicolon) {
            self.expression();
            self.consume(TokenKind::Semicolon, "Expect ';' after loop condition.");
            exit_jump = Some(self.emit_jump(OpCode::JumpIfFalse));
            self.emit_op(OpCode::Pop);
        }

        if !self.matches(TokenKind::RightParen) {
            // The increment textually precedes the body but runs after it:
            // jump over it into the body, and loop back through it.
            let body_jump = self.emit_jump(OpCode::Jump);
            let increment_start = self.chunk_len();
            self.expression();
            self.emit_op(OpCode::Pop);
            self.consume(TokenKind::RightParen, "Expect ')' after for clauses.");

            self.emit_loop(loop_start);
            loop_start = increment_start;
            self.patch_jump(body_jump);
        }

        self.statement();
        self.emit_loop(loop_start);

        if let Some(exit_jump) = exit_jump {
            self.patch_jump(exit_jump);
            self.emit_op(OpCode::Pop);
        }
        self.end_scope();
    }

    fn return_statement(&mut self) {
        if self.fn_compiler().fn_type == FunctionType::Script {
            self.error("Can't return from top-level code.");
        }
        if self.matches(TokenKind::Semicolon) {
            self.emit_return();
        } else {
            if self.fn_compiler().fn_type == FunctionType::Initializer {
                self.error("Can't return a value from an initializer.");
            }
            self.expression();
            self.consume(TokenKind::Semicolon, "Expect ';' after return value.");
            self.emit_op(OpCode::Return);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::VmOptions;

    fn try_compile(source: &str) -> Result<(), Vec<String>> {
        let mut vm = Vm::new(VmOptions::default());
        match compile(source, &mut vm) {
            Ok(_) => Ok(()),
            Err(report) => Err(report.diagnostics),
        }
    }

    fn first_error(source: &str) -> String {
        try_compile(source).expect_err("expected a compile error")[0].clone()
    }

    #[test]
    fn compiles_well_formed_programs() {
        assert!(try_compile("print 1 + 2 * 3;").is_ok());
        assert!(try_compile("var a = 1; { var b = a; print b; }").is_ok());
        assert!(try_compile("fun f(a, b) { return a + b; } print f(1, 2);").is_ok());
        assert!(try_compile(
            "class A { init(n) { this.n = n; } get() { return this.n; } } print A(1).get();"
        )
        .is_ok());
        assert!(try_compile("for (var i = 0; i < 3; i = i + 1) print i;").is_ok());
    }

    #[test]
    fn missing_expression() {
        assert_eq!(first_error("print ;"), "[line 1] Error at ';': Expect expression.");
    }

    #[test]
    fn missing_semicolon_reports_at_end() {
        assert_eq!(first_error("print 1"), "[line 1] Error at end: Expect ';' after value.");
    }

    #[test]
    fn duplicate_local_declaration() {
        assert_eq!(
            first_error("{ var a = 1; var a = 2; }"),
            "[line 1] Error at 'a': Already a variable with this name in this scope."
        );
    }

    #[test]
    fn local_read_in_own_initializer() {
        assert_eq!(
            first_error("{ var a = 1; { var a = a; } }"),
            "[line 1] Error at 'a': Can't read local variable in its own initializer."
        );
    }

    #[test]
    fn invalid_assignment_target() {
        assert_eq!(
            first_error("1 + 2 = 3;"),
            "[line 1] Error at '=': Invalid assignment target."
        );
    }

    #[test]
    fn return_at_top_level() {
        assert_eq!(
            first_error("return 1;"),
            "[line 1] Error at 'return': Can't return from top-level code."
        );
    }

    #[test]
    fn return_value_from_initializer() {
        assert_eq!(
            first_error("class A { init() { return 1; } }"),
            "[line 1] Error at 'return': Can't return a value from an initializer."
        );
    }

    #[test]
    fn this_outside_class() {
        assert_eq!(
            first_error("print this;"),
            "[line 1] Error at 'this': Can't use 'this' outside of a class."
        );
    }

    #[test]
    fn super_without_superclass() {
        assert_eq!(
            first_error("class A { f() { super.f(); } }"),
            "[line 1] Error at 'super': Can't use 'super' in a class with no superclass."
        );
    }

    #[test]
    fn super_outside_class() {
        assert_eq!(
            first_error("fun f() { super.g(); }"),
            "[line 1] Error at 'super': Can't use 'super' outside of a class."
        );
    }

    #[test]
    fn class_inheriting_from_itself() {
        assert_eq!(
            first_error("class A < A {}"),
            "[line 1] Error at 'A': A class can't inherit from itself."
        );
    }

    #[test]
    fn too_many_constants_in_one_chunk() {
        let mut source = String::new();
        for i in 0..300 {
            source.push_str(&format!("print {}.5;", i));
        }
        let errors = try_compile(&source).expect_err("expected a compile error");
        assert!(errors[0].ends_with("Too many constants in one chunk."));
    }

    #[test]
    fn loop_body_too_large() {
        // Local-only statements keep the constant pool small, so the only
        // limit hit is the 16-bit loop offset.
        let mut source = String::from("{ var x = 0; while (true) { ");
        for _ in 0..9000 {
            source.push_str("x = x + x; ");
        }
        source.push_str("} }");
        let errors = try_compile(&source).expect_err("expected a compile error");
        assert!(errors[0].ends_with("Loop body too large."));
    }

    #[test]
    fn error_recovery_reports_later_statements() {
        let errors =
            try_compile("print ;\nprint ;").expect_err("expected compile errors");
        assert_eq!(errors.len(), 2);
        assert!(errors[1].starts_with("[line 2]"));
    }

    #[test]
    fn line_numbers_in_diagnostics() {
        assert_eq!(
            first_error("var a = 1;\nvar = 2;"),
            "[line 2] Error at '=': Expect variable name."
        );
    }
}
