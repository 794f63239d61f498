// File: src/bytecode.rs
//
// Bytecode instruction definitions and the Chunk container for the Quill VM.
// Instructions are encoded as raw bytes: one opcode byte followed by zero or
// more operand bytes. Jump operands are 16-bit unsigned big-endian offsets.

use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::value::Value;

/// Bytecode opcodes for the Quill VM.
///
/// Stack effects are noted per instruction. `u8` operands follow the opcode
/// byte; `u16` operands are two bytes, high byte first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum OpCode {
    // === Constants and literals ===
    /// Push constants[u8] onto the stack.
    Constant,
    /// Push nil.
    Nil,
    /// Push true.
    True,
    /// Push false.
    False,

    /// Discard the top of the stack.
    Pop,

    // === Variables ===
    /// Push the local in slot u8 (relative to the frame base).
    GetLocal,
    /// Store the top of the stack into local slot u8 (value stays on stack).
    SetLocal,
    /// Push the global named by constants[u8]; error if undefined.
    GetGlobal,
    /// Define (or overwrite) the global named by constants[u8], then pop.
    DefineGlobal,
    /// Store into an existing global named by constants[u8]; error if undefined.
    SetGlobal,
    /// Push the value of upvalue u8 of the running closure.
    GetUpvalue,
    /// Store the top of the stack into upvalue u8 (value stays on stack).
    SetUpvalue,

    // === Properties ===
    /// Replace the instance on top of the stack with its field or a bound
    /// method named constants[u8].
    GetProperty,
    /// Set a field named constants[u8]; leaves the assigned value on the stack.
    SetProperty,
    /// Pop a superclass, bind its method named constants[u8] to `this`.
    GetSuper,

    // === Operators ===
    /// Pop two values, push their equality (defined for all types).
    Equal,
    /// Pop two numbers, push a > b.
    Greater,
    /// Pop two numbers, push a < b.
    Less,
    /// Pop two numbers or two strings, push sum or concatenation.
    Add,
    Subtract,
    Multiply,
    Divide,
    /// Pop one value, push its logical negation (nil and false are falsey).
    Not,
    /// Pop a number, push its arithmetic negation.
    Negate,

    /// Pop a value and print it followed by a newline.
    Print,

    // === Control flow ===
    /// Unconditionally skip forward u16 bytes.
    Jump,
    /// Skip forward u16 bytes if the top of the stack is falsey (no pop).
    JumpIfFalse,
    /// Skip backward u16 bytes.
    Loop,

    // === Calls and closures ===
    /// Call the value below u8 arguments on the stack.
    Call,
    /// Fused property access + call: method name constants[u8], u8 arguments.
    Invoke,
    /// Fused `super.name(args)`: method name constants[u8], u8 arguments.
    SuperInvoke,
    /// Wrap constants[u8] (a function) in a closure. Followed by one
    /// `(is_local, index)` byte pair per upvalue the function declares.
    Closure,
    /// Hoist the captured local at the top of the stack into the heap, then pop.
    CloseUpvalue,
    /// Return the top of the stack from the current frame.
    Return,

    // === Classes ===
    /// Push a new class named by constants[u8].
    Class,
    /// Copy every method of the superclass at peek(1) into the class at
    /// peek(0), then pop the subclass.
    Inherit,
    /// Add the closure at peek(0) as a method named constants[u8] on the class
    /// at peek(1), then pop the closure.
    Method,
}

/// A compiled unit of bytecode: the output of compiling one function.
///
/// `lines` runs parallel to `code`, one source line per byte, for error
/// reporting and disassembly.
#[derive(Debug, Default)]
pub struct Chunk {
    pub code: Vec<u8>,
    pub lines: Vec<u32>,
    pub constants: Vec<Value>,
}

impl Chunk {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one byte, recording the source line it was compiled from.
    pub fn write(&mut self, byte: u8, line: u32) {
        self.code.push(byte);
        self.lines.push(line);
    }

    /// Add a constant to the pool and return its index. The caller is
    /// responsible for the 256-constant limit.
    pub fn add_constant(&mut self, value: Value) -> usize {
        self.constants.push(value);
        self.constants.len() - 1
    }
}
