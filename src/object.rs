// File: src/object.rs
//
// Heap object variants for the Quill runtime. Objects live in the Heap arena
// (see memory.rs) and refer to each other through ObjHandle indices; the
// collector, not Rust ownership, decides liveness.

use std::fmt;

use crate::bytecode::Chunk;
use crate::table::Table;
use crate::value::Value;

/// Index of an object in the heap arena. Copyable and non-owning; handle
/// equality is object identity.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjHandle(u32);

impl ObjHandle {
    #[inline]
    pub fn new(index: u32) -> Self {
        ObjHandle(index)
    }

    #[inline]
    pub fn index(self) -> u32 {
        self.0
    }
}

impl fmt::Debug for ObjHandle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Host function signature: (argument count, arguments) -> result.
pub type NativeFn = fn(usize, &[Value]) -> Value;

/// An interned immutable string with its precomputed FNV-1a hash.
pub struct ObjString {
    pub chars: Box<str>,
    pub hash: u32,
}

/// A compiled function: its bytecode plus call metadata. The name is an
/// interned string, absent for the top-level script.
pub struct ObjFunction {
    pub arity: usize,
    pub upvalue_count: usize,
    pub chunk: Chunk,
    pub name: Option<ObjHandle>,
}

impl ObjFunction {
    pub fn new(name: Option<ObjHandle>) -> Self {
        Self { arity: 0, upvalue_count: 0, chunk: Chunk::new(), name }
    }
}

pub struct ObjNative {
    pub function: NativeFn,
}

/// A function plus the upvalues it captured. Every callable the VM runs is a
/// closure, even when the function captures nothing.
pub struct ObjClosure {
    pub function: ObjHandle,
    pub upvalues: Vec<ObjHandle>,
}

/// Where a captured variable currently lives. The transition is one-way:
/// open (a stack slot) until close_upvalues hoists it, closed afterwards.
#[derive(Clone, Copy)]
pub enum UpvalueLocation {
    Open(usize),
    Closed(Value),
}

pub struct ObjUpvalue {
    pub location: UpvalueLocation,
}

pub struct ObjClass {
    pub name: ObjHandle,
    pub methods: Table,
}

pub struct ObjInstance {
    pub class: ObjHandle,
    pub fields: Table,
}

/// A method loaded as a first-class value: receiver + closure.
pub struct ObjBoundMethod {
    pub receiver: Value,
    pub method: ObjHandle,
}

pub enum Obj {
    String(ObjString),
    Function(ObjFunction),
    Native(ObjNative),
    Closure(ObjClosure),
    Upvalue(ObjUpvalue),
    Class(ObjClass),
    Instance(ObjInstance),
    BoundMethod(ObjBoundMethod),
}

impl Obj {
    /// Approximate heap footprint, used for the collector's byte accounting.
    pub fn size_estimate(&self) -> usize {
        let owned = match self {
            Obj::String(s) => s.chars.len(),
            Obj::Function(f) => {
                f.chunk.code.len()
                    + f.chunk.lines.len() * std::mem::size_of::<u32>()
                    + f.chunk.constants.len() * std::mem::size_of::<Value>()
            }
            Obj::Native(_) => 0,
            Obj::Closure(c) => c.upvalues.len() * std::mem::size_of::<ObjHandle>(),
            Obj::Upvalue(_) => 0,
            Obj::Class(c) => c.methods.byte_size(),
            Obj::Instance(i) => i.fields.byte_size(),
            Obj::BoundMethod(_) => 0,
        };
        std::mem::size_of::<Obj>() + owned
    }
}

/// FNV-1a, 32 bits. Every string hashes once, at interning time.
pub fn hash_string(s: &str) -> u32 {
    let mut hash: u32 = 2166136261;
    for byte in s.bytes() {
        hash ^= byte as u32;
        hash = hash.wrapping_mul(16777619);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fnv1a_known_vectors() {
        assert_eq!(hash_string(""), 2166136261);
        assert_eq!(hash_string("a"), 0xe40c292c);
        assert_eq!(hash_string("foobar"), 0xbf9cf968);
    }

    #[test]
    fn equal_strings_hash_equal() {
        assert_eq!(hash_string("init"), hash_string("init"));
        assert_ne!(hash_string("init"), hash_string("tini"));
    }
}
