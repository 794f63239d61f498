// File: src/vm.rs
//
// The Quill virtual machine: a stack interpreter over byte-encoded chunks,
// with call frames, upvalues, string interning, and the garbage collector's
// root set. One Vm is one interpreter instance; globals and interned strings
// persist across interpret calls (the REPL relies on this).
//
// Collection can run inside any Vm::alloc call, so every allocation site must
// keep its temporaries reachable: values are parked on the VM stack, and the
// compiler registers in-progress functions on the heap's compiler-root stack.

use once_cell::sync::Lazy;
use std::time::Instant;

use crate::bytecode::OpCode;
use crate::compiler::compile;
use crate::debug;
use crate::errors::{InterpretError, RuntimeErrorReport, TraceFrame};
use crate::memory::{Heap, GC_HEAP_GROW_FACTOR};
use crate::object::{
    hash_string, NativeFn, Obj, ObjBoundMethod, ObjClass, ObjClosure, ObjHandle, ObjInstance,
    ObjNative, ObjString, ObjUpvalue, UpvalueLocation,
};
use crate::table::Table;
use crate::value::Value;

pub const FRAMES_MAX: usize = 64;
pub const STACK_MAX: usize = FRAMES_MAX * 256;

/// Debug and GC knobs, set once at startup from flags or environment.
#[derive(Debug, Clone, Default)]
pub struct VmOptions {
    /// Print each instruction and the stack before executing it.
    pub trace: bool,
    /// Disassemble every function as it finishes compiling.
    pub disassemble: bool,
    /// Collect on every allocation instead of on the byte threshold.
    pub gc_stress: bool,
    /// Log collection cycles and their byte statistics.
    pub gc_log: bool,
}

/// One active function invocation: the running closure, its instruction
/// offset, and where its locals start on the value stack.
struct CallFrame {
    closure: ObjHandle,
    ip: usize,
    base: usize,
}

enum OutputSink {
    Stdout,
    Buffer(String),
}

pub struct Vm {
    pub heap: Heap,
    strings: Table,
    globals: Table,
    stack: Vec<Value>,
    frames: Vec<CallFrame>,
    // Open upvalues sorted by ascending stack slot, so the top of the stack
    // is at the back and both capture and close are linear in the affected
    // entries.
    open_upvalues: Vec<ObjHandle>,
    init_string: ObjHandle,
    pub options: VmOptions,
    output: OutputSink,
}

static PROCESS_START: Lazy<Instant> = Lazy::new(Instant::now);

/// The one predefined native: seconds since process start.
fn clock_native(_arg_count: usize, _args: &[Value]) -> Value {
    Value::number(PROCESS_START.elapsed().as_secs_f64())
}

impl Vm {
    pub fn new(options: VmOptions) -> Self {
        let mut heap = Heap::new();
        let mut strings = Table::new();

        // The `init` sentinel exists before anything else so initializer
        // lookup never allocates.
        let init_hash = hash_string("init");
        let init_string =
            heap.allocate(Obj::String(ObjString { chars: "init".into(), hash: init_hash }));
        strings.set(init_string, init_hash, Value::NIL);

        let mut vm = Vm {
            heap,
            strings,
            globals: Table::new(),
            stack: Vec::with_capacity(STACK_MAX),
            frames: Vec::with_capacity(FRAMES_MAX),
            open_upvalues: Vec::new(),
            init_string,
            options,
            output: OutputSink::Stdout,
        };
        vm.define_native("clock", clock_native);
        vm
    }

    /// Route `print` output into an internal buffer instead of stdout.
    pub fn capture_output(&mut self) {
        self.output = OutputSink::Buffer(String::new());
    }

    /// Drain the captured output buffer.
    pub fn take_output(&mut self) -> String {
        match &mut self.output {
            OutputSink::Buffer(buffer) => std::mem::take(buffer),
            OutputSink::Stdout => String::new(),
        }
    }

    /// True when no script state remains: empty value stack, no frames, no
    /// open upvalues. Holds after every interpret call, success or error.
    pub fn is_idle(&self) -> bool {
        self.stack.is_empty() && self.frames.is_empty() && self.open_upvalues.is_empty()
    }

    /// Compile and run one source buffer to completion.
    pub fn interpret(&mut self, source: &str) -> Result<(), InterpretError> {
        let function = compile(source, self).map_err(InterpretError::Compile)?;

        // The function is no longer a compiler root; park it on the stack
        // while the closure wrapping it is allocated.
        self.push(Value::object(function));
        let closure = self.alloc(Obj::Closure(ObjClosure { function, upvalues: Vec::new() }));
        self.pop();
        self.push(Value::object(closure));
        self.call(closure, 0).map_err(InterpretError::Runtime)?;

        self.run().map_err(InterpretError::Runtime)
    }

    // === Allocation and interning ===

    /// Create a heap object, collecting first if the threshold (or stress
    /// mode) says so. Every live value must be reachable from the roots at
    /// this point.
    pub fn alloc(&mut self, obj: Obj) -> ObjHandle {
        if self.options.gc_stress || self.heap.should_collect() {
            self.collect_garbage();
        }
        self.heap.allocate(obj)
    }

    /// Intern a copy of `chars`: equal contents always yield the same handle.
    pub fn intern(&mut self, chars: &str) -> ObjHandle {
        let hash = hash_string(chars);
        if let Some(existing) = self.strings.find_string(&self.heap, chars, hash) {
            return existing;
        }
        let handle = self.alloc(Obj::String(ObjString { chars: chars.into(), hash }));
        self.strings.set(handle, hash, Value::NIL);
        handle
    }

    /// Intern an owned buffer, dropping it if an equal string already exists.
    fn take_string(&mut self, chars: String) -> ObjHandle {
        let hash = hash_string(&chars);
        if let Some(existing) = self.strings.find_string(&self.heap, &chars, hash) {
            return existing;
        }
        let handle =
            self.alloc(Obj::String(ObjString { chars: chars.into_boxed_str(), hash }));
        self.strings.set(handle, hash, Value::NIL);
        handle
    }

    fn define_native(&mut self, name: &str, function: NativeFn) {
        let name = self.intern(name);
        // The intern table is weak; park name and native on the stack until
        // the globals entry holds them.
        self.push(Value::object(name));
        let native = self.alloc(Obj::Native(ObjNative { function }));
        self.push(Value::object(native));
        let hash = self.heap.string(name).hash;
        self.globals.set(name, hash, Value::object(native));
        self.pop();
        self.pop();
    }

    // === Garbage collection ===

    fn collect_garbage(&mut self) {
        let before = self.heap.bytes_allocated();
        if self.options.gc_log {
            eprintln!("-- gc begin");
        }

        // Mark roots: the value stack, every frame's closure, the open
        // upvalues, globals, in-progress compiler functions, and `init`.
        for i in 0..self.stack.len() {
            self.heap.mark_value(self.stack[i]);
        }
        for i in 0..self.frames.len() {
            self.heap.mark_object(self.frames[i].closure);
        }
        for i in 0..self.open_upvalues.len() {
            self.heap.mark_object(self.open_upvalues[i]);
        }
        self.heap.mark_table(&self.globals);
        self.heap.mark_compiler_roots();
        self.heap.mark_object(self.init_string);

        self.heap.trace_references();

        // Interned strings are weak references: drop the ones the sweep is
        // about to free so the table never dangles.
        self.strings.remove_white(&self.heap);

        let freed = self.heap.sweep();
        let after = self.heap.bytes_allocated();
        self.heap.set_next_gc(after * GC_HEAP_GROW_FACTOR);

        if self.options.gc_log {
            eprintln!("-- gc end");
            eprintln!(
                "   collected {} bytes ({} objects), {} remain, next collection at {}",
                before.saturating_sub(after),
                freed,
                after,
                after * GC_HEAP_GROW_FACTOR
            );
        }
    }

    // === Stack primitives ===

    #[inline]
    fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    #[inline]
    fn pop(&mut self) -> Value {
        self.stack.pop().expect("value stack underflow")
    }

    #[inline]
    fn peek(&self, distance: usize) -> Value {
        self.stack[self.stack.len() - 1 - distance]
    }

    fn reset_stack(&mut self) {
        self.stack.clear();
        self.frames.clear();
        self.open_upvalues.clear();
    }

    /// Build the error report with a stack trace (innermost frame first),
    /// then unwind everything.
    fn runtime_error(&mut self, message: String) -> RuntimeErrorReport {
        let mut trace = Vec::new();
        for frame in self.frames.iter().rev() {
            let function = self.heap.closure(frame.closure).function;
            let function = self.heap.function(function);
            let line =
                function.chunk.lines.get(frame.ip.saturating_sub(1)).copied().unwrap_or(0);
            let name = function.name.map(|n| self.heap.string(n).chars.to_string());
            trace.push(TraceFrame { line, function: name });
        }
        self.reset_stack();
        RuntimeErrorReport { message, trace }
    }

    // === Instruction reads ===

    #[inline]
    fn current_function(&self) -> ObjHandle {
        let frame = self.frames.last().expect("no call frame");
        self.heap.closure(frame.closure).function
    }

    #[inline]
    fn read_byte(&mut self) -> u8 {
        let function = self.current_function();
        let ip = self.frames.last().expect("no call frame").ip;
        let byte = self.heap.function(function).chunk.code[ip];
        self.frames.last_mut().expect("no call frame").ip += 1;
        byte
    }

    #[inline]
    fn read_u16(&mut self) -> u16 {
        let high = self.read_byte() as u16;
        let low = self.read_byte() as u16;
        (high << 8) | low
    }

    #[inline]
    fn read_constant(&mut self) -> Value {
        let index = self.read_byte() as usize;
        let function = self.current_function();
        self.heap.function(function).chunk.constants[index]
    }

    /// Read a constant that the compiler guarantees is an interned string.
    #[inline]
    fn read_string(&mut self) -> ObjHandle {
        self.read_constant().as_obj()
    }

    fn is_string(&self, value: Value) -> bool {
        value.is_obj() && matches!(self.heap.get(value.as_obj()), Obj::String(_))
    }

    fn print_line(&mut self, text: &str) {
        match &mut self.output {
            OutputSink::Stdout => println!("{}", text),
            OutputSink::Buffer(buffer) => {
                buffer.push_str(text);
                buffer.push('\n');
            }
        }
    }

    // === The interpreter loop ===

    fn run(&mut self) -> Result<(), RuntimeErrorReport> {
        macro_rules! binary_number_op {
            ($vm:expr, $wrap:expr, $op:tt) => {{
                if !$vm.peek(0).is_number() || !$vm.peek(1).is_number() {
                    return Err($vm.runtime_error("Operands must be numbers.".to_string()));
                }
                let b = $vm.pop().as_number();
                let a = $vm.pop().as_number();
                $vm.push($wrap(a $op b));
            }};
        }

        loop {
            if self.options.trace {
                self.trace_instruction();
            }

            let byte = self.read_byte();
            let op = match OpCode::try_from(byte) {
                Ok(op) => op,
                Err(_) => {
                    return Err(self.runtime_error(format!("Unknown opcode {}.", byte)));
                }
            };

            match op {
                OpCode::Constant => {
                    let value = self.read_constant();
                    self.push(value);
                }
                OpCode::Nil => self.push(Value::NIL),
                OpCode::True => self.push(Value::TRUE),
                OpCode::False => self.push(Value::FALSE),
                OpCode::Pop => {
                    self.pop();
                }

                OpCode::GetLocal => {
                    let slot = self.read_byte() as usize;
                    let base = self.frames.last().expect("no call frame").base;
                    self.push(self.stack[base + slot]);
                }
                OpCode::SetLocal => {
                    let slot = self.read_byte() as usize;
                    let base = self.frames.last().expect("no call frame").base;
                    self.stack[base + slot] = self.peek(0);
                }
                OpCode::GetGlobal => {
                    let name = self.read_string();
                    let hash = self.heap.string(name).hash;
                    match self.globals.get(name, hash) {
                        Some(value) => self.push(value),
                        None => {
                            let message = format!(
                                "Undefined variable '{}'.",
                                self.heap.string(name).chars
                            );
                            return Err(self.runtime_error(message));
                        }
                    }
                }
                OpCode::DefineGlobal => {
                    let name = self.read_string();
                    let hash = self.heap.string(name).hash;
                    let value = self.peek(0);
                    self.globals.set(name, hash, value);
                    self.pop();
                }
                OpCode::SetGlobal => {
                    let name = self.read_string();
                    let hash = self.heap.string(name).hash;
                    let value = self.peek(0);
                    // Assignment never creates a global: undo the speculative
                    // insert before reporting.
                    if self.globals.set(name, hash, value) {
                        self.globals.delete(name, hash);
                        let message =
                            format!("Undefined variable '{}'.", self.heap.string(name).chars);
                        return Err(self.runtime_error(message));
                    }
                }
                OpCode::GetUpvalue => {
                    let slot = self.read_byte() as usize;
                    let closure = self.frames.last().expect("no call frame").closure;
                    let upvalue = self.heap.closure(closure).upvalues[slot];
                    let value = match self.heap.upvalue(upvalue).location {
                        UpvalueLocation::Open(stack_slot) => self.stack[stack_slot],
                        UpvalueLocation::Closed(value) => value,
                    };
                    self.push(value);
                }
                OpCode::SetUpvalue => {
                    let slot = self.read_byte() as usize;
                    let closure = self.frames.last().expect("no call frame").closure;
                    let upvalue = self.heap.closure(closure).upvalues[slot];
                    let value = self.peek(0);
                    match self.heap.upvalue(upvalue).location {
                        UpvalueLocation::Open(stack_slot) => self.stack[stack_slot] = value,
                        UpvalueLocation::Closed(_) => {
                            self.heap.upvalue_mut(upvalue).location =
                                UpvalueLocation::Closed(value);
                        }
                    }
                }

                OpCode::GetProperty => {
                    let name = self.read_string();
                    let target = self.peek(0);
                    if !self.is_instance(target) {
                        return Err(self
                            .runtime_error("Only instances have properties.".to_string()));
                    }
                    let instance = target.as_obj();
                    let hash = self.heap.string(name).hash;
                    // Fields shadow methods.
                    if let Some(value) = self.heap.instance(instance).fields.get(name, hash) {
                        self.pop();
                        self.push(value);
                    } else {
                        let class = self.heap.instance(instance).class;
                        self.bind_method(class, name)?;
                    }
                }
                OpCode::SetProperty => {
                    let name = self.read_string();
                    let target = self.peek(1);
                    if !self.is_instance(target) {
                        return Err(
                            self.runtime_error("Only instances have fields.".to_string())
                        );
                    }
                    let instance = target.as_obj();
                    let hash = self.heap.string(name).hash;
                    let value = self.peek(0);
                    self.heap.instance_mut(instance).fields.set(name, hash, value);
                    // The assigned value, not the instance, stays on the
                    // stack: assignment is an expression.
                    let value = self.pop();
                    self.pop();
                    self.push(value);
                }
                OpCode::GetSuper => {
                    let name = self.read_string();
                    let superclass = self.pop().as_obj();
                    self.bind_method(superclass, name)?;
                }

                OpCode::Equal => {
                    let b = self.pop();
                    let a = self.pop();
                    self.push(Value::boolean(a == b));
                }
                OpCode::Greater => binary_number_op!(self, Value::boolean, >),
                OpCode::Less => binary_number_op!(self, Value::boolean, <),
                OpCode::Add => {
                    if self.is_string(self.peek(0)) && self.is_string(self.peek(1)) {
                        self.concatenate();
                    } else if self.peek(0).is_number() && self.peek(1).is_number() {
                        let b = self.pop().as_number();
                        let a = self.pop().as_number();
                        self.push(Value::number(a + b));
                    } else {
                        return Err(self.runtime_error(
                            "Operands must be two numbers or two strings.".to_string(),
                        ));
                    }
                }
                OpCode::Subtract => binary_number_op!(self, Value::number, -),
                OpCode::Multiply => binary_number_op!(self, Value::number, *),
                OpCode::Divide => binary_number_op!(self, Value::number, /),
                OpCode::Not => {
                    let value = self.pop();
                    self.push(Value::boolean(value.is_falsey()));
                }
                OpCode::Negate => {
                    if !self.peek(0).is_number() {
                        return Err(
                            self.runtime_error("Operand must be a number.".to_string())
                        );
                    }
                    let n = self.pop().as_number();
                    self.push(Value::number(-n));
                }

                OpCode::Print => {
                    let value = self.pop();
                    let text = self.heap.format_value(value);
                    self.print_line(&text);
                }

                OpCode::Jump => {
                    let offset = self.read_u16() as usize;
                    self.frames.last_mut().expect("no call frame").ip += offset;
                }
                OpCode::JumpIfFalse => {
                    let offset = self.read_u16() as usize;
                    // The predicate stays on the stack; the compiler emits the
                    // explicit Pop.
                    if self.peek(0).is_falsey() {
                        self.frames.last_mut().expect("no call frame").ip += offset;
                    }
                }
                OpCode::Loop => {
                    let offset = self.read_u16() as usize;
                    self.frames.last_mut().expect("no call frame").ip -= offset;
                }

                OpCode::Call => {
                    let arg_count = self.read_byte() as usize;
                    self.call_value(self.peek(arg_count), arg_count)?;
                }
                OpCode::Invoke => {
                    let name = self.read_string();
                    let arg_count = self.read_byte() as usize;
                    self.invoke(name, arg_count)?;
                }
                OpCode::SuperInvoke => {
                    let name = self.read_string();
                    let arg_count = self.read_byte() as usize;
                    let superclass = self.pop().as_obj();
                    self.invoke_from_class(superclass, name, arg_count)?;
                }

                OpCode::Closure => {
                    let function = self.read_constant().as_obj();
                    let upvalue_count = self.heap.function(function).upvalue_count;
                    let closure = self.alloc(Obj::Closure(ObjClosure {
                        function,
                        upvalues: Vec::with_capacity(upvalue_count),
                    }));
                    // On the stack immediately: capture_upvalue below can
                    // allocate, and the closure must survive that.
                    self.push(Value::object(closure));
                    for _ in 0..upvalue_count {
                        let is_local = self.read_byte() != 0;
                        let index = self.read_byte() as usize;
                        let upvalue = if is_local {
                            let base = self.frames.last().expect("no call frame").base;
                            self.capture_upvalue(base + index)
                        } else {
                            let enclosing =
                                self.frames.last().expect("no call frame").closure;
                            self.heap.closure(enclosing).upvalues[index]
                        };
                        self.heap.closure_mut(closure).upvalues.push(upvalue);
                    }
                }
                OpCode::CloseUpvalue => {
                    self.close_upvalues(self.stack.len() - 1);
                    self.pop();
                }
                OpCode::Return => {
                    let result = self.pop();
                    let base = self.frames.last().expect("no call frame").base;
                    self.close_upvalues(base);
                    self.frames.pop();
                    if self.frames.is_empty() {
                        // Pop the script closure; the stack is now empty.
                        self.pop();
                        return Ok(());
                    }
                    self.stack.truncate(base);
                    self.push(result);
                }

                OpCode::Class => {
                    let name = self.read_string();
                    let class =
                        self.alloc(Obj::Class(ObjClass { name, methods: Table::new() }));
                    self.push(Value::object(class));
                }
                OpCode::Inherit => {
                    let superclass = self.peek(1);
                    if !superclass.is_obj()
                        || !matches!(self.heap.get(superclass.as_obj()), Obj::Class(_))
                    {
                        return Err(
                            self.runtime_error("Superclass must be a class.".to_string())
                        );
                    }
                    let superclass = superclass.as_obj();
                    let subclass = self.peek(0).as_obj();
                    let methods: Vec<_> =
                        self.heap.class(superclass).methods.iter().collect();
                    let subclass_methods = &mut self.heap.class_mut(subclass).methods;
                    for (key, hash, value) in methods {
                        subclass_methods.set(key, hash, value);
                    }
                    self.pop(); // subclass; the superclass stays as `super`
                }
                OpCode::Method => {
                    let name = self.read_string();
                    let method = self.peek(0);
                    let class = self.peek(1).as_obj();
                    let hash = self.heap.string(name).hash;
                    self.heap.class_mut(class).methods.set(name, hash, method);
                    self.pop();
                }
            }
        }
    }

    // === Calls and method dispatch ===

    fn call_value(
        &mut self,
        callee: Value,
        arg_count: usize,
    ) -> Result<(), RuntimeErrorReport> {
        enum Callee {
            Closure,
            Bound(Value, ObjHandle),
            Class,
            Native(NativeFn),
            NotCallable,
        }

        let kind = if callee.is_obj() {
            match self.heap.get(callee.as_obj()) {
                Obj::Closure(_) => Callee::Closure,
                Obj::BoundMethod(bound) => Callee::Bound(bound.receiver, bound.method),
                Obj::Class(_) => Callee::Class,
                Obj::Native(native) => Callee::Native(native.function),
                _ => Callee::NotCallable,
            }
        } else {
            Callee::NotCallable
        };

        match kind {
            Callee::Closure => self.call(callee.as_obj(), arg_count),
            Callee::Bound(receiver, method) => {
                // The receiver takes the callee's slot, becoming `this`.
                let top = self.stack.len();
                self.stack[top - arg_count - 1] = receiver;
                self.call(method, arg_count)
            }
            Callee::Class => {
                let class = callee.as_obj();
                let instance =
                    self.alloc(Obj::Instance(ObjInstance { class, fields: Table::new() }));
                let top = self.stack.len();
                self.stack[top - arg_count - 1] = Value::object(instance);

                let init = self.init_string;
                let init_hash = self.heap.string(init).hash;
                match self.heap.class(class).methods.get(init, init_hash) {
                    Some(initializer) => self.call(initializer.as_obj(), arg_count),
                    None if arg_count != 0 => Err(self.runtime_error(format!(
                        "Expected 0 arguments but got {}.",
                        arg_count
                    ))),
                    None => Ok(()),
                }
            }
            Callee::Native(function) => {
                let args_start = self.stack.len() - arg_count;
                let result = function(arg_count, &self.stack[args_start..]);
                self.stack.truncate(args_start - 1);
                self.push(result);
                Ok(())
            }
            Callee::NotCallable => {
                Err(self.runtime_error("Can only call functions and classes.".to_string()))
            }
        }
    }

    fn call(&mut self, closure: ObjHandle, arg_count: usize) -> Result<(), RuntimeErrorReport> {
        let function = self.heap.closure(closure).function;
        let arity = self.heap.function(function).arity;
        if arg_count != arity {
            return Err(self.runtime_error(format!(
                "Expected {} arguments but got {}.",
                arity, arg_count
            )));
        }
        if self.frames.len() == FRAMES_MAX {
            return Err(self.runtime_error("Stack overflow.".to_string()));
        }
        self.frames.push(CallFrame {
            closure,
            ip: 0,
            base: self.stack.len() - arg_count - 1,
        });
        Ok(())
    }

    fn invoke(&mut self, name: ObjHandle, arg_count: usize) -> Result<(), RuntimeErrorReport> {
        let receiver = self.peek(arg_count);
        if !self.is_instance(receiver) {
            return Err(self.runtime_error("Only instances have methods.".to_string()));
        }
        let instance = receiver.as_obj();
        let hash = self.heap.string(name).hash;

        // A field shadowing the method name turns this back into a plain call.
        if let Some(field) = self.heap.instance(instance).fields.get(name, hash) {
            let top = self.stack.len();
            self.stack[top - arg_count - 1] = field;
            return self.call_value(field, arg_count);
        }

        let class = self.heap.instance(instance).class;
        self.invoke_from_class(class, name, arg_count)
    }

    fn invoke_from_class(
        &mut self,
        class: ObjHandle,
        name: ObjHandle,
        arg_count: usize,
    ) -> Result<(), RuntimeErrorReport> {
        let hash = self.heap.string(name).hash;
        match self.heap.class(class).methods.get(name, hash) {
            Some(method) => self.call(method.as_obj(), arg_count),
            None => {
                let message =
                    format!("Undefined property '{}'.", self.heap.string(name).chars);
                Err(self.runtime_error(message))
            }
        }
    }

    fn bind_method(
        &mut self,
        class: ObjHandle,
        name: ObjHandle,
    ) -> Result<(), RuntimeErrorReport> {
        let hash = self.heap.string(name).hash;
        let method = match self.heap.class(class).methods.get(name, hash) {
            Some(method) => method.as_obj(),
            None => {
                let message =
                    format!("Undefined property '{}'.", self.heap.string(name).chars);
                return Err(self.runtime_error(message));
            }
        };
        // The receiver is still on the stack, which also roots it across the
        // allocation.
        let receiver = self.peek(0);
        let bound = self.alloc(Obj::BoundMethod(ObjBoundMethod { receiver, method }));
        self.pop();
        self.push(Value::object(bound));
        Ok(())
    }

    fn is_instance(&self, value: Value) -> bool {
        value.is_obj() && matches!(self.heap.get(value.as_obj()), Obj::Instance(_))
    }

    /// Concatenate the two strings on top of the stack. The operands stay on
    /// the stack until the result exists, keeping them rooted across the
    /// allocation.
    fn concatenate(&mut self) {
        let b = self.peek(0).as_obj();
        let a = self.peek(1).as_obj();
        let mut chars = String::with_capacity(
            self.heap.string(a).chars.len() + self.heap.string(b).chars.len(),
        );
        chars.push_str(&self.heap.string(a).chars);
        chars.push_str(&self.heap.string(b).chars);
        let result = self.take_string(chars);
        self.pop();
        self.pop();
        self.push(Value::object(result));
    }

    // === Upvalues ===

    /// Find or create the open upvalue for a stack slot. The list stays
    /// sorted so the scan stops as soon as it walks past the slot.
    fn capture_upvalue(&mut self, slot: usize) -> ObjHandle {
        let mut insert_at = self.open_upvalues.len();
        for i in (0..self.open_upvalues.len()).rev() {
            let handle = self.open_upvalues[i];
            match self.heap.upvalue(handle).location {
                UpvalueLocation::Open(open_slot) => {
                    if open_slot == slot {
                        return handle;
                    }
                    if open_slot < slot {
                        break;
                    }
                    insert_at = i;
                }
                UpvalueLocation::Closed(_) => unreachable!("closed upvalue on the open list"),
            }
        }
        let created =
            self.alloc(Obj::Upvalue(ObjUpvalue { location: UpvalueLocation::Open(slot) }));
        self.open_upvalues.insert(insert_at, created);
        created
    }

    /// Close every open upvalue at or above `from`: copy the stack value into
    /// the upvalue and unlink it from the open list.
    fn close_upvalues(&mut self, from: usize) {
        while let Some(&handle) = self.open_upvalues.last() {
            let slot = match self.heap.upvalue(handle).location {
                UpvalueLocation::Open(slot) => slot,
                UpvalueLocation::Closed(_) => break,
            };
            if slot < from {
                break;
            }
            let value = self.stack[slot];
            self.heap.upvalue_mut(handle).location = UpvalueLocation::Closed(value);
            self.open_upvalues.pop();
        }
    }

    // === Tracing ===

    fn trace_instruction(&self) {
        print!("          ");
        if self.stack.is_empty() {
            print!("<empty>");
        } else {
            for value in &self.stack {
                print!("[ {} ]", self.heap.format_value(*value));
            }
        }
        println!();
        let frame = self.frames.last().expect("no call frame");
        let function = self.heap.closure(frame.closure).function;
        debug::disassemble_instruction(&self.heap, &self.heap.function(function).chunk, frame.ip);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Compile and run Quill source, returning captured print output.
    fn run_code(source: &str) -> Result<String, InterpretError> {
        run_with_options(source, VmOptions::default())
    }

    fn run_with_options(source: &str, options: VmOptions) -> Result<String, InterpretError> {
        let mut vm = Vm::new(options);
        vm.capture_output();
        vm.interpret(source)?;
        Ok(vm.take_output())
    }

    fn runtime_message(source: &str) -> RuntimeErrorReport {
        match run_code(source) {
            Err(InterpretError::Runtime(report)) => report,
            other => panic!("expected a runtime error, got: {:?}", other),
        }
    }

    #[test]
    fn arithmetic_precedence() {
        assert_eq!(run_code("print 1 + 2 * 3;").unwrap(), "7\n");
        assert_eq!(run_code("print (1 + 2) * 3;").unwrap(), "9\n");
        assert_eq!(run_code("print -2 * 3;").unwrap(), "-6\n");
        assert_eq!(run_code("print 1 - 2 - 3;").unwrap(), "-4\n");
        assert_eq!(run_code("print 10 / 4;").unwrap(), "2.5\n");
    }

    #[test]
    fn string_concatenation() {
        assert_eq!(
            run_code("var a = \"Hel\"; var b = \"lo\"; print a + b;").unwrap(),
            "Hello\n"
        );
    }

    #[test]
    fn comparison_and_equality() {
        assert_eq!(run_code("print 1 < 2;").unwrap(), "true\n");
        assert_eq!(run_code("print 2 <= 1;").unwrap(), "false\n");
        assert_eq!(run_code("print \"a\" == \"a\";").unwrap(), "true\n");
        assert_eq!(run_code("print \"a\" == \"b\";").unwrap(), "false\n");
        assert_eq!(run_code("print nil == false;").unwrap(), "false\n");
        assert_eq!(run_code("print 1 == \"1\";").unwrap(), "false\n");
        assert_eq!(run_code("print 0 / 0 == 0 / 0;").unwrap(), "false\n");
    }

    #[test]
    fn truthiness() {
        assert_eq!(run_code("print !nil;").unwrap(), "true\n");
        assert_eq!(run_code("print !false;").unwrap(), "true\n");
        assert_eq!(run_code("print !0;").unwrap(), "false\n");
        assert_eq!(run_code("print !\"\";").unwrap(), "false\n");
    }

    #[test]
    fn short_circuit_operators() {
        assert_eq!(run_code("print false and 1;").unwrap(), "false\n");
        assert_eq!(run_code("print true and 1;").unwrap(), "1\n");
        assert_eq!(run_code("print nil or \"fallback\";").unwrap(), "fallback\n");
        assert_eq!(run_code("print 1 or 2;").unwrap(), "1\n");
    }

    #[test]
    fn globals_and_locals() {
        assert_eq!(run_code("var x; print x;").unwrap(), "nil\n");
        assert_eq!(
            run_code("var x = 1; { var x = 2; print x; } print x;").unwrap(),
            "2\n1\n"
        );
        assert_eq!(run_code("var x = 1; x = 2; print x;").unwrap(), "2\n");
    }

    #[test]
    fn control_flow() {
        assert_eq!(
            run_code("if (1 < 2) print \"then\"; else print \"else\";").unwrap(),
            "then\n"
        );
        assert_eq!(
            run_code("if (1 > 2) print \"then\"; else print \"else\";").unwrap(),
            "else\n"
        );
        assert_eq!(
            run_code("var i = 0; while (i < 3) { print i; i = i + 1; }").unwrap(),
            "0\n1\n2\n"
        );
        assert_eq!(
            run_code("for (var i = 0; i < 3; i = i + 1) print i;").unwrap(),
            "0\n1\n2\n"
        );
    }

    #[test]
    fn functions_and_returns() {
        assert_eq!(
            run_code("fun add(a, b) { return a + b; } print add(1, 2);").unwrap(),
            "3\n"
        );
        assert_eq!(run_code("fun f() {} print f();").unwrap(), "nil\n");
        assert_eq!(
            run_code(
                "fun fib(n) { if (n < 2) return n; return fib(n - 1) + fib(n - 2); }\
                 print fib(10);"
            )
            .unwrap(),
            "55\n"
        );
    }

    #[test]
    fn closure_counter_keeps_per_instance_state() {
        let source = "
            fun make_counter() {
                var count = 0;
                fun increment() {
                    count = count + 1;
                    return count;
                }
                return increment;
            }
            var a = make_counter();
            var b = make_counter();
            print a();
            print a();
            print b();
            print a();
        ";
        assert_eq!(run_code(source).unwrap(), "1\n2\n1\n3\n");
    }

    #[test]
    fn block_scoped_capture_is_closed() {
        let source = "
            var global;
            {
                var a = \"captured\";
                fun f() { print a; }
                global = f;
            }
            global();
        ";
        assert_eq!(run_code(source).unwrap(), "captured\n");
    }

    #[test]
    fn sibling_closures_share_one_upvalue() {
        let source = "
            fun make() {
                var shared = 0;
                fun bump() { shared = shared + 1; }
                fun read() { return shared; }
                bump();
                bump();
                return read;
            }
            print make()();
        ";
        assert_eq!(run_code(source).unwrap(), "2\n");
    }

    #[test]
    fn classes_fields_and_methods() {
        assert_eq!(
            run_code("class P { init(n) { this.n = n; } } var p = P(7); print p.n;").unwrap(),
            "7\n"
        );
        assert_eq!(
            run_code(
                "class C { speak() { return \"hi\"; } } var c = C(); print c.speak();"
            )
            .unwrap(),
            "hi\n"
        );
        // Assignment chains rely on SetProperty leaving the value on the stack.
        assert_eq!(
            run_code(
                "class C {} var a = C(); var b = C(); var x = a.f = b.g = 1;\
                 print a.f; print b.g; print x;"
            )
            .unwrap(),
            "1\n1\n1\n"
        );
    }

    #[test]
    fn bound_methods_carry_their_receiver() {
        let source = "
            class Greeter {
                init(name) { this.name = name; }
                greet() { print this.name; }
            }
            var method = Greeter(\"alice\").greet;
            method();
        ";
        assert_eq!(run_code(source).unwrap(), "alice\n");
    }

    #[test]
    fn inheritance_and_super() {
        let source = "
            class A { greet() { print \"A\"; } }
            class B < A { greet() { super.greet(); print \"B\"; } }
            B().greet();
        ";
        assert_eq!(run_code(source).unwrap(), "A\nB\n");
    }

    #[test]
    fn initializer_returns_this_implicitly() {
        let source = "
            class C { init() { this.x = 1; } }
            var c = C();
            print c.init().x;
        ";
        assert_eq!(run_code(source).unwrap(), "1\n");
    }

    #[test]
    fn field_shadows_method_on_invoke() {
        let source = "
            class C { f() { return \"method\"; } }
            var c = C();
            fun replacement() { return \"field\"; }
            c.f = replacement;
            print c.f();
        ";
        assert_eq!(run_code(source).unwrap(), "field\n");
    }

    #[test]
    fn print_formats() {
        assert_eq!(run_code("print nil;").unwrap(), "nil\n");
        assert_eq!(run_code("print true;").unwrap(), "true\n");
        assert_eq!(run_code("fun f() {} print f;").unwrap(), "<fn f>\n");
        assert_eq!(run_code("print clock;").unwrap(), "<native fn>\n");
        assert_eq!(run_code("class C {} print C;").unwrap(), "C\n");
        assert_eq!(run_code("class C {} print C();").unwrap(), "C instance\n");
    }

    #[test]
    fn clock_native_is_monotonic() {
        assert_eq!(run_code("print clock() <= clock();").unwrap(), "true\n");
    }

    #[test]
    fn arity_errors() {
        assert_eq!(
            runtime_message("class P { init(n) { this.n = n; } } P();").message,
            "Expected 1 arguments but got 0."
        );
        assert_eq!(
            runtime_message("class C {} C(1);").message,
            "Expected 0 arguments but got 1."
        );
        assert_eq!(
            runtime_message("fun f(a, b) {} f(1);").message,
            "Expected 2 arguments but got 1."
        );
    }

    #[test]
    fn type_errors() {
        assert_eq!(
            runtime_message("print 1 + \"one\";").message,
            "Operands must be two numbers or two strings."
        );
        assert_eq!(runtime_message("print 1 < \"two\";").message, "Operands must be numbers.");
        assert_eq!(runtime_message("print -\"three\";").message, "Operand must be a number.");
        assert_eq!(
            runtime_message("\"not callable\"();").message,
            "Can only call functions and classes."
        );
        assert_eq!(
            runtime_message("var x = 1; print x.field;").message,
            "Only instances have properties."
        );
        assert_eq!(
            runtime_message("var x = 1; x.field = 2;").message,
            "Only instances have fields."
        );
        assert_eq!(
            runtime_message("var x = 1; x.method();").message,
            "Only instances have methods."
        );
        assert_eq!(
            runtime_message("var NotAClass = 1; class C < NotAClass {}").message,
            "Superclass must be a class."
        );
    }

    #[test]
    fn undefined_variables_and_properties() {
        assert_eq!(runtime_message("print y;").message, "Undefined variable 'y'.");
        assert_eq!(runtime_message("y = 1;").message, "Undefined variable 'y'.");
        assert_eq!(
            runtime_message("class C {} print C().missing;").message,
            "Undefined property 'missing'."
        );
        assert_eq!(
            runtime_message("class C {} C().missing();").message,
            "Undefined property 'missing'."
        );
    }

    #[test]
    fn assignment_to_undefined_global_does_not_create_it() {
        let mut vm = Vm::new(VmOptions::default());
        vm.capture_output();
        assert!(vm.interpret("ghost = 1;").is_err());
        // The speculative insert was rolled back.
        assert_eq!(
            runtime_message_in(&mut vm, "print ghost;"),
            "Undefined variable 'ghost'."
        );
    }

    fn runtime_message_in(vm: &mut Vm, source: &str) -> String {
        match vm.interpret(source) {
            Err(InterpretError::Runtime(report)) => report.message,
            other => panic!("expected a runtime error, got: {:?}", other),
        }
    }

    #[test]
    fn stack_overflow_on_runaway_recursion() {
        let report = runtime_message("fun f() { f(); } f();");
        assert_eq!(report.message, "Stack overflow.");
        assert_eq!(report.trace.len(), FRAMES_MAX);
    }

    #[test]
    fn runtime_error_traces_are_innermost_first() {
        let source = "fun inner() { return missing; }\nfun outer() { return inner(); }\nouter();";
        let report = runtime_message(source);
        assert_eq!(report.message, "Undefined variable 'missing'.");
        assert_eq!(report.trace.len(), 3);
        assert_eq!(report.trace[0].function.as_deref(), Some("inner"));
        assert_eq!(report.trace[0].line, 1);
        assert_eq!(report.trace[1].function.as_deref(), Some("outer"));
        assert_eq!(report.trace[1].line, 2);
        assert_eq!(report.trace[2].function, None);
        assert_eq!(report.trace[2].line, 3);
    }

    #[test]
    fn vm_is_idle_after_success_and_after_error() {
        let mut vm = Vm::new(VmOptions::default());
        vm.capture_output();
        vm.interpret("print 1;").unwrap();
        assert!(vm.is_idle());
        assert!(vm.interpret("print missing;").is_err());
        assert!(vm.is_idle());
    }

    #[test]
    fn globals_persist_across_interpret_calls() {
        let mut vm = Vm::new(VmOptions::default());
        vm.capture_output();
        vm.interpret("var x = 41;").unwrap();
        vm.interpret("print x + 1;").unwrap();
        assert_eq!(vm.take_output(), "42\n");
    }

    #[test]
    fn interned_strings_are_identical() {
        let mut vm = Vm::new(VmOptions::default());
        let a = vm.intern("shared");
        let b = vm.intern("shared");
        assert_eq!(a, b);
        let c = vm.intern("other");
        assert_ne!(a, c);
    }

    #[test]
    fn concatenation_interns_its_result() {
        let mut vm = Vm::new(VmOptions::default());
        vm.capture_output();
        vm.interpret("var joined = \"con\" + \"cat\";").unwrap();
        let direct = vm.intern("concat");
        // The global holds the same object the intern table does.
        vm.interpret("print joined == \"concat\";").unwrap();
        assert_eq!(vm.take_output(), "true\n");
        let again = vm.intern("concat");
        assert_eq!(direct, again);
    }

    #[test]
    fn gc_stress_produces_identical_output() {
        let source = "
            fun make_adder(n) {
                fun add(m) { return n + m; }
                return add;
            }
            class Node {
                init(value) { this.value = value; }
            }
            var text = \"\";
            for (var i = 0; i < 40; i = i + 1) {
                text = text + \"x\";
                var node = Node(i);
                var adder = make_adder(i);
                print adder(node.value);
            }
            print text;
        ";
        let plain = run_code(source).unwrap();
        let stressed =
            run_with_options(source, VmOptions { gc_stress: true, ..Default::default() })
                .unwrap();
        assert_eq!(plain, stressed);
    }

    #[test]
    fn deterministic_output_across_runs() {
        let source = "
            class Shape { init(n) { this.n = n; } area() { return this.n * this.n; } }
            for (var i = 1; i < 4; i = i + 1) print Shape(i).area();
        ";
        assert_eq!(run_code(source).unwrap(), run_code(source).unwrap());
    }
}
