// File: src/memory.rs
//
// The heap arena and the mark phase machinery of the garbage collector.
// Objects occupy slots in a vector; freed slots go on a free list and are
// reused. The VM drives the collection cycle (it owns the roots); this module
// owns marking, tracing, and the sweep.
//
// Tri-color invariant: white = unmarked, gray = marked and on the worklist,
// black = marked and off the worklist. An object is freed iff it is white
// when the sweep runs.

use crate::object::{
    Obj, ObjClass, ObjClosure, ObjFunction, ObjHandle, ObjInstance, ObjString, ObjUpvalue,
};
use crate::table::Table;
use crate::value::{format_number, Value};

pub const GC_HEAP_GROW_FACTOR: usize = 2;
const FIRST_GC_THRESHOLD: usize = 1024 * 1024;

struct Slot {
    obj: Obj,
    marked: bool,
}

pub struct Heap {
    slots: Vec<Option<Slot>>,
    free: Vec<u32>,
    bytes_allocated: usize,
    next_gc: usize,
    gray: Vec<ObjHandle>,
    // Functions currently under construction by the compiler. They are not
    // yet reachable from any other root, so the compiler registers each one
    // here for the duration of its compilation.
    compiler_roots: Vec<ObjHandle>,
}

impl Heap {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            bytes_allocated: 0,
            next_gc: FIRST_GC_THRESHOLD,
            gray: Vec::new(),
            compiler_roots: Vec::new(),
        }
    }

    /// Place an object in the arena. Does not trigger collection; callers go
    /// through `Vm::alloc`, which collects first when over threshold.
    pub fn allocate(&mut self, obj: Obj) -> ObjHandle {
        self.bytes_allocated += obj.size_estimate();
        let slot = Some(Slot { obj, marked: false });
        match self.free.pop() {
            Some(index) => {
                self.slots[index as usize] = slot;
                ObjHandle::new(index)
            }
            None => {
                self.slots.push(slot);
                ObjHandle::new((self.slots.len() - 1) as u32)
            }
        }
    }

    pub fn bytes_allocated(&self) -> usize {
        self.bytes_allocated
    }

    pub fn should_collect(&self) -> bool {
        self.bytes_allocated > self.next_gc
    }

    pub fn set_next_gc(&mut self, threshold: usize) {
        self.next_gc = threshold;
    }

    pub fn object_count(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    // === Accessors ===
    //
    // Handles are only ever produced by `allocate` and only invalidated by the
    // sweep, which frees exactly the unreachable; a kind mismatch or a stale
    // handle is a VM bug, so these index and match unconditionally.

    pub fn get(&self, handle: ObjHandle) -> &Obj {
        &self.slots[handle.index() as usize]
            .as_ref()
            .expect("stale object handle")
            .obj
    }

    pub fn get_mut(&mut self, handle: ObjHandle) -> &mut Obj {
        &mut self.slots[handle.index() as usize]
            .as_mut()
            .expect("stale object handle")
            .obj
    }

    pub fn string(&self, handle: ObjHandle) -> &ObjString {
        match self.get(handle) {
            Obj::String(s) => s,
            _ => panic!("object is not a string"),
        }
    }

    pub fn function(&self, handle: ObjHandle) -> &ObjFunction {
        match self.get(handle) {
            Obj::Function(f) => f,
            _ => panic!("object is not a function"),
        }
    }

    pub fn function_mut(&mut self, handle: ObjHandle) -> &mut ObjFunction {
        match self.get_mut(handle) {
            Obj::Function(f) => f,
            _ => panic!("object is not a function"),
        }
    }

    pub fn class(&self, handle: ObjHandle) -> &ObjClass {
        match self.get(handle) {
            Obj::Class(c) => c,
            _ => panic!("object is not a class"),
        }
    }

    pub fn class_mut(&mut self, handle: ObjHandle) -> &mut ObjClass {
        match self.get_mut(handle) {
            Obj::Class(c) => c,
            _ => panic!("object is not a class"),
        }
    }

    pub fn instance(&self, handle: ObjHandle) -> &ObjInstance {
        match self.get(handle) {
            Obj::Instance(i) => i,
            _ => panic!("object is not an instance"),
        }
    }

    pub fn instance_mut(&mut self, handle: ObjHandle) -> &mut ObjInstance {
        match self.get_mut(handle) {
            Obj::Instance(i) => i,
            _ => panic!("object is not an instance"),
        }
    }

    pub fn closure(&self, handle: ObjHandle) -> &ObjClosure {
        match self.get(handle) {
            Obj::Closure(c) => c,
            _ => panic!("object is not a closure"),
        }
    }

    pub fn closure_mut(&mut self, handle: ObjHandle) -> &mut ObjClosure {
        match self.get_mut(handle) {
            Obj::Closure(c) => c,
            _ => panic!("object is not a closure"),
        }
    }

    pub fn upvalue(&self, handle: ObjHandle) -> &ObjUpvalue {
        match self.get(handle) {
            Obj::Upvalue(u) => u,
            _ => panic!("object is not an upvalue"),
        }
    }

    pub fn upvalue_mut(&mut self, handle: ObjHandle) -> &mut ObjUpvalue {
        match self.get_mut(handle) {
            Obj::Upvalue(u) => u,
            _ => panic!("object is not an upvalue"),
        }
    }

    // === Compiler roots ===

    pub fn push_compiler_root(&mut self, handle: ObjHandle) {
        self.compiler_roots.push(handle);
    }

    pub fn pop_compiler_root(&mut self) {
        self.compiler_roots.pop();
    }

    // === Mark phase ===

    pub fn mark_value(&mut self, value: Value) {
        if value.is_obj() {
            self.mark_object(value.as_obj());
        }
    }

    pub fn mark_object(&mut self, handle: ObjHandle) {
        let slot = self.slots[handle.index() as usize]
            .as_mut()
            .expect("marked a stale object handle");
        if slot.marked {
            return;
        }
        slot.marked = true;
        self.gray.push(handle);
    }

    pub fn mark_table(&mut self, table: &Table) {
        for (key, _, value) in table.iter() {
            self.mark_object(key);
            self.mark_value(value);
        }
    }

    pub fn mark_compiler_roots(&mut self) {
        for i in 0..self.compiler_roots.len() {
            let handle = self.compiler_roots[i];
            self.mark_object(handle);
        }
    }

    /// Drain the gray worklist, blackening each object by marking what it
    /// refers to.
    pub fn trace_references(&mut self) {
        let mut children = Vec::new();
        while let Some(handle) = self.gray.pop() {
            self.collect_children(handle, &mut children);
            for child in children.drain(..) {
                self.mark_object(child);
            }
        }
    }

    fn collect_children(&self, handle: ObjHandle, out: &mut Vec<ObjHandle>) {
        let push_value = |out: &mut Vec<ObjHandle>, v: Value| {
            if v.is_obj() {
                out.push(v.as_obj());
            }
        };
        match self.get(handle) {
            // Strings and natives refer to nothing.
            Obj::String(_) | Obj::Native(_) => {}
            Obj::Function(f) => {
                if let Some(name) = f.name {
                    out.push(name);
                }
                for &constant in &f.chunk.constants {
                    push_value(out, constant);
                }
            }
            Obj::Closure(c) => {
                out.push(c.function);
                out.extend_from_slice(&c.upvalues);
            }
            Obj::Upvalue(u) => {
                // An open upvalue's referent is a stack slot, which the root
                // pass already marked.
                if let crate::object::UpvalueLocation::Closed(v) = u.location {
                    push_value(out, v);
                }
            }
            Obj::Class(c) => {
                out.push(c.name);
                for (key, _, value) in c.methods.iter() {
                    out.push(key);
                    push_value(out, value);
                }
            }
            Obj::Instance(i) => {
                out.push(i.class);
                for (key, _, value) in i.fields.iter() {
                    out.push(key);
                    push_value(out, value);
                }
            }
            Obj::BoundMethod(b) => {
                push_value(out, b.receiver);
                out.push(b.method);
            }
        }
    }

    pub fn is_marked(&self, handle: ObjHandle) -> bool {
        self.slots[handle.index() as usize]
            .as_ref()
            .map(|s| s.marked)
            .unwrap_or(false)
    }

    // === Sweep phase ===

    /// Free every white object and clear the survivors' marks. Returns the
    /// number of objects freed.
    pub fn sweep(&mut self) -> usize {
        let mut freed = 0;
        for index in 0..self.slots.len() {
            let reclaim = match &mut self.slots[index] {
                Some(slot) if slot.marked => {
                    slot.marked = false;
                    false
                }
                Some(_) => true,
                None => false,
            };
            if reclaim {
                if let Some(slot) = self.slots[index].take() {
                    self.bytes_allocated =
                        self.bytes_allocated.saturating_sub(slot.obj.size_estimate());
                }
                self.free.push(index as u32);
                freed += 1;
            }
        }
        freed
    }

    // === Formatting ===

    /// Render a value the way `print` does. Object rendering needs the heap
    /// to chase names, so it lives here rather than on Value.
    pub fn format_value(&self, value: Value) -> String {
        if value.is_number() {
            format_number(value.as_number())
        } else if value.is_nil() {
            "nil".to_string()
        } else if value.is_bool() {
            if value.as_bool() { "true".to_string() } else { "false".to_string() }
        } else {
            self.format_object(value.as_obj())
        }
    }

    fn format_object(&self, handle: ObjHandle) -> String {
        match self.get(handle) {
            Obj::String(s) => s.chars.to_string(),
            Obj::Function(f) => self.format_function(f),
            Obj::Native(_) => "<native fn>".to_string(),
            Obj::Closure(c) => self.format_function(self.function(c.function)),
            Obj::Upvalue(_) => "upvalue".to_string(),
            Obj::Class(c) => self.string(c.name).chars.to_string(),
            Obj::Instance(i) => {
                format!("{} instance", self.string(self.class(i.class).name).chars)
            }
            Obj::BoundMethod(b) => {
                let closure = match self.get(b.method) {
                    Obj::Closure(c) => c,
                    _ => panic!("bound method does not wrap a closure"),
                };
                self.format_function(self.function(closure.function))
            }
        }
    }

    fn format_function(&self, function: &ObjFunction) -> String {
        match function.name {
            Some(name) => format!("<fn {}>", self.string(name).chars),
            None => "<script>".to_string(),
        }
    }
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}
