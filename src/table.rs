// File: src/table.rs
//
// Open-addressing hash table keyed by interned strings, used for globals,
// class method tables, instance fields, and the intern set itself.
// Linear probing; capacity is always a power of two so wrapping is a mask.
// Deleted slots become tombstones ({key: None, value: true}) so probe
// sequences stay intact.

use crate::memory::Heap;
use crate::object::ObjHandle;
use crate::value::Value;

const TABLE_MAX_LOAD: f64 = 0.75;
const MIN_CAPACITY: usize = 8;

/// One bucket. The key's hash is cached here so resizing never needs to
/// consult the heap; interning makes handle comparison a full key match.
#[derive(Clone, Copy)]
pub(crate) struct Entry {
    pub(crate) key: Option<ObjHandle>,
    pub(crate) hash: u32,
    pub(crate) value: Value,
}

impl Entry {
    const EMPTY: Entry = Entry { key: None, hash: 0, value: Value::NIL };

    #[inline]
    fn is_tombstone(&self) -> bool {
        self.key.is_none() && !self.value.is_nil()
    }
}

pub struct Table {
    // Live entries plus tombstones; resizing drops the tombstones.
    count: usize,
    entries: Vec<Entry>,
}

impl Table {
    pub fn new() -> Self {
        Self { count: 0, entries: Vec::new() }
    }

    pub fn get(&self, key: ObjHandle, hash: u32) -> Option<Value> {
        if self.count == 0 {
            return None;
        }
        let entry = &self.entries[self.find_slot(key, hash)];
        entry.key.map(|_| entry.value)
    }

    /// Insert or overwrite. Returns true iff the key was not present.
    pub fn set(&mut self, key: ObjHandle, hash: u32, value: Value) -> bool {
        if (self.count + 1) as f64 > self.entries.len() as f64 * TABLE_MAX_LOAD {
            self.grow();
        }
        let slot = self.find_slot(key, hash);
        let entry = &mut self.entries[slot];
        let is_new = entry.key.is_none();
        // A reused tombstone was already counted.
        if is_new && entry.value.is_nil() {
            self.count += 1;
        }
        *entry = Entry { key: Some(key), hash, value };
        is_new
    }

    /// Replace the entry with a tombstone. Returns true iff the key was
    /// present. The count is not decremented: tombstones still occupy slots.
    pub fn delete(&mut self, key: ObjHandle, hash: u32) -> bool {
        if self.count == 0 {
            return false;
        }
        let slot = self.find_slot(key, hash);
        let entry = &mut self.entries[slot];
        if entry.key.is_none() {
            return false;
        }
        *entry = Entry { key: None, hash: 0, value: Value::TRUE };
        true
    }

    /// Content-addressed lookup, used only by the string intern set: match by
    /// length, hash, and bytes rather than handle identity.
    pub fn find_string(&self, heap: &Heap, chars: &str, hash: u32) -> Option<ObjHandle> {
        if self.count == 0 {
            return None;
        }
        let mask = self.entries.len() - 1;
        let mut index = hash as usize & mask;
        loop {
            let entry = &self.entries[index];
            match entry.key {
                None => {
                    if !entry.is_tombstone() {
                        return None;
                    }
                }
                Some(key) => {
                    if entry.hash == hash && heap.string(key).chars.as_ref() == chars {
                        return Some(key);
                    }
                }
            }
            index = (index + 1) & mask;
        }
    }

    /// Tombstone every entry whose key did not survive marking. Runs between
    /// the trace and sweep phases so the intern set never dangles.
    pub fn remove_white(&mut self, heap: &Heap) {
        let doomed: Vec<(ObjHandle, u32)> = self
            .entries
            .iter()
            .filter_map(|e| e.key.map(|k| (k, e.hash)))
            .filter(|&(k, _)| !heap.is_marked(k))
            .collect();
        for (key, hash) in doomed {
            self.delete(key, hash);
        }
    }

    /// Live entries as (key, cached hash, value) triples.
    pub fn iter(&self) -> impl Iterator<Item = (ObjHandle, u32, Value)> + '_ {
        self.entries.iter().filter_map(|e| e.key.map(|k| (k, e.hash, e.value)))
    }

    pub fn byte_size(&self) -> usize {
        self.entries.len() * std::mem::size_of::<Entry>()
    }

    /// Index of the entry for `key`: either its current bucket or the slot an
    /// insert should use (the first tombstone on the probe path, if any).
    fn find_slot(&self, key: ObjHandle, hash: u32) -> usize {
        let mask = self.entries.len() - 1;
        let mut index = hash as usize & mask;
        let mut tombstone: Option<usize> = None;
        loop {
            let entry = &self.entries[index];
            match entry.key {
                None => {
                    if entry.is_tombstone() {
                        tombstone.get_or_insert(index);
                    } else {
                        return tombstone.unwrap_or(index);
                    }
                }
                Some(k) if k == key => return index,
                Some(_) => {}
            }
            index = (index + 1) & mask;
        }
    }

    fn grow(&mut self) {
        let new_capacity = (self.entries.len() * 2).max(MIN_CAPACITY);
        let old = std::mem::replace(&mut self.entries, vec![Entry::EMPTY; new_capacity]);
        // Tombstones are dropped here, so the count starts over.
        self.count = 0;
        for entry in old {
            if let Some(key) = entry.key {
                let slot = self.find_slot(key, entry.hash);
                self.entries[slot] = entry;
                self.count += 1;
            }
        }
    }
}

impl Default for Table {
    fn default() -> Self {
        Self::new()
    }
}
