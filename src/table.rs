//! Hash table keyed by interned strings.
//!
//! Open addressing with linear probing and a 0.75 load factor. Key
//! comparison is pointer identity, which interning makes equivalent to
//! byte equality. A bucket is empty (`key: None, value: Nil`), a tombstone
//! (`key: None, value: Bool(true)`), or live. `count` includes tombstones;
//! rehashing drops them and recounts only live entries.
//!
//! The same structure serves as the global environment, class method
//! tables, instance field tables, and the string intern table (the last
//! with weak keys, swept by [`Table::remove_white`] mid-collection).

use std::mem;

use crate::value::{Gc, Value};

const MAX_LOAD_NUM: usize = 3;
const MAX_LOAD_DEN: usize = 4;

/// FNV-1a, 32 bits. Every interned string caches this over its bytes.
pub fn hash_string(chars: &str) -> u32 {
    let mut hash = 2166136261u32;
    for byte in chars.as_bytes() {
        hash ^= *byte as u32;
        hash = hash.wrapping_mul(16777619);
    }
    hash
}

#[derive(Debug, Copy, Clone)]
pub struct Entry {
    pub key: Option<Gc>,
    pub value: Value,
}

const EMPTY: Entry = Entry {
    key: None,
    value: Value::Nil,
};

#[derive(Debug, Default)]
pub struct Table {
    /// Live entries plus tombstones.
    count: usize,
    entries: Box<[Entry]>,
}

impl Table {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    fn capacity(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    fn key_hash(key: Gc) -> u32 {
        // SAFETY: table keys are live interned strings
        unsafe { key.as_ref() }.as_string().hash
    }

    /// Probe for `key`, stopping at a match or the first truly empty
    /// bucket. Returns the matching bucket, or the first tombstone passed
    /// (for reuse), or the empty bucket.
    fn find_entry(entries: &[Entry], key: Gc) -> usize {
        let mut index = Self::key_hash(key) as usize % entries.len();
        let mut tombstone: Option<usize> = None;

        loop {
            let entry = &entries[index];
            match entry.key {
                None => {
                    if matches!(entry.value, Value::Nil) {
                        return tombstone.unwrap_or(index);
                    }
                    // tombstone; keep probing, remember the first
                    if tombstone.is_none() {
                        tombstone = Some(index);
                    }
                }
                Some(existing) if existing == key => return index,
                Some(_) => {}
            }
            index = (index + 1) % entries.len();
        }
    }

    pub fn get(&self, key: Gc) -> Option<Value> {
        if self.count == 0 {
            return None;
        }
        let index = Self::find_entry(&self.entries, key);
        let entry = &self.entries[index];
        entry.key.map(|_| entry.value)
    }

    /// Insert or overwrite. Returns `true` iff `key` was not present.
    pub fn set(&mut self, key: Gc, value: Value) -> bool {
        if (self.count + 1) * MAX_LOAD_DEN > self.capacity() * MAX_LOAD_NUM {
            self.grow();
        }

        let index = Self::find_entry(&self.entries, key);
        let entry = &mut self.entries[index];
        let is_new = entry.key.is_none();
        // a reused tombstone was already counted
        if is_new && matches!(entry.value, Value::Nil) {
            self.count += 1;
        }
        entry.key = Some(key);
        entry.value = value;
        is_new
    }

    /// Replace the entry with a tombstone. `count` is unchanged, so
    /// deleted slots still push the table toward a (cleansing) rehash.
    pub fn delete(&mut self, key: Gc) -> bool {
        if self.count == 0 {
            return false;
        }
        let index = Self::find_entry(&self.entries, key);
        let entry = &mut self.entries[index];
        if entry.key.is_none() {
            return false;
        }
        entry.key = None;
        entry.value = Value::Bool(true);
        true
    }

    /// Copy every live entry of `src` into `self`.
    pub fn add_all_from(&mut self, src: &Table) {
        for entry in src.entries.iter() {
            if let Some(key) = entry.key {
                self.set(key, entry.value);
            }
        }
    }

    /// The interner's lookup: the only probe keyed by raw bytes instead of
    /// identity. Compares length, hash, then bytes; skips tombstones and
    /// stops at the first truly empty bucket.
    pub fn find_string(&self, chars: &str, hash: u32) -> Option<Gc> {
        if self.count == 0 {
            return None;
        }
        let mut index = hash as usize % self.capacity();
        loop {
            let entry = &self.entries[index];
            match entry.key {
                None => {
                    if matches!(entry.value, Value::Nil) {
                        return None;
                    }
                }
                Some(key) => {
                    // SAFETY: intern-table keys are live strings
                    let string = unsafe { key.as_ref() }.as_string();
                    if string.chars.len() == chars.len()
                        && string.hash == hash
                        && &*string.chars == chars
                    {
                        return Some(key);
                    }
                }
            }
            index = (index + 1) % self.capacity();
        }
    }

    /// Weak-key sweep: tombstone every entry whose key was not marked in
    /// the current GC cycle. Runs between trace and sweep.
    pub fn remove_white(&mut self) {
        for index in 0..self.entries.len() {
            if let Some(key) = self.entries[index].key {
                // SAFETY: keys are live until the sweep that follows
                if !unsafe { key.as_ref() }.is_marked() {
                    self.entries[index].key = None;
                    self.entries[index].value = Value::Bool(true);
                }
            }
        }
    }

    /// Raw bucket view for the GC's mark pass.
    pub(crate) fn entries(&self) -> &[Entry] {
        &self.entries
    }

    /// Bucket-array bytes, for allocation accounting.
    pub fn byte_size(&self) -> usize {
        self.entries.len() * mem::size_of::<Entry>()
    }

    fn grow(&mut self) {
        let capacity = (self.capacity() * 2).max(8);
        let mut entries = vec![EMPTY; capacity].into_boxed_slice();

        // reinsert live entries only; tombstones evaporate
        self.count = 0;
        for entry in self.entries.iter() {
            if let Some(key) = entry.key {
                let index = Self::find_entry(&entries, key);
                entries[index] = *entry;
                self.count += 1;
            }
        }
        self.entries = entries;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{Obj, ObjKind, VmString};

    fn make_string(chars: &str) -> Gc {
        let obj = Obj::new(ObjKind::String(VmString {
            hash: hash_string(chars),
            chars: chars.into(),
        }));
        Gc::from_ptr(Box::into_raw(Box::new(obj)))
    }

    #[test]
    fn set_get_overwrite() {
        let mut table = Table::new();
        let key = make_string("answer");

        assert!(table.set(key, Value::Number(1.0)));
        assert_eq!(table.get(key), Some(Value::Number(1.0)));

        assert!(!table.set(key, Value::Number(2.0)));
        assert_eq!(table.get(key), Some(Value::Number(2.0)));
    }

    #[test]
    fn get_on_empty_table_misses() {
        let table = Table::new();
        assert_eq!(table.get(make_string("missing")), None);
    }

    #[test]
    fn delete_leaves_reachable_probe_chains() {
        let mut table = Table::new();
        let keys: Vec<Gc> = (0..32).map(|i| make_string(&format!("k{i}"))).collect();
        for (i, &key) in keys.iter().enumerate() {
            table.set(key, Value::Number(i as f64));
        }

        // delete every other key; the rest must stay reachable through
        // the tombstones left in their probe chains
        for &key in keys.iter().step_by(2) {
            assert!(table.delete(key));
        }
        for (i, &key) in keys.iter().enumerate() {
            if i % 2 == 0 {
                assert_eq!(table.get(key), None);
            } else {
                assert_eq!(table.get(key), Some(Value::Number(i as f64)));
            }
        }
    }

    #[test]
    fn delete_heavy_workload_still_terminates_lookups() {
        // churn one slot's worth of keys far past the table capacity;
        // tombstones count toward load, forcing rehashes that drop them
        let mut table = Table::new();
        let keeper = make_string("keeper");
        table.set(keeper, Value::Bool(true));

        for i in 0..10_000 {
            let key = make_string(&format!("churn{i}"));
            table.set(key, Value::Nil);
            table.delete(key);
        }

        assert_eq!(table.get(keeper), Some(Value::Bool(true)));
        assert_eq!(table.get(make_string("never-inserted")), None);
    }

    #[test]
    fn keys_compare_by_identity_not_bytes() {
        let mut table = Table::new();
        let a = make_string("same");
        let b = make_string("same");

        table.set(a, Value::Number(1.0));
        // distinct (un-interned) objects with equal bytes are distinct keys
        assert_eq!(table.get(b), None);
    }

    #[test]
    fn find_string_matches_by_bytes() {
        let mut table = Table::new();
        let key = make_string("interned");
        table.set(key, Value::Nil);

        let found = table.find_string("interned", hash_string("interned"));
        assert_eq!(found, Some(key));
        assert_eq!(table.find_string("other", hash_string("other")), None);
    }

    #[test]
    fn add_all_copies_live_entries_only() {
        let mut src = Table::new();
        let kept = make_string("kept");
        let dropped = make_string("dropped");
        src.set(kept, Value::Number(1.0));
        src.set(dropped, Value::Number(2.0));
        src.delete(dropped);

        let mut dst = Table::new();
        dst.add_all_from(&src);
        assert_eq!(dst.get(kept), Some(Value::Number(1.0)));
        assert_eq!(dst.get(dropped), None);
    }
}
