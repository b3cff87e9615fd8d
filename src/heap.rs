//! The managed heap: allocation accounting and the tri-color
//! mark-and-sweep collector.
//!
//! Every object lives on one intrusive allocation list threaded through
//! its header; the sweeper is the only consumer. Collection is
//! stop-the-world and runs synchronously from the allocation path when
//! `bytes_allocated` passes `next_gc` (or on every allocation under
//! stress mode). The VM drives the cycle — it knows the roots — while the
//! heap owns the phases: marking, the gray worklist, sweeping, and
//! trigger retuning.
//!
//! The gray worklist is a plain `Vec` on the host allocator, outside the
//! accounted heap, so growing it can never re-enter the collector. If the
//! host allocator fails there, the process aborts, which is the contract
//! for out-of-memory throughout.

use tracing::{debug, trace};

use crate::object::{Obj, ObjKind};
use crate::table::Table;
use crate::value::{Gc, Value};

/// Collector tuning, fixed at construction.
#[derive(Debug, Clone)]
pub struct HeapSettings {
    /// Bytes allocated before the first collection.
    pub first_gc: usize,
    /// `next_gc` multiplier applied after each cycle.
    pub growth_factor: usize,
    /// Collect before every allocation. For flushing out liveness bugs;
    /// the test suite runs its end-to-end programs under this.
    pub stress_gc: bool,
}

impl Default for HeapSettings {
    fn default() -> Self {
        Self {
            first_gc: 1024 * 1024,
            growth_factor: 2,
            stress_gc: false,
        }
    }
}

#[derive(Debug)]
pub struct Heap {
    settings: HeapSettings,
    /// Head of the global allocation list.
    objects: Option<Gc>,
    bytes_allocated: usize,
    next_gc: usize,
    /// Marked but not yet traced objects.
    gray: Vec<Gc>,
}

impl Heap {
    pub fn new(settings: HeapSettings) -> Self {
        let next_gc = settings.first_gc;
        Self {
            settings,
            objects: None,
            bytes_allocated: 0,
            next_gc,
            gray: Vec::new(),
        }
    }

    #[inline]
    pub fn bytes_allocated(&self) -> usize {
        self.bytes_allocated
    }

    /// Charge `bytes` against the trigger before the allocation happens,
    /// so the collection the charge may force sees the true total.
    #[inline]
    pub fn account(&mut self, bytes: usize) {
        self.bytes_allocated += bytes;
    }

    #[inline]
    pub fn should_collect(&self) -> bool {
        self.settings.stress_gc || self.bytes_allocated > self.next_gc
    }

    /// Allocate and link a new object. The caller has already accounted
    /// its size and run any collection the charge triggered.
    pub fn allocate(&mut self, kind: ObjKind) -> Gc {
        let mut obj = Obj::new(kind);
        obj.next = self.objects;
        let gc = Gc::from_ptr(Box::into_raw(Box::new(obj)));
        self.objects = Some(gc);
        trace!(target: "gc", ptr = ?gc.as_ptr(), "allocate");
        gc
    }

    // ── mark phase ────────────────────────────────────────────────────

    pub fn mark_value(&mut self, value: Value) {
        if let Value::Obj(obj) = value {
            self.mark_object(obj);
        }
    }

    /// Gray an object: set its mark bit and queue it for tracing. Already
    /// marked objects are skipped so shared structure is traced once.
    pub fn mark_object(&mut self, obj: Gc) {
        // SAFETY: mark phase runs only on reachable (live) objects
        let obj_ref = unsafe { obj.as_mut() };
        if obj_ref.is_marked() {
            return;
        }
        obj_ref.set_marked(true);
        trace!(target: "gc", ptr = ?obj.as_ptr(), "mark");
        self.gray.push(obj);
    }

    /// Mark every key and value of a (strong) table.
    pub fn mark_table(&mut self, table: &Table) {
        for entry in table.entries() {
            if let Some(key) = entry.key {
                self.mark_object(key);
            }
            self.mark_value(entry.value);
        }
    }

    /// Drain the gray worklist, blackening each object by marking its
    /// outgoing references.
    pub fn trace_references(&mut self) {
        while let Some(obj) = self.gray.pop() {
            self.blacken(obj);
        }
    }

    fn blacken(&mut self, obj: Gc) {
        trace!(target: "gc", ptr = ?obj.as_ptr(), "blacken");
        // SAFETY: gray objects are reachable, hence live
        match &unsafe { obj.as_ref() }.kind {
            ObjKind::String(_) | ObjKind::Native(_) => {}
            ObjKind::Function(function) => {
                if let Some(name) = function.name {
                    self.mark_object(name);
                }
                for index in 0..function.chunk.constants.len() {
                    self.mark_value(function.chunk.constants[index]);
                }
            }
            ObjKind::Closure(closure) => {
                self.mark_object(closure.function);
                for upvalue in closure.upvalues.iter().flatten() {
                    self.mark_object(*upvalue);
                }
            }
            ObjKind::Upvalue(upvalue) => {
                // an open upvalue's stack cell is already a root
                if let crate::object::UpvalueCell::Closed(value) = upvalue.cell {
                    self.mark_value(value);
                }
            }
            ObjKind::Class(class) => {
                self.mark_object(class.name);
                self.mark_table(&class.methods);
            }
            ObjKind::Instance(instance) => {
                self.mark_object(instance.class);
                self.mark_table(&instance.fields);
            }
            ObjKind::BoundMethod(bound) => {
                self.mark_value(bound.receiver);
                self.mark_object(bound.method);
            }
        }
    }

    // ── sweep phase ───────────────────────────────────────────────────

    /// Free every unmarked object and clear the mark on survivors.
    pub fn sweep(&mut self) {
        let mut prev: Option<Gc> = None;
        let mut current = self.objects;
        while let Some(obj) = current {
            // SAFETY: list entries are live until freed right here
            let obj_ref = unsafe { obj.as_mut() };
            if obj_ref.is_marked() {
                obj_ref.set_marked(false);
                prev = current;
                current = obj_ref.next;
            } else {
                current = obj_ref.next;
                match prev {
                    // SAFETY: prev is a marked survivor
                    Some(prev) => unsafe { prev.as_mut() }.next = current,
                    None => self.objects = current,
                }
                self.free_object(obj);
            }
        }
    }

    /// Recompute the trigger after a cycle.
    pub fn retune(&mut self) {
        self.next_gc = self.bytes_allocated * self.settings.growth_factor;
        debug!(
            target: "gc",
            bytes = self.bytes_allocated,
            next_gc = self.next_gc,
            "cycle end"
        );
    }

    fn free_object(&mut self, obj: Gc) {
        trace!(target: "gc", ptr = ?obj.as_ptr(), "free");
        // SAFETY: obj was unlinked and is unreachable; this is the unique
        // owner reconstructed from the allocation
        let boxed = unsafe { Box::from_raw(obj.as_ptr()) };
        // tables and chunks may have grown since allocation; charge the
        // difference here rather than underflow
        self.bytes_allocated = self.bytes_allocated.saturating_sub(boxed.heap_size());
        drop(boxed);
    }

    /// Teardown: free everything still on the allocation list.
    pub fn free_all(&mut self) {
        let mut current = self.objects.take();
        while let Some(obj) = current {
            // SAFETY: teardown owns the entire list
            current = unsafe { obj.as_ref() }.next;
            self.free_object(obj);
        }
        self.gray = Vec::new();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::VmString;
    use crate::table::hash_string;

    fn string_kind(chars: &str) -> ObjKind {
        ObjKind::String(VmString {
            hash: hash_string(chars),
            chars: chars.into(),
        })
    }

    #[test]
    fn allocation_links_objects_and_accounts_bytes() {
        let mut heap = Heap::new(HeapSettings::default());
        assert_eq!(heap.bytes_allocated(), 0);

        let kind = string_kind("hello");
        heap.account(std::mem::size_of::<Obj>() + kind.payload_size());
        let a = heap.allocate(kind);
        let b = heap.allocate(string_kind("world"));

        assert!(heap.bytes_allocated() > 0);
        // newest first on the allocation list
        assert_eq!(heap.objects, Some(b));
        // SAFETY: just allocated
        assert_eq!(unsafe { b.as_ref() }.next, Some(a));

        heap.free_all();
    }

    #[test]
    fn sweep_frees_unmarked_and_unmarks_survivors() {
        let mut heap = Heap::new(HeapSettings::default());
        let doomed = heap.allocate(string_kind("doomed"));
        let survivor = heap.allocate(string_kind("survivor"));
        let _ = doomed;

        heap.mark_object(survivor);
        heap.trace_references();
        heap.sweep();

        assert_eq!(heap.objects, Some(survivor));
        // SAFETY: survivor survived the sweep
        let obj = unsafe { survivor.as_ref() };
        assert!(!obj.is_marked());
        assert_eq!(obj.next, None);

        heap.free_all();
    }

    #[test]
    fn marking_is_idempotent() {
        let mut heap = Heap::new(HeapSettings::default());
        let obj = heap.allocate(string_kind("once"));

        heap.mark_object(obj);
        heap.mark_object(obj);
        assert_eq!(heap.gray.len(), 1);

        heap.trace_references();
        heap.sweep();
        heap.free_all();
    }

    #[test]
    fn stress_mode_always_wants_collection() {
        let heap = Heap::new(HeapSettings {
            stress_gc: true,
            ..Default::default()
        });
        assert!(heap.should_collect());

        let heap = Heap::new(HeapSettings::default());
        assert!(!heap.should_collect());
    }
}
