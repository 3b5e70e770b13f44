//! A generic, growable slot array addressed by `(index, generation)`.
//!
//! Generalizes `StrandRegistry`'s fixed-size slot array (each OS thread
//! claims an exclusive slot, tracked by a generation-free index) into a
//! growable heap backing store: each kind of heap object (`Array`,
//! `Buffer`, `Table`, `Function`, `Fiber`, `Abstract`) gets its own `Slab`,
//! addressed by a `janet_core::GcRef<Kind>`.
//!
//! Freed slots are pushed onto a free list and reused, with their
//! generation counter bumped so a stale handle to a reused slot is
//! detected rather than silently aliasing the wrong object (spec §4.B: the
//! GC frees unreachable objects and the design note on avoiding dangling
//! references after sweep).

use janet_core::GcRef;

/// Per-object mark-sweep bookkeeping (spec §4.B: `GCObject { flags, next
//  }`, `REACHABLE`, `DISABLED`).
#[derive(Debug, Clone, Copy, Default)]
pub struct GcHeader {
    pub reachable: bool,
    /// GC-pinned: never swept even if unreachable.
    pub disabled: bool,
}

struct Slot<T> {
    generation: u32,
    header: GcHeader,
    value: Option<T>,
}

pub struct Slab<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    pub overflow_count: u64,
}

impl<T> Default for Slab<T> {
    fn default() -> Self {
        Slab {
            slots: Vec::new(),
            free: Vec::new(),
            overflow_count: 0,
        }
    }
}

impl<T> Slab<T> {
    pub fn new() -> Self {
        Slab::default()
    }

    /// Allocate a new slot for `value`, returning a fresh handle.
    pub fn insert<Kind>(&mut self, value: T) -> GcRef<Kind> {
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.value = Some(value);
            slot.header = GcHeader::default();
            GcRef::from_raw(index, slot.generation)
        } else {
            let index = self.slots.len() as u32;
            self.slots.push(Slot {
                generation: 0,
                header: GcHeader::default(),
                value: Some(value),
            });
            GcRef::from_raw(index, 0)
        }
    }

    fn slot(&self, handle: GcRef<impl Sized>) -> Option<&Slot<T>> {
        self.slots
            .get(handle.index() as usize)
            .filter(|s| s.generation == handle.generation() && s.value.is_some())
    }

    fn slot_mut(&mut self, handle: GcRef<impl Sized>) -> Option<&mut Slot<T>> {
        self.slots
            .get_mut(handle.index() as usize)
            .filter(|s| s.generation == handle.generation() && s.value.is_some())
    }

    pub fn get<Kind>(&self, handle: GcRef<Kind>) -> Option<&T> {
        self.slot(handle).and_then(|s| s.value.as_ref())
    }

    pub fn get_mut<Kind>(&mut self, handle: GcRef<Kind>) -> Option<&mut T> {
        self.slot_mut(handle).and_then(|s| s.value.as_mut())
    }

    pub fn header<Kind>(&self, handle: GcRef<Kind>) -> Option<GcHeader> {
        self.slot(handle).map(|s| s.header)
    }

    pub fn set_reachable<Kind>(&mut self, handle: GcRef<Kind>, reachable: bool) {
        if let Some(s) = self.slot_mut(handle) {
            s.header.reachable = reachable;
        }
    }

    pub fn set_disabled<Kind>(&mut self, handle: GcRef<Kind>, disabled: bool) {
        if let Some(s) = self.slot_mut(handle) {
            s.header.disabled = disabled;
        }
    }

    /// Free every slot that is neither reachable nor GC-disabled. Returns
    /// the freed values so the caller can run type-specific deinit before
    /// dropping them (spec §4.B sweep step 3).
    pub fn sweep(&mut self) -> Vec<T> {
        let mut freed = Vec::new();
        for index in 0..self.slots.len() {
            let slot = &mut self.slots[index];
            if slot.value.is_none() {
                continue;
            }
            if slot.header.reachable || slot.header.disabled {
                slot.header.reachable = false;
                continue;
            }
            if let Some(value) = slot.value.take() {
                freed.push(value);
                slot.generation = slot.generation.wrapping_add(1);
                self.free.push(index as u32);
            }
        }
        freed
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.slots.iter().filter_map(|s| s.value.as_ref())
    }

    /// Handles for every currently-occupied slot.
    pub fn iter_refs<Kind>(&self) -> impl Iterator<Item = GcRef<Kind>> + '_ {
        self.slots.iter().enumerate().filter_map(|(i, s)| {
            s.value.as_ref().map(|_| GcRef::from_raw(i as u32, s.generation))
        })
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.value.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Kind;

    #[test]
    fn insert_and_get_roundtrip() {
        let mut slab: Slab<i32> = Slab::new();
        let handle: GcRef<Kind> = slab.insert(42);
        assert_eq!(slab.get(handle), Some(&42));
    }

    #[test]
    fn sweep_frees_unmarked_and_keeps_marked() {
        let mut slab: Slab<i32> = Slab::new();
        let a: GcRef<Kind> = slab.insert(1);
        let b: GcRef<Kind> = slab.insert(2);
        slab.set_reachable(a, true);

        let freed = slab.sweep();
        assert_eq!(freed, vec![2]);
        assert_eq!(slab.get(a), Some(&1));
        assert_eq!(slab.get(b), None);
    }

    #[test]
    fn reused_slot_bumps_generation() {
        let mut slab: Slab<i32> = Slab::new();
        let a: GcRef<Kind> = slab.insert(1);
        slab.sweep(); // a unmarked -> freed
        let b: GcRef<Kind> = slab.insert(2);
        assert_eq!(a.index(), b.index());
        assert_ne!(a.generation(), b.generation());
        assert_eq!(slab.get(a), None);
        assert_eq!(slab.get(b), Some(&2));
    }

    #[test]
    fn disabled_slot_survives_sweep_without_being_marked() {
        let mut slab: Slab<i32> = Slab::new();
        let a: GcRef<Kind> = slab.insert(99);
        slab.set_disabled(a, true);
        let freed = slab.sweep();
        assert!(freed.is_empty());
        assert_eq!(slab.get(a), Some(&99));
    }
}
