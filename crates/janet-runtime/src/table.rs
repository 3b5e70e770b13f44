//! Mutable hash table, open addressing with linear probing, tombstones,
//! and an optional prototype chain (spec §3, §4.A, §4.C).
//!
//! No direct teacher analog exists for an open-addressed table in the
//! corpus, so the probing/tombstone/rehash logic here is built fresh from
//! the spec, in the same doc-comment-plus-`#[cfg(test)]` texture as the
//! rest of this crate.

use janet_core::value::TableRef;
use janet_core::Value;

use crate::gc::Heap;

pub const MAX_PROTO_DEPTH: u32 = 200;
const LOAD_FACTOR_NUM: usize = 2;
const LOAD_FACTOR_DEN: usize = 3;

#[derive(Clone)]
enum Slot {
    Empty,
    Tombstone,
    Occupied(Value, Value),
}

/// Which side(s) of a table's entries the GC's weak-heap pre-pass should
/// prune once the other side becomes unreachable (spec §4.B).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WeakKind {
    #[default]
    None,
    Key,
    Value,
    Both,
}

pub struct TableData {
    slots: Vec<Slot>,
    count: usize,
    deleted: usize,
    pub proto: Option<TableRef>,
    pub weak: WeakKind,
}

impl TableData {
    pub fn new(capacity: usize) -> Self {
        TableData {
            slots: vec![Slot::Empty; capacity.next_power_of_two().max(8)],
            count: 0,
            deleted: 0,
            proto: None,
            weak: WeakKind::None,
        }
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn deleted(&self) -> usize {
        self.deleted
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn probe(&self, key: &Value) -> usize {
        let cap = self.slots.len();
        let mut idx = (key.value_hash() as usize) & (cap - 1);
        let mut first_tombstone = None;
        loop {
            match &self.slots[idx] {
                Slot::Empty => return first_tombstone.unwrap_or(idx),
                Slot::Tombstone => {
                    if first_tombstone.is_none() {
                        first_tombstone = Some(idx);
                    }
                }
                Slot::Occupied(k, _) if k == key => return idx,
                Slot::Occupied(_, _) => {}
            }
            idx = (idx + 1) & (cap - 1);
        }
    }

    fn find_occupied(&self, key: &Value) -> Option<usize> {
        let cap = self.slots.len();
        let mut idx = (key.value_hash() as usize) & (cap - 1);
        let mut steps = 0;
        while steps < cap {
            match &self.slots[idx] {
                Slot::Empty => return None,
                Slot::Occupied(k, _) if k == key => return Some(idx),
                _ => {}
            }
            idx = (idx + 1) & (cap - 1);
            steps += 1;
        }
        None
    }

    /// `rawget`: lookup with no prototype chase.
    pub fn rawget(&self, key: &Value) -> Option<&Value> {
        self.find_occupied(key).map(|idx| match &self.slots[idx] {
            Slot::Occupied(_, v) => v,
            _ => unreachable!(),
        })
    }

    /// `get`: walks the optional `proto` chain, bounded by
    /// `MAX_PROTO_DEPTH` (spec §4.A).
    pub fn get(&self, heap: &Heap, key: &Value) -> Option<Value> {
        if let Some(v) = self.rawget(key) {
            return Some(v.clone());
        }
        let mut proto = self.proto;
        let mut depth = 0;
        while let Some(p) = proto {
            if depth >= MAX_PROTO_DEPTH {
                return None;
            }
            let table = heap.tables.get(p)?;
            if let Some(v) = table.rawget(key) {
                return Some(v.clone());
            }
            proto = table.proto;
            depth += 1;
        }
        None
    }

    fn rehash(&mut self, new_capacity: usize) {
        let old = std::mem::replace(&mut self.slots, vec![Slot::Empty; new_capacity]);
        self.deleted = 0;
        for slot in old {
            if let Slot::Occupied(k, v) = slot {
                let idx = self.probe(&k);
                self.slots[idx] = Slot::Occupied(k, v);
            }
        }
    }

    fn maybe_grow(&mut self) {
        if (self.count + self.deleted) * LOAD_FACTOR_DEN >= self.slots.len() * LOAD_FACTOR_NUM {
            let new_cap = if self.count * 2 >= self.slots.len() {
                self.slots.len() * 2
            } else {
                self.slots.len() // pure tombstone cleanup, same size
            };
            self.rehash(new_cap);
        }
    }

    /// `put`: putting a `nil` value deletes; putting a `nil` key is a
    /// caller error (spec §4.C) — checked by the interpreter before
    /// calling this, so this method assumes `key` is not `Value::Nil`.
    pub fn put(&mut self, key: Value, value: Value) {
        if matches!(value, Value::Nil) {
            self.remove(&key);
            return;
        }
        self.maybe_grow();
        let idx = self.probe(&key);
        let was_tombstone_or_empty = !matches!(self.slots[idx], Slot::Occupied(_, _));
        if was_tombstone_or_empty {
            self.count += 1;
        }
        self.slots[idx] = Slot::Occupied(key, value);
    }

    pub fn remove(&mut self, key: &Value) -> Option<Value> {
        let idx = self.find_occupied(key)?;
        let removed = std::mem::replace(&mut self.slots[idx], Slot::Tombstone);
        self.count -= 1;
        self.deleted += 1;
        match removed {
            Slot::Occupied(_, v) => Some(v),
            _ => unreachable!(),
        }
    }

    pub fn find(&self, key: &Value) -> Option<(&Value, &Value)> {
        self.find_occupied(key).map(|idx| match &self.slots[idx] {
            Slot::Occupied(k, v) => (k, v),
            _ => unreachable!(),
        })
    }

    /// Iteration cursor: `next(cursor)` walks occupied slots in storage
    /// order. `None` starts the iteration; returns the key found, or
    /// `None` when exhausted.
    pub fn next_key(&self, cursor: Option<&Value>) -> Option<&Value> {
        let start = match cursor {
            None => 0,
            Some(k) => self.find_occupied(k).map(|i| i + 1)?,
        };
        self.slots[start..].iter().find_map(|s| match s {
            Slot::Occupied(k, _) => Some(k),
            _ => None,
        })
    }

    pub fn entries(&self) -> impl Iterator<Item = (&Value, &Value)> {
        self.slots.iter().filter_map(|s| match s {
            Slot::Occupied(k, v) => Some((k, v)),
            _ => None,
        })
    }

    /// Deep-copy of structure (fresh slot array), shallow of values (spec
    /// §4.C "clone").
    pub fn clone_structure(&self) -> TableData {
        let mut copy = TableData::new(self.slots.len());
        for (k, v) in self.entries() {
            copy.put(k.clone(), v.clone());
        }
        copy.proto = self.proto;
        copy.weak = self.weak;
        copy
    }

    pub fn merge_from(&mut self, other: &TableData) {
        for (k, v) in other.entries() {
            self.put(k.clone(), v.clone());
        }
    }

    /// Immutable snapshot of the current key/value pairs (spec §4.C
    /// "to_struct"). Entries added or removed afterward are not reflected.
    pub fn to_struct(&self) -> janet_core::Struct {
        let mut builder = janet_core::StructBuilder::begin(self.count);
        for (k, v) in self.entries() {
            builder.put(k.clone(), v.clone());
        }
        builder.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_get_roundtrip() {
        let mut t = TableData::new(4);
        t.put(Value::string("k"), Value::number(1.0));
        assert_eq!(t.rawget(&Value::string("k")), Some(&Value::number(1.0)));
    }

    #[test]
    fn put_nil_value_deletes() {
        let mut t = TableData::new(4);
        t.put(Value::string("k"), Value::number(1.0));
        t.put(Value::string("k"), Value::Nil);
        assert_eq!(t.rawget(&Value::string("k")), None);
        assert_eq!(t.count(), 0);
    }

    #[test]
    fn tombstones_counted_in_deleted() {
        let mut t = TableData::new(4);
        t.put(Value::string("k"), Value::number(1.0));
        t.remove(&Value::string("k"));
        assert_eq!(t.deleted(), 1);
        assert_eq!(t.count(), 0);
    }

    #[test]
    fn rehash_preserves_entries() {
        let mut t = TableData::new(4);
        for i in 0..50 {
            t.put(Value::number(i as f64), Value::number((i * 2) as f64));
        }
        assert_eq!(t.count(), 50);
        for i in 0..50 {
            assert_eq!(
                t.rawget(&Value::number(i as f64)),
                Some(&Value::number((i * 2) as f64))
            );
        }
    }

    #[test]
    fn merge_from_overwrites() {
        let mut a = TableData::new(4);
        a.put(Value::string("x"), Value::number(1.0));
        let mut b = TableData::new(4);
        b.put(Value::string("x"), Value::number(2.0));
        b.put(Value::string("y"), Value::number(3.0));
        a.merge_from(&b);
        assert_eq!(a.rawget(&Value::string("x")), Some(&Value::number(2.0)));
        assert_eq!(a.rawget(&Value::string("y")), Some(&Value::number(3.0)));
    }

    #[test]
    fn to_struct_snapshots_current_entries() {
        let mut t = TableData::new(4);
        t.put(Value::string("x"), Value::number(1.0));
        t.put(Value::string("y"), Value::number(2.0));
        let snap = t.to_struct();
        assert_eq!(snap.len(), 2);
        assert_eq!(snap.get(&Value::string("x")), Some(&Value::number(1.0)));
        assert_eq!(snap.get(&Value::string("y")), Some(&Value::number(2.0)));

        t.put(Value::string("z"), Value::number(3.0));
        assert_eq!(snap.len(), 2, "snapshot must not see later mutations");
    }

    #[test]
    fn cursor_iteration_visits_every_entry_once() {
        let mut t = TableData::new(4);
        t.put(Value::number(1.0), Value::number(10.0));
        t.put(Value::number(2.0), Value::number(20.0));
        t.put(Value::number(3.0), Value::number(30.0));

        let mut seen = Vec::new();
        let mut cursor = None;
        loop {
            match t.next_key(cursor.as_ref()) {
                Some(k) => {
                    seen.push(k.clone());
                    cursor = Some(k.clone());
                }
                None => break,
            }
        }
        assert_eq!(seen.len(), 3);
    }
}
