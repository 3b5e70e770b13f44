//! Mutable growable sequence of values (spec §3, §4.C).
//!
//! Lives in the traced heap (`GcRef<ArrayKind>`) rather than behind a plain
//! `Arc` like `Tuple`, because — unlike a tuple — an array can be mutated
//! after construction, including into a state where it references itself.

use janet_core::Value;

const GROWTH_FACTOR: usize = 2;
const MAX_CAPACITY: usize = i32::MAX as usize;

#[derive(Debug, Default)]
pub struct ArrayData {
    data: Vec<Value>,
    /// Weak array (spec §4.B): elements don't keep their referents alive;
    /// the GC's weak-heap pre-pass nils out entries that go unreachable.
    pub weak: bool,
}

impl ArrayData {
    pub fn new(capacity: usize) -> Self {
        ArrayData {
            data: Vec::with_capacity(capacity.min(MAX_CAPACITY)),
            weak: false,
        }
    }

    pub fn from_values(values: Vec<Value>) -> Self {
        ArrayData { data: values, weak: false }
    }

    pub fn count(&self) -> usize {
        self.data.len()
    }

    pub fn capacity(&self) -> usize {
        self.data.capacity()
    }

    pub fn as_slice(&self) -> &[Value] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [Value] {
        &mut self.data
    }

    pub fn push(&mut self, v: Value) {
        self.ensure(self.count() + 1, GROWTH_FACTOR);
        self.data.push(v);
    }

    pub fn pop(&mut self) -> Option<Value> {
        self.data.pop()
    }

    pub fn peek(&self) -> Option<&Value> {
        self.data.last()
    }

    /// Grow (or shrink) to exactly `n` elements, nil-filling new slots.
    pub fn set_count(&mut self, n: usize) {
        if n < self.data.len() {
            self.data.truncate(n);
        } else {
            self.data.resize(n, Value::Nil);
        }
    }

    /// Geometric growth, saturating at `MAX_CAPACITY` (spec §3/§4.C).
    pub fn ensure(&mut self, min_capacity: usize, growth: usize) {
        if self.data.capacity() >= min_capacity {
            return;
        }
        let growth = growth.max(2);
        let mut new_cap = self.data.capacity().max(4);
        while new_cap < min_capacity && new_cap < MAX_CAPACITY {
            new_cap = (new_cap * growth).min(MAX_CAPACITY);
        }
        let additional = new_cap.saturating_sub(self.data.len());
        self.data.reserve(additional);
    }

    pub fn insert(&mut self, at: usize, values: &[Value]) {
        let at = at.min(self.data.len());
        self.ensure(self.data.len() + values.len(), GROWTH_FACTOR);
        self.data.splice(at..at, values.iter().cloned());
    }

    pub fn remove(&mut self, at: usize, n: usize) -> Vec<Value> {
        let end = (at + n).min(self.data.len());
        if at >= self.data.len() {
            return Vec::new();
        }
        self.data.splice(at..end, std::iter::empty()).collect()
    }

    /// `slice(range)`: half-open `[start, end)`, negative indices from
    /// `len`, `end = -1` meaning `len` (spec §4.C).
    pub fn slice(&self, start: i64, end: i64) -> Vec<Value> {
        let len = self.data.len() as i64;
        let resolve = |i: i64| -> usize {
            let i = if i < 0 { len + i + 1 } else { i };
            i.clamp(0, len) as usize
        };
        let start = resolve(start).min(self.data.len());
        let end = if end == -1 {
            self.data.len()
        } else {
            resolve(end).min(self.data.len())
        };
        let end = end.max(start);
        self.data[start..end].to_vec()
    }

    pub fn get_index(&self, index: i64) -> Option<&Value> {
        if index < 0 {
            return None;
        }
        self.data.get(index as usize)
    }

    pub fn put_index(&mut self, index: i64, value: Value) -> bool {
        if index < 0 || index as usize >= self.data.len() {
            return false;
        }
        self.data[index as usize] = value;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_pop_roundtrip() {
        let mut a = ArrayData::new(0);
        a.push(Value::number(1.0));
        a.push(Value::number(2.0));
        assert_eq!(a.count(), 2);
        assert_eq!(a.pop(), Some(Value::number(2.0)));
        assert_eq!(a.count(), 1);
    }

    #[test]
    fn set_count_nil_fills() {
        let mut a = ArrayData::new(0);
        a.set_count(3);
        assert_eq!(a.count(), 3);
        assert!(a.get_index(2).unwrap().equals(&Value::Nil));
    }

    #[test]
    fn geometric_growth() {
        let mut a = ArrayData::new(1);
        let starting_cap = a.capacity();
        a.ensure(1000, 2);
        assert!(a.capacity() >= 1000);
        assert!(a.capacity() >= starting_cap);
    }

    #[test]
    fn insert_and_remove() {
        let mut a = ArrayData::new(0);
        a.push(Value::number(1.0));
        a.push(Value::number(3.0));
        a.insert(1, &[Value::number(2.0)]);
        assert_eq!(a.count(), 3);
        assert_eq!(a.get_index(1).unwrap().unwrap_number(), Some(2.0));

        let removed = a.remove(0, 2);
        assert_eq!(removed.len(), 2);
        assert_eq!(a.count(), 1);
    }

    #[test]
    fn slice_negative_indices() {
        let mut a = ArrayData::new(0);
        for i in 0..5 {
            a.push(Value::number(i as f64));
        }
        let s = a.slice(-3, -1);
        assert_eq!(s.len(), 2);
        assert_eq!(s[0].unwrap_number(), Some(2.0));
    }

    #[test]
    fn out_of_range_get_is_none_put_is_false() {
        let mut a = ArrayData::new(0);
        a.push(Value::number(1.0));
        assert!(a.get_index(5).is_none());
        assert!(!a.put_index(5, Value::number(2.0)));
    }
}
