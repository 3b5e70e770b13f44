//! Immutable, hash-consable tuples (spec §3, §4.C).
//!
//! Built bottom-up via `TupleBuilder::begin(n) / put / end`, exactly as the
//! spec requires ("slots must be filled before `end`"). Because a tuple can
//! only reference values that already existed at the time it was built, a
//! tree of tuples is acyclic by construction — which is what lets this type
//! be a plain `Arc` rather than a heap-slab `GcRef` (see the crate-level
//! doc comment).

use std::fmt;
use std::sync::Arc;

use crate::value::Value;

/// Parens vs. brackets, carried through for round-tripping by the
/// assembler/disassembler (spec §3's "bracket-kind flag").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BracketKind {
    Paren,
    Bracket,
}

#[derive(Debug)]
struct TupleData {
    values: Box<[Value]>,
    hash: u64,
    source_line: u32,
    source_column: u32,
    bracket: BracketKind,
}

fn hash_values<'a>(values: impl Iterator<Item = &'a Value>) -> u64 {
    // Order-sensitive combination (tuples are ordered, unlike structs).
    let mut h: u64 = 0xcbf2_9ce4_8422_2325;
    for v in values {
        h ^= v.value_hash();
        h = h.wrapping_mul(0x0000_0100_0000_01b3);
    }
    h
}

/// An immutable, fixed-length, ordered sequence of values.
#[derive(Debug, Clone)]
pub struct Tuple(Arc<TupleData>);

impl Tuple {
    pub fn as_slice(&self) -> &[Value] {
        &self.0.values
    }

    pub fn len(&self) -> usize {
        self.0.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.values.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Value> {
        self.0.values.get(index)
    }

    pub fn precomputed_hash(&self) -> u64 {
        self.0.hash
    }

    pub fn source_location(&self) -> (u32, u32) {
        (self.0.source_line, self.0.source_column)
    }

    pub fn bracket_kind(&self) -> BracketKind {
        self.0.bracket
    }

    /// Identity of the backing allocation, stable for the life of this
    /// `Arc` clone family. Used by the marshal format's shared-object table
    /// to detect repeated tuple inputs (spec §6 "reconstruct sharing").
    pub fn ptr_identity(&self) -> usize {
        Arc::as_ptr(&self.0) as usize
    }

    /// `slice(range)`: half-open `[start, end)`, negative indices counted
    /// from `len`, `end = -1` meaning `len` (spec §4.C).
    pub fn slice(&self, start: i64, end: i64) -> Tuple {
        let len = self.len() as i64;
        let resolve = |i: i64| -> usize {
            let i = if i < 0 { len + i + 1 } else { i };
            i.clamp(0, len) as usize
        };
        let start = resolve(start).min(self.len());
        let end = if end == -1 {
            self.len()
        } else {
            resolve(end).min(self.len())
        };
        let end = end.max(start);
        let mut b = TupleBuilder::begin(end - start);
        for v in &self.0.values[start..end] {
            b.put(v.clone());
        }
        b.end(BracketKind::Paren)
    }

    /// Produce a new tuple with `v` prepended.
    pub fn prepend(&self, v: Value) -> Tuple {
        let mut b = TupleBuilder::begin(self.len() + 1);
        b.put(v);
        for item in self.0.values.iter() {
            b.put(item.clone());
        }
        b.end(self.0.bracket)
    }

    /// Produce a new tuple with `v` appended.
    pub fn append(&self, v: Value) -> Tuple {
        let mut b = TupleBuilder::begin(self.len() + 1);
        for item in self.0.values.iter() {
            b.put(item.clone());
        }
        b.put(v);
        b.end(self.0.bracket)
    }
}

impl PartialEq for Tuple {
    fn eq(&self, other: &Self) -> bool {
        self.0.hash == other.0.hash && self.0.values == other.0.values
    }
}
impl Eq for Tuple {}

impl PartialOrd for Tuple {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Tuple {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        for (a, b) in self.0.values.iter().zip(other.0.values.iter()) {
            match a.cmp(b) {
                std::cmp::Ordering::Equal => continue,
                other => return other,
            }
        }
        self.len().cmp(&other.len())
    }
}

impl fmt::Display for Tuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (open, close) = match self.0.bracket {
            BracketKind::Paren => ("(", ")"),
            BracketKind::Bracket => ("[", "]"),
        };
        write!(f, "{open}")?;
        for (i, v) in self.0.values.iter().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            write!(f, "{v}")?;
        }
        write!(f, "{close}")
    }
}

/// Builder for a `Tuple`, used by both the interpreter's `MAKE_TUPLE`
/// opcode and the assembler's constant-pool construction.
pub struct TupleBuilder {
    values: Vec<Value>,
    source_line: u32,
    source_column: u32,
}

impl TupleBuilder {
    pub fn begin(capacity: usize) -> Self {
        TupleBuilder {
            values: Vec::with_capacity(capacity),
            source_line: 0,
            source_column: 0,
        }
    }

    pub fn with_source(mut self, line: u32, column: u32) -> Self {
        self.source_line = line;
        self.source_column = column;
        self
    }

    pub fn put(&mut self, v: Value) -> &mut Self {
        self.values.push(v);
        self
    }

    pub fn end(self, bracket: BracketKind) -> Tuple {
        let hash = hash_values(self.values.iter());
        Tuple(Arc::new(TupleData {
            values: self.values.into_boxed_slice(),
            hash,
            source_line: self.source_line,
            source_column: self.source_column,
            bracket,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(values: &[i64]) -> Tuple {
        let mut b = TupleBuilder::begin(values.len());
        for &v in values {
            b.put(Value::number(v as f64));
        }
        b.end(BracketKind::Paren)
    }

    #[test]
    fn equal_content_equal_hash() {
        let a = t(&[1, 2, 3]);
        let b = t(&[1, 2, 3]);
        assert_eq!(a, b);
        assert_eq!(a.precomputed_hash(), b.precomputed_hash());
    }

    #[test]
    fn order_matters() {
        let a = t(&[1, 2]);
        let b = t(&[2, 1]);
        assert_ne!(a, b);
    }

    #[test]
    fn slice_half_open() {
        let a = t(&[10, 20, 30, 40]);
        let s = a.slice(1, 3);
        assert_eq!(s.len(), 2);
        assert_eq!(s.get(0).unwrap().unwrap_number().unwrap(), 20.0);
    }

    #[test]
    fn slice_negative_end() {
        let a = t(&[10, 20, 30]);
        let s = a.slice(0, -1);
        assert_eq!(s.len(), 3);
    }

    #[test]
    fn append_and_prepend() {
        let a = t(&[2, 3]);
        let appended = a.append(Value::number(4.0));
        assert_eq!(appended.len(), 3);
        assert_eq!(appended.get(2).unwrap().unwrap_number().unwrap(), 4.0);

        let prepended = a.prepend(Value::number(1.0));
        assert_eq!(prepended.get(0).unwrap().unwrap_number().unwrap(), 1.0);
    }

    #[test]
    fn total_order_transitive() {
        let a = t(&[1]);
        let b = t(&[1, 2]);
        let c = t(&[2]);
        assert!(a < b);
        assert!(b < c);
        assert!(a < c);
    }
}
