//! Immutable, hash-consable structs (spec §3, §4.C).
//!
//! A struct is a small immutable dictionary. Built via
//! `StructBuilder::begin(n) / put / end`, which canonicalizes the
//! (key, value) pairs before freezing them so that two structs built from
//! the same multiset of pairs, in any insertion order, compare equal and
//! share the same hash (spec: "Two structs with the same (key→value)
//! multiset compare equal and share hash").
//!
//! Canonicalization order (spec §9 open question, resolved here): pairs are
//! sorted by the key's precomputed hash, ties broken by `Value::compare` on
//! the key. Hash is computed commutatively over `(key_hash ^ value_hash)`
//! pairs so that it does not depend on the (already-canonical, but
//! defense-in-depth) ordering.

use std::fmt;
use std::sync::Arc;

use crate::value::Value;

#[derive(Debug)]
struct StructData {
    // Canonical order: sorted by (key.hash(), key) as described above.
    pairs: Box<[(Value, Value)]>,
    hash: u64,
    proto: Option<Struct>,
}

fn canonical_order(a: &Value, b: &Value) -> std::cmp::Ordering {
    a.value_hash().cmp(&b.value_hash()).then_with(|| a.cmp(b))
}

fn commutative_hash<'a>(pairs: impl Iterator<Item = &'a (Value, Value)>) -> u64 {
    let mut h: u64 = 0;
    for (k, v) in pairs {
        h ^= k.value_hash() ^ v.value_hash().rotate_left(17);
    }
    h
}

/// An immutable dictionary with an optional immutable prototype link.
#[derive(Debug, Clone)]
pub struct Struct(Arc<StructData>);

impl Struct {
    pub fn len(&self) -> usize {
        self.0.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.pairs.is_empty()
    }

    pub fn precomputed_hash(&self) -> u64 {
        self.0.hash
    }

    pub fn proto(&self) -> Option<&Struct> {
        self.0.proto.as_ref()
    }

    fn rawget(&self, key: &Value) -> Option<&Value> {
        self.0
            .pairs
            .binary_search_by(|(k, _)| canonical_order(k, key))
            .ok()
            .map(|idx| &self.0.pairs[idx].1)
    }

    /// `get(k)`: walks the optional `proto` chain (spec §4.C).
    pub fn get(&self, key: &Value) -> Option<&Value> {
        if let Some(v) = self.rawget(key) {
            return Some(v);
        }
        self.0.proto.as_ref().and_then(|p| p.get(key))
    }

    pub fn pairs(&self) -> impl Iterator<Item = &(Value, Value)> {
        self.0.pairs.iter()
    }

    /// Identity of the backing allocation, used by the marshal format's
    /// shared-object table (spec §6 "reconstruct sharing").
    pub fn ptr_identity(&self) -> usize {
        Arc::as_ptr(&self.0) as usize
    }
}

impl PartialEq for Struct {
    fn eq(&self, other: &Self) -> bool {
        self.0.hash == other.0.hash && self.0.pairs == other.0.pairs
    }
}
impl Eq for Struct {}

impl PartialOrd for Struct {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Struct {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // "Structs by sorted-key sequence then value" (spec §4.A); pairs are
        // already stored in canonical order, so a lexicographic comparison
        // of the pair sequence is exactly that.
        self.0.pairs.cmp(&other.0.pairs)
    }
}

impl fmt::Display for Struct {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, (k, v)) in self.0.pairs.iter().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            write!(f, "{k} {v}")?;
        }
        write!(f, "}}")
    }
}

/// Builder for a `Struct`. `put` with a duplicate key overwrites the
/// earlier value, matching table `put` semantics during construction.
pub struct StructBuilder {
    pairs: Vec<(Value, Value)>,
}

impl StructBuilder {
    pub fn begin(capacity: usize) -> Self {
        StructBuilder {
            pairs: Vec::with_capacity(capacity),
        }
    }

    pub fn put(&mut self, key: Value, value: Value) -> &mut Self {
        if let Some(existing) = self.pairs.iter_mut().find(|(k, _)| *k == key) {
            existing.1 = value;
        } else {
            self.pairs.push((key, value));
        }
        self
    }

    pub fn end(self) -> Struct {
        self.end_with_proto(None)
    }

    pub fn end_with_proto(mut self, proto: Option<Struct>) -> Struct {
        self.pairs.sort_by(|(a, _), (b, _)| canonical_order(a, b));
        let hash = commutative_hash(self.pairs.iter());
        Struct(Arc::new(StructData {
            pairs: self.pairs.into_boxed_slice(),
            hash,
            proto,
        }))
    }
}
