//! Value-level errors: failures that can be diagnosed from a `Value` alone,
//! without consulting the heap or a running fiber. Hand-rolled enum with a
//! manual `Display`/`Error` impl, matching the rest of the corpus rather
//! than pulling in `thiserror`.

use std::fmt;

use crate::value::TypeTag;

#[derive(Debug, Clone, PartialEq)]
pub enum CoreError {
    /// `length` called on a type that has no defined length (spec §4.A).
    NoLength(TypeTag),
    /// A key used in a `Table`/`Struct` lookup or `put_index` was of a type
    /// that cannot be hashed as a key (currently: only `Value::Pointer`
    /// indirection onto a value carrying NaN survives, so this is reserved
    /// for future abstract-key kinds; kept so `put` has a total error type).
    NotHashable(TypeTag),
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoreError::NoLength(tag) => write!(f, "no length defined for type {tag:?}"),
            CoreError::NotHashable(tag) => write!(f, "value of type {tag:?} is not hashable"),
        }
    }
}

impl std::error::Error for CoreError {}
