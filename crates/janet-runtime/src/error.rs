//! Runtime errors (spec §7): the ten error kinds, surfaced as a
//! hand-rolled enum with manual `Display`/`Error` impls — no `thiserror`,
//! matching `serialize.rs::SerializeError`'s idiom elsewhere in the corpus.

use std::fmt;

use janet_core::{CoreError, TypeTag};

#[derive(Debug, Clone, PartialEq)]
pub enum VmError {
    /// 1. Operand kind mismatch (e.g. arithmetic on a table).
    Type { expected: &'static str, got: TypeTag },
    /// 2. Fixed-arity function called with the wrong argument count.
    Arity { expected: (u32, u32), got: u32 },
    /// 3. Integer index out of `[0, length)`.
    Index { index: i64, length: usize },
    /// 4. Non-hashable key, or a `nil` key passed to `put`.
    Key(String),
    /// 5. Integer division by zero, or signed-integer overflow.
    Arithmetic(String),
    /// 6. `stacktop > maxstack`.
    StackOverflow,
    /// 7. Malformed `FuncDef` rejected by the verifier before execution.
    Verification(String),
    /// 8. Malformed symbolic input to the assembler.
    Assembly(String),
    /// 9. User-level `SIGNAL` opcode carrying a non-error signal code that
    ///    was not caught by any enclosing fiber's mask.
    UncaughtSignal { code: u8, value: String },
    /// 10. Externally injected error delivered on next `resume`.
    Cancellation(String),
    /// A value-model failure bubbled up from `janet-core` (length on the
    /// wrong type, etc).
    Core(CoreError),
    /// Carries an arbitrary Janet value as the error payload — the general
    /// case for user-level `panic`/`panicv` (spec §6). Stored as its
    /// `Display` rendering since `VmError` must stay plain data independent
    /// of the heap that owns the original `Value`.
    Panic(String),
}

impl fmt::Display for VmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VmError::Type { expected, got } => {
                write!(f, "type error: expected {expected}, got {got:?}")
            }
            VmError::Arity { expected, got } => write!(
                f,
                "arity error: expected {}..={} arguments, got {got}",
                expected.0, expected.1
            ),
            VmError::Index { index, length } => {
                write!(f, "index error: {index} out of bounds for length {length}")
            }
            VmError::Key(msg) => write!(f, "key error: {msg}"),
            VmError::Arithmetic(msg) => write!(f, "arithmetic error: {msg}"),
            VmError::StackOverflow => write!(f, "stack overflow"),
            VmError::Verification(msg) => write!(f, "verification error: {msg}"),
            VmError::Assembly(msg) => write!(f, "assembly error: {msg}"),
            VmError::UncaughtSignal { code, value } => {
                write!(f, "uncaught signal {code}: {value}")
            }
            VmError::Cancellation(msg) => write!(f, "cancellation: {msg}"),
            VmError::Core(e) => write!(f, "{e}"),
            VmError::Panic(msg) => write!(f, "{msg}"),
        }
    }
}

impl std::error::Error for VmError {}

impl From<CoreError> for VmError {
    fn from(e: CoreError) -> Self {
        VmError::Core(e)
    }
}
