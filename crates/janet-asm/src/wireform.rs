//! Symbolic `FuncDef` wire form (spec §4.F, §6 "FuncDef wire form").
//!
//! This is the in-memory shape the assembler consumes and the
//! disassembler produces: slot/constant/label names instead of resolved
//! indices, mirroring the dictionary of recognized keys the spec
//! describes. There is no text reader behind this — building a
//! `WireFuncDef` (by hand, or from some future host-language front end)
//! is the boundary this crate sits behind; `assemble`/`disassemble` only
//! deal with this already-parsed, already-typed Rust value.

use janet_core::Value;

/// One recognized argument shape, used by the mnemonic table to resolve
/// a symbolic [`Operand`] into the raw integer `opcodes::Op` needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgKind {
    /// A slot index.
    Slot,
    /// A raw signed/unsigned immediate, used as-is.
    Imm,
    /// An index into the enclosing def's constant pool.
    ConstIdx,
    /// An index into the enclosing def's environment table.
    EnvIdx,
    /// An index into the enclosing def's nested-closure table.
    ChildIdx,
    /// A label reference, resolved to a signed offset relative to the
    /// *next* instruction once every instruction's absolute position is
    /// known (spec §4.E: "relative to next instr").
    JumpOffset,
    /// A type-mask alias symbol or tuple-of-symbols (spec §4.F's fixed
    /// alias table).
    TypeMask,
}

/// A named (or anonymous) slot declaration; the position in
/// [`WireFuncDef::slots`] is the slot's index.
#[derive(Debug, Clone, Default)]
pub struct SlotDecl {
    pub names: Vec<String>,
}

impl SlotDecl {
    pub fn named(name: impl Into<String>) -> Self {
        SlotDecl { names: vec![name.into()] }
    }

    pub fn anonymous() -> Self {
        SlotDecl::default()
    }
}

/// `constants` entries: `(quote x)` or `(def name x)` per spec §6. Since
/// this crate's wire form is already-typed data rather than host
/// s-expressions, `quote` has already done its job by construction time —
/// both variants carry a plain [`Value`], kept distinct only so a
/// disassembler built later has somewhere to put the distinction back.
#[derive(Debug, Clone)]
pub enum ConstantExpr {
    Quote(Value),
    Literal(Value),
}

impl ConstantExpr {
    pub fn value(&self) -> &Value {
        match self {
            ConstantExpr::Quote(v) | ConstantExpr::Literal(v) => v,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConstantDecl {
    pub name: Option<String>,
    pub expr: ConstantExpr,
}

impl ConstantDecl {
    pub fn anonymous(v: Value) -> Self {
        ConstantDecl { name: None, expr: ConstantExpr::Literal(v) }
    }

    pub fn named(name: impl Into<String>, v: Value) -> Self {
        ConstantDecl { name: Some(name.into()), expr: ConstantExpr::Literal(v) }
    }
}

/// An `environments` entry (spec silent on this key's wire shape; see
/// `DESIGN.md` for the resolution). Mirrors `funcdef::EnvSource`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvSourceDecl {
    OnStack,
    Shared(u32),
}

/// One resolvable operand in a symbolic instruction tuple.
#[derive(Debug, Clone)]
pub enum Operand {
    SlotName(String),
    SlotIndex(u32),
    ConstName(String),
    ConstIndex(u32),
    EnvIndex(u32),
    ChildIndex(u32),
    Label(String),
    Imm(i64),
    /// Symbols from the fixed type-mask alias table (spec §4.F).
    TypeMask(Vec<String>),
}

#[derive(Debug, Clone)]
pub struct Instruction {
    pub mnemonic: String,
    pub args: Vec<Operand>,
}

impl Instruction {
    pub fn new(mnemonic: impl Into<String>, args: Vec<Operand>) -> Self {
        Instruction { mnemonic: mnemonic.into(), args }
    }
}

/// `bytecode` is a sequence interleaving instruction tuples and bare label
/// symbols; labels do not occupy bytecode positions (spec §4.F).
#[derive(Debug, Clone)]
pub enum BytecodeItem {
    Label(String),
    Instruction(Instruction),
}

/// The symbolic struct the assembler consumes (spec §6 "FuncDef wire
/// form").
#[derive(Debug, Clone)]
pub struct WireFuncDef {
    pub name: Option<String>,
    pub arity: u32,
    pub min_arity: Option<u32>,
    pub max_arity: Option<u32>,
    pub vararg: bool,
    pub source: Option<String>,
    pub source_path: Option<String>,
    pub slots: Vec<SlotDecl>,
    pub constants: Vec<ConstantDecl>,
    pub closures: Vec<WireFuncDef>,
    pub bytecode: Vec<BytecodeItem>,
    pub sourcemap: Vec<(u32, u32)>,
    /// Empty means "auto-derive from the highest env index referenced by
    /// `ldup`/`stup`", per the open-question resolution in `DESIGN.md`.
    pub environments: Vec<EnvSourceDecl>,
    pub closure_bitset: Option<Vec<bool>>,
}

impl WireFuncDef {
    pub fn new(name: impl Into<String>, arity: u32) -> Self {
        WireFuncDef {
            name: Some(name.into()),
            arity,
            min_arity: None,
            max_arity: None,
            vararg: false,
            source: None,
            source_path: None,
            slots: Vec::new(),
            constants: Vec::new(),
            closures: Vec::new(),
            bytecode: Vec::new(),
            sourcemap: Vec::new(),
            environments: Vec::new(),
            closure_bitset: None,
        }
    }
}

/// The fixed type-mask alias table (spec §4.F, verbatim order).
pub const TYPE_ALIASES: &[&str] = &[
    "nil",
    "boolean",
    "number",
    "string",
    "symbol",
    "keyword",
    "array",
    "tuple",
    "table",
    "struct",
    "buffer",
    "function",
    "cfunction",
    "abstract",
    "fiber",
    "indexed",
    "dictionary",
    "bytes",
    "callable",
];
