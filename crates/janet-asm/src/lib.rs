//! Symbolic assembler/disassembler for `FuncDef`s (spec §4.F).
//!
//! Sits above `janet-runtime` rather than inside it: nothing here touches
//! the heap or the interpreter, it only turns a symbolic [`WireFuncDef`]
//! into a verified `janet_runtime::FuncDef` and back.

pub mod assembler;
pub mod disassembler;
pub mod opname_table;
pub mod wireform;

pub use assembler::assemble;
pub use disassembler::disassemble;
pub use wireform::{
    ArgKind, BytecodeItem, ConstantDecl, ConstantExpr, EnvSourceDecl, Instruction, Operand,
    SlotDecl, WireFuncDef, TYPE_ALIASES,
};
