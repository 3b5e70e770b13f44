//! Verified, immutable function bodies (spec §4.D, §4.F).
//!
//! A `FuncDef` is the output of the assembler (or of a future compiler
//! front end, out of scope here): bytecode plus the side tables the
//! interpreter needs to run it safely. It is built once and never mutated,
//! so — like `Tuple`/`Struct` — it is a plain `Arc`, not a `GcRef`; unlike
//! those, the interpreter never mutates one after `verify` succeeds, so
//! there's no builder/begin-end ceremony, just a plain struct literal.

use std::sync::Arc;

use janet_core::Value;

use crate::error::VmError;

/// An entry in a `FuncDef`'s `environments` table (spec §4.D step 2):
/// `OnStack` captures the enclosing activation's own frame; `Shared(k)`
/// reuses the `k`-th environment already held by the enclosing function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvSource {
    OnStack,
    Shared(u32),
}

#[derive(Debug, Clone)]
pub struct FuncDefData {
    pub name: Option<String>,
    pub source: Option<String>,
    pub source_path: Option<String>,
    pub arity: u32,
    pub min_arity: u32,
    pub max_arity: u32,
    pub vararg: bool,
    pub slot_count: u32,
    pub constants: Vec<Value>,
    pub child_defs: Vec<FuncDef>,
    pub environments: Vec<EnvSource>,
    /// Which slots of an on-stack capture remain live after the owning
    /// frame returns (spec §4.D step 3); `None` means "all slots live".
    pub closure_bitset: Option<Vec<bool>>,
    pub bytecode: Vec<u32>,
    /// Per-instruction `(line, column)`, parallel to `bytecode`.
    pub source_map: Vec<(u32, u32)>,
    pub symbol_map: Vec<(u32, janet_core::Symbol)>,
}

pub type FuncDef = Arc<FuncDefData>;

/// Runs once over a freshly assembled def (spec §4.D "FuncDef
/// verification"): every slot/constant/child-def/environment index and
/// jump target must be in range, and the arity bounds must be sane.
pub fn verify(def: &FuncDefData) -> Result<(), VmError> {
    if def.min_arity > def.arity || def.arity > def.max_arity {
        return Err(VmError::Verification(format!(
            "arity bounds out of order: min {} <= arity {} <= max {} does not hold",
            def.min_arity, def.arity, def.max_arity
        )));
    }

    let len = def.bytecode.len() as u32;
    for (i, &word) in def.bytecode.iter().enumerate() {
        let op = crate::opcodes::Op::decode(word).ok_or_else(|| {
            VmError::Verification(format!("instruction {i} has unknown opcode"))
        })?;
        for slot in op.referenced_slots() {
            if slot >= def.slot_count {
                return Err(VmError::Verification(format!(
                    "instruction {i} references out-of-range slot {slot} (slotcount {})",
                    def.slot_count
                )));
            }
        }
        if let Some(c) = op.constant_index() {
            if c as usize >= def.constants.len() {
                return Err(VmError::Verification(format!(
                    "instruction {i} references out-of-range constant {c}"
                )));
            }
        }
        if let Some(d) = op.child_def_index() {
            if d as usize >= def.child_defs.len() {
                return Err(VmError::Verification(format!(
                    "instruction {i} references out-of-range child def {d}"
                )));
            }
        }
        if let Some(e) = op.env_index() {
            if e as usize >= def.environments.len() {
                return Err(VmError::Verification(format!(
                    "instruction {i} references out-of-range environment {e}"
                )));
            }
        }
        if let Some(target) = op.jump_target(i as i64) {
            if target < 0 || target as u32 >= len {
                return Err(VmError::Verification(format!(
                    "instruction {i} jumps to out-of-range target {target}"
                )));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn empty_def() -> FuncDefData {
        FuncDefData {
            name: None,
            source: None,
            source_path: None,
            arity: 0,
            min_arity: 0,
            max_arity: 0,
            vararg: false,
            slot_count: 1,
            constants: Vec::new(),
            child_defs: Vec::new(),
            environments: Vec::new(),
            closure_bitset: None,
            bytecode: vec![crate::opcodes::Op::ReturnNil.encode()],
            source_map: vec![(1, 0)],
            symbol_map: Vec::new(),
        }
    }

    #[test]
    fn verify_accepts_well_formed_def() {
        assert!(verify(&empty_def()).is_ok());
    }

    #[test]
    fn verify_rejects_bad_arity_bounds() {
        let mut def = empty_def();
        def.min_arity = 2;
        def.max_arity = 1;
        def.arity = 1;
        assert!(verify(&def).is_err());
    }

    #[test]
    fn verify_rejects_out_of_range_constant() {
        let mut def = empty_def();
        def.bytecode = vec![crate::opcodes::Op::LoadConstant { dest: 0, constant: 0 }.encode()];
        assert!(verify(&def).is_err());
    }
}
