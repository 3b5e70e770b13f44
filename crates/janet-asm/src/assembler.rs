//! Symbolic → binary assembler (spec §4.F).
//!
//! Two passes over a [`WireFuncDef`]'s bytecode: the first walks labels
//! and instructions to assign each instruction its absolute index
//! (labels occupy no bytecode position, per spec); the second resolves
//! every instruction's operands against the slot/constant/environment/
//! child-def maps built from the def's own declarations plus the
//! label→index map from pass one, then packs the resolved integers
//! through `opcodes::Op` via the mnemonic table. Closures are assembled
//! bottom-up so a parent's `child_defs` are already-verified `FuncDef`s
//! by the time the parent itself is built.

use std::collections::HashMap;

use janet_core::InternTable;
use janet_runtime::{funcdef::EnvSource, verify, FuncDef, FuncDefData, VmError};

use crate::opname_table::lookup;
use crate::wireform::{
    ArgKind, BytecodeItem, ConstantDecl, EnvSourceDecl, Operand, SlotDecl, WireFuncDef,
};

fn type_alias_bit(name: &str) -> Option<u16> {
    use janet_core::TypeTag::*;
    use janet_runtime::Op;
    let bit = |t: janet_core::TypeTag| Op::type_mask_bit(t);
    Some(match name {
        "nil" => bit(Nil),
        "boolean" => bit(Boolean),
        "number" => bit(Number),
        "string" => bit(String),
        "symbol" => bit(Symbol),
        "keyword" => bit(Keyword),
        "array" => bit(Array),
        "tuple" => bit(Tuple),
        "table" => bit(Table),
        "struct" => bit(Struct),
        "buffer" => bit(Buffer),
        "function" => bit(Function),
        "cfunction" => bit(CFunction),
        "abstract" => bit(Abstract),
        "fiber" => bit(Fiber),
        "indexed" => bit(Array) | bit(Tuple),
        "dictionary" => bit(Table) | bit(Struct),
        "bytes" => bit(String) | bit(Symbol) | bit(Keyword) | bit(Buffer),
        "callable" => bit(Function) | bit(CFunction),
        _ => return None,
    })
}

fn mask_for(names: &[String]) -> Result<u16, VmError> {
    let mut mask = 0u16;
    for n in names {
        mask |= type_alias_bit(n)
            .ok_or_else(|| VmError::Assembly(format!("unknown type alias :{n}")))?;
    }
    Ok(mask)
}

struct NameMaps {
    slots: HashMap<String, u32>,
    constants: HashMap<String, u32>,
}

fn build_slot_map(slots: &[SlotDecl]) -> HashMap<String, u32> {
    let mut map = HashMap::new();
    for (i, decl) in slots.iter().enumerate() {
        for name in &decl.names {
            map.insert(name.clone(), i as u32);
        }
    }
    map
}

fn build_constant_map(constants: &[ConstantDecl]) -> HashMap<String, u32> {
    let mut map = HashMap::new();
    for (i, decl) in constants.iter().enumerate() {
        if let Some(name) = &decl.name {
            map.insert(name.clone(), i as u32);
        }
    }
    map
}

/// First pass: assign each `Instruction` its absolute bytecode index and
/// record every `Label`'s target index. Labels occupy no position.
fn index_labels(items: &[BytecodeItem]) -> (HashMap<String, u32>, u32) {
    let mut labels = HashMap::new();
    let mut idx = 0u32;
    for item in items {
        match item {
            BytecodeItem::Label(name) => {
                labels.insert(name.clone(), idx);
            }
            BytecodeItem::Instruction(_) => idx += 1,
        }
    }
    (labels, idx)
}

fn resolve_operand(
    op: &Operand,
    kind: ArgKind,
    maps: &NameMaps,
    labels: &HashMap<String, u32>,
    at: u32,
    envs_used: &mut u32,
) -> Result<i64, VmError> {
    match (op, kind) {
        (Operand::SlotName(n), ArgKind::Slot) => maps
            .slots
            .get(n)
            .map(|&i| i as i64)
            .ok_or_else(|| VmError::Assembly(format!("undefined slot name {n}"))),
        (Operand::SlotIndex(i), ArgKind::Slot) => Ok(*i as i64),
        (Operand::ConstName(n), ArgKind::ConstIdx) => maps
            .constants
            .get(n)
            .map(|&i| i as i64)
            .ok_or_else(|| VmError::Assembly(format!("undefined constant name {n}"))),
        (Operand::ConstIndex(i), ArgKind::ConstIdx) => Ok(*i as i64),
        (Operand::EnvIndex(i), ArgKind::EnvIdx) => {
            *envs_used = (*envs_used).max(i + 1);
            Ok(*i as i64)
        }
        (Operand::ChildIndex(i), ArgKind::ChildIdx) => Ok(*i as i64),
        (Operand::Imm(n), ArgKind::Imm) => Ok(*n),
        (Operand::Imm(n), ArgKind::Slot | ArgKind::ConstIdx | ArgKind::ChildIdx) => Ok(*n),
        (Operand::Label(name), ArgKind::JumpOffset) => {
            let target = *labels
                .get(name)
                .ok_or_else(|| VmError::Assembly(format!("undefined label {name}")))?;
            Ok(target as i64 - (at as i64 + 1))
        }
        (Operand::TypeMask(names), ArgKind::TypeMask) => Ok(mask_for(names)? as i64),
        (other, kind) => Err(VmError::Assembly(format!(
            "operand {other:?} does not match expected argument kind {kind:?}"
        ))),
    }
}

fn autoderive_environments(max_env_seen: u32) -> Vec<EnvSource> {
    (0..max_env_seen)
        .map(|i| if i == 0 { EnvSource::OnStack } else { EnvSource::Shared(i - 1) })
        .collect()
}

/// Assemble a symbolic `WireFuncDef` (and its nested closures) into a
/// verified `FuncDef` (spec §4.F).
pub fn assemble(wire: &WireFuncDef, interns: &mut InternTable) -> Result<FuncDef, VmError> {
    let child_defs = wire
        .closures
        .iter()
        .map(|c| assemble(c, interns))
        .collect::<Result<Vec<_>, _>>()?;

    let maps = NameMaps {
        slots: build_slot_map(&wire.slots),
        constants: build_constant_map(&wire.constants),
    };

    let (labels, instr_count) = index_labels(&wire.bytecode);

    let mut bytecode = Vec::with_capacity(instr_count as usize);
    let mut envs_used = 0u32;
    let mut at = 0u32;
    for item in &wire.bytecode {
        let instr = match item {
            BytecodeItem::Label(_) => continue,
            BytecodeItem::Instruction(instr) => instr,
        };
        let entry = lookup(&instr.mnemonic)
            .ok_or_else(|| VmError::Assembly(format!("unknown mnemonic {}", instr.mnemonic)))?;
        if entry.args.len() != instr.args.len() {
            return Err(VmError::Assembly(format!(
                "{} expects {} argument(s), got {}",
                instr.mnemonic,
                entry.args.len(),
                instr.args.len()
            )));
        }
        let mut resolved = Vec::with_capacity(instr.args.len());
        for (arg, &kind) in instr.args.iter().zip(entry.args) {
            resolved.push(resolve_operand(arg, kind, &maps, &labels, at, &mut envs_used)?);
        }
        let op = (entry.build)(&resolved);
        bytecode.push(op.encode());
        at += 1;
    }

    let environments = if wire.environments.is_empty() {
        autoderive_environments(envs_used)
    } else {
        if envs_used > wire.environments.len() as u32 {
            return Err(VmError::Assembly(format!(
                "bytecode references environment {} but only {} declared",
                envs_used - 1,
                wire.environments.len()
            )));
        }
        wire.environments
            .iter()
            .map(|e| match e {
                EnvSourceDecl::OnStack => EnvSource::OnStack,
                EnvSourceDecl::Shared(k) => EnvSource::Shared(*k),
            })
            .collect()
    };

    let source_map = if wire.sourcemap.is_empty() {
        vec![(0u32, 0u32); bytecode.len()]
    } else {
        if wire.sourcemap.len() != bytecode.len() {
            return Err(VmError::Assembly(format!(
                "sourcemap has {} entries but bytecode has {} instructions",
                wire.sourcemap.len(),
                bytecode.len()
            )));
        }
        wire.sourcemap.clone()
    };

    let mut symbol_map = Vec::new();
    for (i, decl) in wire.slots.iter().enumerate() {
        for name in &decl.names {
            symbol_map.push((i as u32, interns.intern(name.as_bytes())));
        }
    }

    let arity = wire.arity;
    let min_arity = wire.min_arity.unwrap_or(arity);
    let max_arity = wire.max_arity.unwrap_or(if wire.vararg { u32::MAX } else { arity });

    let def = FuncDefData {
        name: wire.name.clone(),
        source: wire.source.clone(),
        source_path: wire.source_path.clone(),
        arity,
        min_arity,
        max_arity,
        vararg: wire.vararg,
        slot_count: wire.slots.len() as u32,
        constants: wire.constants.iter().map(|c| c.expr.value().clone()).collect(),
        child_defs,
        environments,
        closure_bitset: wire.closure_bitset.clone(),
        bytecode,
        source_map,
        symbol_map,
    };

    verify(&def)?;
    Ok(FuncDef::new(def))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wireform::Operand;

    fn ret_nil_def() -> WireFuncDef {
        let mut wire = WireFuncDef::new("empty", 0);
        wire.slots.push(SlotDecl::anonymous());
        wire.bytecode.push(BytecodeItem::Instruction(Instruction::new("retnil", vec![])));
        wire
    }

    use crate::wireform::Instruction;

    #[test]
    fn assembles_trivial_def() {
        let mut interns = InternTable::new();
        let def = assemble(&ret_nil_def(), &mut interns).unwrap();
        assert_eq!(def.bytecode.len(), 1);
    }

    #[test]
    fn rejects_unknown_mnemonic() {
        let mut wire = WireFuncDef::new("bad", 0);
        wire.bytecode.push(BytecodeItem::Instruction(Instruction::new("nope", vec![])));
        let mut interns = InternTable::new();
        assert!(matches!(assemble(&wire, &mut interns), Err(VmError::Assembly(_))));
    }

    #[test]
    fn rejects_undefined_label() {
        let mut wire = WireFuncDef::new("bad-jump", 0);
        wire.slots.push(SlotDecl::anonymous());
        wire.bytecode.push(BytecodeItem::Instruction(Instruction::new(
            "jump",
            vec![Operand::Label("nowhere".into())],
        )));
        let mut interns = InternTable::new();
        assert!(assemble(&wire, &mut interns).is_err());
    }

    #[test]
    fn resolves_named_slots_and_labels() {
        // fact(n): slot0 = n (arg); loop: jumpno slot0 end; ...; jump loop; end: retnil
        let mut wire = WireFuncDef::new("loopy", 1);
        wire.slots.push(SlotDecl::named("n"));
        wire.bytecode.push(BytecodeItem::Label("loop".into()));
        wire.bytecode.push(BytecodeItem::Instruction(Instruction::new(
            "jumpno",
            vec![Operand::SlotName("n".into()), Operand::Label("end".into())],
        )));
        wire.bytecode.push(BytecodeItem::Instruction(Instruction::new(
            "jump",
            vec![Operand::Label("loop".into())],
        )));
        wire.bytecode.push(BytecodeItem::Label("end".into()));
        wire.bytecode.push(BytecodeItem::Instruction(Instruction::new("retnil", vec![])));

        let mut interns = InternTable::new();
        let def = assemble(&wire, &mut interns).unwrap();
        assert_eq!(def.bytecode.len(), 3);
    }

    #[test]
    fn typecheck_mask_resolves_union_alias() {
        let mut wire = WireFuncDef::new("tc", 1);
        wire.slots.push(SlotDecl::anonymous());
        wire.bytecode.push(BytecodeItem::Instruction(Instruction::new(
            "typecheck",
            vec![Operand::SlotIndex(0), Operand::TypeMask(vec!["indexed".into()])],
        )));
        wire.bytecode.push(BytecodeItem::Instruction(Instruction::new("retnil", vec![])));
        let mut interns = InternTable::new();
        assert!(assemble(&wire, &mut interns).is_ok());
    }
}
