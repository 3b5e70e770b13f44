//! Binary → symbolic disassembler (spec §4.F).
//!
//! An inverse of [`crate::assembler::assemble`] "up to canonicalization":
//! slot/constant names aren't recoverable beyond whatever `symbol_map`
//! recorded, so every operand is emitted by raw index rather than by
//! name. That's enough to satisfy the spec's two round-trip invariants —
//! `asm(disasm(d))` reproduces `d`'s bytecode byte-for-byte, and
//! `disasm(asm(w))` reproduces `w`'s control flow modulo label spelling —
//! without this crate needing to invent matching names for unnamed
//! slots and constants.

use std::collections::HashMap;

use janet_runtime::{ArithOp, CmpOp, FuncDefData, NumKind, Op, ShiftOp};

use crate::wireform::{
    BytecodeItem, ConstantDecl, EnvSourceDecl, Instruction, Operand, SlotDecl, WireFuncDef,
};

/// Reverse of `opname_table`'s mnemonic dispatch: given a decoded `Op`,
/// produce its mnemonic and raw operand values in the same order the
/// assembler's table expects them.
fn mnemonic_and_args(op: Op) -> (&'static str, Vec<i64>) {
    use Op::*;
    match op {
        Noop => ("noop", vec![]),
        Debug => ("debug", vec![]),
        Arith { op, kind, dest, lhs, rhs } => {
            let name = match (op, kind) {
                (ArithOp::Add, NumKind::Integer) => "add",
                (ArithOp::Add, NumKind::Real) => "addr",
                (ArithOp::Sub, NumKind::Integer) => "sub",
                (ArithOp::Sub, NumKind::Real) => "subr",
                (ArithOp::Mul, NumKind::Integer) => "mul",
                (ArithOp::Mul, NumKind::Real) => "mulr",
                (ArithOp::Div, NumKind::Integer) => "div",
                (ArithOp::Div, NumKind::Real) => "divr",
                (ArithOp::Mod, NumKind::Integer) => "mod",
                (ArithOp::Mod, NumKind::Real) => "modr",
                (ArithOp::Rem, NumKind::Integer) => "rem",
                (ArithOp::Rem, NumKind::Real) => "remr",
            };
            (name, vec![dest as i64, lhs as i64, rhs as i64])
        }
        ArithImmediate { op, dest, imm } => {
            let name = match op {
                ArithOp::Add => "addim",
                ArithOp::Sub => "subim",
                ArithOp::Mul => "mulim",
                ArithOp::Div => "divim",
                ArithOp::Mod | ArithOp::Rem => unreachable!("no immediate mod/rem opcode"),
            };
            (name, vec![dest as i64, imm as i64])
        }
        Compare { op, dest, lhs, rhs } => {
            let name = match op {
                CmpOp::Eq => "eq",
                CmpOp::Neq => "neq",
                CmpOp::Lt => "lt",
                CmpOp::Lte => "lte",
                CmpOp::Gt => "gt",
                CmpOp::Gte => "gte",
            };
            (name, vec![dest as i64, lhs as i64, rhs as i64])
        }
        BitAnd { dest, lhs, rhs } => ("band", vec![dest as i64, lhs as i64, rhs as i64]),
        BitOr { dest, lhs, rhs } => ("bor", vec![dest as i64, lhs as i64, rhs as i64]),
        BitXor { dest, lhs, rhs } => ("bxor", vec![dest as i64, lhs as i64, rhs as i64]),
        BitNot { dest, src } => ("bnot", vec![dest as i64, src as i64]),
        Shift { op, dest, src, amount } => {
            let name = match op {
                ShiftOp::Left => "shl",
                ShiftOp::RightArithmetic => "shr",
                ShiftOp::RightLogical => "shru",
            };
            (name, vec![dest as i64, src as i64, amount as i64])
        }
        Jump { offset } => ("jump", vec![offset as i64]),
        JumpIf { cond, offset } => ("jumpif", vec![cond as i64, offset as i64]),
        JumpIfNot { cond, offset } => ("jumpno", vec![cond as i64, offset as i64]),
        JumpIfNil { cond, offset } => ("jumpnil", vec![cond as i64, offset as i64]),
        JumpIfNotNil { cond, offset } => ("jumpnotnil", vec![cond as i64, offset as i64]),
        MakeArray { dest } => ("array", vec![dest as i64]),
        MakeBuffer { dest } => ("buffer", vec![dest as i64]),
        MakeString { dest } => ("string", vec![dest as i64]),
        MakeStruct { dest } => ("struct", vec![dest as i64]),
        MakeTable { dest } => ("table", vec![dest as i64]),
        MakeTuple { dest } => ("tuple", vec![dest as i64]),
        MakeBracketTuple { dest } => ("btuple", vec![dest as i64]),
        LoadNil { dest } => ("ldnil", vec![dest as i64]),
        LoadTrue { dest } => ("ldtrue", vec![dest as i64]),
        LoadFalse { dest } => ("ldfalse", vec![dest as i64]),
        LoadInteger { dest, value } => ("ldint", vec![dest as i64, value as i64]),
        LoadConstant { dest, constant } => ("ldconst", vec![dest as i64, constant as i64]),
        LoadSelf { dest } => ("ldself", vec![dest as i64]),
        LoadUpvalue { dest, env, far_slot } => ("ldup", vec![dest as i64, env as i64, far_slot as i64]),
        SetUpvalue { src, env, far_slot } => ("stup", vec![src as i64, env as i64, far_slot as i64]),
        MoveNear { dest, src } => ("movenear", vec![dest as i64, src as i64]),
        MoveFar { dest, src } => ("movefar", vec![dest as i64, src as i64]),
        Call { dest, callee } => ("call", vec![dest as i64, callee as i64]),
        TailCall { callee } => ("tailcall", vec![callee as i64]),
        Return { src } => ("ret", vec![src as i64]),
        ReturnNil => ("retnil", vec![]),
        Resume { dest, fiber, value } => ("resume", vec![dest as i64, fiber as i64, value as i64]),
        Signal { value, code } => ("signal", vec![value as i64, code as i64]),
        Propagate { value } => ("propagate", vec![value as i64]),
        Yield { value, code } => ("yield", vec![value as i64, code as i64]),
        Cancel { fiber, value } => ("cancel", vec![fiber as i64, value as i64]),
        In { dest, ds, key } => ("in", vec![dest as i64, ds as i64, key as i64]),
        Get { dest, ds, key } => ("get", vec![dest as i64, ds as i64, key as i64]),
        Put { ds, key, value } => ("put", vec![ds as i64, key as i64, value as i64]),
        GetIndex { dest, ds, index } => ("geti", vec![dest as i64, ds as i64, index as i64]),
        PutIndex { ds, index, value } => ("puti", vec![ds as i64, index as i64, value as i64]),
        Length { dest, ds } => ("len", vec![dest as i64, ds as i64]),
        Next { dest, ds, key } => ("next", vec![dest as i64, ds as i64, key as i64]),
        TypeCheck { slot, mask } => ("typecheck", vec![slot as i64, mask as i64]),
        Closure { dest, child_def } => ("closure", vec![dest as i64, child_def as i64]),
        Push { slot } => ("push", vec![slot as i64]),
        Push2 { a, b } => ("push2", vec![a as i64, b as i64]),
        Push3 { a, b, c } => ("push3", vec![a as i64, b as i64, c as i64]),
        PushArray { slot } => ("pusharray", vec![slot as i64]),
        Error { slot } => ("error", vec![slot as i64]),
    }
}

/// Express a type-mask as the smallest list of alias names that covers it
/// exactly: union aliases (`:indexed`, `:dictionary`, `:bytes`,
/// `:callable`) are preferred over spelling out their members.
fn mask_to_aliases(mask: u16) -> Vec<String> {
    use janet_core::TypeTag::*;
    let bit = |t: janet_core::TypeTag| Op::type_mask_bit(t);
    let unions: &[(&str, u16)] = &[
        ("indexed", bit(Array) | bit(Tuple)),
        ("dictionary", bit(Table) | bit(Struct)),
        ("bytes", bit(String) | bit(Symbol) | bit(Keyword) | bit(Buffer)),
        ("callable", bit(Function) | bit(CFunction)),
    ];
    let mut remaining = mask;
    let mut names = Vec::new();
    for (name, union_bits) in unions {
        if remaining & union_bits == *union_bits && *union_bits != 0 {
            names.push((*name).to_string());
            remaining &= !union_bits;
        }
    }
    let primitives: &[(&str, janet_core::TypeTag)] = &[
        ("nil", Nil),
        ("boolean", Boolean),
        ("number", Number),
        ("string", String),
        ("symbol", Symbol),
        ("keyword", Keyword),
        ("array", Array),
        ("tuple", Tuple),
        ("table", Table),
        ("struct", Struct),
        ("buffer", Buffer),
        ("function", Function),
        ("cfunction", CFunction),
        ("abstract", Abstract),
        ("fiber", Fiber),
    ];
    for (name, tag) in primitives {
        let b = bit(*tag);
        if remaining & b != 0 {
            names.push((*name).to_string());
            remaining &= !b;
        }
    }
    names
}

/// Every absolute instruction index that some jump in `def` targets, used
/// to decide where to interleave synthetic labels.
fn jump_targets(def: &FuncDefData) -> HashMap<u32, String> {
    let mut targets: Vec<i64> = Vec::new();
    for (i, &word) in def.bytecode.iter().enumerate() {
        if let Some(op) = Op::decode(word) {
            if let Some(t) = op.jump_target(i as i64) {
                targets.push(t);
            }
        }
    }
    targets.sort_unstable();
    targets.dedup();
    targets
        .into_iter()
        .enumerate()
        .filter(|&(_, t)| t >= 0 && (t as usize) <= def.bytecode.len())
        .map(|(n, t)| (t as u32, format!("L{n}")))
        .collect()
}

/// Disassemble a `FuncDef` into its symbolic wire form (spec §4.F).
pub fn disassemble(def: &FuncDefData) -> WireFuncDef {
    let labels = jump_targets(def);

    let mut slot_names: HashMap<u32, Vec<String>> = HashMap::new();
    for (slot, sym) in &def.symbol_map {
        slot_names
            .entry(*slot)
            .or_default()
            .push(String::from_utf8_lossy(sym.as_bytes()).into_owned());
    }
    let slots = (0..def.slot_count)
        .map(|i| SlotDecl { names: slot_names.remove(&i).unwrap_or_default() })
        .collect();

    let constants = def.constants.iter().map(|v| ConstantDecl::anonymous(v.clone())).collect();
    let closures = def.child_defs.iter().map(|c| disassemble(c)).collect();

    let mut bytecode = Vec::new();
    for (i, &word) in def.bytecode.iter().enumerate() {
        if let Some(label) = labels.get(&(i as u32)) {
            bytecode.push(BytecodeItem::Label(label.clone()));
        }
        let op = Op::decode(word).expect("verified FuncDef carries only decodable opcodes");
        let (mnemonic, args) = mnemonic_and_args(op);
        let mut operands: Vec<Operand> = args.into_iter().map(Operand::Imm).collect();
        match op {
            Op::TypeCheck { mask, .. } => {
                operands[1] = Operand::TypeMask(mask_to_aliases(mask));
            }
            Op::Jump { .. } | Op::JumpIf { .. } | Op::JumpIfNot { .. } | Op::JumpIfNil { .. } | Op::JumpIfNotNil { .. } => {
                let target = op.jump_target(i as i64).expect("jump opcode always has a target");
                let last = operands.len() - 1;
                operands[last] = Operand::Label(
                    labels
                        .get(&(target.max(0) as u32))
                        .cloned()
                        .unwrap_or_else(|| format!("L{target}")),
                );
            }
            _ => {}
        }
        bytecode.push(BytecodeItem::Instruction(Instruction::new(mnemonic, operands)));
    }
    if let Some(label) = labels.get(&(def.bytecode.len() as u32)) {
        bytecode.push(BytecodeItem::Label(label.clone()));
    }

    let environments = def
        .environments
        .iter()
        .map(|e| match e {
            janet_runtime::funcdef::EnvSource::OnStack => EnvSourceDecl::OnStack,
            janet_runtime::funcdef::EnvSource::Shared(k) => EnvSourceDecl::Shared(*k),
        })
        .collect();

    WireFuncDef {
        name: def.name.clone(),
        arity: def.arity,
        min_arity: Some(def.min_arity),
        max_arity: Some(def.max_arity),
        vararg: def.vararg,
        source: def.source.clone(),
        source_path: def.source_path.clone(),
        slots,
        constants,
        closures,
        bytecode,
        sourcemap: def.source_map.clone(),
        environments,
        closure_bitset: def.closure_bitset.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assembler::assemble;
    use crate::wireform::{BytecodeItem as Item, Operand as Opd, SlotDecl as Decl, WireFuncDef};
    use janet_core::InternTable;

    fn loopy() -> WireFuncDef {
        let mut wire = WireFuncDef::new("loopy", 1);
        wire.slots.push(Decl::named("n"));
        wire.bytecode.push(Item::Label("loop".into()));
        wire.bytecode.push(Item::Instruction(crate::wireform::Instruction::new(
            "jumpno",
            vec![Opd::SlotName("n".into()), Opd::Label("end".into())],
        )));
        wire.bytecode.push(Item::Instruction(crate::wireform::Instruction::new(
            "subim",
            vec![Opd::SlotIndex(0), Opd::Imm(1)],
        )));
        wire.bytecode.push(Item::Instruction(crate::wireform::Instruction::new(
            "jump",
            vec![Opd::Label("loop".into())],
        )));
        wire.bytecode.push(Item::Label("end".into()));
        wire.bytecode.push(Item::Instruction(crate::wireform::Instruction::new("retnil", vec![])));
        wire
    }

    #[test]
    fn asm_then_disasm_then_asm_reproduces_bytecode() {
        let mut interns = InternTable::new();
        let def = assemble(&loopy(), &mut interns).unwrap();
        let wire2 = disassemble(&def);
        let mut interns2 = InternTable::new();
        let def2 = assemble(&wire2, &mut interns2).unwrap();
        assert_eq!(def.bytecode, def2.bytecode);
        assert_eq!(def.slot_count, def2.slot_count);
        assert_eq!(def.arity, def2.arity);
    }

    #[test]
    fn typecheck_mask_roundtrips_through_union_alias() {
        let mut wire = WireFuncDef::new("tc", 1);
        wire.slots.push(Decl::anonymous());
        wire.bytecode.push(Item::Instruction(crate::wireform::Instruction::new(
            "typecheck",
            vec![Opd::SlotIndex(0), Opd::TypeMask(vec!["indexed".into()])],
        )));
        wire.bytecode.push(Item::Instruction(crate::wireform::Instruction::new("retnil", vec![])));
        let mut interns = InternTable::new();
        let def = assemble(&wire, &mut interns).unwrap();
        let back = disassemble(&def);
        let mut interns2 = InternTable::new();
        let def2 = assemble(&back, &mut interns2).unwrap();
        assert_eq!(def.bytecode, def2.bytecode);
    }
}
