//! Packed 32-bit bytecode encoding (spec §4.E "Bytecode encoding").
//!
//! Each instruction is one `u32`: the low 7 bits hold the opcode, the
//! remaining 25 bits hold arguments laid out per one of 14 shapes. This
//! module owns only the wire format — `Op::encode`/`Op::decode` and the
//! verifier-facing queries (`referenced_slots`, `constant_index`, etc).
//! Execution lives in `interp`.

use janet_core::TypeTag;

const OPCODE_MASK: u32 = 0x7f;

fn slot8(word: u32, byte: u32) -> u32 {
    (word >> (8 * byte)) & 0xff
}

fn field16(word: u32) -> u32 {
    (word >> 16) & 0xffff
}

fn pack_s(opcode: u32, slot: u32) -> u32 {
    (opcode & OPCODE_MASK) | ((slot & 0x00ff_ffff) << 8)
}

fn pack_l(opcode: u32, offset: i32) -> u32 {
    (opcode & OPCODE_MASK) | (((offset as u32) & 0x00ff_ffff) << 8)
}

fn unpack_l(word: u32) -> i32 {
    let raw = (word >> 8) & 0x00ff_ffff;
    // sign-extend 24 bits
    if raw & 0x0080_0000 != 0 {
        (raw | 0xff00_0000) as i32
    } else {
        raw as i32
    }
}

fn pack_ss(opcode: u32, a: u32, b: u32) -> u32 {
    (opcode & OPCODE_MASK) | ((a & 0xff) << 8) | ((b & 0xffff) << 16)
}

fn pack_sl(opcode: u32, slot: u32, offset: i16) -> u32 {
    (opcode & OPCODE_MASK) | ((slot & 0xff) << 8) | (((offset as u16) as u32) << 16)
}

fn unpack_sl_offset(word: u32) -> i16 {
    field16(word) as i16
}

fn pack_st(opcode: u32, slot: u32, mask: u16) -> u32 {
    (opcode & OPCODE_MASK) | ((slot & 0xff) << 8) | ((mask as u32) << 16)
}

fn pack_sc(opcode: u32, slot: u32, idx: u16) -> u32 {
    (opcode & OPCODE_MASK) | ((slot & 0xff) << 8) | ((idx as u32) << 16)
}

fn pack_sd(opcode: u32, slot: u32, idx: u16) -> u32 {
    pack_sc(opcode, slot, idx)
}

fn pack_si(opcode: u32, slot: u32, imm: i16) -> u32 {
    (opcode & OPCODE_MASK) | ((slot & 0xff) << 8) | (((imm as u16) as u32) << 16)
}

fn pack_sss(opcode: u32, a: u32, b: u32, c: u32) -> u32 {
    (opcode & OPCODE_MASK) | ((a & 0xff) << 8) | ((b & 0xff) << 16) | ((c & 0xff) << 24)
}

fn pack_ssu8(opcode: u32, a: u32, b: u32, imm: u8) -> u32 {
    pack_sss(opcode, a, b, imm as u32)
}

fn pack_ses(opcode: u32, slot: u32, env: u8, far: u8) -> u32 {
    pack_sss(opcode, slot, env as u32, far as u32)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NumKind {
    Integer,
    Real,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Rem,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Neq,
    Lt,
    Lte,
    Gt,
    Gte,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShiftOp {
    Left,
    RightArithmetic,
    RightLogical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Noop,
    Debug,
    Arith { op: ArithOp, kind: NumKind, dest: u8, lhs: u8, rhs: u8 },
    /// `slot[dest] = slot[dest] OP imm`; immediates are 16-bit signed
    /// uniformly across `+ - * /` (spec §3 supplemented resolution).
    ArithImmediate { op: ArithOp, dest: u8, imm: i16 },
    Compare { op: CmpOp, dest: u8, lhs: u8, rhs: u8 },
    BitAnd { dest: u8, lhs: u8, rhs: u8 },
    BitOr { dest: u8, lhs: u8, rhs: u8 },
    BitXor { dest: u8, lhs: u8, rhs: u8 },
    BitNot { dest: u8, src: u8 },
    Shift { op: ShiftOp, dest: u8, src: u8, amount: u8 },
    Jump { offset: i32 },
    JumpIf { cond: u8, offset: i16 },
    JumpIfNot { cond: u8, offset: i16 },
    JumpIfNil { cond: u8, offset: i16 },
    JumpIfNotNil { cond: u8, offset: i16 },
    MakeArray { dest: u8 },
    MakeBuffer { dest: u8 },
    MakeString { dest: u8 },
    MakeStruct { dest: u8 },
    MakeTable { dest: u8 },
    MakeTuple { dest: u8 },
    MakeBracketTuple { dest: u8 },
    LoadNil { dest: u8 },
    LoadTrue { dest: u8 },
    LoadFalse { dest: u8 },
    LoadInteger { dest: u8, value: i16 },
    LoadConstant { dest: u8, constant: u16 },
    LoadSelf { dest: u8 },
    LoadUpvalue { dest: u8, env: u8, far_slot: u8 },
    SetUpvalue { src: u8, env: u8, far_slot: u8 },
    MoveNear { dest: u8, src: u8 },
    MoveFar { dest: u8, src: u8 },
    Call { dest: u8, callee: u8 },
    TailCall { callee: u8 },
    Return { src: u8 },
    ReturnNil,
    Resume { dest: u8, fiber: u8, value: u8 },
    Signal { value: u8, code: u8 },
    Propagate { value: u8 },
    Yield { value: u8, code: u8 },
    Cancel { fiber: u8, value: u8 },
    In { dest: u8, ds: u8, key: u8 },
    Get { dest: u8, ds: u8, key: u8 },
    Put { ds: u8, key: u8, value: u8 },
    GetIndex { dest: u8, ds: u8, index: u8 },
    PutIndex { ds: u8, index: u8, value: u8 },
    Length { dest: u8, ds: u8 },
    Next { dest: u8, ds: u8, key: u8 },
    TypeCheck { slot: u8, mask: u16 },
    Closure { dest: u8, child_def: u16 },
    Push { slot: u8 },
    Push2 { a: u8, b: u8 },
    Push3 { a: u8, b: u8, c: u8 },
    PushArray { slot: u8 },
    Error { slot: u8 },
}

macro_rules! opcodes {
    ($($name:ident = $val:expr;)*) => {
        $(const $name: u32 = $val;)*
    };
}

opcodes! {
    OP_NOOP = 0;
    OP_DEBUG = 1;
    OP_ARITH = 2;           // occupies 2..14 (6 ops x 2 kinds)
    OP_ARITH_IMM = 14;      // occupies 14..18 (4 ops)
    OP_COMPARE = 18;        // occupies 18..24 (6 ops)
    OP_BIT_AND = 24;
    OP_BIT_OR = 25;
    OP_BIT_XOR = 26;
    OP_BIT_NOT = 27;
    OP_SHIFT = 28;          // occupies 28..31 (3 ops)
    OP_JUMP = 31;
    OP_JUMP_IF = 32;
    OP_JUMP_IF_NOT = 33;
    OP_JUMP_IF_NIL = 34;
    OP_JUMP_IF_NOT_NIL = 35;
    OP_MAKE_ARRAY = 36;
    OP_MAKE_BUFFER = 37;
    OP_MAKE_STRING = 38;
    OP_MAKE_STRUCT = 39;
    OP_MAKE_TABLE = 40;
    OP_MAKE_TUPLE = 41;
    OP_MAKE_BRACKET_TUPLE = 42;
    OP_LOAD_NIL = 43;
    OP_LOAD_TRUE = 44;
    OP_LOAD_FALSE = 45;
    OP_LOAD_INTEGER = 46;
    OP_LOAD_CONSTANT = 47;
    OP_LOAD_SELF = 48;
    OP_LOAD_UPVALUE = 49;
    OP_SET_UPVALUE = 50;
    OP_MOVE_NEAR = 51;
    OP_MOVE_FAR = 52;
    OP_CALL = 53;
    OP_TAILCALL = 54;
    OP_RETURN = 55;
    OP_RETURN_NIL = 56;
    OP_RESUME = 57;
    OP_SIGNAL = 58;
    OP_PROPAGATE = 59;
    OP_YIELD = 60;
    OP_CANCEL = 61;
    OP_IN = 62;
    OP_GET = 63;
    OP_PUT = 64;
    OP_GET_INDEX = 65;
    OP_PUT_INDEX = 66;
    OP_LENGTH = 67;
    OP_NEXT = 68;
    OP_TYPECHECK = 69;
    OP_CLOSURE = 70;
    OP_PUSH = 71;
    OP_PUSH2 = 72;
    OP_PUSH3 = 73;
    OP_PUSH_ARRAY = 74;
    OP_ERROR = 75;
}

fn unpack_arith(word: u32) -> Option<(ArithOp, NumKind)> {
    let opcode = word & OPCODE_MASK;
    if !(OP_ARITH..OP_ARITH + 12).contains(&opcode) {
        return None;
    }
    let rel = opcode - OP_ARITH;
    let op = match rel / 2 {
        0 => ArithOp::Add,
        1 => ArithOp::Sub,
        2 => ArithOp::Mul,
        3 => ArithOp::Div,
        4 => ArithOp::Mod,
        5 => ArithOp::Rem,
        _ => return None,
    };
    let kind = if rel % 2 == 0 { NumKind::Integer } else { NumKind::Real };
    Some((op, kind))
}

fn pack_arith_imm(op: ArithOp, dest: u8, imm: i16) -> u32 {
    let opcode = OP_ARITH_IMM + (op as u32);
    pack_si(opcode, dest as u32, imm)
}

fn unpack_arith_imm(word: u32) -> Option<ArithOp> {
    let opcode = word & OPCODE_MASK;
    if !(OP_ARITH_IMM..OP_ARITH_IMM + 4).contains(&opcode) {
        return None;
    }
    Some(match opcode - OP_ARITH_IMM {
        0 => ArithOp::Add,
        1 => ArithOp::Sub,
        2 => ArithOp::Mul,
        3 => ArithOp::Div,
        _ => unreachable!(),
    })
}

fn pack_cmp(op: CmpOp, dest: u8, lhs: u8, rhs: u8) -> u32 {
    let opcode = OP_COMPARE + (op as u32);
    pack_sss(opcode, dest as u32, lhs as u32, rhs as u32)
}

fn unpack_cmp(word: u32) -> Option<CmpOp> {
    let opcode = word & OPCODE_MASK;
    if !(OP_COMPARE..OP_COMPARE + 6).contains(&opcode) {
        return None;
    }
    Some(match opcode - OP_COMPARE {
        0 => CmpOp::Eq,
        1 => CmpOp::Neq,
        2 => CmpOp::Lt,
        3 => CmpOp::Lte,
        4 => CmpOp::Gt,
        5 => CmpOp::Gte,
        _ => unreachable!(),
    })
}

fn pack_shift(op: ShiftOp, dest: u8, src: u8, amount: u8) -> u32 {
    let opcode = OP_SHIFT + (op as u32);
    pack_ssu8(opcode, dest as u32, src as u32, amount)
}

fn unpack_shift(word: u32) -> Option<ShiftOp> {
    let opcode = word & OPCODE_MASK;
    if !(OP_SHIFT..OP_SHIFT + 3).contains(&opcode) {
        return None;
    }
    Some(match opcode - OP_SHIFT {
        0 => ShiftOp::Left,
        1 => ShiftOp::RightArithmetic,
        2 => ShiftOp::RightLogical,
        _ => unreachable!(),
    })
}

impl Op {
    pub fn encode(self) -> u32 {
        match self {
            Op::Noop => OP_NOOP,
            Op::Debug => OP_DEBUG,
            Op::Arith { op, kind, dest, lhs, rhs } => {
                let opcode = OP_ARITH + (op as u32) * 2 + if kind == NumKind::Real { 1 } else { 0 };
                pack_sss(opcode, dest as u32, lhs as u32, rhs as u32)
            }
            Op::ArithImmediate { op, dest, imm } => pack_arith_imm(op, dest, imm),
            Op::Compare { op, dest, lhs, rhs } => pack_cmp(op, dest, lhs, rhs),
            Op::BitAnd { dest, lhs, rhs } => pack_sss(OP_BIT_AND, dest as u32, lhs as u32, rhs as u32),
            Op::BitOr { dest, lhs, rhs } => pack_sss(OP_BIT_OR, dest as u32, lhs as u32, rhs as u32),
            Op::BitXor { dest, lhs, rhs } => pack_sss(OP_BIT_XOR, dest as u32, lhs as u32, rhs as u32),
            Op::BitNot { dest, src } => pack_ss(OP_BIT_NOT, dest as u32, src as u32),
            Op::Shift { op, dest, src, amount } => pack_shift(op, dest, src, amount),
            Op::Jump { offset } => pack_l(OP_JUMP, offset),
            Op::JumpIf { cond, offset } => pack_sl(OP_JUMP_IF, cond as u32, offset),
            Op::JumpIfNot { cond, offset } => pack_sl(OP_JUMP_IF_NOT, cond as u32, offset),
            Op::JumpIfNil { cond, offset } => pack_sl(OP_JUMP_IF_NIL, cond as u32, offset),
            Op::JumpIfNotNil { cond, offset } => pack_sl(OP_JUMP_IF_NOT_NIL, cond as u32, offset),
            Op::MakeArray { dest } => pack_s(OP_MAKE_ARRAY, dest as u32),
            Op::MakeBuffer { dest } => pack_s(OP_MAKE_BUFFER, dest as u32),
            Op::MakeString { dest } => pack_s(OP_MAKE_STRING, dest as u32),
            Op::MakeStruct { dest } => pack_s(OP_MAKE_STRUCT, dest as u32),
            Op::MakeTable { dest } => pack_s(OP_MAKE_TABLE, dest as u32),
            Op::MakeTuple { dest } => pack_s(OP_MAKE_TUPLE, dest as u32),
            Op::MakeBracketTuple { dest } => pack_s(OP_MAKE_BRACKET_TUPLE, dest as u32),
            Op::LoadNil { dest } => pack_s(OP_LOAD_NIL, dest as u32),
            Op::LoadTrue { dest } => pack_s(OP_LOAD_TRUE, dest as u32),
            Op::LoadFalse { dest } => pack_s(OP_LOAD_FALSE, dest as u32),
            Op::LoadInteger { dest, value } => pack_si(OP_LOAD_INTEGER, dest as u32, value),
            Op::LoadConstant { dest, constant } => pack_sc(OP_LOAD_CONSTANT, dest as u32, constant),
            Op::LoadSelf { dest } => pack_s(OP_LOAD_SELF, dest as u32),
            Op::LoadUpvalue { dest, env, far_slot } => pack_ses(OP_LOAD_UPVALUE, dest as u32, env, far_slot),
            Op::SetUpvalue { src, env, far_slot } => pack_ses(OP_SET_UPVALUE, src as u32, env, far_slot),
            Op::MoveNear { dest, src } => pack_ss(OP_MOVE_NEAR, dest as u32, src as u32),
            Op::MoveFar { dest, src } => pack_ss(OP_MOVE_FAR, dest as u32, src as u32),
            Op::Call { dest, callee } => pack_ss(OP_CALL, dest as u32, callee as u32),
            Op::TailCall { callee } => pack_s(OP_TAILCALL, callee as u32),
            Op::Return { src } => pack_s(OP_RETURN, src as u32),
            Op::ReturnNil => OP_RETURN_NIL,
            Op::Resume { dest, fiber, value } => pack_sss(OP_RESUME, dest as u32, fiber as u32, value as u32),
            Op::Signal { value, code } => pack_ss(OP_SIGNAL, value as u32, code as u32),
            Op::Propagate { value } => pack_s(OP_PROPAGATE, value as u32),
            Op::Yield { value, code } => pack_ss(OP_YIELD, value as u32, code as u32),
            Op::Cancel { fiber, value } => pack_ss(OP_CANCEL, fiber as u32, value as u32),
            Op::In { dest, ds, key } => pack_sss(OP_IN, dest as u32, ds as u32, key as u32),
            Op::Get { dest, ds, key } => pack_sss(OP_GET, dest as u32, ds as u32, key as u32),
            Op::Put { ds, key, value } => pack_sss(OP_PUT, ds as u32, key as u32, value as u32),
            Op::GetIndex { dest, ds, index } => pack_sss(OP_GET_INDEX, dest as u32, ds as u32, index as u32),
            Op::PutIndex { ds, index, value } => pack_sss(OP_PUT_INDEX, ds as u32, index as u32, value as u32),
            Op::Length { dest, ds } => pack_ss(OP_LENGTH, dest as u32, ds as u32),
            Op::Next { dest, ds, key } => pack_sss(OP_NEXT, dest as u32, ds as u32, key as u32),
            Op::TypeCheck { slot, mask } => pack_st(OP_TYPECHECK, slot as u32, mask),
            Op::Closure { dest, child_def } => pack_sd(OP_CLOSURE, dest as u32, child_def),
            Op::Push { slot } => pack_s(OP_PUSH, slot as u32),
            Op::Push2 { a, b } => pack_ss(OP_PUSH2, a as u32, b as u32),
            Op::Push3 { a, b, c } => pack_sss(OP_PUSH3, a as u32, b as u32, c as u32),
            Op::PushArray { slot } => pack_s(OP_PUSH_ARRAY, slot as u32),
            Op::Error { slot } => pack_s(OP_ERROR, slot as u32),
        }
    }

    pub fn decode(word: u32) -> Option<Op> {
        if let Some((op, kind)) = unpack_arith(word) {
            return Some(Op::Arith {
                op,
                kind,
                dest: slot8(word, 1) as u8,
                lhs: slot8(word, 2) as u8,
                rhs: slot8(word, 3) as u8,
            });
        }
        if let Some(op) = unpack_arith_imm(word) {
            return Some(Op::ArithImmediate {
                op,
                dest: slot8(word, 1) as u8,
                imm: field16(word) as i16,
            });
        }
        if let Some(op) = unpack_cmp(word) {
            return Some(Op::Compare {
                op,
                dest: slot8(word, 1) as u8,
                lhs: slot8(word, 2) as u8,
                rhs: slot8(word, 3) as u8,
            });
        }
        if let Some(op) = unpack_shift(word) {
            return Some(Op::Shift {
                op,
                dest: slot8(word, 1) as u8,
                src: slot8(word, 2) as u8,
                amount: slot8(word, 3) as u8,
            });
        }
        let opcode = word & OPCODE_MASK;
        Some(match opcode {
            OP_NOOP => Op::Noop,
            OP_DEBUG => Op::Debug,
            OP_BIT_AND => Op::BitAnd { dest: slot8(word, 1) as u8, lhs: slot8(word, 2) as u8, rhs: slot8(word, 3) as u8 },
            OP_BIT_OR => Op::BitOr { dest: slot8(word, 1) as u8, lhs: slot8(word, 2) as u8, rhs: slot8(word, 3) as u8 },
            OP_BIT_XOR => Op::BitXor { dest: slot8(word, 1) as u8, lhs: slot8(word, 2) as u8, rhs: slot8(word, 3) as u8 },
            OP_BIT_NOT => Op::BitNot { dest: slot8(word, 1) as u8, src: slot8(word, 2) as u8 },
            OP_JUMP => Op::Jump { offset: unpack_l(word) },
            OP_JUMP_IF => Op::JumpIf { cond: slot8(word, 1) as u8, offset: unpack_sl_offset(word) },
            OP_JUMP_IF_NOT => Op::JumpIfNot { cond: slot8(word, 1) as u8, offset: unpack_sl_offset(word) },
            OP_JUMP_IF_NIL => Op::JumpIfNil { cond: slot8(word, 1) as u8, offset: unpack_sl_offset(word) },
            OP_JUMP_IF_NOT_NIL => Op::JumpIfNotNil { cond: slot8(word, 1) as u8, offset: unpack_sl_offset(word) },
            OP_MAKE_ARRAY => Op::MakeArray { dest: slot8(word, 1) as u8 },
            OP_MAKE_BUFFER => Op::MakeBuffer { dest: slot8(word, 1) as u8 },
            OP_MAKE_STRING => Op::MakeString { dest: slot8(word, 1) as u8 },
            OP_MAKE_STRUCT => Op::MakeStruct { dest: slot8(word, 1) as u8 },
            OP_MAKE_TABLE => Op::MakeTable { dest: slot8(word, 1) as u8 },
            OP_MAKE_TUPLE => Op::MakeTuple { dest: slot8(word, 1) as u8 },
            OP_MAKE_BRACKET_TUPLE => Op::MakeBracketTuple { dest: slot8(word, 1) as u8 },
            OP_LOAD_NIL => Op::LoadNil { dest: slot8(word, 1) as u8 },
            OP_LOAD_TRUE => Op::LoadTrue { dest: slot8(word, 1) as u8 },
            OP_LOAD_FALSE => Op::LoadFalse { dest: slot8(word, 1) as u8 },
            OP_LOAD_INTEGER => Op::LoadInteger { dest: slot8(word, 1) as u8, value: field16(word) as i16 },
            OP_LOAD_CONSTANT => Op::LoadConstant { dest: slot8(word, 1) as u8, constant: field16(word) as u16 },
            OP_LOAD_SELF => Op::LoadSelf { dest: slot8(word, 1) as u8 },
            OP_LOAD_UPVALUE => Op::LoadUpvalue { dest: slot8(word, 1) as u8, env: slot8(word, 2) as u8, far_slot: slot8(word, 3) as u8 },
            OP_SET_UPVALUE => Op::SetUpvalue { src: slot8(word, 1) as u8, env: slot8(word, 2) as u8, far_slot: slot8(word, 3) as u8 },
            OP_MOVE_NEAR => Op::MoveNear { dest: slot8(word, 1) as u8, src: slot8(word, 2) as u8 },
            OP_MOVE_FAR => Op::MoveFar { dest: slot8(word, 1) as u8, src: slot8(word, 2) as u8 },
            OP_CALL => Op::Call { dest: slot8(word, 1) as u8, callee: slot8(word, 2) as u8 },
            OP_TAILCALL => Op::TailCall { callee: slot8(word, 1) as u8 },
            OP_RETURN => Op::Return { src: slot8(word, 1) as u8 },
            OP_RETURN_NIL => Op::ReturnNil,
            OP_RESUME => Op::Resume { dest: slot8(word, 1) as u8, fiber: slot8(word, 2) as u8, value: slot8(word, 3) as u8 },
            OP_SIGNAL => Op::Signal { value: slot8(word, 1) as u8, code: slot8(word, 2) as u8 },
            OP_PROPAGATE => Op::Propagate { value: slot8(word, 1) as u8 },
            OP_YIELD => Op::Yield { value: slot8(word, 1) as u8, code: slot8(word, 2) as u8 },
            OP_CANCEL => Op::Cancel { fiber: slot8(word, 1) as u8, value: slot8(word, 2) as u8 },
            OP_IN => Op::In { dest: slot8(word, 1) as u8, ds: slot8(word, 2) as u8, key: slot8(word, 3) as u8 },
            OP_GET => Op::Get { dest: slot8(word, 1) as u8, ds: slot8(word, 2) as u8, key: slot8(word, 3) as u8 },
            OP_PUT => Op::Put { ds: slot8(word, 1) as u8, key: slot8(word, 2) as u8, value: slot8(word, 3) as u8 },
            OP_GET_INDEX => Op::GetIndex { dest: slot8(word, 1) as u8, ds: slot8(word, 2) as u8, index: slot8(word, 3) as u8 },
            OP_PUT_INDEX => Op::PutIndex { ds: slot8(word, 1) as u8, index: slot8(word, 2) as u8, value: slot8(word, 3) as u8 },
            OP_LENGTH => Op::Length { dest: slot8(word, 1) as u8, ds: slot8(word, 2) as u8 },
            OP_NEXT => Op::Next { dest: slot8(word, 1) as u8, ds: slot8(word, 2) as u8, key: slot8(word, 3) as u8 },
            OP_TYPECHECK => Op::TypeCheck { slot: slot8(word, 1) as u8, mask: field16(word) as u16 },
            OP_CLOSURE => Op::Closure { dest: slot8(word, 1) as u8, child_def: field16(word) as u16 },
            OP_PUSH => Op::Push { slot: slot8(word, 1) as u8 },
            OP_PUSH2 => Op::Push2 { a: slot8(word, 1) as u8, b: slot8(word, 2) as u8 },
            OP_PUSH3 => Op::Push3 { a: slot8(word, 1) as u8, b: slot8(word, 2) as u8, c: slot8(word, 3) as u8 },
            OP_PUSH_ARRAY => Op::PushArray { slot: slot8(word, 1) as u8 },
            OP_ERROR => Op::Error { slot: slot8(word, 1) as u8 },
            _ => return None,
        })
    }

    /// Every slot index this instruction reads or writes, for the verifier.
    pub fn referenced_slots(&self) -> Vec<u32> {
        use Op::*;
        match *self {
            Noop | Debug | ReturnNil => vec![],
            Arith { dest, lhs, rhs, .. } => vec![dest as u32, lhs as u32, rhs as u32],
            ArithImmediate { dest, .. } => vec![dest as u32],
            Compare { dest, lhs, rhs, .. } => vec![dest as u32, lhs as u32, rhs as u32],
            BitAnd { dest, lhs, rhs } | BitOr { dest, lhs, rhs } | BitXor { dest, lhs, rhs } => {
                vec![dest as u32, lhs as u32, rhs as u32]
            }
            BitNot { dest, src } => vec![dest as u32, src as u32],
            Shift { dest, src, .. } => vec![dest as u32, src as u32],
            Jump { .. } => vec![],
            JumpIf { cond, .. } | JumpIfNot { cond, .. } | JumpIfNil { cond, .. } | JumpIfNotNil { cond, .. } => {
                vec![cond as u32]
            }
            MakeArray { dest } | MakeBuffer { dest } | MakeString { dest } | MakeStruct { dest }
            | MakeTable { dest } | MakeTuple { dest } | MakeBracketTuple { dest }
            | LoadNil { dest } | LoadTrue { dest } | LoadFalse { dest } | LoadSelf { dest } => vec![dest as u32],
            LoadInteger { dest, .. } | LoadConstant { dest, .. } | Closure { dest, .. } => vec![dest as u32],
            LoadUpvalue { dest, far_slot, .. } => vec![dest as u32, far_slot as u32],
            SetUpvalue { src, far_slot, .. } => vec![src as u32, far_slot as u32],
            MoveNear { dest, src } | MoveFar { dest, src } | Length { dest, ds: src } => vec![dest as u32, src as u32],
            Call { dest, callee } => vec![dest as u32, callee as u32],
            TailCall { callee } => vec![callee as u32],
            Return { src } => vec![src as u32],
            Resume { dest, fiber, value } => vec![dest as u32, fiber as u32, value as u32],
            Signal { value, .. } => vec![value as u32],
            Propagate { value } => vec![value as u32],
            Yield { value, .. } => vec![value as u32],
            Cancel { fiber, value } => vec![fiber as u32, value as u32],
            In { dest, ds, key } | Get { dest, ds, key } | Next { dest, ds, key } => {
                vec![dest as u32, ds as u32, key as u32]
            }
            Put { ds, key, value } => vec![ds as u32, key as u32, value as u32],
            GetIndex { dest, ds, index } => vec![dest as u32, ds as u32, index as u32],
            PutIndex { ds, index, value } => vec![ds as u32, index as u32, value as u32],
            TypeCheck { slot, .. } => vec![slot as u32],
            Push { slot } | PushArray { slot } | Error { slot } => vec![slot as u32],
            Push2 { a, b } => vec![a as u32, b as u32],
            Push3 { a, b, c } => vec![a as u32, b as u32, c as u32],
        }
    }

    pub fn constant_index(&self) -> Option<u32> {
        match *self {
            Op::LoadConstant { constant, .. } => Some(constant as u32),
            _ => None,
        }
    }

    pub fn child_def_index(&self) -> Option<u32> {
        match *self {
            Op::Closure { child_def, .. } => Some(child_def as u32),
            _ => None,
        }
    }

    pub fn env_index(&self) -> Option<u32> {
        match *self {
            Op::LoadUpvalue { env, .. } | Op::SetUpvalue { env, .. } => Some(env as u32),
            _ => None,
        }
    }

    /// Absolute instruction index this jump targets, given the current
    /// instruction's index `at` (offsets are relative to the *next*
    /// instruction, per spec §4.E).
    pub fn jump_target(&self, at: i64) -> Option<i64> {
        match *self {
            Op::Jump { offset } => Some(at + 1 + offset as i64),
            Op::JumpIf { offset, .. }
            | Op::JumpIfNot { offset, .. }
            | Op::JumpIfNil { offset, .. }
            | Op::JumpIfNotNil { offset, .. } => Some(at + 1 + offset as i64),
            _ => None,
        }
    }

    /// Type-mask argument for `TYPECHECK`, bit `i` set for `TypeTag` `i`.
    pub fn type_mask_bit(tag: TypeTag) -> u16 {
        1u16 << (tag as u8)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn noop_roundtrips() {
        assert_eq!(Op::decode(Op::Noop.encode()), Some(Op::Noop));
    }

    #[test]
    fn arith_roundtrips_op_and_kind() {
        let op = Op::Arith { op: ArithOp::Mul, kind: NumKind::Real, dest: 1, lhs: 2, rhs: 3 };
        assert_eq!(Op::decode(op.encode()), Some(op));
    }

    #[test]
    fn arith_immediate_roundtrips_signed() {
        let op = Op::ArithImmediate { op: ArithOp::Sub, dest: 4, imm: -100 };
        assert_eq!(Op::decode(op.encode()), Some(op));
    }

    #[test]
    fn jump_offset_sign_extends() {
        let op = Op::Jump { offset: -5 };
        assert_eq!(Op::decode(op.encode()), Some(op));
    }

    #[test]
    fn jump_if_roundtrips_and_computes_target() {
        let op = Op::JumpIf { cond: 9, offset: -3 };
        assert_eq!(Op::decode(op.encode()), Some(op));
        assert_eq!(op.jump_target(10), Some(8));
    }

    #[test]
    fn load_constant_roundtrips_wide_index() {
        let op = Op::LoadConstant { dest: 0, constant: 60000 };
        assert_eq!(Op::decode(op.encode()), Some(op));
        assert_eq!(op.constant_index(), Some(60000));
    }

    #[test]
    fn closure_roundtrips_wide_child_index() {
        let op = Op::Closure { dest: 2, child_def: 40000 };
        assert_eq!(Op::decode(op.encode()), Some(op));
        assert_eq!(op.child_def_index(), Some(40000));
    }

    #[test]
    fn typecheck_mask_roundtrips() {
        let mask = Op::type_mask_bit(TypeTag::Table) | Op::type_mask_bit(TypeTag::Struct);
        let op = Op::TypeCheck { slot: 3, mask };
        assert_eq!(Op::decode(op.encode()), Some(op));
    }

    #[test]
    fn referenced_slots_covers_all_operands() {
        let op = Op::Put { ds: 1, key: 2, value: 3 };
        assert_eq!(op.referenced_slots(), vec![1, 2, 3]);
    }
}
