//! The bytecode dispatch loop (spec §4.E).
//!
//! `resume` is the sole entry point: it drives a fiber's interpreter loop
//! until the fiber dies, yields, errors, or pauses in a debug/user status,
//! then returns the `(Signal, Value)` pair the caller's own `RESUME`
//! instruction (or top-level embedder) receives. There is no
//! `setjmp`/`longjmp` here — Rust's `?` operator and `Result` do the work
//! the C interpreter's jump-buffer restore protocol does.

use janet_core::value::FiberRef;
use janet_core::Value;

use crate::error::VmError;
use crate::fiber::{FiberStatus, Signal};
use crate::funcdef::EnvSource;
use crate::funcenv::{FuncEnvData, FuncEnvStorage, FunctionData};
use crate::opcodes::{ArithOp, CmpOp, NumKind, Op, ShiftOp};
use crate::table::TableData;
use crate::vm::Vm;

enum Step {
    Continue,
    Suspend(Signal, Value),
}

pub fn resume(vm: &mut Vm, fiber_ref: FiberRef, value: Value) -> Result<(Signal, Value), VmError> {
    let status = vm
        .heap
        .fibers
        .get(fiber_ref)
        .map(|f| f.status)
        .ok_or_else(|| VmError::Panic("resume of a freed fiber".to_string()))?;

    match status {
        FiberStatus::Dead | FiberStatus::Error => {
            return Err(VmError::Panic(
                "cannot resume a dead or errored fiber".to_string(),
            ));
        }
        _ => {}
    }

    if let Some(cancel_value) = vm
        .heap
        .fibers
        .get_mut(fiber_ref)
        .and_then(|f| f.pending_cancel.take())
    {
        let fiber = vm.heap.fibers.get_mut(fiber_ref).unwrap();
        fiber.status = FiberStatus::Error;
        fiber.last_value = cancel_value.clone();
        return Ok((Signal::Error, cancel_value));
    }

    match status {
        FiberStatus::New => {
            let func = vm.heap.fibers.get(fiber_ref).unwrap().frames[0].func.unwrap();
            let slot_count = vm
                .heap
                .functions
                .get(func)
                .map(|f| f.def.slot_count)
                .unwrap_or(0);
            let fiber = vm.heap.fibers.get_mut(fiber_ref).unwrap();
            fiber.status = FiberStatus::Alive;
            fiber.data.resize(slot_count as usize, Value::Nil);
            if slot_count > 0 {
                fiber.data[0] = value;
            }
        }
        FiberStatus::Pending => {
            let fiber = vm.heap.fibers.get_mut(fiber_ref).unwrap();
            fiber.status = FiberStatus::Alive;
            if let Some(slot) = fiber.current_frame().pending_resume_slot() {
                fiber.set_slot(slot as u32, value);
            }
        }
        _ => {}
    }

    let prev = vm.current_fiber.replace(fiber_ref);
    let result = run(vm, fiber_ref);
    vm.current_fiber = prev;
    result
}

fn run(vm: &mut Vm, fiber_ref: FiberRef) -> Result<(Signal, Value), VmError> {
    loop {
        vm.maybe_collect();

        let func_ref = vm.heap.fibers.get(fiber_ref).unwrap().current_frame().func;
        let func_ref = func_ref.ok_or_else(|| VmError::Panic("frame has no function".to_string()))?;
        let def = vm
            .heap
            .functions
            .get(func_ref)
            .ok_or_else(|| VmError::Panic("function was freed".to_string()))?
            .def
            .clone();
        let pc = vm.heap.fibers.get(fiber_ref).unwrap().current_frame().pc;
        let word = *def
            .bytecode
            .get(pc)
            .ok_or_else(|| VmError::Verification("pc ran past end of bytecode".to_string()))?;
        let op = Op::decode(word)
            .ok_or_else(|| VmError::Verification(format!("unknown opcode at pc {pc}")))?;

        let advance_pc = !matches!(
            op,
            Op::Jump { .. }
                | Op::JumpIf { .. }
                | Op::JumpIfNot { .. }
                | Op::JumpIfNil { .. }
                | Op::JumpIfNotNil { .. }
                | Op::Call { .. }
                | Op::TailCall { .. }
                | Op::Return { .. }
                | Op::ReturnNil
        );

        match step(vm, fiber_ref, op, pc)? {
            Step::Continue => {
                if advance_pc {
                    vm.heap.fibers.get_mut(fiber_ref).unwrap().current_frame_mut().pc += 1;
                }
            }
            Step::Suspend(signal, value) => return Ok((signal, value)),
        }
    }
}

fn as_number(v: &Value) -> Result<f64, VmError> {
    v.unwrap_number()
        .ok_or_else(|| VmError::Type { expected: "number", got: v.type_of() })
}

fn arith(op: ArithOp, kind: NumKind, a: f64, b: f64) -> Result<f64, VmError> {
    match kind {
        NumKind::Real => Ok(match op {
            ArithOp::Add => a + b,
            ArithOp::Sub => a - b,
            ArithOp::Mul => a * b,
            ArithOp::Div => a / b,
            ArithOp::Mod => a - b * (a / b).floor(),
            ArithOp::Rem => a % b,
        }),
        NumKind::Integer => {
            let ia = a as i64;
            let ib = b as i64;
            let result = match op {
                ArithOp::Add => ia.checked_add(ib),
                ArithOp::Sub => ia.checked_sub(ib),
                ArithOp::Mul => ia.checked_mul(ib),
                ArithOp::Div => {
                    if ib == 0 {
                        return Err(VmError::Arithmetic("integer division by zero".to_string()));
                    }
                    ia.checked_div(ib)
                }
                ArithOp::Mod => {
                    if ib == 0 {
                        return Err(VmError::Arithmetic("integer modulo by zero".to_string()));
                    }
                    Some(ia.rem_euclid(ib))
                }
                ArithOp::Rem => {
                    if ib == 0 {
                        return Err(VmError::Arithmetic("integer remainder by zero".to_string()));
                    }
                    ia.checked_rem(ib)
                }
            };
            result
                .map(|r| r as f64)
                .ok_or_else(|| VmError::Arithmetic("signed integer overflow".to_string()))
        }
    }
}

fn step(vm: &mut Vm, fiber_ref: FiberRef, op: Op, pc: usize) -> Result<Step, VmError> {
    match op {
        Op::Noop | Op::Debug => Ok(Step::Continue),

        Op::Arith { op, kind, dest, lhs, rhs } => {
            let fiber = vm.heap.fibers.get(fiber_ref).unwrap();
            let a = as_number(fiber.slot(lhs as u32))?;
            let b = as_number(fiber.slot(rhs as u32))?;
            let r = arith(op, kind, a, b)?;
            set(vm, fiber_ref, dest, Value::number(r));
            Ok(Step::Continue)
        }

        Op::ArithImmediate { op, dest, imm } => {
            let fiber = vm.heap.fibers.get(fiber_ref).unwrap();
            let a = as_number(fiber.slot(dest as u32))?;
            let r = arith(op, NumKind::Real, a, imm as f64)?;
            set(vm, fiber_ref, dest, Value::number(r));
            Ok(Step::Continue)
        }

        Op::Compare { op, dest, lhs, rhs } => {
            let fiber = vm.heap.fibers.get(fiber_ref).unwrap();
            let a = fiber.slot(lhs as u32).clone();
            let b = fiber.slot(rhs as u32).clone();
            use std::cmp::Ordering::*;
            let result = match op {
                CmpOp::Eq => a.equals(&b),
                CmpOp::Neq => !a.equals(&b),
                CmpOp::Lt => a.compare(&b) == Less,
                CmpOp::Lte => a.compare(&b) != Greater,
                CmpOp::Gt => a.compare(&b) == Greater,
                CmpOp::Gte => a.compare(&b) != Less,
            };
            set(vm, fiber_ref, dest, Value::boolean(result));
            Ok(Step::Continue)
        }

        Op::BitAnd { dest, lhs, rhs } => bitwise(vm, fiber_ref, dest, lhs, rhs, |a, b| a & b),
        Op::BitOr { dest, lhs, rhs } => bitwise(vm, fiber_ref, dest, lhs, rhs, |a, b| a | b),
        Op::BitXor { dest, lhs, rhs } => bitwise(vm, fiber_ref, dest, lhs, rhs, |a, b| a ^ b),

        Op::BitNot { dest, src } => {
            let fiber = vm.heap.fibers.get(fiber_ref).unwrap();
            let a = as_number(fiber.slot(src as u32))? as i64;
            set(vm, fiber_ref, dest, Value::number(!a as f64));
            Ok(Step::Continue)
        }

        Op::Shift { op, dest, src, amount } => {
            let fiber = vm.heap.fibers.get(fiber_ref).unwrap();
            let a = as_number(fiber.slot(src as u32))? as i64;
            let r = match op {
                ShiftOp::Left => a.wrapping_shl(amount as u32),
                ShiftOp::RightArithmetic => a.wrapping_shr(amount as u32),
                ShiftOp::RightLogical => ((a as u64) >> (amount as u32 & 63)) as i64,
            };
            set(vm, fiber_ref, dest, Value::number(r as f64));
            Ok(Step::Continue)
        }

        Op::Jump { offset } => {
            jump_to(vm, fiber_ref, pc, 1 + offset as i64);
            Ok(Step::Continue)
        }
        Op::JumpIf { cond, offset } => {
            let truthy = vm.heap.fibers.get(fiber_ref).unwrap().slot(cond as u32).truthy();
            jump_to(vm, fiber_ref, pc, if truthy { 1 + offset as i64 } else { 1 });
            Ok(Step::Continue)
        }
        Op::JumpIfNot { cond, offset } => {
            let truthy = vm.heap.fibers.get(fiber_ref).unwrap().slot(cond as u32).truthy();
            jump_to(vm, fiber_ref, pc, if !truthy { 1 + offset as i64 } else { 1 });
            Ok(Step::Continue)
        }
        Op::JumpIfNil { cond, offset } => {
            let is_nil = matches!(vm.heap.fibers.get(fiber_ref).unwrap().slot(cond as u32), Value::Nil);
            jump_to(vm, fiber_ref, pc, if is_nil { 1 + offset as i64 } else { 1 });
            Ok(Step::Continue)
        }
        Op::JumpIfNotNil { cond, offset } => {
            let is_nil = matches!(vm.heap.fibers.get(fiber_ref).unwrap().slot(cond as u32), Value::Nil);
            jump_to(vm, fiber_ref, pc, if !is_nil { 1 + offset as i64 } else { 1 });
            Ok(Step::Continue)
        }

        Op::LoadNil { dest } => { set(vm, fiber_ref, dest, Value::Nil); Ok(Step::Continue) }
        Op::LoadTrue { dest } => { set(vm, fiber_ref, dest, Value::boolean(true)); Ok(Step::Continue) }
        Op::LoadFalse { dest } => { set(vm, fiber_ref, dest, Value::boolean(false)); Ok(Step::Continue) }
        Op::LoadInteger { dest, value } => { set(vm, fiber_ref, dest, Value::number(value as f64)); Ok(Step::Continue) }
        Op::LoadConstant { dest, constant } => {
            let func_ref = vm.heap.fibers.get(fiber_ref).unwrap().current_frame().func.unwrap();
            let v = vm.heap.functions.get(func_ref).unwrap().def.constants[constant as usize].clone();
            set(vm, fiber_ref, dest, v);
            Ok(Step::Continue)
        }
        Op::LoadSelf { dest } => {
            let func_ref = vm.heap.fibers.get(fiber_ref).unwrap().current_frame().func.unwrap();
            set(vm, fiber_ref, dest, Value::Function(func_ref));
            Ok(Step::Continue)
        }
        Op::LoadUpvalue { dest, env, far_slot } => {
            let v = read_upvalue(vm, fiber_ref, env, far_slot)?;
            set(vm, fiber_ref, dest, v);
            Ok(Step::Continue)
        }
        Op::SetUpvalue { src, env, far_slot } => {
            let v = vm.heap.fibers.get(fiber_ref).unwrap().slot(src as u32).clone();
            write_upvalue(vm, fiber_ref, env, far_slot, v)?;
            Ok(Step::Continue)
        }
        Op::MoveNear { dest, src } | Op::MoveFar { dest, src } => {
            let v = vm.heap.fibers.get(fiber_ref).unwrap().slot(src as u32).clone();
            set(vm, fiber_ref, dest, v);
            Ok(Step::Continue)
        }

        Op::MakeArray { dest } => {
            let values = take_staged(vm, fiber_ref);
            let r = vm.heap.alloc_array(crate::array::ArrayData::from_values(values));
            set(vm, fiber_ref, dest, Value::Array(r));
            Ok(Step::Continue)
        }
        Op::MakeBuffer { dest } => {
            let values = take_staged(vm, fiber_ref);
            let bytes: Vec<u8> = values
                .iter()
                .map(|v| as_number(v).map(|n| n.rem_euclid(256.0) as u8))
                .collect::<Result<_, _>>()?;
            let r = vm.heap.alloc_buffer(crate::buffer::BufferData::from_bytes(bytes));
            set(vm, fiber_ref, dest, Value::Buffer(r));
            Ok(Step::Continue)
        }
        Op::MakeString { dest } => {
            let values = take_staged(vm, fiber_ref);
            let bytes: Vec<u8> = values
                .iter()
                .map(|v| as_number(v).map(|n| n.rem_euclid(256.0) as u8))
                .collect::<Result<_, _>>()?;
            set(vm, fiber_ref, dest, Value::string(String::from_utf8_lossy(&bytes).into_owned()));
            Ok(Step::Continue)
        }
        Op::MakeTuple { dest } | Op::MakeBracketTuple { dest } => {
            let values = take_staged(vm, fiber_ref);
            let bracket = if matches!(op, Op::MakeBracketTuple { .. }) {
                janet_core::BracketKind::Bracket
            } else {
                janet_core::BracketKind::Paren
            };
            let mut builder = janet_core::TupleBuilder::begin(values.len());
            for v in values {
                builder.put(v);
            }
            set(vm, fiber_ref, dest, Value::Tuple(builder.end(bracket)));
            Ok(Step::Continue)
        }
        Op::MakeStruct { dest } => {
            let values = take_staged(vm, fiber_ref);
            let mut builder = janet_core::StructBuilder::begin(values.len() / 2);
            for pair in values.chunks(2) {
                if let [k, v] = pair {
                    builder.put(k.clone(), v.clone());
                }
            }
            set(vm, fiber_ref, dest, Value::Struct(builder.end()));
            Ok(Step::Continue)
        }
        Op::MakeTable { dest } => {
            let values = take_staged(vm, fiber_ref);
            let mut table = TableData::new((values.len() / 2).max(4));
            for pair in values.chunks(2) {
                if let [k, v] = pair {
                    table.put(k.clone(), v.clone());
                }
            }
            let r = vm.heap.alloc_table(table);
            set(vm, fiber_ref, dest, Value::Table(r));
            Ok(Step::Continue)
        }

        Op::Push { slot } => {
            let v = vm.heap.fibers.get(fiber_ref).unwrap().slot(slot as u32).clone();
            vm.heap.fibers.get_mut(fiber_ref).unwrap().arg_stage.push(v);
            Ok(Step::Continue)
        }
        Op::Push2 { a, b } => {
            let fiber = vm.heap.fibers.get(fiber_ref).unwrap();
            let (va, vb) = (fiber.slot(a as u32).clone(), fiber.slot(b as u32).clone());
            let fiber = vm.heap.fibers.get_mut(fiber_ref).unwrap();
            fiber.arg_stage.push(va);
            fiber.arg_stage.push(vb);
            Ok(Step::Continue)
        }
        Op::Push3 { a, b, c } => {
            let fiber = vm.heap.fibers.get(fiber_ref).unwrap();
            let (va, vb, vc) = (
                fiber.slot(a as u32).clone(),
                fiber.slot(b as u32).clone(),
                fiber.slot(c as u32).clone(),
            );
            let fiber = vm.heap.fibers.get_mut(fiber_ref).unwrap();
            fiber.arg_stage.push(va);
            fiber.arg_stage.push(vb);
            fiber.arg_stage.push(vc);
            Ok(Step::Continue)
        }
        Op::PushArray { slot } => {
            let v = vm.heap.fibers.get(fiber_ref).unwrap().slot(slot as u32).clone();
            let elems: Vec<Value> = match v {
                Value::Array(r) => vm.heap.arrays.get(r).map(|a| a.as_slice().to_vec()).unwrap_or_default(),
                Value::Tuple(t) => t.as_slice().to_vec(),
                _ => return Err(VmError::Type { expected: "indexed", got: v.type_of() }),
            };
            vm.heap.fibers.get_mut(fiber_ref).unwrap().arg_stage.extend(elems);
            Ok(Step::Continue)
        }

        Op::Call { dest, callee } => do_call(vm, fiber_ref, Some(dest), callee, false),
        Op::TailCall { callee } => do_call(vm, fiber_ref, None, callee, true),

        Op::Return { src } => {
            let v = vm.heap.fibers.get(fiber_ref).unwrap().slot(src as u32).clone();
            do_return(vm, fiber_ref, v)
        }
        Op::ReturnNil => do_return(vm, fiber_ref, Value::Nil),

        Op::Closure { dest, child_def } => {
            let v = make_closure(vm, fiber_ref, child_def)?;
            set(vm, fiber_ref, dest, v);
            Ok(Step::Continue)
        }

        Op::TypeCheck { slot, mask } => {
            let v = vm.heap.fibers.get(fiber_ref).unwrap().slot(slot as u32).clone();
            let bit = Op::type_mask_bit(v.type_of());
            if mask & bit == 0 {
                return Err(VmError::Type { expected: "typecheck mask member", got: v.type_of() });
            }
            Ok(Step::Continue)
        }

        Op::Get { dest, ds, key } | Op::In { dest, ds, key } => {
            let fiber = vm.heap.fibers.get(fiber_ref).unwrap();
            let (container, k) = (fiber.slot(ds as u32).clone(), fiber.slot(key as u32).clone());
            let v = get_value(vm, &container, &k)?;
            set(vm, fiber_ref, dest, v);
            Ok(Step::Continue)
        }
        Op::Put { ds, key, value } => {
            let fiber = vm.heap.fibers.get(fiber_ref).unwrap();
            let (container, k, v) = (
                fiber.slot(ds as u32).clone(),
                fiber.slot(key as u32).clone(),
                fiber.slot(value as u32).clone(),
            );
            put_value(vm, &container, k, v)?;
            Ok(Step::Continue)
        }
        Op::GetIndex { dest, ds, index } => {
            let fiber = vm.heap.fibers.get(fiber_ref).unwrap();
            let (container, i) = (fiber.slot(ds as u32).clone(), fiber.slot(index as u32).clone());
            let idx = as_number(&i)? as i64;
            let v = get_index_value(vm, &container, idx)?;
            set(vm, fiber_ref, dest, v);
            Ok(Step::Continue)
        }
        Op::PutIndex { ds, index, value } => {
            let fiber = vm.heap.fibers.get(fiber_ref).unwrap();
            let (container, i, v) = (
                fiber.slot(ds as u32).clone(),
                fiber.slot(index as u32).clone(),
                fiber.slot(value as u32).clone(),
            );
            let idx = as_number(&i)? as i64;
            put_index_value(vm, &container, idx, v)?;
            Ok(Step::Continue)
        }
        Op::Length { dest, ds } => {
            let container = vm.heap.fibers.get(fiber_ref).unwrap().slot(ds as u32).clone();
            let len = length_of(vm, &container)?;
            set(vm, fiber_ref, dest, Value::number(len as f64));
            Ok(Step::Continue)
        }
        Op::Next { dest, ds, key } => {
            let fiber = vm.heap.fibers.get(fiber_ref).unwrap();
            let (container, k) = (fiber.slot(ds as u32).clone(), fiber.slot(key as u32).clone());
            let r = match container {
                Value::Table(t) => {
                    let cursor = if matches!(k, Value::Nil) { None } else { Some(k) };
                    vm.heap
                        .tables
                        .get(t)
                        .and_then(|td| td.next_key(cursor.as_ref()))
                        .cloned()
                        .unwrap_or(Value::Nil)
                }
                _ => return Err(VmError::Type { expected: "table", got: container.type_of() }),
            };
            set(vm, fiber_ref, dest, r);
            Ok(Step::Continue)
        }

        Op::Resume { dest, fiber: target_slot, value } => {
            let fiber = vm.heap.fibers.get(fiber_ref).unwrap();
            let target = fiber.slot(target_slot as u32).clone();
            let val = fiber.slot(value as u32).clone();
            let target_ref = target
                .unwrap_fiber()
                .ok_or_else(|| VmError::Type { expected: "fiber", got: target.type_of() })?;

            vm.heap.fibers.get_mut(fiber_ref).unwrap().child = Some(target_ref);
            let outcome = crate::interp::resume(vm, target_ref, val)?;
            vm.heap.fibers.get_mut(fiber_ref).unwrap().child = None;

            let (signal, result_value) = outcome;
            if signal == Signal::Error {
                let mask = vm.heap.fibers.get(fiber_ref).unwrap().mask;
                if !mask.catches(Signal::Error) {
                    let fiber = vm.heap.fibers.get_mut(fiber_ref).unwrap();
                    fiber.status = FiberStatus::Error;
                    fiber.last_value = result_value.clone();
                    return Ok(Step::Suspend(Signal::Error, result_value));
                }
            }
            set(vm, fiber_ref, dest, result_value);
            Ok(Step::Continue)
        }

        Op::Signal { value, code } => {
            let v = vm.heap.fibers.get(fiber_ref).unwrap().slot(value as u32).clone();
            let signal = signal_from_code(code);
            Ok(suspend_with(vm, fiber_ref, value, signal, v))
        }
        Op::Yield { value, code } => {
            let v = vm.heap.fibers.get(fiber_ref).unwrap().slot(value as u32).clone();
            let signal = if code == 0 { Signal::Yield } else { signal_from_code(code) };
            Ok(suspend_with(vm, fiber_ref, value, signal, v))
        }
        Op::Propagate { value } => {
            let v = vm.heap.fibers.get(fiber_ref).unwrap().slot(value as u32).clone();
            Ok(suspend_with(vm, fiber_ref, value, Signal::Error, v))
        }
        Op::Cancel { fiber: target_slot, value } => {
            let fiber = vm.heap.fibers.get(fiber_ref).unwrap();
            let target = fiber.slot(target_slot as u32).clone();
            let v = fiber.slot(value as u32).clone();
            if let Some(target_ref) = target.unwrap_fiber() {
                vm.cancel(target_ref, v);
            }
            Ok(Step::Continue)
        }

        Op::Error { slot } => {
            let v = vm.heap.fibers.get(fiber_ref).unwrap().slot(slot as u32).clone();
            Ok(suspend_with(vm, fiber_ref, slot, Signal::Error, v))
        }
    }
}

fn signal_from_code(code: u8) -> Signal {
    match code {
        0 => Signal::Ok,
        1 => Signal::Error,
        2 => Signal::Debug,
        n => Signal::User(n - 3),
    }
}

/// Parks the fiber in the status matching `signal`, records `value` as its
/// `last_value`, and remembers `dest_slot` so a later `resume` can refill it
/// (only meaningful for `Yield`; terminal signals never resume again).
fn suspend_with(vm: &mut Vm, fiber_ref: FiberRef, dest_slot: u8, signal: Signal, value: Value) -> Step {
    let fiber = vm.heap.fibers.get_mut(fiber_ref).unwrap();
    fiber.last_value = value.clone();
    fiber.status = match signal {
        Signal::Yield => FiberStatus::Pending,
        Signal::Error => FiberStatus::Error,
        Signal::Debug => FiberStatus::Debug,
        Signal::User(n) => FiberStatus::User(n),
        Signal::Ok => FiberStatus::Pending,
    };
    fiber.current_frame_mut().set_pending_resume_slot(dest_slot);
    fiber.current_frame_mut().pc += 1;
    Step::Suspend(signal, value)
}

fn set(vm: &mut Vm, fiber_ref: FiberRef, dest: u8, value: Value) {
    vm.heap.fibers.get_mut(fiber_ref).unwrap().set_slot(dest as u32, value);
}

fn bitwise(
    vm: &mut Vm,
    fiber_ref: FiberRef,
    dest: u8,
    lhs: u8,
    rhs: u8,
    f: impl Fn(i64, i64) -> i64,
) -> Result<Step, VmError> {
    let fiber = vm.heap.fibers.get(fiber_ref).unwrap();
    let a = as_number(fiber.slot(lhs as u32))? as i64;
    let b = as_number(fiber.slot(rhs as u32))? as i64;
    set(vm, fiber_ref, dest, Value::number(f(a, b) as f64));
    Ok(Step::Continue)
}

fn jump_to(vm: &mut Vm, fiber_ref: FiberRef, pc: usize, delta: i64) {
    let frame = vm.heap.fibers.get_mut(fiber_ref).unwrap().current_frame_mut();
    frame.pc = (pc as i64 + delta) as usize;
}

fn take_staged(vm: &mut Vm, fiber_ref: FiberRef) -> Vec<Value> {
    std::mem::take(&mut vm.heap.fibers.get_mut(fiber_ref).unwrap().arg_stage)
}

fn read_upvalue(vm: &mut Vm, fiber_ref: FiberRef, env_idx: u8, far_slot: u8) -> Result<Value, VmError> {
    let func_ref = vm.heap.fibers.get(fiber_ref).unwrap().current_frame().func.unwrap();
    let env_ref = vm
        .heap
        .functions
        .get(func_ref)
        .and_then(|f| f.envs.get(env_idx as usize).copied().flatten())
        .ok_or_else(|| VmError::Verification("upvalue env not captured".to_string()))?;
    let env = vm.heap.func_envs.get(env_ref).ok_or_else(|| VmError::Panic("env freed".to_string()))?;
    match &env.storage {
        FuncEnvStorage::Detached { values } => Ok(values[far_slot as usize].clone()),
        FuncEnvStorage::OnStack { fiber, offset } => {
            let owner = vm.heap.fibers.get(*fiber).ok_or_else(|| VmError::Panic("owning fiber freed".to_string()))?;
            Ok(owner.data[offset + far_slot as usize].clone())
        }
    }
}

fn write_upvalue(vm: &mut Vm, fiber_ref: FiberRef, env_idx: u8, far_slot: u8, value: Value) -> Result<(), VmError> {
    let func_ref = vm.heap.fibers.get(fiber_ref).unwrap().current_frame().func.unwrap();
    let env_ref = vm
        .heap
        .functions
        .get(func_ref)
        .and_then(|f| f.envs.get(env_idx as usize).copied().flatten())
        .ok_or_else(|| VmError::Verification("upvalue env not captured".to_string()))?;
    let (owner, offset) = {
        let env = vm.heap.func_envs.get(env_ref).ok_or_else(|| VmError::Panic("env freed".to_string()))?;
        match &env.storage {
            FuncEnvStorage::Detached { .. } => (None, 0),
            FuncEnvStorage::OnStack { fiber, offset } => (Some(*fiber), *offset),
        }
    };
    match owner {
        Some(owner_ref) => {
            let owner = vm.heap.fibers.get_mut(owner_ref).unwrap();
            owner.data[offset + far_slot as usize] = value;
        }
        None => {
            let env = vm.heap.func_envs.get_mut(env_ref).unwrap();
            if let FuncEnvStorage::Detached { values } = &mut env.storage {
                values[far_slot as usize] = value;
            }
        }
    }
    Ok(())
}

fn make_closure(vm: &mut Vm, fiber_ref: FiberRef, child_def_idx: u16) -> Result<Value, VmError> {
    let func_ref = vm.heap.fibers.get(fiber_ref).unwrap().current_frame().func.unwrap();
    let (child_def, parent_envs) = {
        let parent = vm.heap.functions.get(func_ref).unwrap();
        (parent.def.child_defs[child_def_idx as usize].clone(), parent.envs.clone())
    };

    let frame_base = vm.heap.fibers.get(fiber_ref).unwrap().current_frame().base;
    let parent_slot_count = vm.heap.functions.get(func_ref).unwrap().def.slot_count;

    let mut envs = Vec::with_capacity(child_def.environments.len());
    let mut captured_env = None;
    for entry in &child_def.environments {
        let env_ref = match entry {
            EnvSource::OnStack => {
                let data = FuncEnvData::on_stack(fiber_ref, frame_base, parent_slot_count as usize);
                let r = vm.heap.alloc_func_env(data);
                captured_env.get_or_insert(r);
                Some(r)
            }
            EnvSource::Shared(k) => parent_envs.get(*k as usize).copied().flatten(),
        };
        envs.push(env_ref);
    }

    if let Some(env_ref) = captured_env {
        vm.heap.fibers.get_mut(fiber_ref).unwrap().current_frame_mut().env = Some(env_ref);
    }

    let data = FunctionData { def: child_def, envs };
    Ok(Value::Function(vm.heap.alloc_function(data)))
}

fn do_call(vm: &mut Vm, fiber_ref: FiberRef, dest: Option<u8>, callee_slot: u8, is_tail: bool) -> Result<Step, VmError> {
    let callee = vm.heap.fibers.get(fiber_ref).unwrap().slot(callee_slot as u32).clone();
    let args = take_staged(vm, fiber_ref);

    match callee {
        Value::Function(func_ref) => {
            let def = vm.heap.functions.get(func_ref).unwrap().def.clone();
            let argc = args.len() as u32;
            let arity_ok = if def.vararg {
                argc >= def.min_arity
            } else {
                argc >= def.min_arity && argc <= def.max_arity
            };
            if !arity_ok {
                return Err(VmError::Arity { expected: (def.min_arity, def.max_arity), got: argc });
            }

            let mut locals = vec![Value::Nil; def.slot_count as usize];
            let fixed = def.arity.min(argc) as usize;
            locals[..fixed].clone_from_slice(&args[..fixed]);
            if def.vararg {
                let rest: Vec<Value> = args.get(def.arity as usize..).map(|s| s.to_vec()).unwrap_or_default();
                let mut builder = janet_core::TupleBuilder::begin(rest.len());
                for v in rest {
                    builder.put(v);
                }
                locals[def.arity as usize] = Value::Tuple(builder.end(janet_core::BracketKind::Paren));
            }

            if is_tail {
                detach_current_env_if_needed(vm, fiber_ref);
                let fiber = vm.heap.fibers.get_mut(fiber_ref).unwrap();
                let base = fiber.current_frame().base;
                fiber.data.truncate(base);
                fiber.data.extend(locals);
                let frame = fiber.current_frame_mut();
                frame.pc = 0;
                frame.func = Some(func_ref);
                frame.env = None;
                frame.slot_count = def.slot_count;
                frame.tailcall = true;
            } else {
                let fiber = vm.heap.fibers.get_mut(fiber_ref).unwrap();
                let base = fiber.data.len();
                if base + def.slot_count as usize > fiber.max_stack {
                    return Err(VmError::StackOverflow);
                }
                let prev_frame = fiber.frame;
                fiber.data.extend(locals);
                fiber.frames.push(crate::fiber::StackFrame {
                    prevframe: Some(prev_frame),
                    base,
                    slot_count: def.slot_count,
                    pc: 0,
                    func: Some(func_ref),
                    env: None,
                    tailcall: false,
                    pending_resume_slot: None,
                    call_dest_slot: dest,
                });
                fiber.frame = fiber.frames.len() - 1;
            }
            Ok(Step::Continue)
        }
        Value::CFunction(id) => {
            let result = vm.call_cfunction(id, &args)?;
            if is_tail {
                do_return(vm, fiber_ref, result)
            } else {
                set(vm, fiber_ref, dest.unwrap(), result);
                vm.heap.fibers.get_mut(fiber_ref).unwrap().current_frame_mut().pc += 1;
                Ok(Step::Continue)
            }
        }
        other => Err(VmError::Type { expected: "callable", got: other.type_of() }),
    }
}

/// Copies an on-stack env's current slot values out into an owned vector so
/// it keeps working once its owning frame is gone (spec §4.D "Env
/// detachment"). A no-op when the frame never had its env captured.
fn detach_current_env_if_needed(vm: &mut Vm, fiber_ref: FiberRef) {
    let (env_ref, base, length) = {
        let fiber = vm.heap.fibers.get(fiber_ref).unwrap();
        let frame = fiber.current_frame();
        (frame.env, frame.base, frame.slot_count as usize)
    };
    if let Some(env_ref) = env_ref {
        let values = vm.heap.fibers.get(fiber_ref).unwrap().data[base..base + length].to_vec();
        if let Some(env) = vm.heap.func_envs.get_mut(env_ref) {
            env.detach(values);
        }
    }
}

fn do_return(vm: &mut Vm, fiber_ref: FiberRef, value: Value) -> Result<Step, VmError> {
    detach_current_env_if_needed(vm, fiber_ref);

    let fiber = vm.heap.fibers.get_mut(fiber_ref).unwrap();
    let popped = fiber.frames.pop().unwrap();
    fiber.data.truncate(popped.base);

    match popped.prevframe {
        None => {
            fiber.frames.push(popped);
            fiber.status = FiberStatus::Dead;
            fiber.last_value = value.clone();
            Ok(Step::Suspend(Signal::Ok, value))
        }
        Some(prev_index) => {
            fiber.frame = prev_index;
            fiber.current_frame_mut().pc += 1;
            if let Some(dest) = popped.call_dest_slot {
                fiber.set_slot(dest as u32, value);
            }
            Ok(Step::Continue)
        }
    }
}

fn get_value(vm: &mut Vm, container: &Value, key: &Value) -> Result<Value, VmError> {
    match container {
        Value::Table(t) => Ok(vm.heap.tables.get(*t).and_then(|td| td.get(&vm.heap, key)).unwrap_or(Value::Nil)),
        Value::Struct(s) => Ok(s.get(key).cloned().unwrap_or(Value::Nil)),
        Value::Array(a) => {
            let idx = as_number(key)? as i64;
            Ok(vm.heap.arrays.get(*a).and_then(|ad| ad.get_index(idx)).cloned().unwrap_or(Value::Nil))
        }
        _ => Err(VmError::Type { expected: "dictionary or indexed", got: container.type_of() }),
    }
}

fn put_value(vm: &mut Vm, container: &Value, key: Value, value: Value) -> Result<(), VmError> {
    match container {
        Value::Table(t) => {
            if matches!(key, Value::Nil) {
                return Err(VmError::Key("nil key".to_string()));
            }
            if let Some(td) = vm.heap.tables.get_mut(*t) {
                td.put(key, value);
            }
            Ok(())
        }
        Value::Array(a) => {
            let idx = as_number(&key)? as i64;
            let ok = vm.heap.arrays.get_mut(*a).map(|ad| ad.put_index(idx, value)).unwrap_or(false);
            if ok {
                Ok(())
            } else {
                Err(VmError::Index { index: idx, length: vm.heap.arrays.get(*a).map(|a| a.count()).unwrap_or(0) })
            }
        }
        _ => Err(VmError::Type { expected: "mutable dictionary or indexed", got: container.type_of() }),
    }
}

fn get_index_value(vm: &mut Vm, container: &Value, idx: i64) -> Result<Value, VmError> {
    match container {
        Value::Array(a) => Ok(vm.heap.arrays.get(*a).and_then(|ad| ad.get_index(idx)).cloned().unwrap_or(Value::Nil)),
        Value::Tuple(t) => Ok(if idx < 0 { None } else { t.get(idx as usize) }.cloned().unwrap_or(Value::Nil)),
        Value::Buffer(b) => Ok(vm
            .heap
            .buffers
            .get(*b)
            .and_then(|bd| bd.get_index(idx))
            .map(|n| Value::number(n as f64))
            .unwrap_or(Value::Nil)),
        Value::String(s) => Ok(s.as_bytes().get(idx.max(0) as usize).map(|&b| Value::number(b as f64)).unwrap_or(Value::Nil)),
        _ => Err(VmError::Type { expected: "indexed or bytes", got: container.type_of() }),
    }
}

fn put_index_value(vm: &mut Vm, container: &Value, idx: i64, value: Value) -> Result<(), VmError> {
    match container {
        Value::Array(a) => {
            if vm.heap.arrays.get_mut(*a).map(|ad| ad.put_index(idx, value)).unwrap_or(false) {
                Ok(())
            } else {
                Err(VmError::Index { index: idx, length: vm.heap.arrays.get(*a).map(|a| a.count()).unwrap_or(0) })
            }
        }
        Value::Buffer(b) => {
            let n = as_number(&value)? as i64;
            if vm.heap.buffers.get_mut(*b).map(|bd| bd.put_index(idx, n)).unwrap_or(false) {
                Ok(())
            } else {
                Err(VmError::Index { index: idx, length: vm.heap.buffers.get(*b).map(|b| b.count()).unwrap_or(0) })
            }
        }
        _ => Err(VmError::Type { expected: "mutable indexed or bytes", got: container.type_of() }),
    }
}

fn length_of(vm: &mut Vm, container: &Value) -> Result<usize, VmError> {
    match container {
        Value::Array(a) => Ok(vm.heap.arrays.get(*a).map(|a| a.count()).unwrap_or(0)),
        Value::Buffer(b) => Ok(vm.heap.buffers.get(*b).map(|b| b.count()).unwrap_or(0)),
        Value::Table(t) => Ok(vm.heap.tables.get(*t).map(|t| t.count()).unwrap_or(0)),
        Value::Tuple(t) => Ok(t.len()),
        Value::Struct(s) => Ok(s.len()),
        Value::String(s) => Ok(s.len()),
        _ => Err(VmError::Core(janet_core::CoreError::NoLength(container.type_of()))),
    }
}
