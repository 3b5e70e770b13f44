//! A fiber that `yield`s three times in a row, ping-ponged by repeated
//! `resume` calls from its parent (spec §4.E fiber state machine).

use janet_asm::{assemble, BytecodeItem, Instruction, Operand, SlotDecl, WireFuncDef};
use janet_core::Value;
use janet_runtime::fiber::{FiberStatus, Signal, SignalMask};
use janet_runtime::funcenv::FunctionData;
use janet_runtime::vm::{Vm, VmConfig};

fn counter_def() -> WireFuncDef {
    let mut wire = WireFuncDef::new("counter", 0);
    wire.slots.push(SlotDecl::named("i"));
    wire.slots.push(SlotDecl::named("limit"));
    wire.slots.push(SlotDecl::named("cond"));

    wire.bytecode.push(BytecodeItem::Instruction(Instruction::new(
        "ldint",
        vec![Operand::SlotName("i".into()), Operand::Imm(1)],
    )));
    wire.bytecode.push(BytecodeItem::Label("loop".into()));
    wire.bytecode.push(BytecodeItem::Instruction(Instruction::new(
        "yield",
        vec![Operand::SlotName("i".into()), Operand::Imm(0)],
    )));
    wire.bytecode.push(BytecodeItem::Instruction(Instruction::new(
        "addim",
        vec![Operand::SlotName("i".into()), Operand::Imm(1)],
    )));
    wire.bytecode.push(BytecodeItem::Instruction(Instruction::new(
        "ldint",
        vec![Operand::SlotName("limit".into()), Operand::Imm(4)],
    )));
    wire.bytecode.push(BytecodeItem::Instruction(Instruction::new(
        "eq",
        vec![
            Operand::SlotName("cond".into()),
            Operand::SlotName("i".into()),
            Operand::SlotName("limit".into()),
        ],
    )));
    wire.bytecode.push(BytecodeItem::Instruction(Instruction::new(
        "jumpno",
        vec![Operand::SlotName("cond".into()), Operand::Label("loop".into())],
    )));
    wire.bytecode.push(BytecodeItem::Instruction(Instruction::new(
        "ret",
        vec![Operand::SlotName("i".into())],
    )));
    wire
}

#[test]
fn yields_then_returns_in_order() {
    let mut vm = Vm::new(VmConfig::default());
    let def = assemble(&counter_def(), &mut vm.interns).unwrap();
    let func = vm.heap.alloc_function(FunctionData { def, envs: Vec::new() });
    let fiber = vm.spawn_fiber(func, SignalMask::default());

    let (signal, value) = vm.resume(fiber, Value::Nil).unwrap();
    assert_eq!(signal, Signal::Yield);
    assert_eq!(value.unwrap_number(), Some(1.0));
    assert_eq!(vm.heap.fibers.get(fiber).unwrap().status, FiberStatus::Pending);

    let (signal, value) = vm.resume(fiber, Value::Nil).unwrap();
    assert_eq!(signal, Signal::Yield);
    assert_eq!(value.unwrap_number(), Some(2.0));

    let (signal, value) = vm.resume(fiber, Value::Nil).unwrap();
    assert_eq!(signal, Signal::Yield);
    assert_eq!(value.unwrap_number(), Some(3.0));

    let (signal, value) = vm.resume(fiber, Value::Nil).unwrap();
    assert_eq!(signal, Signal::Ok);
    assert_eq!(value.unwrap_number(), Some(4.0));
    assert_eq!(vm.heap.fibers.get(fiber).unwrap().status, FiberStatus::Dead);
}
