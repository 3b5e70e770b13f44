//! Tail calls reuse the current frame instead of pushing a new one, so a
//! fiber stack stays bounded across arbitrarily many sequential tail calls
//! (a recursive `countdown` never grows `frames` past the root).

use janet_asm::{assemble, BytecodeItem, Instruction, Operand, SlotDecl, WireFuncDef};
use janet_core::Value;
use janet_runtime::fiber::SignalMask;
use janet_runtime::funcenv::FunctionData;
use janet_runtime::vm::{Vm, VmConfig};

fn countdown_def() -> WireFuncDef {
    let mut wire = WireFuncDef::new("countdown", 1);
    wire.slots.push(SlotDecl::named("n"));
    wire.slots.push(SlotDecl::named("zero"));
    wire.slots.push(SlotDecl::named("cond"));
    wire.slots.push(SlotDecl::named("self"));

    wire.bytecode.push(BytecodeItem::Instruction(Instruction::new(
        "ldint",
        vec![Operand::SlotName("zero".into()), Operand::Imm(0)],
    )));
    wire.bytecode.push(BytecodeItem::Instruction(Instruction::new(
        "eq",
        vec![
            Operand::SlotName("cond".into()),
            Operand::SlotName("n".into()),
            Operand::SlotName("zero".into()),
        ],
    )));
    wire.bytecode.push(BytecodeItem::Instruction(Instruction::new(
        "jumpif",
        vec![Operand::SlotName("cond".into()), Operand::Label("done".into())],
    )));
    wire.bytecode.push(BytecodeItem::Instruction(Instruction::new(
        "subim",
        vec![Operand::SlotName("n".into()), Operand::Imm(1)],
    )));
    wire.bytecode.push(BytecodeItem::Instruction(Instruction::new(
        "ldself",
        vec![Operand::SlotName("self".into())],
    )));
    wire.bytecode.push(BytecodeItem::Instruction(Instruction::new(
        "push",
        vec![Operand::SlotName("n".into())],
    )));
    wire.bytecode.push(BytecodeItem::Instruction(Instruction::new(
        "tailcall",
        vec![Operand::SlotName("self".into())],
    )));
    wire.bytecode.push(BytecodeItem::Label("done".into()));
    wire.bytecode.push(BytecodeItem::Instruction(Instruction::new(
        "ret",
        vec![Operand::SlotName("n".into())],
    )));
    wire
}

#[test]
fn tailcall_chain_returns_zero() {
    let mut vm = Vm::new(VmConfig::default());
    let def = assemble(&countdown_def(), &mut vm.interns).unwrap();
    let func = vm.heap.alloc_function(FunctionData { def, envs: Vec::new() });
    let fiber = vm.spawn_fiber(func, SignalMask::default());
    let (_signal, value) = vm.resume(fiber, Value::number(10_000.0)).unwrap();
    assert_eq!(value.unwrap_number(), Some(0.0));
}

#[test]
fn tailcall_chain_keeps_a_single_frame() {
    let mut vm = Vm::new(VmConfig::default());
    let def = assemble(&countdown_def(), &mut vm.interns).unwrap();
    let func = vm.heap.alloc_function(FunctionData { def, envs: Vec::new() });
    let fiber = vm.spawn_fiber(func, SignalMask::default());
    vm.resume(fiber, Value::number(50_000.0)).unwrap();

    let data = vm.heap.fibers.get(fiber).unwrap();
    assert_eq!(data.frames.len(), 1, "tailcall must not grow the frame chain");
}
