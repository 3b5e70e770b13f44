//! An inner fiber signals an error; the outer fiber `resume`s it without
//! catching `Signal::Error` in its mask, so the error propagates straight
//! through the outer fiber's own suspension (spec §5 "uncaught signals
//! propagate to the nearest ancestor with a matching mask").

use janet_asm::{assemble, BytecodeItem, ConstantDecl, Instruction, Operand, SlotDecl, WireFuncDef};
use janet_core::Value;
use janet_runtime::fiber::{FiberStatus, Signal, SignalMask};
use janet_runtime::funcenv::FunctionData;
use janet_runtime::vm::{Vm, VmConfig};

fn boom_def() -> WireFuncDef {
    let mut wire = WireFuncDef::new("boom", 0);
    wire.slots.push(SlotDecl::named("msg"));
    wire.constants.push(ConstantDecl::anonymous(Value::string("boom")));
    wire.bytecode.push(BytecodeItem::Instruction(Instruction::new(
        "ldconst",
        vec![Operand::SlotName("msg".into()), Operand::ConstIndex(0)],
    )));
    wire.bytecode.push(BytecodeItem::Instruction(Instruction::new(
        "error",
        vec![Operand::SlotName("msg".into())],
    )));
    wire
}

fn supervisor_def() -> WireFuncDef {
    let mut wire = WireFuncDef::new("supervisor", 1);
    wire.slots.push(SlotDecl::named("child"));
    wire.slots.push(SlotDecl::named("dest"));
    wire.slots.push(SlotDecl::named("arg"));
    wire.bytecode.push(BytecodeItem::Instruction(Instruction::new(
        "ldnil",
        vec![Operand::SlotName("arg".into())],
    )));
    wire.bytecode.push(BytecodeItem::Instruction(Instruction::new(
        "resume",
        vec![
            Operand::SlotName("dest".into()),
            Operand::SlotName("child".into()),
            Operand::SlotName("arg".into()),
        ],
    )));
    wire.bytecode.push(BytecodeItem::Instruction(Instruction::new(
        "ret",
        vec![Operand::SlotName("dest".into())],
    )));
    wire
}

#[test]
fn uncaught_child_error_propagates_to_parent() {
    let mut vm = Vm::new(VmConfig::default());

    let child_def = assemble(&boom_def(), &mut vm.interns).unwrap();
    let child_func = vm.heap.alloc_function(FunctionData { def: child_def, envs: Vec::new() });
    let child_fiber = vm.spawn_fiber(child_func, SignalMask::default());

    let parent_def = assemble(&supervisor_def(), &mut vm.interns).unwrap();
    let parent_func = vm.heap.alloc_function(FunctionData { def: parent_def, envs: Vec::new() });
    let parent_fiber = vm.spawn_fiber(parent_func, SignalMask::default());

    let (signal, value) = vm.resume(parent_fiber, Value::Fiber(child_fiber)).unwrap();

    assert_eq!(signal, Signal::Error);
    assert_eq!(value.unwrap_string().unwrap().as_str_lossy().as_ref(), "boom");
    assert_eq!(vm.heap.fibers.get(parent_fiber).unwrap().status, FiberStatus::Error);
    assert_eq!(vm.heap.fibers.get(child_fiber).unwrap().status, FiberStatus::Error);
}

#[test]
fn mask_that_catches_error_absorbs_it() {
    let mut vm = Vm::new(VmConfig::default());

    let child_def = assemble(&boom_def(), &mut vm.interns).unwrap();
    let child_func = vm.heap.alloc_function(FunctionData { def: child_def, envs: Vec::new() });
    let child_fiber = vm.spawn_fiber(child_func, SignalMask::default());

    let parent_def = assemble(&supervisor_def(), &mut vm.interns).unwrap();
    let parent_func = vm.heap.alloc_function(FunctionData { def: parent_def, envs: Vec::new() });
    let parent_fiber = vm.spawn_fiber(parent_func, SignalMask::parse("e"));

    let (signal, value) = vm.resume(parent_fiber, Value::Fiber(child_fiber)).unwrap();

    assert_eq!(signal, Signal::Ok);
    assert_eq!(value.unwrap_string().unwrap().as_str_lossy().as_ref(), "boom");
    assert_eq!(vm.heap.fibers.get(parent_fiber).unwrap().status, FiberStatus::Dead);
}
