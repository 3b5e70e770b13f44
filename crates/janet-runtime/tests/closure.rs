//! `make_adder(x)` returns a closure over `x`; the closure is called from
//! an entirely separate fiber, exercising env detachment and upvalue
//! reads against storage no longer backed by the capturing frame
//! (spec §4.D "Env detachment").

use janet_asm::{assemble, BytecodeItem, Instruction, Operand, SlotDecl, WireFuncDef};
use janet_core::Value;
use janet_runtime::fiber::SignalMask;
use janet_runtime::funcenv::FunctionData;
use janet_runtime::vm::{Vm, VmConfig};

fn adder_def() -> WireFuncDef {
    let mut adder = WireFuncDef::new("adder", 1);
    adder.slots.push(SlotDecl::named("y"));
    adder.slots.push(SlotDecl::named("xup"));
    adder.bytecode.push(BytecodeItem::Instruction(Instruction::new(
        "ldup",
        vec![
            Operand::SlotName("xup".into()),
            Operand::EnvIndex(0),
            Operand::Imm(0),
        ],
    )));
    adder.bytecode.push(BytecodeItem::Instruction(Instruction::new(
        "add",
        vec![
            Operand::SlotName("xup".into()),
            Operand::SlotName("xup".into()),
            Operand::SlotName("y".into()),
        ],
    )));
    adder.bytecode.push(BytecodeItem::Instruction(Instruction::new(
        "ret",
        vec![Operand::SlotName("xup".into())],
    )));
    adder
}

fn make_adder_def() -> WireFuncDef {
    let mut wire = WireFuncDef::new("make_adder", 1);
    wire.slots.push(SlotDecl::named("x"));
    wire.slots.push(SlotDecl::named("result"));
    wire.closures.push(adder_def());
    wire.bytecode.push(BytecodeItem::Instruction(Instruction::new(
        "closure",
        vec![Operand::SlotName("result".into()), Operand::Imm(0)],
    )));
    wire.bytecode.push(BytecodeItem::Instruction(Instruction::new(
        "ret",
        vec![Operand::SlotName("result".into())],
    )));
    wire
}

#[test]
fn closure_captures_enclosing_argument() {
    let mut vm = Vm::new(VmConfig::default());
    let def = assemble(&make_adder_def(), &mut vm.interns).unwrap();
    let func = vm.heap.alloc_function(FunctionData { def, envs: Vec::new() });
    let outer_fiber = vm.spawn_fiber(func, SignalMask::default());
    let (_signal, closure_value) = vm.resume(outer_fiber, Value::number(10.0)).unwrap();
    let adder_ref = closure_value.unwrap_function().expect("make_adder should return a function");

    let inner_fiber = vm.spawn_fiber(adder_ref, SignalMask::default());
    let (_signal, sum) = vm.resume(inner_fiber, Value::number(5.0)).unwrap();
    assert_eq!(sum.unwrap_number(), Some(15.0));
}

#[test]
fn two_closures_over_different_calls_stay_independent() {
    let mut vm = Vm::new(VmConfig::default());
    let def = assemble(&make_adder_def(), &mut vm.interns).unwrap();

    let func_a = vm.heap.alloc_function(FunctionData { def: def.clone(), envs: Vec::new() });
    let fiber_a = vm.spawn_fiber(func_a, SignalMask::default());
    let (_s, add_ten) = vm.resume(fiber_a, Value::number(10.0)).unwrap();

    let func_b = vm.heap.alloc_function(FunctionData { def, envs: Vec::new() });
    let fiber_b = vm.spawn_fiber(func_b, SignalMask::default());
    let (_s, add_hundred) = vm.resume(fiber_b, Value::number(100.0)).unwrap();

    let add_ten_ref = add_ten.unwrap_function().unwrap();
    let add_hundred_ref = add_hundred.unwrap_function().unwrap();

    let call_ten = vm.spawn_fiber(add_ten_ref, SignalMask::default());
    let (_s, r1) = vm.resume(call_ten, Value::number(1.0)).unwrap();
    assert_eq!(r1.unwrap_number(), Some(11.0));

    let call_hundred = vm.spawn_fiber(add_hundred_ref, SignalMask::default());
    let (_s, r2) = vm.resume(call_hundred, Value::number(1.0)).unwrap();
    assert_eq!(r2.unwrap_number(), Some(101.0));
}
