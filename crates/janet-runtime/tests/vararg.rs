//! A vararg def's trailing arguments are packed into a single `Tuple` in
//! the slot right after its fixed arity (spec §8 "vararg tuple-packing"),
//! grounded on `interp.rs::do_call`'s `if def.vararg { ... }` branch.

use janet_asm::{assemble, BytecodeItem, Instruction, Operand, SlotDecl, WireFuncDef};
use janet_core::Value;
use janet_runtime::fiber::SignalMask;
use janet_runtime::funcenv::FunctionData;
use janet_runtime::vm::{Vm, VmConfig};

/// `collect(a, ...)`: one fixed arg plus a vararg tail. `tail` is the
/// packed tuple; `return_len` picks whether the function reports the
/// tuple's length or its first element, so one shape covers both checks.
fn collect_def(return_len: bool) -> WireFuncDef {
    let mut wire = WireFuncDef::new("collect", 1);
    wire.vararg = true;
    wire.slots.push(SlotDecl::named("a"));
    wire.slots.push(SlotDecl::named("tail"));
    wire.slots.push(SlotDecl::named("idx0"));
    wire.slots.push(SlotDecl::named("out"));

    if return_len {
        wire.bytecode.push(BytecodeItem::Instruction(Instruction::new(
            "len",
            vec![Operand::SlotName("out".into()), Operand::SlotName("tail".into())],
        )));
    } else {
        wire.bytecode.push(BytecodeItem::Instruction(Instruction::new(
            "ldint",
            vec![Operand::SlotName("idx0".into()), Operand::Imm(0)],
        )));
        wire.bytecode.push(BytecodeItem::Instruction(Instruction::new(
            "geti",
            vec![
                Operand::SlotName("out".into()),
                Operand::SlotName("tail".into()),
                Operand::SlotName("idx0".into()),
            ],
        )));
    }
    wire.bytecode.push(BytecodeItem::Instruction(Instruction::new(
        "ret",
        vec![Operand::SlotName("out".into())],
    )));
    wire
}

fn call_with(vm: &mut Vm, wire: &WireFuncDef, args: &[Value]) -> Value {
    let def = assemble(wire, &mut vm.interns).unwrap();
    let func = vm.heap.alloc_function(FunctionData { def, envs: Vec::new() });

    // Drive the call through a second, tiny caller so every vararg
    // argument (not just the first) can be staged with `push`.
    let mut caller = WireFuncDef::new("caller", 0);
    for i in 0..args.len() {
        caller.slots.push(SlotDecl::named(format!("a{i}")));
    }
    caller.slots.push(SlotDecl::named("callee"));
    caller.slots.push(SlotDecl::named("dest"));
    // constants: each arg, then the callee function value itself.
    for a in args {
        caller.constants.push(janet_asm::ConstantDecl::anonymous(a.clone()));
    }
    caller.constants.push(janet_asm::ConstantDecl::anonymous(Value::Function(func)));
    for (i, _) in args.iter().enumerate() {
        caller.bytecode.push(BytecodeItem::Instruction(Instruction::new(
            "ldconst",
            vec![Operand::SlotName(format!("a{i}")), Operand::ConstIndex(i as u32)],
        )));
    }
    caller.bytecode.push(BytecodeItem::Instruction(Instruction::new(
        "ldconst",
        vec![Operand::SlotName("callee".into()), Operand::ConstIndex(args.len() as u32)],
    )));
    for i in 0..args.len() {
        caller.bytecode.push(BytecodeItem::Instruction(Instruction::new(
            "push",
            vec![Operand::SlotName(format!("a{i}"))],
        )));
    }
    caller.bytecode.push(BytecodeItem::Instruction(Instruction::new(
        "call",
        vec![Operand::SlotName("dest".into()), Operand::SlotName("callee".into())],
    )));
    caller.bytecode.push(BytecodeItem::Instruction(Instruction::new(
        "ret",
        vec![Operand::SlotName("dest".into())],
    )));

    let caller_def = assemble(&caller, &mut vm.interns).unwrap();
    let caller_func = vm.heap.alloc_function(FunctionData { def: caller_def, envs: Vec::new() });
    let caller_fiber = vm.spawn_fiber(caller_func, SignalMask::default());
    let (_signal, value) = vm.resume(caller_fiber, Value::Nil).unwrap();
    value
}

#[test]
fn trailing_args_are_packed_into_one_tuple() {
    let mut vm = Vm::new(VmConfig::default());
    let wire = collect_def(true);
    let value = call_with(
        &mut vm,
        &wire,
        &[Value::number(1.0), Value::number(2.0), Value::number(3.0), Value::number(4.0)],
    );
    assert_eq!(value.unwrap_number(), Some(3.0));
}

#[test]
fn packed_tuple_preserves_order() {
    let mut vm = Vm::new(VmConfig::default());
    let wire = collect_def(false);
    let value = call_with(
        &mut vm,
        &wire,
        &[Value::number(1.0), Value::number(20.0), Value::number(30.0)],
    );
    assert_eq!(value.unwrap_number(), Some(20.0));
}

#[test]
fn exact_fixed_arity_packs_an_empty_tuple() {
    let mut vm = Vm::new(VmConfig::default());
    let wire = collect_def(true);
    let value = call_with(&mut vm, &wire, &[Value::number(1.0)]);
    assert_eq!(value.unwrap_number(), Some(0.0));
}
