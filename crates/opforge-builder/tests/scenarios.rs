//! Builder-level checks of bytecode shape for common program patterns (no
//! execution here — that needs `opforge-vm`).

use opforge_builder::builder::{Builder, BuilderConfig};
use opforge_builder::instruction::{builtin_id, InstructionTable};
use opforge_builder::{Arity, Constant, Instruction, OperationKind};

fn new_builder() -> Builder {
    Builder::new(InstructionTable::with_builtins(), BuilderConfig::default())
}

#[test]
fn scenario_try_catch_rethrow_registers_one_handler() {
    let mut b = new_builder();
    b.begin_root().unwrap();
    let exc = b.declare_local();

    b.begin_try_catch(exc);
    b.emit_load_constant(Constant::Int(1));
    b.emit_pop();
    b.try_catch_body_emitted();
    b.emit_store_local(exc);
    b.emit_load_local(exc);
    b.emit_throw();
    b.end_try_catch().unwrap();

    b.emit_load_constant(Constant::Int(0));
    b.emit_return().unwrap();
    let program = b.end_root().unwrap();

    assert_eq!(program.handlers.len(), 1);
    let handler = &program.handlers[0];
    assert_eq!(handler.exc_local_idx, exc.index() as u32);
}

#[test]
fn scenario_block_is_transparent_about_its_last_value() {
    let mut b = new_builder();
    b.begin_root().unwrap();
    b.begin_block();
    b.emit_load_constant(Constant::Int(7));
    b.end_block().unwrap();
    b.emit_return().unwrap();
    let program = b.end_root().unwrap();
    assert_eq!(program.bc[0], builtin_id::LOAD_CONSTANT);
}

#[test]
fn scenario_conditional_skips_the_else_arm_with_an_unconditional_branch() {
    let mut b = new_builder();
    b.begin_root().unwrap();
    b.emit_load_argument(0);
    b.begin_conditional();
    b.conditional_condition_emitted();
    let false_fixup_bci = b.current_bci() - 1;
    b.emit_load_constant(Constant::Int(1));
    b.conditional_then_emitted();
    let end_fixup_bci = b.current_bci() - 1;
    b.emit_load_constant(Constant::Int(2));
    b.end_conditional().unwrap();
    let conditional_end_bci = b.current_bci();
    b.emit_return().unwrap();
    let program = b.end_root().unwrap();

    assert!(program.bc.contains(&builtin_id::BRANCH_FALSE));
    assert!(program.bc.contains(&builtin_id::BRANCH));

    // The then-arm must skip the else-arm with an unconditional branch, and
    // the BRANCH_FALSE from the condition must land exactly where the
    // else-arm starts (right after that branch), not before it.
    let false_target = program.bc[false_fixup_bci as usize];
    let end_target = program.bc[end_fixup_bci as usize];
    assert!(false_target as u32 > false_fixup_bci, "must patch a forward target");
    assert_eq!(end_target as u32, conditional_end_bci, "branch-to-end must land after the else-arm");
}

#[test]
fn scenario_custom_short_circuit_emits_converter_and_branch_between_operands() {
    let mut instructions = InstructionTable::with_builtins();
    let is_truthy = instructions.register_custom(Instruction::custom(
        0,
        "IS_TRUTHY",
        false,
        vec![opforge_builder::ImmediateKind::Node],
        0,
        vec![None],
        Some("bool"),
    ));
    let and_id = instructions.register_custom(Instruction::custom(
        0,
        "SC_AND",
        true,
        vec![],
        0,
        vec![None, None],
        None,
    ));

    let mut b = Builder::new(instructions, BuilderConfig::default());
    b.begin_root().unwrap();
    b.begin_custom(OperationKind::CustomShortCircuit, Arity::Fixed(2), false).unwrap();
    b.emit_load_argument(0);
    b.custom_operand_emitted(is_truthy, true);
    b.emit_load_argument(1);
    b.end_custom(and_id, Arity::Fixed(2)).unwrap();
    b.emit_return().unwrap();
    let program = b.end_root().unwrap();

    // DUP, the converter, and a conditional branch must sit between the two
    // operands, and the final instruction emitted must not be `and_id` (a
    // short-circuit chain has no combining instruction, the surviving
    // operand's own value is the result).
    assert!(program.bc.contains(&builtin_id::DUP));
    assert!(program.bc.contains(&is_truthy));
    assert!(program.bc.contains(&builtin_id::BRANCH_FALSE));
    assert!(!program.bc.contains(&and_id));
}
