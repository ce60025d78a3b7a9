use crate::fuzzing::func::{check_fully_allocated, machine_config, Func};
use crate::{
    run, AllocatedOperand, Block, ConstantOperand, Frame, GapPosition, Inst, Instruction,
    InstructionSequence, InstructionSequenceBuilder, MoveOperands, Operand, OperandPolicy,
    RegisterConfiguration, RegisterKind, Representation, TickCounter, UnallocatedOperand, VReg,
};

use super::vreg::Range;
use super::{spill_slots, MidTierAllocationData, MidTierRegisterAllocator};

fn config(n: usize) -> RegisterConfiguration {
    let codes: Vec<u8> = (0..n as u8).collect();
    RegisterConfiguration::new(codes.clone(), codes)
}

fn reg_def(vreg: VReg) -> Operand {
    Operand::Unallocated(UnallocatedOperand::new(OperandPolicy::Register, vreg))
}

fn reg_use(vreg: VReg) -> Operand {
    Operand::Unallocated(UnallocatedOperand::new(OperandPolicy::Register, vreg))
}

fn reg_use_at_start(vreg: VReg) -> Operand {
    Operand::Unallocated(UnallocatedOperand::new_used_at_start(
        OperandPolicy::Register,
        vreg,
    ))
}

fn any_use(vreg: VReg) -> Operand {
    Operand::Unallocated(UnallocatedOperand::new(OperandPolicy::RegisterOrSlot, vreg))
}

fn r(code: i32) -> Operand {
    Operand::Allocated(AllocatedOperand::register(Representation::Word64, code))
}

fn s(slot: i32) -> Operand {
    Operand::Allocated(AllocatedOperand::stack_slot(Representation::Word64, slot))
}

fn mv(source: Operand, destination: Operand) -> MoveOperands {
    MoveOperands {
        source,
        destination,
    }
}

fn moves_at(sequence: &InstructionSequence, instr: usize, pos: GapPosition) -> Vec<MoveOperands> {
    sequence
        .instruction(Inst::new(instr))
        .parallel_move(pos)
        .map(|moves| moves.moves().to_vec())
        .unwrap_or_default()
}

fn allocate(sequence: &mut InstructionSequence, config: &RegisterConfiguration) -> Frame {
    let mut frame = Frame::new();
    let mut tick_counter = TickCounter::new();
    run(sequence, config, &mut frame, &mut tick_counter);
    check_fully_allocated(sequence);
    frame
}

#[test]
fn test_straight_line_copy() {
    // def v0; use v0. With a register available: v0 lives in r0 throughout,
    // no spills, no gap moves.
    let mut b = InstructionSequenceBuilder::new();
    let v0 = b.new_virtual_register(Representation::Word64);
    b.begin_block();
    b.add_instruction(Instruction::new().with_output(reg_def(v0)));
    b.add_instruction(Instruction::new().with_input(reg_use(v0)));
    b.add_instruction(Instruction::new());
    b.end_block(&[]);
    let mut sequence = b.finish();

    let frame = allocate(&mut sequence, &config(4));

    assert_eq!(sequence.instruction(Inst::new(0)).output(0), r(0));
    assert_eq!(sequence.instruction(Inst::new(1)).input(0), r(0));
    for i in 0..3 {
        assert!(moves_at(&sequence, i, GapPosition::Start).is_empty());
        assert!(moves_at(&sequence, i, GapPosition::End).is_empty());
    }
    assert_eq!(frame.slot_count(), 0);
    assert_eq!(frame.allocated_registers(RegisterKind::General), 0b1);
    assert_eq!(frame.allocated_registers(RegisterKind::Double), 0);
}

#[test]
fn test_forced_spill_with_one_register() {
    // Two values, one register. The register-constrained use of v0 wins the
    // register at i2; v0 is spilled around the definition of v1 and reloaded
    // by a gap move at i2's end, while v1's unconstrained use reads its slot.
    let mut b = InstructionSequenceBuilder::new();
    let v0 = b.new_virtual_register(Representation::Word64);
    let v1 = b.new_virtual_register(Representation::Word64);
    b.begin_block();
    b.add_instruction(Instruction::new().with_output(reg_def(v0)));
    b.add_instruction(Instruction::new().with_output(reg_def(v1)));
    b.add_instruction(
        Instruction::new()
            .with_input(reg_use_at_start(v0))
            .with_input(any_use(v1)),
    );
    b.add_instruction(Instruction::new());
    b.end_block(&[]);
    let mut sequence = b.finish();

    let frame = allocate(&mut sequence, &config(1));

    assert_eq!(sequence.instruction(Inst::new(0)).output(0), r(0));
    assert_eq!(sequence.instruction(Inst::new(1)).output(0), r(0));
    assert_eq!(sequence.instruction(Inst::new(2)).input(0), r(0));
    assert_eq!(sequence.instruction(Inst::new(2)).input(1), s(1));

    // v0 stored after its definition, reloaded for its use.
    assert_eq!(moves_at(&sequence, 1, GapPosition::Start), vec![mv(r(0), s(0))]);
    assert_eq!(moves_at(&sequence, 2, GapPosition::End), vec![mv(s(0), r(0))]);
    // v1 stored after its definition.
    assert_eq!(moves_at(&sequence, 2, GapPosition::Start), vec![mv(r(0), s(1))]);

    assert_eq!(frame.slot_count(), 2);
}

#[test]
fn test_fixed_register_conflict_inserts_gap_move() {
    // v0 is placed in r0 by its plain use at i2; the fixed-r1 use at i1 is
    // satisfied by an end gap move into r1 rather than re-homing v0.
    let mut b = InstructionSequenceBuilder::new();
    let v0 = b.new_virtual_register(Representation::Word64);
    b.begin_block();
    b.add_instruction(Instruction::new().with_output(reg_def(v0)));
    b.add_instruction(Instruction::new().with_input(Operand::Unallocated(
        UnallocatedOperand::new_used_at_start(OperandPolicy::FixedRegister(1), v0),
    )));
    b.add_instruction(Instruction::new().with_input(reg_use(v0)));
    b.add_instruction(Instruction::new());
    b.end_block(&[]);
    let mut sequence = b.finish();

    let frame = allocate(&mut sequence, &config(2));

    assert_eq!(sequence.instruction(Inst::new(0)).output(0), r(0));
    assert_eq!(sequence.instruction(Inst::new(1)).input(0), r(1));
    assert_eq!(sequence.instruction(Inst::new(2)).input(0), r(0));
    assert_eq!(moves_at(&sequence, 1, GapPosition::End), vec![mv(r(0), r(1))]);
    assert_eq!(frame.slot_count(), 0);
}

#[test]
fn test_fixed_register_output_conflict_moves_into_prior_register() {
    // The output is pinned to r1 while v0 was already allocated to r0 by a
    // later use; the output lands in r1 and a start gap move carries it into
    // r0 for that use.
    let mut b = InstructionSequenceBuilder::new();
    let v0 = b.new_virtual_register(Representation::Word64);
    b.begin_block();
    b.add_instruction(Instruction::new().with_output(Operand::Unallocated(
        UnallocatedOperand::new(OperandPolicy::FixedRegister(1), v0),
    )));
    b.add_instruction(Instruction::new().with_input(reg_use(v0)));
    b.add_instruction(Instruction::new());
    b.end_block(&[]);
    let mut sequence = b.finish();

    allocate(&mut sequence, &config(2));

    assert_eq!(sequence.instruction(Inst::new(0)).output(0), r(1));
    assert_eq!(sequence.instruction(Inst::new(1)).input(0), r(0));
    assert_eq!(moves_at(&sequence, 1, GapPosition::Start), vec![mv(r(1), r(0))]);
}

#[test]
fn test_same_as_input_shares_register() {
    // v1 = op(v0) with a same-as-input constraint: with a free register both
    // share it, and the input is pinned to the output's register.
    let mut b = InstructionSequenceBuilder::new();
    let v0 = b.new_virtual_register(Representation::Word64);
    let v1 = b.new_virtual_register(Representation::Word64);
    b.begin_block();
    b.add_instruction(Instruction::new().with_output(reg_def(v0)));
    b.add_instruction(
        Instruction::new()
            .with_output(Operand::Unallocated(UnallocatedOperand::new(
                OperandPolicy::SameAsInput,
                v1,
            )))
            .with_input(reg_use(v0)),
    );
    b.add_instruction(Instruction::new());
    b.end_block(&[]);
    let mut sequence = b.finish();

    let frame = allocate(&mut sequence, &config(2));

    assert_eq!(sequence.instruction(Inst::new(0)).output(0), r(0));
    assert_eq!(sequence.instruction(Inst::new(1)).output(0), r(0));
    assert_eq!(sequence.instruction(Inst::new(1)).input(0), r(0));
    assert_eq!(frame.slot_count(), 0);
}

#[test]
fn test_same_as_input_spilled_shares_slot() {
    // No register is available for the same-as-input def (v3 holds the only
    // register across i2), so input and output share one spill slot, filled
    // by an end gap move from an unconstrained copy of the input value.
    let mut b = InstructionSequenceBuilder::new();
    let v3 = b.new_virtual_register(Representation::Word64);
    let v0 = b.new_virtual_register(Representation::Word64);
    let v1 = b.new_virtual_register(Representation::Word64);
    b.begin_block();
    b.add_instruction(Instruction::new().with_output(reg_def(v3)));
    b.add_instruction(Instruction::new().with_output(reg_def(v0)));
    b.add_instruction(
        Instruction::new()
            .with_output(Operand::Unallocated(UnallocatedOperand::new(
                OperandPolicy::SameAsInput,
                v1,
            )))
            .with_input(any_use(v0)),
    );
    b.add_instruction(Instruction::new().with_input(reg_use(v3)));
    b.add_instruction(Instruction::new());
    b.end_block(&[]);
    let mut sequence = b.finish();

    let frame = allocate(&mut sequence, &config(1));

    // Slots: v3 -> 0, v0 -> 1, v1 -> 2 (in order of spill range starts).
    assert_eq!(sequence.instruction(Inst::new(0)).output(0), r(0));
    assert_eq!(sequence.instruction(Inst::new(1)).output(0), r(0));
    assert_eq!(sequence.instruction(Inst::new(2)).output(0), s(2));
    assert_eq!(sequence.instruction(Inst::new(2)).input(0), s(2));
    assert_eq!(sequence.instruction(Inst::new(3)).input(0), r(0));

    assert_eq!(moves_at(&sequence, 1, GapPosition::Start), vec![mv(r(0), s(0))]);
    assert_eq!(moves_at(&sequence, 2, GapPosition::Start), vec![mv(r(0), s(1))]);
    // The unconstrained copy of v0 (itself spilled) fills the shared slot.
    assert_eq!(moves_at(&sequence, 2, GapPosition::End), vec![mv(s(1), s(2))]);
    // v3 reloaded for its register use.
    assert_eq!(moves_at(&sequence, 3, GapPosition::End), vec![mv(s(0), r(0))]);

    assert_eq!(frame.slot_count(), 3);
}

#[test]
fn test_constant_output_needs_no_slot() {
    // A constant is its own spill operand: unconstrained uses read the
    // constant directly and no frame slot is allocated.
    let mut b = InstructionSequenceBuilder::new();
    let v0 = b.new_virtual_register(Representation::Word64);
    b.set_constant(v0, 42);
    b.begin_block();
    b.add_instruction(Instruction::new().with_output(Operand::Constant(ConstantOperand::new(v0))));
    b.add_instruction(Instruction::new().with_input(Operand::Unallocated(
        UnallocatedOperand::new(OperandPolicy::RegisterOrSlotOrConstant, v0),
    )));
    b.add_instruction(Instruction::new());
    b.end_block(&[]);
    let mut sequence = b.finish();

    let frame = allocate(&mut sequence, &config(2));

    assert_eq!(
        sequence.instruction(Inst::new(0)).output(0),
        Operand::Constant(ConstantOperand::new(v0))
    );
    assert_eq!(
        sequence.instruction(Inst::new(1)).input(0),
        Operand::Constant(ConstantOperand::new(v0))
    );
    assert_eq!(frame.slot_count(), 0);
}

#[test]
fn test_constant_materialized_for_register_use() {
    // A register-constrained use of a constant gets the register, filled by
    // an end gap move from the constant at the use.
    let mut b = InstructionSequenceBuilder::new();
    let v0 = b.new_virtual_register(Representation::Word64);
    b.set_constant(v0, 7);
    b.begin_block();
    b.add_instruction(Instruction::new().with_output(Operand::Constant(ConstantOperand::new(v0))));
    b.add_instruction(Instruction::new().with_input(reg_use(v0)));
    b.add_instruction(Instruction::new());
    b.end_block(&[]);
    let mut sequence = b.finish();

    let frame = allocate(&mut sequence, &config(2));

    assert_eq!(sequence.instruction(Inst::new(1)).input(0), r(0));
    assert_eq!(
        moves_at(&sequence, 1, GapPosition::End),
        vec![mv(Operand::Constant(ConstantOperand::new(v0)), r(0))]
    );
    assert_eq!(frame.slot_count(), 0);
}

#[test]
fn test_fixed_slot_output_is_spill_operand() {
    // A fixed-slot output defines the vreg's spill operand up front; the
    // register use is fed by a reload from that slot, and no frame slot is
    // allocated.
    let mut b = InstructionSequenceBuilder::new();
    let v0 = b.new_virtual_register(Representation::Word64);
    b.begin_block();
    b.add_instruction(Instruction::new().with_output(Operand::Unallocated(
        UnallocatedOperand::new(OperandPolicy::FixedSlot(-2), v0),
    )));
    b.add_instruction(Instruction::new().with_input(reg_use(v0)));
    b.add_instruction(Instruction::new());
    b.end_block(&[]);
    let mut sequence = b.finish();

    let frame = allocate(&mut sequence, &config(2));

    assert_eq!(sequence.instruction(Inst::new(0)).output(0), s(-2));
    assert_eq!(sequence.instruction(Inst::new(1)).input(0), r(0));
    assert_eq!(moves_at(&sequence, 1, GapPosition::End), vec![mv(s(-2), r(0))]);
    assert_eq!(frame.slot_count(), 0);
}

#[test]
fn test_fixed_temp_register_spills_conflicting_value() {
    // A fixed temp evicts the value a later use placed in its register: the
    // value is spilled at its definition and reloaded at its use.
    let mut b = InstructionSequenceBuilder::new();
    let v0 = b.new_virtual_register(Representation::Word64);
    b.begin_block();
    b.add_instruction(Instruction::new().with_output(reg_def(v0)));
    b.add_instruction(Instruction::new().with_temp(Operand::Unallocated(
        UnallocatedOperand::new(OperandPolicy::FixedRegister(0), VReg::invalid()),
    )));
    b.add_instruction(Instruction::new().with_input(reg_use(v0)));
    b.add_instruction(Instruction::new());
    b.end_block(&[]);
    let mut sequence = b.finish();

    let frame = allocate(&mut sequence, &config(2));

    assert_eq!(sequence.instruction(Inst::new(1)).temp(0), r(0));
    // v0 was in r0 (its use is processed before the temp in the backwards
    // walk), so the temp's reservation spills it.
    assert_eq!(sequence.instruction(Inst::new(0)).output(0), r(0));
    assert_eq!(sequence.instruction(Inst::new(2)).input(0), r(0));
    assert_eq!(moves_at(&sequence, 1, GapPosition::Start), vec![mv(r(0), s(0))]);
    assert_eq!(moves_at(&sequence, 2, GapPosition::End), vec![mv(s(0), r(0))]);
    assert_eq!(frame.slot_count(), 1);
}

#[test]
fn test_temp_does_not_steal_input_register() {
    let mut b = InstructionSequenceBuilder::new();
    let v0 = b.new_virtual_register(Representation::Word64);
    b.begin_block();
    b.add_instruction(Instruction::new().with_output(reg_def(v0)));
    b.add_instruction(
        Instruction::new()
            .with_temp(Operand::Unallocated(UnallocatedOperand::new(
                OperandPolicy::Register,
                VReg::invalid(),
            )))
            .with_input(reg_use(v0)),
    );
    b.add_instruction(Instruction::new());
    b.end_block(&[]);
    let mut sequence = b.finish();

    allocate(&mut sequence, &config(2));

    // Temps are allocated before inputs and hold their register for the
    // whole instruction.
    assert_eq!(sequence.instruction(Inst::new(1)).temp(0), r(0));
    assert_eq!(sequence.instruction(Inst::new(1)).input(0), r(1));
    assert_eq!(sequence.instruction(Inst::new(0)).output(0), r(1));
}

#[test]
fn test_clobbers_spill_across_call() {
    // An instruction clobbering all general registers forces v0 to live in a
    // slot across it even though registers are otherwise free.
    let mut b = InstructionSequenceBuilder::new();
    let v0 = b.new_virtual_register(Representation::Word64);
    b.begin_block();
    b.add_instruction(Instruction::new().with_output(reg_def(v0)));
    b.add_instruction(Instruction::new().with_clobbers(RegisterKind::General));
    b.add_instruction(Instruction::new().with_input(any_use(v0)));
    b.add_instruction(Instruction::new());
    b.end_block(&[]);
    let mut sequence = b.finish();

    let frame = allocate(&mut sequence, &config(2));

    assert_eq!(sequence.instruction(Inst::new(0)).output(0), r(0));
    // The unconstrained use reads the slot directly; the value is stored
    // once after its definition.
    assert_eq!(sequence.instruction(Inst::new(2)).input(0), s(0));
    assert_eq!(moves_at(&sequence, 1, GapPosition::Start), vec![mv(r(0), s(0))]);
    assert_eq!(frame.slot_count(), 1);
}

#[test]
fn test_loop_header_extends_spill_ranges() {
    // CFG: b0 -> b1 (loop header) -> {b2, b3}, b2 -> b1. The spilled value
    // v0, live on entry to the loop, has its spill range extended through
    // the last instruction of the loop body.
    let mut b = InstructionSequenceBuilder::new();
    let v0 = b.new_virtual_register(Representation::Word64);
    let v2 = b.new_virtual_register(Representation::Word64);
    let v3 = b.new_virtual_register(Representation::Word64);

    b.begin_block();
    b.add_instruction(Instruction::new().with_output(reg_def(v0)));
    b.add_instruction(Instruction::new());
    b.end_block(&[Block::new(1)]);

    let header = b.begin_block();
    b.add_phi(v2, &[v0, v3]);
    b.add_instruction(
        Instruction::new()
            .with_input(any_use(v2))
            .with_input(any_use(v0)),
    );
    b.add_instruction(Instruction::new());
    b.end_block(&[Block::new(2), Block::new(3)]);
    b.mark_loop_header(header, Block::new(3));

    b.begin_block();
    b.add_instruction(Instruction::new().with_output(reg_def(v3)));
    b.add_instruction(Instruction::new());
    b.end_block(&[Block::new(1)]);

    b.begin_block();
    b.add_instruction(Instruction::new());
    b.end_block(&[]);

    let mut sequence = b.finish();
    let config = config(2);
    let mut frame = Frame::new();
    let mut tick_counter = TickCounter::new();

    let mut data = MidTierAllocationData::new(&mut sequence, &config, &mut frame, &mut tick_counter);
    let mut allocator = MidTierRegisterAllocator::new(&data);
    allocator.define_outputs(&mut data);
    allocator.allocate_registers(&mut data);

    // The phi's spill range spans from each predecessor's last instruction
    // (i1 in b0, i5 in b2) across the loop.
    assert_eq!(
        data.vreg_data(v2).spill_range().live_range(),
        Range::new(Inst::new(1), Inst::new(5))
    );
    // v0's range initially ended at its loop-header use (i2) and is extended
    // through the loop body's last instruction (i5).
    assert_eq!(
        data.vreg_data(v0).spill_range().live_range(),
        Range::new(Inst::new(1), Inst::new(5))
    );

    // Overlapping ranges get distinct slots.
    spill_slots::allocate_spill_slots(&mut data);
    drop(data);
    assert_eq!(sequence.instruction(Inst::new(2)).input(0), s(1));
    assert_eq!(sequence.instruction(Inst::new(2)).input(1), s(0));
    assert_eq!(frame.slot_count(), 2);
}

#[test]
fn test_reference_map_records_spilled_reference() {
    // A spilled GC reference live across a safepoint lands on the
    // safepoint's reference map.
    let mut b = InstructionSequenceBuilder::new();
    let v3 = b.new_virtual_register(Representation::Tagged);
    b.mark_reference(v3);
    b.begin_block();
    b.add_instruction(Instruction::new().with_output(reg_def(v3)));
    b.add_instruction(
        Instruction::new()
            .with_reference_map()
            .with_clobbers(RegisterKind::General),
    );
    b.add_instruction(Instruction::new().with_input(any_use(v3)));
    b.add_instruction(Instruction::new());
    b.end_block(&[]);
    let mut sequence = b.finish();

    let frame = allocate(&mut sequence, &config(2));

    let slot = AllocatedOperand::stack_slot(Representation::Tagged, 0);
    assert_eq!(
        sequence.instruction(Inst::new(2)).input(0),
        Operand::Allocated(slot)
    );
    assert_eq!(
        sequence
            .instruction(Inst::new(1))
            .reference_map()
            .unwrap()
            .reference_operands(),
        &[slot]
    );
    assert_eq!(
        moves_at(&sequence, 1, GapPosition::Start),
        vec![mv(
            Operand::Allocated(AllocatedOperand::register(Representation::Tagged, 0)),
            Operand::Allocated(slot)
        )]
    );
    assert_eq!(frame.slot_count(), 1);
}

#[test]
fn test_unreferenced_slot_not_on_reference_map() {
    // A spilled non-reference value must not appear on reference maps.
    let mut b = InstructionSequenceBuilder::new();
    let v0 = b.new_virtual_register(Representation::Word64);
    b.begin_block();
    b.add_instruction(Instruction::new().with_output(reg_def(v0)));
    b.add_instruction(
        Instruction::new()
            .with_reference_map()
            .with_clobbers(RegisterKind::General),
    );
    b.add_instruction(Instruction::new().with_input(any_use(v0)));
    b.add_instruction(Instruction::new());
    b.end_block(&[]);
    let mut sequence = b.finish();

    allocate(&mut sequence, &config(2));

    assert!(sequence
        .instruction(Inst::new(1))
        .reference_map()
        .unwrap()
        .reference_operands()
        .is_empty());
}

#[test]
fn test_slot_reuse_requires_disjoint_ranges() {
    // Two spilled values with disjoint live ranges share a slot; a third
    // whose range overlaps the second gets a fresh one.
    let mut b = InstructionSequenceBuilder::new();
    let v0 = b.new_virtual_register(Representation::Word64);
    let v1 = b.new_virtual_register(Representation::Word64);
    b.begin_block();
    b.add_instruction(Instruction::new().with_output(reg_def(v0)));
    b.add_instruction(Instruction::new().with_clobbers(RegisterKind::General));
    b.add_instruction(Instruction::new().with_input(any_use(v0)));
    b.add_instruction(Instruction::new().with_output(reg_def(v1)));
    b.add_instruction(Instruction::new().with_clobbers(RegisterKind::General));
    b.add_instruction(Instruction::new().with_input(any_use(v1)));
    b.add_instruction(Instruction::new());
    b.end_block(&[]);
    let mut sequence = b.finish();

    let frame = allocate(&mut sequence, &config(2));

    // v0 lives in [i1, i2], v1 in [i4, i5]: disjoint, same slot.
    assert_eq!(sequence.instruction(Inst::new(2)).input(0), s(0));
    assert_eq!(sequence.instruction(Inst::new(5)).input(0), s(0));
    assert_eq!(frame.slot_count(), 1);
}

#[test]
fn test_slot_reuse_matches_byte_width() {
    // A freed 8-byte slot is not reused for a 4-byte value.
    let mut b = InstructionSequenceBuilder::new();
    let v0 = b.new_virtual_register(Representation::Word64);
    let v1 = b.new_virtual_register(Representation::Word32);
    b.begin_block();
    b.add_instruction(Instruction::new().with_output(reg_def(v0)));
    b.add_instruction(Instruction::new().with_clobbers(RegisterKind::General));
    b.add_instruction(Instruction::new().with_input(any_use(v0)));
    b.add_instruction(Instruction::new().with_output(reg_def(v1)));
    b.add_instruction(Instruction::new().with_clobbers(RegisterKind::General));
    b.add_instruction(Instruction::new().with_input(any_use(v1)));
    b.add_instruction(Instruction::new());
    b.end_block(&[]);
    let mut sequence = b.finish();

    let frame = allocate(&mut sequence, &config(2));

    assert_eq!(sequence.instruction(Inst::new(2)).input(0), s(0));
    assert_eq!(
        sequence.instruction(Inst::new(5)).input(0),
        Operand::Allocated(AllocatedOperand::stack_slot(Representation::Word32, 1))
    );
    assert_eq!(frame.slot_count(), 2);
}

#[test]
fn test_double_and_general_pools_are_independent() {
    let mut b = InstructionSequenceBuilder::new();
    let v0 = b.new_virtual_register(Representation::Word64);
    let v1 = b.new_virtual_register(Representation::Float64);
    b.begin_block();
    b.add_instruction(Instruction::new().with_output(reg_def(v0)));
    b.add_instruction(Instruction::new().with_output(reg_def(v1)));
    b.add_instruction(
        Instruction::new()
            .with_input(reg_use(v0))
            .with_input(reg_use(v1)),
    );
    b.add_instruction(Instruction::new());
    b.end_block(&[]);
    let mut sequence = b.finish();

    let frame = allocate(&mut sequence, &config(1));

    // Both values get register 0 of their own kind; neither spills.
    assert_eq!(sequence.instruction(Inst::new(0)).output(0), r(0));
    assert_eq!(
        sequence.instruction(Inst::new(1)).output(0),
        Operand::Allocated(AllocatedOperand::register(Representation::Float64, 0))
    );
    assert_eq!(frame.slot_count(), 0);
    assert_eq!(frame.allocated_registers(RegisterKind::General), 0b1);
    assert_eq!(frame.allocated_registers(RegisterKind::Double), 0b1);
}

#[test]
fn test_block_boundaries_spill_live_values() {
    // Values never stay in registers across blocks: a value defined in b0
    // and used in b1 travels through its spill slot.
    let mut b = InstructionSequenceBuilder::new();
    let v0 = b.new_virtual_register(Representation::Word64);
    b.begin_block();
    b.add_instruction(Instruction::new().with_output(reg_def(v0)));
    b.add_instruction(Instruction::new());
    b.end_block(&[Block::new(1)]);
    b.begin_block();
    b.add_instruction(Instruction::new().with_input(reg_use(v0)));
    b.add_instruction(Instruction::new());
    b.end_block(&[]);
    let mut sequence = b.finish();

    let frame = allocate(&mut sequence, &config(4));

    assert_eq!(sequence.instruction(Inst::new(0)).output(0), r(0));
    assert_eq!(sequence.instruction(Inst::new(2)).input(0), r(0));
    // Stored after the definition, reloaded at the use in the next block.
    assert_eq!(moves_at(&sequence, 1, GapPosition::Start), vec![mv(r(0), s(0))]);
    assert_eq!(moves_at(&sequence, 2, GapPosition::End), vec![mv(s(0), r(0))]);
    assert_eq!(frame.slot_count(), 1);
}

#[test]
fn test_idempotent_on_allocated_input() {
    // Re-running the pass over its own output is a no-op: every operand is
    // already concrete, so nothing is rewritten and no moves are added.
    let mut b = InstructionSequenceBuilder::new();
    let v0 = b.new_virtual_register(Representation::Word64);
    let v1 = b.new_virtual_register(Representation::Word64);
    b.begin_block();
    b.add_instruction(Instruction::new().with_output(reg_def(v0)));
    b.add_instruction(Instruction::new().with_output(reg_def(v1)));
    b.add_instruction(
        Instruction::new()
            .with_input(reg_use_at_start(v0))
            .with_input(any_use(v1)),
    );
    b.add_instruction(Instruction::new());
    b.end_block(&[]);
    let mut sequence = b.finish();

    let config = config(1);
    allocate(&mut sequence, &config);
    let snapshot = format!("{:?}", sequence);

    allocate(&mut sequence, &config);
    assert_eq!(format!("{:?}", sequence), snapshot);
}

#[test]
fn test_random_sequences_fully_allocate() {
    use arbitrary::{Arbitrary, Unstructured};
    use rand::{Rng, SeedableRng};
    use rand_chacha::ChaCha8Rng;

    let mut rng = ChaCha8Rng::seed_from_u64(0x2b);
    for _ in 0..200 {
        let mut bytes = vec![0u8; 4096];
        rng.fill(&mut bytes[..]);
        let mut u = Unstructured::new(&bytes);
        let func = match Func::arbitrary(&mut u) {
            Ok(func) => func,
            Err(_) => continue,
        };
        let mut sequence = func.sequence;
        let mut frame = Frame::new();
        let mut tick_counter = TickCounter::new();
        run(&mut sequence, &machine_config(), &mut frame, &mut tick_counter);
        check_fully_allocated(&sequence);
    }
}
