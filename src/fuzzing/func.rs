/*
 * Released under the terms of the Apache 2.0 license with LLVM
 * exception. See `LICENSE` for details.
 */

//! Generation of random but structurally valid instruction sequences, for
//! property tests, fuzz targets, and benchmarks.

use arbitrary::{Arbitrary, Result as ArbitraryResult, Unstructured};

use crate::{
    Block, ConstantOperand, Inst, Instruction, InstructionSequence, InstructionSequenceBuilder,
    GapPosition, Operand, OperandPolicy, RegisterConfiguration, RegisterKind, Representation,
    UnallocatedOperand, VReg,
};

/// The register configuration every generated sequence targets: four
/// allocatable registers of each kind, so spilling is frequent.
pub fn machine_config() -> RegisterConfiguration {
    RegisterConfiguration::new(vec![0, 1, 2, 3], vec![0, 1, 2, 3])
}

/// A randomly generated instruction sequence, valid by construction: blocks
/// form a chain in RPO, every vreg is defined at most once and before any
/// use, and fixed operands never collide within an instruction.
#[derive(Clone, Debug)]
pub struct Func {
    pub sequence: InstructionSequence,
}

impl<'a> Arbitrary<'a> for Func {
    fn arbitrary(u: &mut Unstructured<'a>) -> ArbitraryResult<Func> {
        Ok(Func {
            sequence: arbitrary_sequence(u)?,
        })
    }
}

fn arbitrary_rep(u: &mut Unstructured) -> ArbitraryResult<Representation> {
    Ok(*u.choose(&[
        Representation::Word32,
        Representation::Word64,
        Representation::Tagged,
        Representation::Tagged,
        Representation::Float32,
        Representation::Float64,
    ])?)
}

/// A fixed-register code of the right kind that no other fixed operand of
/// this instruction uses yet.
fn pick_fixed_code(
    u: &mut Unstructured,
    config: &RegisterConfiguration,
    kind: RegisterKind,
    used: &mut Vec<(RegisterKind, u8)>,
) -> ArbitraryResult<Option<u8>> {
    let available: Vec<u8> = config
        .allocatable_codes(kind)
        .iter()
        .copied()
        .filter(|&code| !used.contains(&(kind, code)))
        .collect();
    if available.is_empty() {
        return Ok(None);
    }
    let code = *u.choose(&available)?;
    used.push((kind, code));
    Ok(Some(code))
}

fn arbitrary_sequence(u: &mut Unstructured) -> ArbitraryResult<InstructionSequence> {
    let config = machine_config();
    let mut b = InstructionSequenceBuilder::new();

    let num_vregs: usize = u.int_in_range(1..=10)?;
    let mut undefined: Vec<(VReg, Representation)> = Vec::new();
    for _ in 0..num_vregs {
        let rep = arbitrary_rep(u)?;
        let vreg = b.new_virtual_register(rep);
        if rep == Representation::Tagged && bool::arbitrary(u)? {
            b.mark_reference(vreg);
        }
        undefined.push((vreg, rep));
    }

    // (vreg, rep, is_constant) for every vreg defined so far.
    let mut defined: Vec<(VReg, Representation, bool)> = Vec::new();

    let num_blocks: usize = u.int_in_range(1..=3)?;
    for block_index in 0..num_blocks {
        b.begin_block();
        let num_instrs: usize = u.int_in_range(1..=6)?;
        for _ in 0..num_instrs {
            let mut instr = Instruction::new();
            let mut used_fixed: Vec<(RegisterKind, u8)> = Vec::new();
            let mut used_fixed_slots: Vec<i32> = Vec::new();

            // Inputs, drawn from vregs defined by earlier instructions.
            let num_inputs: usize = if defined.is_empty() {
                0
            } else {
                u.int_in_range(0..=3)?
            };
            let mut first_input: Option<(VReg, Representation)> = None;
            for input_index in 0..num_inputs {
                let &(vreg, rep, _) = u.choose(&defined)?;
                let policy = match u.int_in_range(0..=5)? {
                    0 => OperandPolicy::Register,
                    1 => OperandPolicy::RegisterOrSlot,
                    2 => OperandPolicy::RegisterOrSlotOrConstant,
                    3 => OperandPolicy::Slot,
                    4 => {
                        let slot = -(vreg.index() as i32 + 1);
                        if used_fixed_slots.contains(&slot) {
                            OperandPolicy::RegisterOrSlot
                        } else {
                            used_fixed_slots.push(slot);
                            OperandPolicy::FixedSlot(slot)
                        }
                    }
                    _ => match pick_fixed_code(u, &config, rep.kind(), &mut used_fixed)? {
                        Some(code) => {
                            if rep.is_floating_point() {
                                OperandPolicy::FixedFpRegister(code)
                            } else {
                                OperandPolicy::FixedRegister(code)
                            }
                        }
                        None => OperandPolicy::RegisterOrSlot,
                    },
                };
                // Keep fixed-register inputs at start-only so their
                // reservations can't collide with fixed outputs.
                let operand = match policy {
                    OperandPolicy::FixedRegister(_) | OperandPolicy::FixedFpRegister(_) => {
                        UnallocatedOperand::new_used_at_start(policy, vreg)
                    }
                    _ => {
                        if bool::arbitrary(u)? {
                            UnallocatedOperand::new_used_at_start(policy, vreg)
                        } else {
                            UnallocatedOperand::new(policy, vreg)
                        }
                    }
                };
                if input_index == 0
                    && matches!(
                        operand.policy(),
                        OperandPolicy::Register
                            | OperandPolicy::RegisterOrSlot
                            | OperandPolicy::RegisterOrSlotOrConstant
                    )
                {
                    first_input = Some((vreg, rep));
                }
                instr = instr.with_input(Operand::Unallocated(operand));
            }

            // Possibly define one not-yet-defined vreg.
            if !undefined.is_empty() && bool::arbitrary(u)? {
                let index: usize = u.int_in_range(0..=undefined.len() - 1)?;
                let (vreg, rep) = undefined.swap_remove(index);
                let is_constant = !rep.is_floating_point() && u.ratio(1u32, 5u32)?;
                if is_constant {
                    b.set_constant(vreg, i64::arbitrary(u)?);
                    instr = instr.with_output(Operand::Constant(ConstantOperand::new(vreg)));
                } else {
                    let same_as_first_input = match first_input {
                        Some((_, input_rep)) => {
                            input_rep.kind() == rep.kind() && u.ratio(1u32, 4u32)?
                        }
                        None => false,
                    };
                    let policy = if same_as_first_input {
                        OperandPolicy::SameAsInput
                    } else {
                        match u.int_in_range(0..=4)? {
                            0 => OperandPolicy::Register,
                            1 => OperandPolicy::RegisterOrSlot,
                            2 => OperandPolicy::Slot,
                            3 => OperandPolicy::FixedSlot(-(vreg.index() as i32 + 1)),
                            _ => match pick_fixed_code(u, &config, rep.kind(), &mut used_fixed)? {
                                Some(code) => {
                                    if rep.is_floating_point() {
                                        OperandPolicy::FixedFpRegister(code)
                                    } else {
                                        OperandPolicy::FixedRegister(code)
                                    }
                                }
                                None => OperandPolicy::Register,
                            },
                        }
                    };
                    instr =
                        instr.with_output(Operand::Unallocated(UnallocatedOperand::new(policy, vreg)));
                }
                defined.push((vreg, rep, is_constant));
            }

            // Occasional register temps, clobbers, and safepoints.
            if u.ratio(1u32, 6u32)? {
                let double = bool::arbitrary(u)?;
                let vreg = if bool::arbitrary(u)? {
                    b.new_virtual_register(if double {
                        Representation::Float64
                    } else {
                        Representation::Word64
                    })
                } else {
                    // Vreg-less temps are allowed and use the default
                    // (general) representation.
                    VReg::invalid()
                };
                let kind = if double && vreg.is_valid() {
                    RegisterKind::Double
                } else {
                    RegisterKind::General
                };
                let policy = match pick_fixed_code(u, &config, kind, &mut used_fixed)? {
                    Some(code) if u.ratio(1u32, 2u32)? => {
                        if kind == RegisterKind::Double {
                            OperandPolicy::FixedFpRegister(code)
                        } else {
                            OperandPolicy::FixedRegister(code)
                        }
                    }
                    _ => OperandPolicy::Register,
                };
                instr = instr.with_temp(Operand::Unallocated(UnallocatedOperand::new(policy, vreg)));
            }
            if u.ratio(1u32, 8u32)? {
                instr = instr.with_clobbers(RegisterKind::General);
            }
            if u.ratio(1u32, 8u32)? {
                instr = instr.with_clobbers(RegisterKind::Double);
            }
            if u.ratio(1u32, 6u32)? {
                instr = instr.with_reference_map();
            }

            b.add_instruction(instr);
        }

        // Block terminator: no operands.
        b.add_instruction(Instruction::new());
        if block_index + 1 < num_blocks {
            b.end_block(&[Block::new(block_index + 1)]);
        } else {
            b.end_block(&[]);
        }
    }

    Ok(b.finish())
}

/// Panic unless every operand of every instruction, including gap-move
/// endpoints, has been rewritten to an allocated operand or a constant.
pub fn check_fully_allocated(sequence: &InstructionSequence) {
    fn check(op: Operand) {
        assert!(
            op.is_allocated() || op.is_constant(),
            "operand not fully allocated: {}",
            op
        );
    }

    for index in 0..sequence.instruction_count() {
        let instr = sequence.instruction(Inst::new(index));
        for i in 0..instr.output_count() {
            check(instr.output(i));
        }
        for i in 0..instr.input_count() {
            check(instr.input(i));
        }
        for i in 0..instr.temp_count() {
            check(instr.temp(i));
        }
        for pos in [GapPosition::Start, GapPosition::End] {
            if let Some(moves) = instr.parallel_move(pos) {
                for mv in moves.moves() {
                    check(mv.source);
                    check(mv.destination);
                }
            }
        }
    }
}
