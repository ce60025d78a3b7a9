/*
 * Released under the terms of the Apache 2.0 license with LLVM
 * exception. See `LICENSE` for details.
 */

//! The single-pass allocator: state shared between its passes, and the block
//! driver that walks the sequence and strings the passes together.

mod pending;
mod reference_maps;
mod register_state;
mod single_pass;
mod spill_slots;
mod vreg;

#[cfg(test)]
mod tests;

use smallvec::SmallVec;

use crate::code::{
    AllocatedOperand, GapPosition, Operand, OperandCell, OperandLocation, OperandPolicy,
    PendingOperandId,
};
use crate::indexset::IndexSet;
use crate::{
    Block, Frame, Inst, InstructionSequence, RegisterConfiguration, RegisterKind, Representation,
    TickCounter, VReg,
};
use pending::PendingOperands;
use single_pass::SinglePassRegisterAllocator;
use vreg::VirtualRegisterData;

/// Index of an allocatable register of one kind. Convertible to a bit
/// position in a word-sized bitmap.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct RegisterIndex(u32);

impl RegisterIndex {
    const INVALID: u32 = u32::MAX;

    #[inline(always)]
    pub fn new(index: usize) -> Self {
        debug_assert!(index < crate::MAX_REGISTERS);
        Self(index as u32)
    }

    #[inline(always)]
    pub fn invalid() -> Self {
        Self(Self::INVALID)
    }

    #[inline(always)]
    pub fn is_valid(self) -> bool {
        self.0 != Self::INVALID
    }

    #[inline(always)]
    pub fn index(self) -> usize {
        debug_assert!(self.is_valid());
        self.0 as usize
    }

    #[inline(always)]
    pub fn bit(self) -> u64 {
        1u64 << self.index()
    }
}

/// Per-block state: the set of RPO numbers of the blocks this block
/// dominates.
#[derive(Clone, Debug, Default)]
struct BlockState {
    dominated_blocks: IndexSet,
}

/// State shared between the allocation passes: the borrowed instruction
/// sequence and frame, per-vreg data, per-block dominance sets, and the
/// pending-operand arena that backs deferred operand rewrites.
pub(crate) struct MidTierAllocationData<'a> {
    code: &'a mut InstructionSequence,
    config: &'a RegisterConfiguration,
    frame: &'a mut Frame,
    tick_counter: &'a mut TickCounter,
    virtual_register_data: Vec<VirtualRegisterData>,
    block_states: Vec<BlockState>,
    reference_map_instructions: Vec<Inst>,
    spilled_virtual_registers: IndexSet,
    pending_operands: PendingOperands,
}

impl<'a> MidTierAllocationData<'a> {
    pub fn new(
        code: &'a mut InstructionSequence,
        config: &'a RegisterConfiguration,
        frame: &'a mut Frame,
        tick_counter: &'a mut TickCounter,
    ) -> Self {
        let vreg_count = code.virtual_register_count();
        let block_count = code.block_count();
        Self {
            code,
            config,
            frame,
            tick_counter,
            virtual_register_data: vec![VirtualRegisterData::default(); vreg_count],
            block_states: vec![BlockState::default(); block_count],
            reference_map_instructions: Vec::new(),
            spilled_virtual_registers: IndexSet::new(),
            pending_operands: PendingOperands::new(),
        }
    }

    pub fn code(&self) -> &InstructionSequence {
        self.code
    }

    pub fn code_mut(&mut self) -> &mut InstructionSequence {
        self.code
    }

    pub fn config(&self) -> &RegisterConfiguration {
        self.config
    }

    pub fn frame_mut(&mut self) -> &mut Frame {
        self.frame
    }

    fn tick(&mut self) {
        self.tick_counter.tick();
    }

    pub fn vreg_data(&self, vreg: VReg) -> &VirtualRegisterData {
        &self.virtual_register_data[vreg.index()]
    }

    pub fn vreg_data_mut(&mut self, vreg: VReg) -> &mut VirtualRegisterData {
        &mut self.virtual_register_data[vreg.index()]
    }

    pub fn spilled_virtual_registers(&self) -> &IndexSet {
        &self.spilled_virtual_registers
    }

    pub fn reference_map_instructions(&self) -> &[Inst] {
        &self.reference_map_instructions
    }

    fn record_reference_map_instruction(&mut self, instr: Inst) {
        self.reference_map_instructions.push(instr);
    }

    pub fn operand_at(&self, loc: OperandLocation) -> Operand {
        self.code.operand(loc)
    }

    pub fn set_operand_at(&mut self, loc: OperandLocation, op: Operand) {
        self.code.set_operand(loc, op);
    }

    pub fn add_gap_move(
        &mut self,
        instr: Inst,
        pos: GapPosition,
        from: Operand,
        to: Operand,
    ) -> usize {
        trace!("gap move at {} {:?}: {} <- {}", instr, pos, to, from);
        self.code.add_gap_move(instr, pos, from, to)
    }

    /// Allocate a pending placeholder for the operand at `loc`, chained in
    /// front of `next`, and write it in place.
    pub fn allocate_pending(&mut self, loc: OperandLocation, next: PendingOperandId) -> PendingOperandId {
        let id = self.pending_operands.allocate(loc, next);
        self.code.set_operand(loc, Operand::Pending(id));
        id
    }

    pub fn pending_next(&self, id: PendingOperandId) -> PendingOperandId {
        self.pending_operands.next(id)
    }

    /// Overwrite the placeholder `id`'s operand cell with its final form,
    /// returning the next placeholder in the chain.
    pub fn resolve_pending(&mut self, id: PendingOperandId, op: Operand) -> PendingOperandId {
        let loc = self.pending_operands.location(id);
        let next = self.pending_operands.next(id);
        debug_assert!(matches!(self.code.operand(loc), Operand::Pending(p) if p == id));
        self.code.set_operand(loc, op);
        next
    }

    /// Add this block to its own dominated set, then fold that set into its
    /// immediate dominator's. Blocks are visited in reverse RPO, so every
    /// dominated block has already accumulated its own subtree.
    fn initialize_block_state(&mut self, block: Block) {
        self.block_states[block.index()]
            .dominated_blocks
            .add(block.index());

        let dominator = self.code.block(block).dominator();
        if dominator.is_valid() {
            // A dominator's RPO number is strictly less than its dominee's.
            debug_assert!(dominator.index() < block.index());
            let (head, tail) = self.block_states.split_at_mut(block.index());
            head[dominator.index()]
                .dominated_blocks
                .union_with(&tail[0].dominated_blocks);
        } else {
            debug_assert_eq!(block.index(), 0);
        }
    }

    /// True if `vreg`'s spill slot holds its value at `instr_index` within
    /// `block`.
    pub fn spill_range_is_live_at(&self, vreg: VReg, instr_index: Inst, block: Block) -> bool {
        let spill_range = self.vreg_data(vreg).spill_range();
        spill_range.live_range().contains(instr_index)
            && self
                .block_state(spill_range.defined_in())
                .dominated_blocks
                .contains(block.index())
    }

    fn block_state(&self, block: Block) -> &BlockState {
        &self.block_states[block.index()]
    }
}

/// The two per-kind allocators plus the passes that drive them over the
/// instruction sequence.
struct MidTierRegisterAllocator {
    general_reg_allocator: SinglePassRegisterAllocator,
    double_reg_allocator: SinglePassRegisterAllocator,
}

impl MidTierRegisterAllocator {
    fn new(data: &MidTierAllocationData) -> Self {
        Self {
            general_reg_allocator: SinglePassRegisterAllocator::new(RegisterKind::General, data),
            double_reg_allocator: SinglePassRegisterAllocator::new(RegisterKind::Double, data),
        }
    }

    fn allocator_for(&mut self, rep: Representation) -> &mut SinglePassRegisterAllocator {
        if rep.is_floating_point() {
            &mut self.double_reg_allocator
        } else {
            &mut self.general_reg_allocator
        }
    }

    /// First pass: visit blocks in reverse RPO, build dominated-block sets,
    /// and record how each virtual register is defined.
    fn define_outputs(&mut self, data: &mut MidTierAllocationData) {
        for block in (0..data.code().block_count()).rev() {
            let block = Block::new(block);
            data.tick();
            data.initialize_block_state(block);
            self.define_block_outputs(data, block);
        }
    }

    fn define_block_outputs(&mut self, data: &mut MidTierAllocationData, block: Block) {
        let block_start = data.code().block(block).first_instruction_index();
        let block_end = data.code().block(block).last_instruction_index();
        for index in (block_start.index()..=block_end.index()).rev() {
            let instr_index = Inst::new(index);
            let output_count = data.code().instruction(instr_index).output_count();
            for i in 0..output_count {
                let output = data.code().instruction(instr_index).output(i);
                match output {
                    Operand::Constant(constant) => {
                        data.define_as_constant(constant.vreg(), instr_index);
                    }
                    Operand::Unallocated(operand) => {
                        let vreg = operand.vreg();
                        if let OperandPolicy::FixedSlot(slot) = operand.policy() {
                            // A fixed-slot output's spill operand is known
                            // up front; record it so uses can be redirected
                            // to the slot without reloads.
                            let rep = data.code().representation_for(vreg);
                            data.define_as_fixed_spill(
                                vreg,
                                AllocatedOperand::stack_slot(rep, slot),
                                instr_index,
                            );
                        } else {
                            data.define_as_unallocated(vreg, instr_index);
                        }
                    }
                    // Already-allocated outputs (e.g. when re-running over
                    // allocated code) need no definition data.
                    Operand::Allocated(_) => {}
                    Operand::Pending(_) => unreachable!("pending operand before allocation"),
                }
            }

            if data.code().instruction(instr_index).has_reference_map() {
                data.record_reference_map_instruction(instr_index);
            }
        }

        let phi_count = data.code().block(block).phis().len();
        for i in 0..phi_count {
            let vreg = data.code().block(block).phis()[i].vreg();
            data.define_as_phi(vreg, block_start);
        }
    }

    /// Second pass: allocate registers block by block in reverse RPO, each
    /// block walked from its last instruction to its first.
    fn allocate_registers(&mut self, data: &mut MidTierAllocationData) {
        for block in (0..data.code().block_count()).rev() {
            data.tick();
            self.allocate_block(data, Block::new(block));
        }

        self.update_spill_ranges_for_loops(data);

        let general_bits = self.general_reg_allocator.assigned_registers();
        let double_bits = self.double_reg_allocator.assigned_registers();
        data.frame_mut()
            .set_allocated_registers(RegisterKind::General, general_bits);
        data.frame_mut()
            .set_allocated_registers(RegisterKind::Double, double_bits);
    }

    fn allocate_block(&mut self, data: &mut MidTierAllocationData, block: Block) {
        trace!("allocate registers for {}", block);
        self.general_reg_allocator.start_block(block);
        self.double_reg_allocator.start_block(block);

        let block_start = data.code().block(block).first_instruction_index();
        let block_end = data.code().block(block).last_instruction_index();
        for index in (block_start.index()..=block_end.index()).rev() {
            let instr_index = Inst::new(index);

            // Reserve fixed register operands up front so the registers they
            // name aren't handed to other operands of this instruction.
            self.reserve_fixed_registers(data, instr_index);

            let output_count = data.code().instruction(instr_index).output_count();
            for i in 0..output_count {
                let loc = OperandLocation {
                    instr: instr_index,
                    cell: OperandCell::Output(i as u16),
                };
                let output = data.code().instruction(instr_index).output(i);
                match output {
                    Operand::Constant(constant) => {
                        let rep = data.code().representation_for(constant.vreg());
                        self.allocator_for(rep).allocate_constant_output(data, loc);
                    }
                    Operand::Unallocated(operand) => {
                        if operand.policy() == OperandPolicy::SameAsInput {
                            debug_assert_eq!(i, 0);
                            let input_loc = OperandLocation {
                                instr: instr_index,
                                cell: OperandCell::Input(0),
                            };
                            let input = data
                                .code()
                                .instruction(instr_index)
                                .input(0)
                                .as_unallocated()
                                .unwrap();
                            let rep = data.code().representation_for(operand.vreg());
                            debug_assert_eq!(
                                rep.kind(),
                                data.code().representation_for(input.vreg()).kind()
                            );
                            self.allocator_for(rep).allocate_same_input_output(
                                data, loc, input_loc, instr_index,
                            );
                        } else {
                            let rep = data.code().representation_for(operand.vreg());
                            self.allocator_for(rep).allocate_output(data, loc, instr_index);
                        }
                    }
                    Operand::Allocated(_) => {}
                    Operand::Pending(_) => unreachable!("pending operand before allocation"),
                }
            }

            if data.code().instruction(instr_index).clobbers_registers() {
                self.general_reg_allocator.spill_all_registers(data);
            }
            if data.code().instruction(instr_index).clobbers_double_registers() {
                self.double_reg_allocator.spill_all_registers(data);
            }

            let temp_count = data.code().instruction(instr_index).temp_count();
            for i in 0..temp_count {
                let loc = OperandLocation {
                    instr: instr_index,
                    cell: OperandCell::Temp(i as u16),
                };
                let Some(temp) = data.code().instruction(instr_index).temp(i).as_unallocated()
                else {
                    continue;
                };
                let rep = data.code().representation_for(temp.vreg());
                self.allocator_for(rep).allocate_temp(data, loc, instr_index);
            }

            // Allocate inputs that are used across the whole instruction
            // first, then the ones only used at the start; the latter can
            // then overlap registers freed by end-of-instruction uses.
            let input_count = data.code().instruction(instr_index).input_count();
            for i in 0..input_count {
                let input = data.code().instruction(instr_index).input(i);
                let Some(operand) = input.as_unallocated() else {
                    continue;
                };
                if operand.is_used_at_start() {
                    continue;
                }
                let loc = OperandLocation {
                    instr: instr_index,
                    cell: OperandCell::Input(i as u16),
                };
                let rep = data.code().representation_for(operand.vreg());
                self.allocator_for(rep).allocate_input(data, loc, instr_index);
            }
            for i in 0..input_count {
                let input = data.code().instruction(instr_index).input(i);
                let Some(operand) = input.as_unallocated() else {
                    continue;
                };
                debug_assert!(operand.is_used_at_start());
                let loc = OperandLocation {
                    instr: instr_index,
                    cell: OperandCell::Input(i as u16),
                };
                let rep = data.code().representation_for(operand.vreg());
                self.allocator_for(rep).allocate_input(data, loc, instr_index);
            }

            // Allocate any unallocated sources of this instruction's end gap
            // moves (sources this pass added while processing instructions
            // after this one).
            let move_count = data
                .code()
                .instruction(instr_index)
                .parallel_move(GapPosition::End)
                .map_or(0, |moves| moves.len());
            for i in 0..move_count {
                let mv = data
                    .code()
                    .instruction(instr_index)
                    .parallel_move(GapPosition::End)
                    .unwrap()
                    .moves()[i];
                debug_assert!(!mv.destination.is_unallocated());
                if let Operand::Unallocated(source) = mv.source {
                    let loc = OperandLocation {
                        instr: instr_index,
                        cell: OperandCell::MoveSource(GapPosition::End, i as u16),
                    };
                    let rep = data.code().representation_for(source.vreg());
                    self.allocator_for(rep)
                        .allocate_gap_move_input(data, loc, instr_index);
                }
            }

            self.general_reg_allocator.end_instruction();
            self.double_reg_allocator.end_instruction();
        }

        // No cross-block register state: everything live leaves in a spill
        // slot.
        self.general_reg_allocator.spill_all_registers(data);
        self.double_reg_allocator.spill_all_registers(data);

        self.general_reg_allocator.end_block(block);
        self.double_reg_allocator.end_block(block);
    }

    fn reserve_fixed_registers(&mut self, data: &mut MidTierAllocationData, instr_index: Inst) {
        let output_count = data.code().instruction(instr_index).output_count();
        for i in 0..output_count {
            let output = data.code().instruction(instr_index).output(i);
            let Some(mut operand) = output.as_unallocated() else {
                continue;
            };
            if operand.policy() == OperandPolicy::SameAsInput {
                // The input operand carries the register constraints; use it
                // to reserve the output's register (the input itself is
                // reserved below).
                match data.code().instruction(instr_index).input(i).as_unallocated() {
                    Some(input) => operand = input,
                    None => continue,
                }
            }
            if operand.has_fixed_register_policy() {
                let rep = data.code().representation_for(operand.vreg());
                self.allocator_for(rep)
                    .reserve_fixed_output_register(data, operand, instr_index);
            }
        }

        let temp_count = data.code().instruction(instr_index).temp_count();
        for i in 0..temp_count {
            let Some(operand) = data.code().instruction(instr_index).temp(i).as_unallocated()
            else {
                continue;
            };
            if operand.has_fixed_register_policy() {
                let rep = data.code().representation_for(operand.vreg());
                self.allocator_for(rep)
                    .reserve_fixed_temp_register(data, operand, instr_index);
            }
        }

        let input_count = data.code().instruction(instr_index).input_count();
        for i in 0..input_count {
            let Some(operand) = data.code().instruction(instr_index).input(i).as_unallocated()
            else {
                continue;
            };
            if operand.has_fixed_register_policy() {
                let rep = data.code().representation_for(operand.vreg());
                self.allocator_for(rep)
                    .reserve_fixed_input_register(data, operand, instr_index);
            }
        }
    }

    /// Extend the spill range of every spilled value live on entry to a loop
    /// header through the whole loop, so the slot survives the backedge.
    fn update_spill_ranges_for_loops(&mut self, data: &mut MidTierAllocationData) {
        for block in 0..data.code().block_count() {
            let block = Block::new(block);
            if !data.code().block(block).is_loop_header() {
                continue;
            }
            let last_loop_block = Block::new(data.code().block(block).loop_end().index() - 1);
            let last_loop_instr = data
                .code()
                .block(last_loop_block)
                .last_instruction_index();
            let header_first = data.code().block(block).first_instruction_index();

            let spilled: SmallVec<[usize; 8]> = data.spilled_virtual_registers().iter().collect();
            for vreg in spilled {
                let vreg = VReg::new(vreg);
                let live = data.vreg_data(vreg).has_spill_range()
                    && data.spill_range_is_live_at(vreg, header_first, block);
                if live {
                    trace!("extending {} spill range over loop {}", vreg, block);
                    data.vreg_data_mut(vreg)
                        .spill_range_mut()
                        .extend_range_to(last_loop_instr);
                }
            }
        }
    }
}

/// Run register allocation over `code`: rewrite every operand into a
/// register, stack slot, or constant; insert the gap moves that connect
/// them; assign spill slots from `frame`; and record GC references on
/// reference maps.
pub fn run(
    code: &mut InstructionSequence,
    config: &RegisterConfiguration,
    frame: &mut Frame,
    tick_counter: &mut TickCounter,
) {
    let mut data = MidTierAllocationData::new(code, config, frame, tick_counter);
    let mut allocator = MidTierRegisterAllocator::new(&data);
    allocator.define_outputs(&mut data);
    allocator.allocate_registers(&mut data);
    spill_slots::allocate_spill_slots(&mut data);
    reference_maps::populate_reference_maps(&mut data);
}
