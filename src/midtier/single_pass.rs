/*
 * Released under the terms of the Apache 2.0 license with LLVM
 * exception. See `LICENSE` for details.
 */

//! The per-kind single-pass allocation state machine.
//!
//! One allocator instance handles one register kind. It walks each block's
//! instructions from last to first with no prior live-range analysis,
//! tracking which registers hold which virtual registers, and decides
//! per-operand between keeping a value in a register and spilling it. Uses
//! whose requirement is soft are recorded as pending placeholders and only
//! resolved when their register is finally committed or spilled.

use smallvec::SmallVec;

use crate::code::{
    AllocatedOperand, GapPosition, Operand, OperandCell, OperandLocation, OperandPolicy,
    PendingOperandId, UnallocatedOperand,
};
use crate::{Block, Inst, RegisterKind, VReg};

use super::register_state::RegisterState;
use super::{MidTierAllocationData, RegisterIndex};

/// Position(s) within an instruction at which an operand occupies its
/// register.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum UsePosition {
    /// Used at the start of the instruction.
    Start,
    /// Used at the end of the instruction.
    End,
    /// Used for the whole instruction.
    All,
    /// Not used within the instruction (pending uses, which reserve nothing).
    None,
}

pub(crate) struct SinglePassRegisterAllocator {
    kind: RegisterKind,
    num_allocatable_registers: usize,

    /// Inverse of the register state's register-to-vreg mapping.
    virtual_register_to_reg: Vec<RegisterIndex>,

    /// Current register state, created lazily per block on first use.
    register_state: Option<RegisterState>,

    reg_code_to_index: Vec<RegisterIndex>,
    index_to_reg_code: Vec<u8>,

    /// Every register code this allocator ever assigned, for the frame.
    assigned_registers: u64,

    /// Registers reserved by operands of the current instruction, by use
    /// position.
    in_use_at_instr_start_bits: u64,
    in_use_at_instr_end_bits: u64,
    /// Registers holding live vregs across instructions of this block.
    allocated_registers_bits: u64,
}

impl SinglePassRegisterAllocator {
    pub fn new(kind: RegisterKind, data: &MidTierAllocationData) -> Self {
        let codes = data.config().allocatable_codes(kind);
        let max_code = codes.iter().map(|&code| code as usize + 1).max().unwrap_or(0);
        let mut reg_code_to_index = vec![RegisterIndex::invalid(); max_code];
        for (index, &code) in codes.iter().enumerate() {
            reg_code_to_index[code as usize] = RegisterIndex::new(index);
        }
        Self {
            kind,
            num_allocatable_registers: codes.len(),
            virtual_register_to_reg: vec![
                RegisterIndex::invalid();
                data.code().virtual_register_count()
            ],
            register_state: None,
            reg_code_to_index,
            index_to_reg_code: codes.to_vec(),
            assigned_registers: 0,
            in_use_at_instr_start_bits: 0,
            in_use_at_instr_end_bits: 0,
            allocated_registers_bits: 0,
        }
    }

    pub fn assigned_registers(&self) -> u64 {
        self.assigned_registers
    }

    fn has_register_state(&self) -> bool {
        self.register_state.is_some()
    }

    fn register_state(&self) -> &RegisterState {
        self.register_state.as_ref().unwrap()
    }

    fn register_state_mut(&mut self) -> &mut RegisterState {
        self.register_state.as_mut().unwrap()
    }

    /// The allocator carries no register state by default, so functions that
    /// never touch this kind don't pay for per-block state.
    fn ensure_register_state(&mut self) {
        if !self.has_register_state() {
            self.register_state = Some(RegisterState::new(self.num_allocatable_registers));
        }
    }

    fn from_reg_code(&self, reg_code: u8) -> RegisterIndex {
        let reg = self.reg_code_to_index[reg_code as usize];
        debug_assert!(reg.is_valid());
        reg
    }

    fn to_reg_code(&self, reg: RegisterIndex) -> u8 {
        self.index_to_reg_code[reg.index()]
    }

    fn virtual_register_for_register(&self, reg: RegisterIndex) -> VReg {
        self.register_state().virtual_register_for_register(reg)
    }

    fn register_for_virtual_register(&self, virtual_register: VReg) -> RegisterIndex {
        debug_assert!(virtual_register.is_valid());
        self.virtual_register_to_reg[virtual_register.index()]
    }

    fn virtual_register_is_unallocated_or_in_reg(
        &self,
        virtual_register: VReg,
        reg: RegisterIndex,
    ) -> bool {
        let existing_reg = self.register_for_virtual_register(virtual_register);
        !existing_reg.is_valid() || existing_reg == reg
    }

    fn is_free_or_same_virtual_register(&self, reg: RegisterIndex, virtual_register: VReg) -> bool {
        let allocated_vreg = self.virtual_register_for_register(reg);
        allocated_vreg.is_invalid() || allocated_vreg == virtual_register
    }

    pub fn start_block(&mut self, _block: Block) {
        debug_assert!(!self.has_register_state());
        debug_assert_eq!(self.in_use_at_instr_start_bits, 0);
        debug_assert_eq!(self.in_use_at_instr_end_bits, 0);
        debug_assert_eq!(self.allocated_registers_bits, 0);
    }

    pub fn end_block(&mut self, _block: Block) {
        debug_assert_eq!(self.in_use_at_instr_start_bits, 0);
        debug_assert_eq!(self.in_use_at_instr_end_bits, 0);
        self.register_state = None;
    }

    pub fn end_instruction(&mut self) {
        self.in_use_at_instr_end_bits = 0;
        self.in_use_at_instr_start_bits = 0;
    }

    /// Check the bijection between the vreg-to-register map and the register
    /// state, in debug builds.
    fn check_consistency(&self, data: &MidTierAllocationData) {
        if !cfg!(debug_assertions) {
            return;
        }
        for virtual_register in 0..data.code().virtual_register_count() {
            let reg = self.virtual_register_to_reg[virtual_register];
            if reg.is_valid() {
                assert_eq!(
                    self.virtual_register_for_register(reg),
                    VReg::new(virtual_register)
                );
                assert!(self.allocated_registers_bits & reg.bit() != 0);
            }
        }
        for index in 0..self.num_allocatable_registers {
            let reg = RegisterIndex::new(index);
            let virtual_register = self.virtual_register_for_register(reg);
            if virtual_register.is_valid() {
                assert_eq!(self.register_for_virtual_register(virtual_register), reg);
                assert!(self.allocated_registers_bits & reg.bit() != 0);
            }
        }
    }

    fn mark_register_use(&mut self, reg: RegisterIndex, pos: UsePosition) {
        if pos == UsePosition::Start || pos == UsePosition::All {
            self.in_use_at_instr_start_bits |= reg.bit();
        }
        if pos == UsePosition::End || pos == UsePosition::All {
            self.in_use_at_instr_end_bits |= reg.bit();
        }
    }

    fn in_use_bitmap(&self, pos: UsePosition) -> u64 {
        match pos {
            UsePosition::Start => self.in_use_at_instr_start_bits,
            UsePosition::End => self.in_use_at_instr_end_bits,
            UsePosition::All => self.in_use_at_instr_start_bits | self.in_use_at_instr_end_bits,
            UsePosition::None => unreachable!(),
        }
    }

    fn assign_register(&mut self, reg: RegisterIndex, virtual_register: VReg, pos: UsePosition) {
        self.assigned_registers |= 1u64 << self.to_reg_code(reg);
        self.mark_register_use(reg, pos);
        self.allocated_registers_bits |= reg.bit();
        if virtual_register.is_valid() {
            self.virtual_register_to_reg[virtual_register.index()] = reg;
        }
    }

    fn free_register(&mut self, reg: RegisterIndex, virtual_register: VReg) {
        self.allocated_registers_bits &= !reg.bit();
        if virtual_register.is_valid() {
            self.virtual_register_to_reg[virtual_register.index()] = RegisterIndex::invalid();
        }
    }

    /// Choose a register for `virtual_register`: its current register if it
    /// has one; otherwise a free register, but only when the use requires a
    /// register or the vreg has not already been spilled (avoiding a fresh
    /// spill); otherwise, if a register is required, one chosen to spill.
    fn choose_register_for_vreg(
        &mut self,
        data: &mut MidTierAllocationData,
        virtual_register: VReg,
        pos: UsePosition,
        must_use_register: bool,
    ) -> RegisterIndex {
        let reg = self.register_for_virtual_register(virtual_register);
        if !reg.is_valid() && (must_use_register || !data.vreg_data(virtual_register).has_spill_operand())
        {
            self.choose_register(data, pos, must_use_register)
        } else {
            reg
        }
    }

    fn choose_register(
        &mut self,
        data: &mut MidTierAllocationData,
        pos: UsePosition,
        must_use_register: bool,
    ) -> RegisterIndex {
        let mut reg = self.choose_free_register(pos);
        if !reg.is_valid() && must_use_register {
            reg = self.choose_register_to_spill(data, pos);
            self.spill_register(data, reg);
        }
        reg
    }

    fn choose_free_register(&self, pos: UsePosition) -> RegisterIndex {
        // Take the lowest-indexed free, non-blocked register, if any.
        let allocated_or_in_use = self.in_use_bitmap(pos) | self.allocated_registers_bits;
        let reg_index = (!allocated_or_in_use).trailing_zeros() as usize;
        if reg_index >= self.num_allocatable_registers {
            RegisterIndex::invalid()
        } else {
            RegisterIndex::new(reg_index)
        }
    }

    /// Choose a register to spill. Preferentially choose a register with
    /// only pending uses, to avoid a reload gap move; then one whose vreg
    /// already has a spill operand, to avoid a new spill store; then the one
    /// holding the vreg with the earliest definition, as the likeliest to be
    /// spilled anyway.
    fn choose_register_to_spill(
        &self,
        data: &MidTierAllocationData,
        pos: UsePosition,
    ) -> RegisterIndex {
        let in_use = self.in_use_bitmap(pos);

        let mut chosen_reg = RegisterIndex::invalid();
        let mut earliest_definition = usize::MAX;
        let mut pending_only_use = false;
        let mut already_spilled = false;
        for index in 0..self.num_allocatable_registers {
            let reg = RegisterIndex::new(index);
            if in_use & reg.bit() != 0 {
                continue;
            }
            let virtual_register = self.virtual_register_for_register(reg);
            debug_assert!(virtual_register.is_valid());
            let vreg_data = data.vreg_data(virtual_register);

            let has_pending_only = self.register_state().has_pending_uses_only(reg);
            let has_spill = vreg_data.has_spill_operand();
            if (!pending_only_use && has_pending_only)
                || (!already_spilled && has_spill)
                || vreg_data.output_instr_index().index() < earliest_definition
            {
                chosen_reg = reg;
                earliest_definition = vreg_data.output_instr_index().index();
                pending_only_use = has_pending_only;
                already_spilled = has_spill;
            }
        }

        // There is always an unblocked register available: an instruction
        // cannot pin every register of a kind with fixed policies.
        debug_assert!(chosen_reg.is_valid());
        trace!("choose {:?} to spill", chosen_reg);
        chosen_reg
    }

    /// The register operand for `reg` holding `virtual_register`. Every
    /// register that materializes in an operand is recorded for the frame.
    fn allocated_operand_for_reg(
        &mut self,
        data: &MidTierAllocationData,
        reg: RegisterIndex,
        virtual_register: VReg,
    ) -> AllocatedOperand {
        let rep = data.code().representation_for(virtual_register);
        debug_assert!(virtual_register.is_invalid() || rep.kind() == self.kind);
        self.assigned_registers |= 1u64 << self.to_reg_code(reg);
        AllocatedOperand::register(rep, self.to_reg_code(reg) as i32)
    }

    /// Commit `reg` for `virtual_register`: resolve its pending uses, write
    /// the allocated operand through `loc` if given, and free the register.
    fn commit_register(
        &mut self,
        data: &mut MidTierAllocationData,
        reg: RegisterIndex,
        virtual_register: VReg,
        loc: Option<OperandLocation>,
        pos: UsePosition,
    ) -> AllocatedOperand {
        let allocated = self.allocated_operand_for_reg(data, reg, virtual_register);
        if let Some(loc) = loc {
            data.set_operand_at(loc, Operand::Allocated(allocated));
        }
        self.register_state_mut().commit(reg, allocated, data);
        if pos != UsePosition::None {
            self.mark_register_use(reg, pos);
        }
        self.free_register(reg, virtual_register);
        self.check_consistency(data);
        allocated
    }

    fn spill_register(&mut self, data: &mut MidTierAllocationData, reg: RegisterIndex) {
        if !self.register_state().is_allocated(reg) {
            return;
        }
        let virtual_register = self.virtual_register_for_register(reg);
        trace!("spill {:?} holding {}", reg, virtual_register);
        let allocated = self.allocated_operand_for_reg(data, reg, virtual_register);
        self.register_state_mut().spill(reg, allocated, data);
        self.free_register(reg, virtual_register);
    }

    /// Spill every allocated register, e.g. for an instruction that clobbers
    /// all registers of this kind, or at block boundaries.
    pub fn spill_all_registers(&mut self, data: &mut MidTierAllocationData) {
        if !self.has_register_state() {
            return;
        }
        for index in 0..self.num_allocatable_registers {
            self.spill_register(data, RegisterIndex::new(index));
        }
    }

    fn spill_register_for_virtual_register(
        &mut self,
        data: &mut MidTierAllocationData,
        virtual_register: VReg,
    ) {
        debug_assert!(virtual_register.is_valid());
        let reg = self.register_for_virtual_register(virtual_register);
        if reg.is_valid() {
            self.spill_register(data, reg);
        }
    }

    fn allocate_use(
        &mut self,
        data: &mut MidTierAllocationData,
        reg: RegisterIndex,
        virtual_register: VReg,
        loc: OperandLocation,
        instr_index: Inst,
        pos: UsePosition,
    ) {
        debug_assert!(virtual_register.is_valid());
        debug_assert!(self.is_free_or_same_virtual_register(reg, virtual_register));

        let allocated = self.allocated_operand_for_reg(data, reg, virtual_register);
        self.register_state_mut().commit(reg, allocated, data);
        data.set_operand_at(loc, Operand::Allocated(allocated));
        self.register_state_mut()
            .allocate_use(reg, virtual_register, instr_index);
        self.assign_register(reg, virtual_register, pos);
        self.check_consistency(data);
    }

    fn allocate_pending_use(
        &mut self,
        data: &mut MidTierAllocationData,
        reg: RegisterIndex,
        virtual_register: VReg,
        loc: OperandLocation,
        instr_index: Inst,
    ) {
        debug_assert!(virtual_register.is_valid());
        debug_assert!(self.is_free_or_same_virtual_register(reg, virtual_register));

        self.register_state_mut()
            .allocate_pending_use(reg, virtual_register, loc, instr_index, data);
        // A pending use doesn't need the register within this instruction,
        // so don't block it for other operands.
        self.assign_register(reg, virtual_register, UsePosition::None);
        self.check_consistency(data);
    }

    /// Allocate `loc` to `reg` and add a gap move bringing the vreg (from
    /// wherever it currently lives) into this register.
    fn allocate_use_with_move(
        &mut self,
        data: &mut MidTierAllocationData,
        reg: RegisterIndex,
        virtual_register: VReg,
        loc: OperandLocation,
        instr_index: Inst,
        pos: UsePosition,
    ) {
        let to = self.allocated_operand_for_reg(data, reg, virtual_register);
        let from = Operand::Unallocated(UnallocatedOperand::new(
            OperandPolicy::RegisterOrSlot,
            virtual_register,
        ));
        data.add_gap_move(instr_index, GapPosition::End, from, Operand::Allocated(to));
        data.set_operand_at(loc, Operand::Allocated(to));
        self.mark_register_use(reg, pos);
        self.check_consistency(data);
    }

    pub fn allocate_input(
        &mut self,
        data: &mut MidTierAllocationData,
        loc: OperandLocation,
        instr_index: Inst,
    ) {
        self.ensure_register_state();
        let operand = data.operand_at(loc).as_unallocated().unwrap();
        let virtual_register = operand.vreg();
        let rep = data.code().representation_for(virtual_register);

        if let OperandPolicy::FixedSlot(slot) = operand.policy() {
            // Allocate the input to its fixed slot, fill the slot with an
            // end gap move from an unconstrained copy of the input, and
            // spill that copy.
            let input_copy = Operand::Unallocated(UnallocatedOperand::new(
                OperandPolicy::RegisterOrSlot,
                virtual_register,
            ));
            let allocated = AllocatedOperand::stack_slot(rep, slot);
            data.set_operand_at(loc, Operand::Allocated(allocated));
            let index = data.add_gap_move(
                instr_index,
                GapPosition::End,
                input_copy,
                Operand::Allocated(allocated),
            );
            let source_loc = OperandLocation {
                instr: instr_index,
                cell: OperandCell::MoveSource(GapPosition::End, index as u16),
            };
            data.spill_operand(virtual_register, source_loc, instr_index);
            return;
        } else if operand.policy() == OperandPolicy::Slot {
            data.spill_operand(virtual_register, loc, instr_index);
            return;
        }

        let pos = if operand.is_used_at_start() {
            UsePosition::Start
        } else {
            UsePosition::All
        };
        if operand.has_fixed_register_policy() {
            debug_assert_eq!(rep.kind(), self.kind);
            let reg = self.from_reg_code(operand.fixed_register_code());
            if !self.virtual_register_is_unallocated_or_in_reg(virtual_register, reg) {
                // The vreg already lives in a different register; route it
                // into the fixed register with a gap move.
                self.allocate_use_with_move(data, reg, virtual_register, loc, instr_index, pos);
            } else {
                self.allocate_use(data, reg, virtual_register, loc, instr_index, pos);
            }
        } else {
            let must_use_register = operand.policy() == OperandPolicy::Register
                || (data.vreg_data(virtual_register).is_constant()
                    && operand.policy() != OperandPolicy::RegisterOrSlotOrConstant);
            let reg = self.choose_register_for_vreg(data, virtual_register, pos, must_use_register);

            if reg.is_valid() {
                if must_use_register {
                    self.allocate_use(data, reg, virtual_register, loc, instr_index, pos);
                } else {
                    self.allocate_pending_use(data, reg, virtual_register, loc, instr_index);
                }
            } else {
                data.spill_operand(virtual_register, loc, instr_index);
            }
        }
    }

    pub fn allocate_gap_move_input(
        &mut self,
        data: &mut MidTierAllocationData,
        loc: OperandLocation,
        instr_index: Inst,
    ) {
        self.ensure_register_state();
        let operand = data.operand_at(loc).as_unallocated().unwrap();
        let virtual_register = operand.vreg();

        // Gap move inputs are unconstrained.
        debug_assert_eq!(operand.policy(), OperandPolicy::RegisterOrSlot);
        let reg = self.choose_register_for_vreg(data, virtual_register, UsePosition::Start, false);
        if reg.is_valid() {
            self.allocate_pending_use(data, reg, virtual_register, loc, instr_index);
        } else {
            data.spill_operand(virtual_register, loc, instr_index);
        }
    }

    pub fn allocate_constant_output(&mut self, data: &mut MidTierAllocationData, loc: OperandLocation) {
        self.ensure_register_state();
        let operand = data.operand_at(loc).as_constant().unwrap();
        // If the constant was allocated to a register further along, spill
        // it now to insert the gap moves from the constant operand.
        self.spill_register_for_virtual_register(data, operand.vreg());
    }

    pub fn allocate_output(
        &mut self,
        data: &mut MidTierAllocationData,
        loc: OperandLocation,
        instr_index: Inst,
    ) {
        self.allocate_output_at(data, loc, instr_index, UsePosition::End);
    }

    fn allocate_output_at(
        &mut self,
        data: &mut MidTierAllocationData,
        loc: OperandLocation,
        instr_index: Inst,
        pos: UsePosition,
    ) -> RegisterIndex {
        self.ensure_register_state();
        let operand = data.operand_at(loc).as_unallocated().unwrap();
        let virtual_register = operand.vreg();

        let reg = match operand.policy() {
            OperandPolicy::Slot | OperandPolicy::FixedSlot(_) => {
                // No register for this output; make sure any register still
                // holding the vreg is reloaded from the slot instead.
                self.spill_register_for_virtual_register(data, virtual_register);
                RegisterIndex::invalid()
            }
            OperandPolicy::FixedRegister(_) | OperandPolicy::FixedFpRegister(_) => {
                self.from_reg_code(operand.fixed_register_code())
            }
            _ => self.choose_register_for_vreg(
                data,
                virtual_register,
                pos,
                operand.policy() == OperandPolicy::Register,
            ),
        };

        if !reg.is_valid() {
            data.spill_operand(virtual_register, loc, instr_index);
        } else {
            let mut move_output_to = None;
            if !self.virtual_register_is_unallocated_or_in_reg(virtual_register, reg) {
                // The vreg was allocated to a different register (e.g. by a
                // fixed use in a following instruction's gap move); commit
                // that use here and move the output into it. The existing
                // register isn't marked used in this instruction, since its
                // use belongs to the following gap.
                let existing_reg = self.register_for_virtual_register(virtual_register);
                move_output_to = Some(self.commit_register(
                    data,
                    existing_reg,
                    virtual_register,
                    None,
                    UsePosition::None,
                ));
            }
            let allocated = self.commit_register(data, reg, virtual_register, Some(loc), pos);
            if let Some(to) = move_output_to {
                self.emit_gap_move_from_output(data, allocated, to, instr_index);
            }
            if data.vreg_data(virtual_register).needs_spill_at_output() {
                let block = data.code().instr_block(instr_index);
                data.emit_gap_move_from_output_to_spill_slot(
                    virtual_register,
                    allocated,
                    block,
                    instr_index,
                );
            }
        }

        reg
    }

    pub fn allocate_same_input_output(
        &mut self,
        data: &mut MidTierAllocationData,
        output_loc: OperandLocation,
        input_loc: OperandLocation,
        instr_index: Inst,
    ) {
        self.ensure_register_state();
        let input = data.operand_at(input_loc).as_unallocated().unwrap();
        let output = data.operand_at(output_loc).as_unallocated().unwrap();
        let input_vreg = input.vreg();
        let output_vreg = output.vreg();

        // The input operand carries the register constraints, so allocate
        // the output as a copy of the input bearing the output's vreg.
        let output_as_input = UnallocatedOperand::with_vreg(input, output_vreg);
        data.set_operand_at(output_loc, Operand::Unallocated(output_as_input));
        let reg = self.allocate_output_at(data, output_loc, instr_index, UsePosition::All);

        if reg.is_valid() {
            // Pin the input to the same register.
            let policy = match self.kind {
                RegisterKind::General => OperandPolicy::FixedRegister(self.to_reg_code(reg)),
                RegisterKind::Double => OperandPolicy::FixedFpRegister(self.to_reg_code(reg)),
            };
            data.set_operand_at(
                input_loc,
                Operand::Unallocated(UnallocatedOperand::new(policy, input_vreg)),
            );
        } else {
            // The output was spilled, so the input has to be its spill slot
            // too: spill the input operand against the output vreg's chain,
            // and store the input value into the shared slot at the end of
            // the instruction.
            data.spill_operand(output_vreg, input_loc, instr_index);

            let unconstrained_input = Operand::Unallocated(UnallocatedOperand::new(
                OperandPolicy::RegisterOrSlot,
                input_vreg,
            ));
            let index = data.add_gap_move(
                instr_index,
                GapPosition::End,
                unconstrained_input,
                Operand::Pending(PendingOperandId::invalid()),
            );
            let destination_loc = OperandLocation {
                instr: instr_index,
                cell: OperandCell::MoveDestination(GapPosition::End, index as u16),
            };
            data.spill_operand(output_vreg, destination_loc, instr_index);
        }
    }

    pub fn allocate_temp(
        &mut self,
        data: &mut MidTierAllocationData,
        loc: OperandLocation,
        instr_index: Inst,
    ) {
        self.ensure_register_state();
        let operand = data.operand_at(loc).as_unallocated().unwrap();
        let virtual_register = operand.vreg();
        debug_assert!(!matches!(operand.policy(), OperandPolicy::FixedSlot(_)));

        let reg = match operand.policy() {
            OperandPolicy::Slot => RegisterIndex::invalid(),
            OperandPolicy::FixedRegister(_) | OperandPolicy::FixedFpRegister(_) => {
                self.from_reg_code(operand.fixed_register_code())
            }
            _ => self.choose_register(
                data,
                UsePosition::All,
                operand.policy() == OperandPolicy::Register,
            ),
        };

        if reg.is_valid() {
            debug_assert!(
                virtual_register.is_invalid()
                    || self.virtual_register_is_unallocated_or_in_reg(virtual_register, reg)
            );
            self.commit_register(data, reg, virtual_register, Some(loc), UsePosition::All);
        } else {
            debug_assert!(virtual_register.is_valid());
            data.spill_operand(virtual_register, loc, instr_index);
        }
    }

    /// True if `virtual_register` is defined after use position `pos` of
    /// `instr_index`.
    fn defined_after(
        &self,
        data: &MidTierAllocationData,
        virtual_register: VReg,
        instr_index: Inst,
        pos: UsePosition,
    ) -> bool {
        if virtual_register.is_invalid() {
            return false;
        }
        let defined_at = data.vreg_data(virtual_register).output_instr_index();
        defined_at > instr_index || (defined_at == instr_index && pos == UsePosition::Start)
    }

    pub fn reserve_fixed_input_register(
        &mut self,
        data: &mut MidTierAllocationData,
        operand: UnallocatedOperand,
        instr_index: Inst,
    ) {
        let pos = if operand.is_used_at_start() {
            UsePosition::Start
        } else {
            UsePosition::All
        };
        self.reserve_fixed_register(data, operand, instr_index, pos);
    }

    pub fn reserve_fixed_temp_register(
        &mut self,
        data: &mut MidTierAllocationData,
        operand: UnallocatedOperand,
        instr_index: Inst,
    ) {
        self.reserve_fixed_register(data, operand, instr_index, UsePosition::All);
    }

    pub fn reserve_fixed_output_register(
        &mut self,
        data: &mut MidTierAllocationData,
        operand: UnallocatedOperand,
        instr_index: Inst,
    ) {
        self.reserve_fixed_register(data, operand, instr_index, UsePosition::End);
    }

    fn reserve_fixed_register(
        &mut self,
        data: &mut MidTierAllocationData,
        operand: UnallocatedOperand,
        instr_index: Inst,
        pos: UsePosition,
    ) {
        self.ensure_register_state();
        let virtual_register = operand.vreg();
        let reg = self.from_reg_code(operand.fixed_register_code());
        if !self.is_free_or_same_virtual_register(reg, virtual_register)
            && !self.defined_after(data, virtual_register, instr_index, pos)
        {
            // The register is in use by a different virtual register that
            // stays live across this instruction; spill it now.
            self.spill_register(data, reg);
        }
        self.mark_register_use(reg, pos);
    }

    fn emit_gap_move_from_output(
        &self,
        data: &mut MidTierAllocationData,
        from: AllocatedOperand,
        to: AllocatedOperand,
        instr_index: Inst,
    ) {
        let block = data.code().instr_block(instr_index);
        if instr_index == data.code().block(block).last_instruction_index() {
            let successors: SmallVec<[Block; 2]> = data
                .code()
                .block(block)
                .successors()
                .iter()
                .copied()
                .collect();
            for succ in successors {
                debug_assert_eq!(data.code().block(succ).predecessors().len(), 1);
                let first = data.code().block(succ).first_instruction_index();
                data.add_gap_move(
                    first,
                    GapPosition::Start,
                    Operand::Allocated(from),
                    Operand::Allocated(to),
                );
            }
        } else {
            data.add_gap_move(
                instr_index.next(),
                GapPosition::Start,
                Operand::Allocated(from),
                Operand::Allocated(to),
            );
        }
    }
}
