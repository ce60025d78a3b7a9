/*
 * Released under the terms of the Apache 2.0 license with LLVM
 * exception. See `LICENSE` for details.
 */

//! Per-register state for one register kind at a point in the backwards
//! walk: which virtual register each physical register holds, and how its
//! uses are updated when the register is committed or spilled.

use crate::code::{AllocatedOperand, Operand, OperandLocation, PendingOperandId};
use crate::{Inst, VReg};

use super::{MidTierAllocationData, RegisterIndex};

/// One physical register: the virtual register it currently holds and what
/// has to happen if the register is committed or spilled.
#[derive(Clone, Debug)]
struct Register {
    /// True if a committed use exists, so spilling must materialize the vreg
    /// in this register with a gap move. Pending uses alone can instead be
    /// redirected to the spill slot.
    needs_gap_move_on_spill: bool,
    /// The most recent use seen; walking backwards, this is the largest
    /// instruction index of the in-progress allocation.
    last_use_instr_index: Inst,
    virtual_register: VReg,
    /// Head of the chain of pending uses of this register.
    pending_uses: PendingOperandId,
}

impl Register {
    fn new() -> Self {
        Self {
            needs_gap_move_on_spill: false,
            last_use_instr_index: Inst::invalid(),
            virtual_register: VReg::invalid(),
            pending_uses: PendingOperandId::invalid(),
        }
    }

    fn reset(&mut self) {
        *self = Self::new();
    }

    fn is_allocated(&self) -> bool {
        self.virtual_register.is_valid()
    }

    fn record_use(&mut self, virtual_register: VReg, instr_index: Inst) {
        // A register can have many pending uses, but only ever a single
        // committed use: any subsequent use commits the preceding one first.
        debug_assert!(!self.is_allocated());
        self.needs_gap_move_on_spill = true;
        self.virtual_register = virtual_register;
        self.last_use_instr_index = instr_index;
    }
}

/// The state of all allocatable registers of one kind. Clonable, so
/// speculative states can be modeled by value copy.
#[derive(Clone, Debug)]
pub(crate) struct RegisterState {
    register_data: Vec<Option<Register>>,
}

impl RegisterState {
    pub fn new(num_allocatable_registers: usize) -> Self {
        Self {
            register_data: vec![None; num_allocatable_registers],
        }
    }

    fn reg_data(&self, reg: RegisterIndex) -> &Register {
        self.register_data[reg.index()].as_ref().unwrap()
    }

    fn reg_data_mut(&mut self, reg: RegisterIndex) -> &mut Register {
        self.register_data[reg.index()].as_mut().unwrap()
    }

    fn ensure_register_data(&mut self, reg: RegisterIndex) -> &mut Register {
        self.register_data[reg.index()].get_or_insert_with(Register::new)
    }

    pub fn is_allocated(&self, reg: RegisterIndex) -> bool {
        self.register_data[reg.index()]
            .as_ref()
            .map_or(false, |data| data.is_allocated())
    }

    pub fn virtual_register_for_register(&self, reg: RegisterIndex) -> VReg {
        if self.is_allocated(reg) {
            self.reg_data(reg).virtual_register
        } else {
            VReg::invalid()
        }
    }

    /// True if `reg` has only pending uses, so spilling it needs no gap move.
    pub fn has_pending_uses_only(&self, reg: RegisterIndex) -> bool {
        debug_assert!(self.is_allocated(reg));
        !self.reg_data(reg).needs_gap_move_on_spill
    }

    /// Commit `reg`: resolve its pending uses to `allocated` and free it.
    pub fn commit(
        &mut self,
        reg: RegisterIndex,
        allocated: AllocatedOperand,
        data: &mut MidTierAllocationData,
    ) {
        if !self.is_allocated(reg) {
            return;
        }
        let head = {
            let reg_data = self.reg_data_mut(reg);
            let head = reg_data.pending_uses;
            reg_data.reset();
            head
        };
        let mut current = head;
        while current.is_valid() {
            current = data.resolve_pending(current, Operand::Allocated(allocated));
        }
    }

    /// Spill `reg`: if a committed use needs the value in this register,
    /// emit the reload gap move at its last use; all pending uses are
    /// redirected to the vreg's spill operand.
    pub fn spill(
        &mut self,
        reg: RegisterIndex,
        allocated: AllocatedOperand,
        data: &mut MidTierAllocationData,
    ) {
        debug_assert!(self.is_allocated(reg));
        let register = {
            let reg_data = self.reg_data_mut(reg);
            let copy = reg_data.clone();
            reg_data.reset();
            copy
        };

        if register.needs_gap_move_on_spill {
            data.emit_gap_move_to_input_from_spill_slot(
                register.virtual_register,
                allocated,
                register.last_use_instr_index,
            );
        }

        let mut current = register.pending_uses;
        while current.is_valid() {
            // Read the link before the node is relinked onto the vreg's
            // pending-spill chain.
            let next = data.pending_next(current);
            data.spill_pending_use(
                register.virtual_register,
                current,
                register.last_use_instr_index,
            );
            current = next;
        }
    }

    /// Allocate `reg` to `virtual_register` as a committed use: if the
    /// register is later spilled, a gap move at `instr_index` will reload it.
    pub fn allocate_use(&mut self, reg: RegisterIndex, virtual_register: VReg, instr_index: Inst) {
        self.ensure_register_data(reg)
            .record_use(virtual_register, instr_index);
    }

    /// Allocate `reg` to `virtual_register` for the operand at `loc` as a
    /// pending use: the operand becomes this register only if the register is
    /// eventually committed, and the vreg's spill operand otherwise.
    pub fn allocate_pending_use(
        &mut self,
        reg: RegisterIndex,
        virtual_register: VReg,
        loc: OperandLocation,
        instr_index: Inst,
        data: &mut MidTierAllocationData,
    ) {
        {
            let reg_data = self.ensure_register_data(reg);
            if !reg_data.is_allocated() {
                reg_data.virtual_register = virtual_register;
                reg_data.last_use_instr_index = instr_index;
            }
            debug_assert_eq!(reg_data.virtual_register, virtual_register);
            debug_assert!(reg_data.last_use_instr_index >= instr_index);
        }
        let next = self.reg_data(reg).pending_uses;
        let id = data.allocate_pending(loc, next);
        self.reg_data_mut(reg).pending_uses = id;
    }
}
