/*
 * Released under the terms of the Apache 2.0 license with LLVM
 * exception. See `LICENSE` for details.
 */

//! Per-virtual-register data: how each vreg is defined, its spill operand
//! (concrete or pending), and the instruction range its spill slot must stay
//! live over.

use smallvec::SmallVec;

use crate::code::{
    AllocatedOperand, ConstantOperand, GapPosition, Operand, OperandCell, OperandLocation,
    PendingOperandId,
};
use crate::{Block, Inst, VReg};

use super::MidTierAllocationData;

/// An inclusive `[start, end]` range of instruction indices. Only widens;
/// there is no empty state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Range {
    start: Inst,
    end: Inst,
}

impl Range {
    pub fn new(start: Inst, end: Inst) -> Self {
        debug_assert!(start <= end);
        Self { start, end }
    }

    pub fn add_instr(&mut self, index: Inst) {
        self.start = self.start.min(index);
        self.end = self.end.max(index);
    }

    pub fn add_range(&mut self, other: Range) {
        self.start = self.start.min(other.start);
        self.end = self.end.max(other.end);
    }

    pub fn contains(&self, index: Inst) -> bool {
        index >= self.start && index <= self.end
    }

    pub fn start(&self) -> Inst {
        self.start
    }

    pub fn end(&self) -> Inst {
        self.end
    }
}

/// The range of instructions for which a virtual register needs to be kept
/// on the stack, bounded to the blocks dominated by its defining block.
#[derive(Clone, Copy, Debug)]
pub(crate) struct SpillRange {
    live_range: Range,
    defined_in: Block,
}

impl SpillRange {
    fn new(live_range: Range, defined_in: Block) -> Self {
        Self {
            live_range,
            defined_in,
        }
    }

    pub fn live_range(&self) -> Range {
        self.live_range
    }

    /// The block whose dominated set bounds this range.
    pub fn defined_in(&self) -> Block {
        self.defined_in
    }

    pub fn extend_range_to(&mut self, instr_index: Inst) {
        self.live_range.add_instr(instr_index);
    }
}

/// What stands in for a virtual register's value on the stack.
#[derive(Clone, Copy, Debug)]
pub(crate) enum SpillOperand {
    /// A concrete stack slot.
    Allocated(AllocatedOperand),
    /// The vreg's constant, usable anywhere a slot could be.
    Constant(ConstantOperand),
    /// Head of the chain of placeholders awaiting a slot.
    Pending(PendingOperandId),
}

/// Data for one virtual register.
#[derive(Clone, Debug)]
pub(crate) struct VirtualRegisterData {
    output_instr_index: Inst,
    is_phi: bool,
    is_constant: bool,
    spill_operand: Option<SpillOperand>,
    spill_range: Option<SpillRange>,
}

impl Default for VirtualRegisterData {
    fn default() -> Self {
        Self {
            output_instr_index: Inst::invalid(),
            is_phi: false,
            is_constant: false,
            spill_operand: None,
            spill_range: None,
        }
    }
}

impl VirtualRegisterData {
    fn initialize(
        spill_operand: Option<SpillOperand>,
        instr_index: Inst,
        is_phi: bool,
        is_constant: bool,
    ) -> Self {
        Self {
            output_instr_index: instr_index,
            is_phi,
            is_constant,
            spill_operand,
            spill_range: None,
        }
    }

    /// The instruction that defines this vreg; for phis, the first
    /// instruction of the phi's block.
    pub fn output_instr_index(&self) -> Inst {
        self.output_instr_index
    }

    pub fn is_phi(&self) -> bool {
        self.is_phi
    }

    pub fn is_constant(&self) -> bool {
        self.is_constant
    }

    pub fn has_spill_operand(&self) -> bool {
        self.spill_operand.is_some()
    }

    pub fn spill_operand(&self) -> Option<SpillOperand> {
        self.spill_operand
    }

    pub fn has_pending_spill_operand(&self) -> bool {
        matches!(self.spill_operand, Some(SpillOperand::Pending(_)))
    }

    /// The spill operand in its final form, if already known.
    pub fn allocated_or_constant_spill_operand(&self) -> Option<Operand> {
        match self.spill_operand {
            Some(SpillOperand::Allocated(allocated)) => Some(Operand::Allocated(allocated)),
            Some(SpillOperand::Constant(constant)) => Some(Operand::Constant(constant)),
            _ => None,
        }
    }

    /// True if defining this vreg must also store it to its spill location.
    pub fn needs_spill_at_output(&self) -> bool {
        self.has_spill_operand() && !self.is_constant()
    }

    pub fn has_spill_range(&self) -> bool {
        self.spill_range.is_some()
    }

    pub fn spill_range(&self) -> &SpillRange {
        self.spill_range.as_ref().unwrap()
    }

    pub fn spill_range_mut(&mut self) -> &mut SpillRange {
        self.spill_range.as_mut().unwrap()
    }

    fn set_pending_spill_head(&mut self, id: PendingOperandId) {
        self.spill_operand = Some(SpillOperand::Pending(id));
    }
}

impl<'a> MidTierAllocationData<'a> {
    /// Define `vreg` as produced by the constant output of `instr_index`.
    pub fn define_as_constant(&mut self, vreg: VReg, instr_index: Inst) {
        self.virtual_register_data[vreg.index()] = VirtualRegisterData::initialize(
            Some(SpillOperand::Constant(ConstantOperand::new(vreg))),
            instr_index,
            false,
            true,
        );
    }

    /// Define `vreg` as output into a fixed stack slot at `instr_index`.
    pub fn define_as_fixed_spill(&mut self, vreg: VReg, slot: AllocatedOperand, instr_index: Inst) {
        debug_assert!(slot.is_stack_slot());
        self.virtual_register_data[vreg.index()] = VirtualRegisterData::initialize(
            Some(SpillOperand::Allocated(slot)),
            instr_index,
            false,
            false,
        );
    }

    /// Define `vreg` as the unconstrained output of `instr_index`.
    pub fn define_as_unallocated(&mut self, vreg: VReg, instr_index: Inst) {
        self.virtual_register_data[vreg.index()] =
            VirtualRegisterData::initialize(None, instr_index, false, false);
    }

    /// Define `vreg` as a phi of the block whose first instruction is
    /// `instr_index`.
    pub fn define_as_phi(&mut self, vreg: VReg, instr_index: Inst) {
        self.virtual_register_data[vreg.index()] =
            VirtualRegisterData::initialize(None, instr_index, true, false);
    }

    fn ensure_spill_range(&mut self, vreg: VReg) {
        debug_assert!(!self.vreg_data(vreg).is_constant());
        if self.vreg_data(vreg).has_spill_range() {
            return;
        }

        let (is_phi, output_index) = {
            let data = self.vreg_data(vreg);
            (data.is_phi(), data.output_instr_index())
        };

        let spill_range = if is_phi {
            // A phi's slot is read at its block's entry and written in the
            // gap before each predecessor's last instruction.
            let phi_block = self.code.instr_block(output_index);
            let first = self.code.block(phi_block).first_instruction_index();
            let mut live_range = Range::new(first, first);
            for &pred in self.code.block(phi_block).predecessors() {
                live_range.add_instr(self.code.block(pred).last_instruction_index());
            }
            SpillRange::new(live_range, phi_block)
        } else {
            // The slot is defined in the gap after the defining instruction.
            let def = output_index.next();
            let block = self.code.instr_block(def);
            SpillRange::new(Range::new(def, def), block)
        };

        trace!("{} spill range starts {:?}", vreg, spill_range.live_range());
        self.virtual_register_data[vreg.index()].spill_range = Some(spill_range);
        self.spilled_virtual_registers.add(vreg.index());
    }

    /// Note a use of `vreg`'s spill location at `instr_index`.
    fn add_spill_use(&mut self, vreg: VReg, instr_index: Inst) {
        if self.vreg_data(vreg).is_constant() {
            return;
        }
        self.ensure_spill_range(vreg);
        self.virtual_register_data[vreg.index()]
            .spill_range_mut()
            .extend_range_to(instr_index);
    }

    /// Replace the operand at `loc` with `vreg`'s spill operand: the concrete
    /// operand when known, otherwise a fresh pending placeholder chained on
    /// the vreg.
    pub fn spill_operand(&mut self, vreg: VReg, loc: OperandLocation, instr_index: Inst) {
        trace!("spill {} use at {}", vreg, instr_index);
        self.add_spill_use(vreg, instr_index);
        if let Some(op) = self.vreg_data(vreg).allocated_or_constant_spill_operand() {
            self.set_operand_at(loc, op);
        } else {
            self.add_pending_spill_operand(vreg, loc);
        }
    }

    /// Like `spill_operand`, but for a placeholder that already exists: it is
    /// relinked from its old chain onto `vreg`'s pending-spill chain.
    pub fn spill_pending_use(&mut self, vreg: VReg, id: PendingOperandId, instr_index: Inst) {
        self.add_spill_use(vreg, instr_index);
        if let Some(op) = self.vreg_data(vreg).allocated_or_constant_spill_operand() {
            let loc = self.pending_operands.location(id);
            self.code.set_operand(loc, op);
        } else {
            let next = self.pending_spill_head(vreg);
            self.pending_operands.set_next(id, next);
            self.virtual_register_data[vreg.index()].set_pending_spill_head(id);
            debug_assert!(
                matches!(self.code.operand(self.pending_operands.location(id)),
                    Operand::Pending(p) if p == id)
            );
        }
    }

    fn pending_spill_head(&self, vreg: VReg) -> PendingOperandId {
        match self.vreg_data(vreg).spill_operand() {
            None => PendingOperandId::invalid(),
            Some(SpillOperand::Pending(head)) => head,
            Some(_) => unreachable!("spill operand already concrete"),
        }
    }

    fn add_pending_spill_operand(&mut self, vreg: VReg, loc: OperandLocation) {
        debug_assert!(self.vreg_data(vreg).has_spill_range());
        let next = self.pending_spill_head(vreg);
        let id = self.allocate_pending(loc, next);
        self.virtual_register_data[vreg.index()].set_pending_spill_head(id);
    }

    /// Emit a gap move at the end of `instr_index` bringing `vreg`'s spill
    /// operand into `to`.
    pub fn emit_gap_move_to_input_from_spill_slot(
        &mut self,
        vreg: VReg,
        to: AllocatedOperand,
        instr_index: Inst,
    ) {
        self.add_spill_use(vreg, instr_index);
        if let Some(op) = self.vreg_data(vreg).allocated_or_constant_spill_operand() {
            self.add_gap_move(instr_index, GapPosition::End, op, Operand::Allocated(to));
        } else {
            let index = self.add_gap_move(
                instr_index,
                GapPosition::End,
                Operand::Pending(PendingOperandId::invalid()),
                Operand::Allocated(to),
            );
            let loc = OperandLocation {
                instr: instr_index,
                cell: OperandCell::MoveSource(GapPosition::End, index as u16),
            };
            self.add_pending_spill_operand(vreg, loc);
        }
    }

    /// Emit a gap move at the start of `instr_index` storing `from` into
    /// `vreg`'s spill operand.
    pub fn emit_gap_move_to_spill_slot(
        &mut self,
        vreg: VReg,
        from: AllocatedOperand,
        instr_index: Inst,
    ) {
        self.add_spill_use(vreg, instr_index);
        if let Some(op) = self.vreg_data(vreg).allocated_or_constant_spill_operand() {
            self.add_gap_move(instr_index, GapPosition::Start, Operand::Allocated(from), op);
        } else {
            let index = self.add_gap_move(
                instr_index,
                GapPosition::Start,
                Operand::Allocated(from),
                Operand::Pending(PendingOperandId::invalid()),
            );
            let loc = OperandLocation {
                instr: instr_index,
                cell: OperandCell::MoveDestination(GapPosition::Start, index as u16),
            };
            self.add_pending_spill_operand(vreg, loc);
        }
    }

    /// Store the output `from` of `instr_index` to `vreg`'s spill operand: in
    /// the gap before the next instruction, or, for a block-ending
    /// instruction, at the start of every successor.
    pub fn emit_gap_move_from_output_to_spill_slot(
        &mut self,
        vreg: VReg,
        from: AllocatedOperand,
        current_block: Block,
        instr_index: Inst,
    ) {
        debug_assert_eq!(self.code.instr_block(instr_index), current_block);
        if instr_index == self.code.block(current_block).last_instruction_index() {
            let successors: SmallVec<[Block; 2]> = self
                .code
                .block(current_block)
                .successors()
                .iter()
                .copied()
                .collect();
            for succ in successors {
                debug_assert_eq!(self.code.block(succ).predecessors().len(), 1);
                let first = self.code.block(succ).first_instruction_index();
                self.emit_gap_move_to_spill_slot(vreg, from, first);
            }
        } else {
            self.emit_gap_move_to_spill_slot(vreg, from, instr_index.next());
        }
    }

    /// Resolve `vreg`'s pending-spill chain to the now-known `allocated`
    /// stack slot.
    pub fn allocate_pending_spill_operand(&mut self, vreg: VReg, allocated: AllocatedOperand) {
        trace!("resolve pending spills of {} to {}", vreg, allocated);
        let mut current = match self.vreg_data(vreg).spill_operand() {
            Some(SpillOperand::Pending(head)) => head,
            _ => unreachable!("no pending spill operands"),
        };
        while current.is_valid() {
            current = self.resolve_pending(current, Operand::Allocated(allocated));
        }
        self.virtual_register_data[vreg.index()].spill_operand =
            Some(SpillOperand::Allocated(allocated));
    }
}
