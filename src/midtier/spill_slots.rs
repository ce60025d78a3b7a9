/*
 * Released under the terms of the Apache 2.0 license with LLVM
 * exception. See `LICENSE` for details.
 */

//! Spill-slot assignment: a linear sweep over spill live ranges, reusing
//! freed slots of the same byte width.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use crate::code::AllocatedOperand;
use crate::{Inst, Representation, VReg};

use super::vreg::Range;
use super::MidTierAllocationData;

/// A frame slot together with the union of live ranges it has held.
#[derive(Debug)]
struct SpillSlot {
    stack_slot: i32,
    byte_width: u32,
    range: Option<Range>,
}

impl SpillSlot {
    fn new(stack_slot: i32, byte_width: u32) -> Self {
        Self {
            stack_slot,
            byte_width,
            range: None,
        }
    }

    fn add_range(&mut self, range: Range) {
        match &mut self.range {
            Some(existing) => existing.add_range(range),
            None => self.range = Some(range),
        }
    }

    fn last_use(&self) -> Inst {
        self.range.as_ref().unwrap().end()
    }

    fn to_operand(&self, rep: Representation) -> AllocatedOperand {
        AllocatedOperand::stack_slot(rep, self.stack_slot)
    }
}

/// Min-heap adapter: the queue surfaces the slot whose last use is earliest.
struct OrderByLastUse(SpillSlot);

impl PartialEq for OrderByLastUse {
    fn eq(&self, other: &Self) -> bool {
        self.0.last_use() == other.0.last_use()
    }
}

impl Eq for OrderByLastUse {}

impl PartialOrd for OrderByLastUse {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for OrderByLastUse {
    fn cmp(&self, other: &Self) -> Ordering {
        other.0.last_use().cmp(&self.0.last_use())
    }
}

struct SpillSlotAllocator {
    allocated_slots: BinaryHeap<OrderByLastUse>,
    free_slots: Vec<SpillSlot>,
    position: Inst,
}

impl SpillSlotAllocator {
    fn new() -> Self {
        Self {
            allocated_slots: BinaryHeap::new(),
            free_slots: Vec::new(),
            position: Inst::new(0),
        }
    }

    /// Move slots whose values died before `instr_index` to the free list.
    fn advance_to(&mut self, instr_index: Inst) {
        debug_assert!(self.position <= instr_index);
        while let Some(top) = self.allocated_slots.peek() {
            if instr_index > top.0.last_use() {
                let slot = self.allocated_slots.pop().unwrap().0;
                self.free_slots.push(slot);
            } else {
                break;
            }
        }
        self.position = instr_index;
    }

    fn get_free_slot(&mut self, byte_width: u32) -> Option<SpillSlot> {
        self.free_slots
            .iter()
            .position(|slot| slot.byte_width == byte_width)
            .map(|index| self.free_slots.remove(index))
    }

    fn allocate(&mut self, data: &mut MidTierAllocationData, virtual_register: VReg) {
        debug_assert!(data.vreg_data(virtual_register).has_pending_spill_operand());
        let rep = data.code().representation_for(virtual_register);
        let byte_width = rep.byte_width();
        let live_range = data.vreg_data(virtual_register).spill_range().live_range();

        self.advance_to(live_range.start());

        // Reuse a freed slot of the same width, else take a new one from the
        // frame.
        let mut slot = match self.get_free_slot(byte_width) {
            Some(slot) => slot,
            None => SpillSlot::new(data.frame_mut().allocate_spill_slot(byte_width), byte_width),
        };
        trace!(
            "{} -> spill slot {} for {:?}",
            virtual_register,
            slot.stack_slot,
            live_range
        );

        slot.add_range(live_range);
        data.allocate_pending_spill_operand(virtual_register, slot.to_operand(rep));
        self.allocated_slots.push(OrderByLastUse(slot));
    }
}

/// Assign a stack slot to every virtual register with a pending spill
/// operand, and resolve the pending chains.
pub(crate) fn allocate_spill_slots(data: &mut MidTierAllocationData) {
    let mut spilled: Vec<VReg> = data
        .spilled_virtual_registers()
        .iter()
        .map(VReg::new)
        .filter(|&vreg| data.vreg_data(vreg).has_pending_spill_operand())
        .collect();

    // Sort by first use so slots can be swept linearly.
    spilled.sort_unstable_by_key(|&vreg| {
        (
            data.vreg_data(vreg).spill_range().live_range().start(),
            vreg,
        )
    });

    let mut allocator = SpillSlotAllocator::new();
    for vreg in spilled {
        allocator.allocate(data, vreg);
    }
}
