/*
 * Released under the terms of the Apache 2.0 license with LLVM
 * exception. See `LICENSE` for details.
 */

//! Reference-map population: record, for each safepoint, the stack slots
//! holding GC-traceable references at that instruction.

use smallvec::SmallVec;

use crate::{Inst, VReg};

use super::vreg::SpillOperand;
use super::MidTierAllocationData;

/// For every spilled reference vreg, record its slot on each safepoint its
/// spill range covers.
pub(crate) fn populate_reference_maps(data: &mut MidTierAllocationData) {
    let spilled: SmallVec<[usize; 8]> = data.spilled_virtual_registers().iter().collect();
    for vreg in spilled {
        record_references(data, VReg::new(vreg));
    }
}

fn record_references(data: &mut MidTierAllocationData, virtual_register: VReg) {
    let allocated = match data.vreg_data(virtual_register).spill_operand() {
        Some(SpillOperand::Allocated(allocated)) => allocated,
        _ => return,
    };
    if !data.code().is_reference(virtual_register) {
        return;
    }

    let live_range = data.vreg_data(virtual_register).spill_range().live_range();
    let safepoints: SmallVec<[Inst; 8]> =
        data.reference_map_instructions().iter().copied().collect();
    for instr_index in safepoints {
        if instr_index < live_range.start() || instr_index > live_range.end() {
            continue;
        }
        let block = data.code().instr_block(instr_index);
        if data.spill_range_is_live_at(virtual_register, instr_index, block) {
            trace!(
                "{} live in {} across safepoint {}",
                virtual_register,
                allocated,
                instr_index
            );
            debug_assert!(data.code().instruction(instr_index).has_reference_map());
            data.code_mut()
                .instruction_mut(instr_index)
                .reference_map_mut()
                .record_reference(allocated);
        }
    }
}
