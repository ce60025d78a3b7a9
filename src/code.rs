/*
 * Released under the terms of the Apache 2.0 license with LLVM
 * exception. See `LICENSE` for details.
 */

//! The instruction sequence the allocator operates on: operands and their
//! placement policies, instructions with parallel gap moves, basic blocks in
//! reverse postorder, and a builder that derives the CFG side tables.

use core::fmt;

use fxhash::FxHashMap;
use smallvec::SmallVec;

use crate::indexset::IndexSet;
use crate::{domtree, Block, Inst, Representation, VReg};

define_index!(PendingOperandId);

/// Policy constraining where an unallocated operand may be placed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OperandPolicy {
    /// The general register with this code.
    FixedRegister(u8),
    /// The floating-point register with this code.
    FixedFpRegister(u8),
    /// This exact stack slot.
    FixedSlot(i32),
    /// Any stack slot.
    Slot,
    /// Any register.
    Register,
    /// Any register or stack slot.
    RegisterOrSlot,
    /// Any register or stack slot, or the value's own constant.
    RegisterOrSlotOrConstant,
    /// Outputs only: wherever the first input operand is placed.
    SameAsInput,
}

/// An operand awaiting allocation: a virtual register and a placement policy.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UnallocatedOperand {
    vreg: VReg,
    policy: OperandPolicy,
    used_at_start: bool,
}

impl UnallocatedOperand {
    pub fn new(policy: OperandPolicy, vreg: VReg) -> Self {
        Self {
            vreg,
            policy,
            used_at_start: false,
        }
    }

    /// An input operand whose register is only needed at the start of its
    /// instruction, freeing it for outputs of the same instruction.
    pub fn new_used_at_start(policy: OperandPolicy, vreg: VReg) -> Self {
        Self {
            vreg,
            policy,
            used_at_start: true,
        }
    }

    /// Copy of `other` bearing a different virtual register.
    pub fn with_vreg(other: UnallocatedOperand, vreg: VReg) -> Self {
        Self { vreg, ..other }
    }

    #[inline(always)]
    pub fn vreg(self) -> VReg {
        self.vreg
    }

    #[inline(always)]
    pub fn policy(self) -> OperandPolicy {
        self.policy
    }

    #[inline(always)]
    pub fn is_used_at_start(self) -> bool {
        self.used_at_start
    }

    #[inline(always)]
    pub fn has_fixed_register_policy(self) -> bool {
        matches!(
            self.policy,
            OperandPolicy::FixedRegister(_) | OperandPolicy::FixedFpRegister(_)
        )
    }

    /// The register code named by a fixed-register policy.
    pub fn fixed_register_code(self) -> u8 {
        match self.policy {
            OperandPolicy::FixedRegister(code) | OperandPolicy::FixedFpRegister(code) => code,
            _ => unreachable!("not a fixed register policy"),
        }
    }
}

/// An operand standing for the constant value registered for `vreg` on the
/// sequence.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ConstantOperand {
    vreg: VReg,
}

impl ConstantOperand {
    pub fn new(vreg: VReg) -> Self {
        Self { vreg }
    }

    #[inline(always)]
    pub fn vreg(self) -> VReg {
        self.vreg
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AllocatedKind {
    Register,
    StackSlot,
}

/// A fully-allocated operand: a physical register code or a frame slot, plus
/// the representation of the value stored there.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AllocatedOperand {
    kind: AllocatedKind,
    rep: Representation,
    index: i32,
}

impl AllocatedOperand {
    pub fn register(rep: Representation, code: i32) -> Self {
        Self {
            kind: AllocatedKind::Register,
            rep,
            index: code,
        }
    }

    pub fn stack_slot(rep: Representation, slot: i32) -> Self {
        Self {
            kind: AllocatedKind::StackSlot,
            rep,
            index: slot,
        }
    }

    #[inline(always)]
    pub fn kind(self) -> AllocatedKind {
        self.kind
    }

    #[inline(always)]
    pub fn is_register(self) -> bool {
        self.kind == AllocatedKind::Register
    }

    #[inline(always)]
    pub fn is_stack_slot(self) -> bool {
        self.kind == AllocatedKind::StackSlot
    }

    #[inline(always)]
    pub fn rep(self) -> Representation {
        self.rep
    }

    pub fn register_code(self) -> i32 {
        debug_assert!(self.is_register());
        self.index
    }

    pub fn slot_index(self) -> i32 {
        debug_assert!(self.is_stack_slot());
        self.index
    }
}

/// An operand slot in an instruction or gap move.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Operand {
    Unallocated(UnallocatedOperand),
    Constant(ConstantOperand),
    Allocated(AllocatedOperand),
    /// A placeholder whose final form (register vs. stack slot) is deferred;
    /// the id indexes the allocator's pending-operand arena, and the
    /// placeholder is overwritten when its owning chain is resolved.
    Pending(PendingOperandId),
}

impl Operand {
    #[inline(always)]
    pub fn is_unallocated(self) -> bool {
        matches!(self, Operand::Unallocated(_))
    }

    #[inline(always)]
    pub fn is_constant(self) -> bool {
        matches!(self, Operand::Constant(_))
    }

    #[inline(always)]
    pub fn is_allocated(self) -> bool {
        matches!(self, Operand::Allocated(_))
    }

    #[inline(always)]
    pub fn is_pending(self) -> bool {
        matches!(self, Operand::Pending(_))
    }

    #[inline(always)]
    pub fn as_unallocated(self) -> Option<UnallocatedOperand> {
        match self {
            Operand::Unallocated(op) => Some(op),
            _ => None,
        }
    }

    #[inline(always)]
    pub fn as_constant(self) -> Option<ConstantOperand> {
        match self {
            Operand::Constant(op) => Some(op),
            _ => None,
        }
    }

    #[inline(always)]
    pub fn as_allocated(self) -> Option<AllocatedOperand> {
        match self {
            Operand::Allocated(op) => Some(op),
            _ => None,
        }
    }
}

impl fmt::Display for AllocatedOperand {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.kind {
            AllocatedKind::Register => {
                if self.rep.is_floating_point() {
                    write!(f, "d{}", self.index)
                } else {
                    write!(f, "r{}", self.index)
                }
            }
            AllocatedKind::StackSlot => write!(f, "slot{}", self.index),
        }
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Operand::Unallocated(op) => write!(f, "{}:{:?}", op.vreg(), op.policy()),
            Operand::Constant(op) => write!(f, "const({})", op.vreg()),
            Operand::Allocated(op) => write!(f, "{}", op),
            Operand::Pending(id) => write!(f, "pending({})", id.0),
        }
    }
}

/// Gap positions within an instruction at which parallel moves execute.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GapPosition {
    Start = 0,
    End = 1,
}

/// One move within a parallel gap move.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MoveOperands {
    pub source: Operand,
    pub destination: Operand,
}

/// A set of moves executed atomically as a permutation, between instructions.
#[derive(Clone, Debug, Default)]
pub struct ParallelMove {
    moves: Vec<MoveOperands>,
}

impl ParallelMove {
    pub fn moves(&self) -> &[MoveOperands] {
        &self.moves
    }

    pub fn len(&self) -> usize {
        self.moves.len()
    }

    pub fn is_empty(&self) -> bool {
        self.moves.is_empty()
    }
}

/// The stack slots holding GC-traceable references at one safepoint.
#[derive(Clone, Debug, Default)]
pub struct ReferenceMap {
    reference_operands: Vec<AllocatedOperand>,
}

impl ReferenceMap {
    pub fn record_reference(&mut self, allocated: AllocatedOperand) {
        debug_assert!(allocated.is_stack_slot());
        self.reference_operands.push(allocated);
    }

    pub fn reference_operands(&self) -> &[AllocatedOperand] {
        &self.reference_operands
    }
}

/// A single instruction: outputs, temps, inputs, optional parallel moves at
/// the START and END gaps, clobber flags, and an optional reference map.
#[derive(Clone, Debug, Default)]
pub struct Instruction {
    outputs: SmallVec<[Operand; 1]>,
    inputs: SmallVec<[Operand; 4]>,
    temps: SmallVec<[Operand; 1]>,
    parallel_moves: [Option<ParallelMove>; 2],
    reference_map: Option<ReferenceMap>,
    clobbers_registers: bool,
    clobbers_double_registers: bool,
}

impl Instruction {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_output(mut self, op: Operand) -> Self {
        self.outputs.push(op);
        self
    }

    pub fn with_input(mut self, op: Operand) -> Self {
        self.inputs.push(op);
        self
    }

    pub fn with_temp(mut self, op: Operand) -> Self {
        self.temps.push(op);
        self
    }

    /// Mark the instruction as clobbering every register of `kind`.
    pub fn with_clobbers(mut self, kind: crate::RegisterKind) -> Self {
        match kind {
            crate::RegisterKind::General => self.clobbers_registers = true,
            crate::RegisterKind::Double => self.clobbers_double_registers = true,
        }
        self
    }

    /// Mark the instruction as a safepoint that needs a reference map.
    pub fn with_reference_map(mut self) -> Self {
        self.reference_map = Some(ReferenceMap::default());
        self
    }

    pub fn output_count(&self) -> usize {
        self.outputs.len()
    }

    pub fn output(&self, i: usize) -> Operand {
        self.outputs[i]
    }

    pub fn input_count(&self) -> usize {
        self.inputs.len()
    }

    pub fn input(&self, i: usize) -> Operand {
        self.inputs[i]
    }

    pub fn temp_count(&self) -> usize {
        self.temps.len()
    }

    pub fn temp(&self, i: usize) -> Operand {
        self.temps[i]
    }

    pub fn parallel_move(&self, pos: GapPosition) -> Option<&ParallelMove> {
        self.parallel_moves[pos as usize].as_ref()
    }

    fn get_or_create_parallel_move(&mut self, pos: GapPosition) -> &mut ParallelMove {
        self.parallel_moves[pos as usize].get_or_insert_with(ParallelMove::default)
    }

    pub fn has_reference_map(&self) -> bool {
        self.reference_map.is_some()
    }

    pub fn reference_map(&self) -> Option<&ReferenceMap> {
        self.reference_map.as_ref()
    }

    pub(crate) fn reference_map_mut(&mut self) -> &mut ReferenceMap {
        self.reference_map.as_mut().unwrap()
    }

    pub fn clobbers_registers(&self) -> bool {
        self.clobbers_registers
    }

    pub fn clobbers_double_registers(&self) -> bool {
        self.clobbers_double_registers
    }
}

/// Identifies one operand cell within an instruction, so rewrites and pending
/// chains can address operands without holding references into the sequence.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct OperandLocation {
    pub instr: Inst,
    pub cell: OperandCell,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum OperandCell {
    Output(u16),
    Input(u16),
    Temp(u16),
    MoveSource(GapPosition, u16),
    MoveDestination(GapPosition, u16),
}

/// A phi definition at a block entry: the defined vreg and the incoming vreg
/// from each predecessor, in predecessor order.
#[derive(Clone, Debug)]
pub struct PhiInstruction {
    vreg: VReg,
    inputs: SmallVec<[VReg; 2]>,
}

impl PhiInstruction {
    pub fn vreg(&self) -> VReg {
        self.vreg
    }

    pub fn inputs(&self) -> &[VReg] {
        &self.inputs
    }
}

/// A basic block: a contiguous, non-empty run of instructions, CFG edges, a
/// dominator link, and loop metadata. The block's index is its RPO number.
#[derive(Clone, Debug)]
pub struct InstructionBlock {
    first_instr: Inst,
    last_instr: Inst,
    predecessors: SmallVec<[Block; 2]>,
    successors: SmallVec<[Block; 2]>,
    dominator: Block,
    phis: Vec<PhiInstruction>,
    /// For loop headers, the block one past the last block of the loop body.
    loop_end: Option<Block>,
}

impl InstructionBlock {
    pub fn first_instruction_index(&self) -> Inst {
        self.first_instr
    }

    pub fn last_instruction_index(&self) -> Inst {
        self.last_instr
    }

    pub fn predecessors(&self) -> &[Block] {
        &self.predecessors
    }

    pub fn successors(&self) -> &[Block] {
        &self.successors
    }

    /// Immediate dominator; invalid for the entry block.
    pub fn dominator(&self) -> Block {
        self.dominator
    }

    pub fn phis(&self) -> &[PhiInstruction] {
        &self.phis
    }

    pub fn is_loop_header(&self) -> bool {
        self.loop_end.is_some()
    }

    pub fn loop_end(&self) -> Block {
        self.loop_end.unwrap()
    }
}

/// The unit of allocation: blocks in reverse postorder over a flat
/// instruction vector, plus per-vreg side tables.
#[derive(Clone, Debug)]
pub struct InstructionSequence {
    instructions: Vec<Instruction>,
    blocks: Vec<InstructionBlock>,
    instr_block: Vec<Block>,
    representations: Vec<Representation>,
    constants: FxHashMap<VReg, i64>,
    references: IndexSet,
}

impl InstructionSequence {
    pub fn instruction_count(&self) -> usize {
        self.instructions.len()
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    pub fn virtual_register_count(&self) -> usize {
        self.representations.len()
    }

    pub fn block(&self, block: Block) -> &InstructionBlock {
        &self.blocks[block.index()]
    }

    /// The block containing instruction `instr`.
    pub fn instr_block(&self, instr: Inst) -> Block {
        self.instr_block[instr.index()]
    }

    pub fn instruction(&self, instr: Inst) -> &Instruction {
        &self.instructions[instr.index()]
    }

    pub(crate) fn instruction_mut(&mut self, instr: Inst) -> &mut Instruction {
        &mut self.instructions[instr.index()]
    }

    pub fn representation_for(&self, vreg: VReg) -> Representation {
        if vreg.is_invalid() {
            Representation::default()
        } else {
            self.representations[vreg.index()]
        }
    }

    pub fn is_reference(&self, vreg: VReg) -> bool {
        self.references.contains(vreg.index())
    }

    pub fn constant(&self, vreg: VReg) -> i64 {
        self.constants[&vreg]
    }

    pub(crate) fn operand(&self, loc: OperandLocation) -> Operand {
        let instr = &self.instructions[loc.instr.index()];
        match loc.cell {
            OperandCell::Output(i) => instr.outputs[i as usize],
            OperandCell::Input(i) => instr.inputs[i as usize],
            OperandCell::Temp(i) => instr.temps[i as usize],
            OperandCell::MoveSource(pos, i) => {
                instr.parallel_moves[pos as usize].as_ref().unwrap().moves[i as usize].source
            }
            OperandCell::MoveDestination(pos, i) => {
                instr.parallel_moves[pos as usize].as_ref().unwrap().moves[i as usize].destination
            }
        }
    }

    pub(crate) fn set_operand(&mut self, loc: OperandLocation, op: Operand) {
        let instr = &mut self.instructions[loc.instr.index()];
        let cell = match loc.cell {
            OperandCell::Output(i) => &mut instr.outputs[i as usize],
            OperandCell::Input(i) => &mut instr.inputs[i as usize],
            OperandCell::Temp(i) => &mut instr.temps[i as usize],
            OperandCell::MoveSource(pos, i) => {
                &mut instr.parallel_moves[pos as usize].as_mut().unwrap().moves[i as usize].source
            }
            OperandCell::MoveDestination(pos, i) => {
                &mut instr.parallel_moves[pos as usize].as_mut().unwrap().moves[i as usize]
                    .destination
            }
        };
        *cell = op;
    }

    /// Append a move to the parallel move of `instr` at `pos`, returning the
    /// move's index within it.
    pub(crate) fn add_gap_move(
        &mut self,
        instr: Inst,
        pos: GapPosition,
        from: Operand,
        to: Operand,
    ) -> usize {
        let moves = self.instructions[instr.index()].get_or_create_parallel_move(pos);
        moves.moves.push(MoveOperands {
            source: from,
            destination: to,
        });
        moves.moves.len() - 1
    }
}

/// Builds a well-formed [`InstructionSequence`]: blocks are appended in RPO,
/// and `finish` derives predecessor lists, the instruction-to-block map, and
/// dominator links.
#[derive(Debug, Default)]
pub struct InstructionSequenceBuilder {
    instructions: Vec<Instruction>,
    blocks: Vec<InstructionBlock>,
    representations: Vec<Representation>,
    constants: FxHashMap<VReg, i64>,
    references: IndexSet,
    current_block: Option<usize>,
}

impl InstructionSequenceBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn new_virtual_register(&mut self, rep: Representation) -> VReg {
        let vreg = VReg::new(self.representations.len());
        self.representations.push(rep);
        vreg
    }

    /// Register `vreg` as a constant with the given value. Its defining
    /// instruction must use a [`ConstantOperand`] output.
    pub fn set_constant(&mut self, vreg: VReg, value: i64) {
        self.constants.insert(vreg, value);
    }

    /// Mark `vreg` as holding a GC-traceable reference.
    pub fn mark_reference(&mut self, vreg: VReg) {
        debug_assert_eq!(self.representations[vreg.index()], Representation::Tagged);
        self.references.add(vreg.index());
    }

    pub fn begin_block(&mut self) -> Block {
        assert!(self.current_block.is_none(), "previous block still open");
        let block = Block::new(self.blocks.len());
        self.current_block = Some(block.index());
        self.blocks.push(InstructionBlock {
            first_instr: Inst::new(self.instructions.len()),
            last_instr: Inst::invalid(),
            predecessors: SmallVec::new(),
            successors: SmallVec::new(),
            dominator: Block::invalid(),
            phis: Vec::new(),
            loop_end: None,
        });
        block
    }

    /// Close the current block. Successors may name blocks not yet built.
    pub fn end_block(&mut self, successors: &[Block]) {
        let block = self.current_block.take().expect("no open block");
        assert!(
            self.instructions.len() > self.blocks[block].first_instr.index(),
            "blocks must be non-empty"
        );
        self.blocks[block].last_instr = Inst::new(self.instructions.len() - 1);
        self.blocks[block].successors = successors.iter().copied().collect();
    }

    /// Mark `block` as a loop header whose body runs through `loop_end - 1`.
    pub fn mark_loop_header(&mut self, block: Block, loop_end: Block) {
        debug_assert!(loop_end.index() > block.index());
        self.blocks[block.index()].loop_end = Some(loop_end);
    }

    pub fn add_instruction(&mut self, instr: Instruction) -> Inst {
        assert!(self.current_block.is_some(), "no open block");
        debug_assert!(instr.outputs.len() <= u16::MAX as usize);
        debug_assert!(instr.inputs.len() <= u16::MAX as usize);
        let index = Inst::new(self.instructions.len());
        self.instructions.push(instr);
        index
    }

    /// Add a phi to the current block. `inputs` are the incoming vregs, one
    /// per predecessor in predecessor order.
    pub fn add_phi(&mut self, vreg: VReg, inputs: &[VReg]) {
        let block = self.current_block.expect("no open block");
        self.blocks[block].phis.push(PhiInstruction {
            vreg,
            inputs: inputs.iter().copied().collect(),
        });
    }

    pub fn finish(self) -> InstructionSequence {
        assert!(self.current_block.is_none(), "block left open");
        let mut blocks = self.blocks;
        let num_blocks = blocks.len();

        // Derive predecessor lists from the successor edges.
        let mut predecessors: Vec<SmallVec<[Block; 2]>> =
            (0..num_blocks).map(|_| SmallVec::new()).collect();
        for (index, block) in blocks.iter().enumerate() {
            for &succ in &block.successors {
                assert!(succ.index() < num_blocks, "successor out of range");
                predecessors[succ.index()].push(Block::new(index));
            }
        }

        let idom = {
            let predecessors = &predecessors;
            domtree::calculate(num_blocks, |b| &predecessors[b.index()][..])
        };
        // Every block must be reachable from the entry.
        debug_assert!((1..num_blocks).all(|i| domtree::dominates(&idom, Block::new(0), Block::new(i))));

        for (index, block) in blocks.iter_mut().enumerate() {
            block.predecessors = core::mem::take(&mut predecessors[index]);
            block.dominator = idom[index];
            debug_assert!(
                block
                    .phis
                    .iter()
                    .all(|p| p.inputs.len() == block.predecessors.len()),
                "phi input count must match predecessor count"
            );
        }

        // Blocks must tile the instruction vector in order.
        let mut instr_block = vec![Block::invalid(); self.instructions.len()];
        let mut next_instr = 0;
        for (index, block) in blocks.iter().enumerate() {
            assert_eq!(block.first_instr.index(), next_instr);
            for i in block.first_instr.index()..=block.last_instr.index() {
                instr_block[i] = Block::new(index);
            }
            next_instr = block.last_instr.index() + 1;
        }
        assert_eq!(next_instr, self.instructions.len());

        InstructionSequence {
            instructions: self.instructions,
            blocks,
            instr_block,
            representations: self.representations,
            constants: self.constants,
            references: self.references,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_builder_links_cfg() {
        let mut b = InstructionSequenceBuilder::new();
        let v0 = b.new_virtual_register(Representation::Word64);

        let b0 = b.begin_block();
        b.add_instruction(
            Instruction::new().with_output(Operand::Unallocated(UnallocatedOperand::new(
                OperandPolicy::Register,
                v0,
            ))),
        );
        b.end_block(&[Block::new(1), Block::new(2)]);

        let b1 = b.begin_block();
        b.add_instruction(Instruction::new());
        b.end_block(&[Block::new(3)]);

        let b2 = b.begin_block();
        b.add_instruction(Instruction::new());
        b.end_block(&[Block::new(3)]);

        let b3 = b.begin_block();
        b.add_instruction(Instruction::new());
        b.end_block(&[]);

        let seq = b.finish();
        assert_eq!(seq.block_count(), 4);
        assert_eq!(seq.block(b1).predecessors(), &[b0]);
        assert_eq!(seq.block(b3).predecessors(), &[b1, b2]);
        assert_eq!(seq.block(b1).dominator(), b0);
        assert_eq!(seq.block(b3).dominator(), b0);
        assert_eq!(seq.instr_block(Inst::new(3)), b3);
        assert_eq!(seq.virtual_register_count(), 1);
    }
}
