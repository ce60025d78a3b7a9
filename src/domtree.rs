/*
 * Released under the terms of the Apache 2.0 license with LLVM
 * exception. See `LICENSE` for details.
 */

// This is an implementation of the algorithm described in
//
//   A Simple, Fast Dominance Algorithm
//   Keith D. Cooper, Timothy J. Harvey, and Ken Kennedy
//   Department of Computer Science, Rice University, Houston, Texas, USA
//   TR-06-33870
//   https://www.cs.rice.edu/~keith/EMBED/dom.pdf
//
// Blocks are required to already be numbered in reverse postorder, so a
// block's number doubles as its RPO position.

use crate::Block;

fn merge_sets(idom: &[Block], mut node1: Block, mut node2: Block) -> Block {
    while node1 != node2 {
        if node1.is_invalid() || node2.is_invalid() {
            return Block::invalid();
        }
        if node1.index() > node2.index() {
            node1 = idom[node1.index()];
        } else {
            node2 = idom[node2.index()];
        }
    }
    debug_assert!(node1 == node2);
    node1
}

/// Compute immediate-dominator links for blocks in RPO order. Block 0 is the
/// entry; its returned parent is `Block::invalid()`.
pub fn calculate<'a, PredFn: Fn(Block) -> &'a [Block]>(
    num_blocks: usize,
    preds: PredFn,
) -> Vec<Block> {
    let mut idom = vec![Block::invalid(); num_blocks];
    if num_blocks == 0 {
        return idom;
    }

    // The entry node must have itself as a parent while iterating.
    idom[0] = Block::new(0);

    let mut changed = true;
    while changed {
        changed = false;
        for node in 1..num_blocks {
            let node = Block::new(node);

            // Pick any already-visited predecessor as the starting parent; a
            // forward edge always provides one.
            let mut parent = Block::invalid();
            for &pred in preds(node).iter() {
                if pred.index() < node.index() {
                    parent = pred;
                    break;
                }
            }

            if parent.is_valid() {
                for &pred in preds(node).iter() {
                    if pred == parent {
                        continue;
                    }
                    if idom[pred.index()].is_invalid() {
                        continue;
                    }
                    parent = merge_sets(&idom, parent, pred);
                }
            }

            if parent.is_valid() && parent != idom[node.index()] {
                idom[node.index()] = parent;
                changed = true;
            }
        }
    }

    // Reset the entry node's parent to "invalid"; this allows the loop in
    // `dominates` to terminate.
    idom[0] = Block::invalid();

    idom
}

pub fn dominates(idom: &[Block], a: Block, mut b: Block) -> bool {
    loop {
        if a == b {
            return true;
        }
        if b.is_invalid() {
            return false;
        }
        b = idom[b.index()];
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn calc(preds: &[&[usize]]) -> Vec<Block> {
        let preds: Vec<Vec<Block>> = preds
            .iter()
            .map(|ps| ps.iter().map(|&p| Block::new(p)).collect())
            .collect();
        let preds_ref = &preds;
        calculate(preds.len(), |b| &preds_ref[b.index()][..])
    }

    #[test]
    fn test_diamond() {
        // 0 -> {1, 2} -> 3
        let idom = calc(&[&[], &[0], &[0], &[1, 2]]);
        assert_eq!(idom[1], Block::new(0));
        assert_eq!(idom[2], Block::new(0));
        assert_eq!(idom[3], Block::new(0));
        assert!(dominates(&idom, Block::new(0), Block::new(3)));
        assert!(!dominates(&idom, Block::new(1), Block::new(3)));
    }

    #[test]
    fn test_loop() {
        // 0 -> 1 (header) -> 2 -> 1 backedge, 1 -> 3
        let idom = calc(&[&[], &[0, 2], &[1], &[1]]);
        assert_eq!(idom[1], Block::new(0));
        assert_eq!(idom[2], Block::new(1));
        assert_eq!(idom[3], Block::new(1));
        assert!(dominates(&idom, Block::new(1), Block::new(2)));
        assert!(dominates(&idom, Block::new(1), Block::new(3)));
    }
}
