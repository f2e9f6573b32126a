//! Layout and expansion of one batch of [`PARALLEL_TREES`] GGM trees.
//!
//! A batch is stored level by level in a single buffer, where each node holds
//! the values of all trees of the batch. Level `d` is only as wide as needed to
//! produce `domain` leaves, so domains that are not a power of two do not pay
//! for the unused part of the tree.
use std::sync::LazyLock;

use silentot_core::{
    Block,
    aes_hash::{AesHash, FIXED_KEY_HASH},
};

use crate::PARALLEL_TREES;

/// One node position for all trees of a batch.
pub(crate) type Node = [Block; PARALLEL_TREES];

/// Public hashes `H_0` and `H_1` deriving the left and right child of a node.
static GGM_HASH: LazyLock<[AesHash; 2]> = LazyLock::new(|| {
    [
        AesHash::from_block(Block::pack(3242342, 0)),
        AesHash::from_block(Block::pack(8993849, 0)),
    ]
});

/// Roots of the batch starting at tree `tree_idx`: the fixed-key AES in
/// counter mode, starting at `seed ^ tree_idx`.
pub(crate) fn batch_roots(seed: Block, tree_idx: usize) -> Node {
    let counter = u128::from(seed ^ Block::from(tree_idx));
    std::array::from_fn(|i| {
        FIXED_KEY_HASH.permute_block(Block::from(counter.wrapping_add(i as u128)))
    })
}

/// Offsets of the levels of a batch of trees within the tree buffer.
#[derive(Debug, Clone)]
pub(crate) struct TreeLayout {
    depth: usize,
    domain: usize,
    // offsets[d]..offsets[d + 1] is level d, offsets has depth + 2 entries
    offsets: Vec<usize>,
}

impl TreeLayout {
    pub(crate) fn new(domain: usize, depth: usize) -> Self {
        let mut offsets = Vec::with_capacity(depth + 2);
        offsets.push(0);
        offsets.push(1);
        for d in 0..depth {
            let size = 2 * Self::parents(domain, depth, d);
            offsets.push(offsets[d + 1] + size);
        }
        Self {
            depth,
            domain,
            offsets,
        }
    }

    /// Number of nodes of level `d` that have children.
    fn parents(domain: usize, depth: usize, d: usize) -> usize {
        domain.div_ceil(1 << (depth - d))
    }

    /// Length of the tree buffer. If the leaves are written to an external
    /// buffer, the last level is not part of the tree buffer.
    pub(crate) fn tree_len(&self, external_leaves: bool) -> usize {
        if external_leaves {
            self.offsets[self.depth]
        } else {
            self.offsets[self.depth + 1]
        }
    }

    /// Level `d` and `d + 1`. The latter is `leaves` if `d + 1` is the leaf
    /// level and `leaves` is set.
    pub(crate) fn cons_levels<'a>(
        &self,
        tree: &'a mut [Node],
        leaves: Option<&'a mut [Node]>,
        d: usize,
    ) -> (&'a mut [Node], &'a mut [Node]) {
        let (lower, upper) = tree.split_at_mut(self.offsets[d + 1]);
        let level0 = &mut lower[self.offsets[d]..];
        let level1 = match leaves {
            Some(leaves) if d + 1 == self.depth => leaves,
            _ => &mut upper[..self.offsets[d + 2] - self.offsets[d + 1]],
        };
        (level0, level1)
    }

    pub(crate) fn level<'a>(
        &self,
        tree: &'a mut [Node],
        leaves: Option<&'a mut [Node]>,
        d: usize,
    ) -> &'a mut [Node] {
        match leaves {
            Some(leaves) if d == self.depth => leaves,
            _ => &mut tree[self.offsets[d]..self.offsets[d + 1]],
        }
    }

    /// Expand the parents of level `d` into level `d + 1` and return the xor
    /// of all left and all right children.
    pub(crate) fn expand_level(&self, level0: &[Node], level1: &mut [Node], d: usize) -> [Node; 2] {
        let mut sums = [[Block::ZERO; PARALLEL_TREES]; 2];
        let width = Self::parents(self.domain, self.depth, d);
        for (parent, children) in level0[..width].iter().zip(level1.chunks_exact_mut(2)) {
            for ((hash, child), sum) in GGM_HASH.iter().zip(children).zip(&mut sums) {
                hash.cr_hash_blocks_b2b(parent, child);
                for (s, c) in sum.iter_mut().zip(child.iter()) {
                    *s ^= *c;
                }
            }
        }
        sums
    }
}
