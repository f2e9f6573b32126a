//! Output formats of the PPRF expansion.
use std::fmt;

use bytemuck::cast_slice;
use ndarray::Array2;
use silentot_core::{Block, alloc::allocate_zeroed_vec};

use crate::{Error, PARALLEL_TREES, PprfConfig, tree::Node};

/// Tag of a [`PprfOutput`] variant. Used where only the layout matters, e.g.
/// when sampling choice bits or computing the active points.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum OutFormat {
    ByLeafIndex,
    ByTreeIndex,
    Interleaved,
    Callback,
}

/// Consumer of the leaves of one batch, called with the index of the first
/// tree in the batch and the `domain` leaf nodes of the batch.
pub type LeafCallback = Box<dyn FnMut(usize, &[[Block; PARALLEL_TREES]]) + Send>;

/// Destination of the PPRF leaves.
pub enum PprfOutput {
    /// Matrix with `domain` rows and `pnt_count` columns. Leaf `l` of tree `t`
    /// is at `(l, t)`.
    ByLeafIndex(Array2<Block>),
    /// Matrix with `pnt_count` rows and `domain` columns. Leaf `l` of tree `t`
    /// is at `(t, l)`.
    ByTreeIndex(Array2<Block>),
    /// Vector of length `domain * pnt_count`. Leaf `l` of tree `t` is at
    /// `((t / 8) * domain + l) * 8 + t % 8`, which is the in-memory layout of
    /// a batch of trees.
    Interleaved(Vec<Block>),
    /// Leaves are passed to the callback batch by batch.
    Callback(LeafCallback),
}

impl PprfOutput {
    /// Zeroed [`PprfOutput::ByLeafIndex`] output for `conf`.
    pub fn by_leaf_index(conf: &PprfConfig) -> Self {
        Self::ByLeafIndex(Array2::from_elem(
            [conf.domain(), conf.pnt_count()],
            Block::ZERO,
        ))
    }

    /// Zeroed [`PprfOutput::ByTreeIndex`] output for `conf`.
    pub fn by_tree_index(conf: &PprfConfig) -> Self {
        Self::ByTreeIndex(Array2::from_elem(
            [conf.pnt_count(), conf.domain()],
            Block::ZERO,
        ))
    }

    /// Zeroed [`PprfOutput::Interleaved`] output for `conf`.
    pub fn interleaved(conf: &PprfConfig) -> Self {
        Self::Interleaved(allocate_zeroed_vec(conf.size()))
    }

    pub fn callback(f: impl FnMut(usize, &[[Block; PARALLEL_TREES]]) + Send + 'static) -> Self {
        Self::Callback(Box::new(f))
    }

    pub fn format(&self) -> OutFormat {
        match self {
            PprfOutput::ByLeafIndex(_) => OutFormat::ByLeafIndex,
            PprfOutput::ByTreeIndex(_) => OutFormat::ByTreeIndex,
            PprfOutput::Interleaved(_) => OutFormat::Interleaved,
            PprfOutput::Callback(_) => OutFormat::Callback,
        }
    }

    /// Check that the shape of the output fits `conf`.
    pub(crate) fn validate(&self, conf: &PprfConfig) -> Result<(), Error> {
        let (domain, pnt_count) = (conf.domain(), conf.pnt_count());
        match self {
            PprfOutput::ByLeafIndex(out) if out.dim() != (domain, pnt_count) => {
                Err(Error::Configuration(format!(
                    "ByLeafIndex output has shape {:?}, expected ({domain}, {pnt_count})",
                    out.dim()
                )))
            }
            PprfOutput::ByTreeIndex(out) if out.dim() != (pnt_count, domain) => {
                Err(Error::Configuration(format!(
                    "ByTreeIndex output has shape {:?}, expected ({pnt_count}, {domain})",
                    out.dim()
                )))
            }
            PprfOutput::Interleaved(out) if out.len() != conf.size() => {
                Err(Error::Configuration(format!(
                    "Interleaved output has length {}, expected {}",
                    out.len(),
                    conf.size()
                )))
            }
            PprfOutput::Interleaved(_) | PprfOutput::Callback(_)
                if pnt_count % PARALLEL_TREES != 0 =>
            {
                Err(Error::Configuration(format!(
                    "{:?} output requires pnt_count divisible by {PARALLEL_TREES}, got {pnt_count}",
                    self.format()
                )))
            }
            _ => Ok(()),
        }
    }

    /// Copy the leaves of the batch starting at tree `tree_idx` into the
    /// output. Interleaved outputs are written in place during expansion.
    pub(crate) fn copy_out(&mut self, leaves: &[Node], tree_idx: usize, pnt_count: usize) {
        let lanes = PARALLEL_TREES.min(pnt_count - tree_idx);
        match self {
            PprfOutput::ByLeafIndex(out) => {
                for (mut row, leaf) in out.rows_mut().into_iter().zip(leaves) {
                    for (j, val) in leaf[..lanes].iter().enumerate() {
                        row[tree_idx + j] = *val;
                    }
                }
            }
            PprfOutput::ByTreeIndex(out) => {
                for (l, leaf) in leaves.iter().enumerate() {
                    for (j, val) in leaf[..lanes].iter().enumerate() {
                        out[(tree_idx + j, l)] = *val;
                    }
                }
            }
            PprfOutput::Callback(f) => f(tree_idx, leaves),
            PprfOutput::Interleaved(_) => {}
        }
    }
}

impl fmt::Debug for PprfOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PprfOutput::ByLeafIndex(out) => f.debug_tuple("ByLeafIndex").field(&out.dim()).finish(),
            PprfOutput::ByTreeIndex(out) => f.debug_tuple("ByTreeIndex").field(&out.dim()).finish(),
            PprfOutput::Interleaved(out) => f.debug_tuple("Interleaved").field(&out.len()).finish(),
            PprfOutput::Callback(_) => f.write_str("Callback"),
        }
    }
}

/// Position of leaf `point` of tree `tree_idx` in an interleaved output.
/// `None` if the point is outside the domain.
pub fn interleave_point(point: usize, tree_idx: usize, domain: usize) -> Option<usize> {
    if point >= domain {
        return None;
    }
    let sub_tree = tree_idx % PARALLEL_TREES;
    let forest = tree_idx / PARALLEL_TREES;
    Some((forest * domain + point) * PARALLEL_TREES + sub_tree)
}

/// View the leaves of a batch as a flat slice in interleaved order.
pub fn flatten_leaves(leaves: &[[Block; PARALLEL_TREES]]) -> &[Block] {
    cast_slice(leaves)
}

#[cfg(test)]
mod tests {
    use silentot_core::Block;

    use super::{PprfOutput, interleave_point};
    use crate::{Error, PprfConfig};

    #[test]
    fn interleave_layout() {
        assert_eq!(Some(0), interleave_point(0, 0, 4));
        assert_eq!(Some(8 + 3), interleave_point(1, 3, 4));
        // second batch starts after domain * 8 blocks
        assert_eq!(Some(4 * 8 + 2 * 8 + 1), interleave_point(2, 9, 4));
        assert_eq!(None, interleave_point(4, 0, 4));
    }

    #[test]
    fn validate_shapes() {
        let conf = PprfConfig::new(10, 8).expect("valid conf");
        assert!(PprfOutput::by_leaf_index(&conf).validate(&conf).is_ok());
        assert!(PprfOutput::by_tree_index(&conf).validate(&conf).is_ok());
        assert!(PprfOutput::interleaved(&conf).validate(&conf).is_ok());
        let wrong = PprfOutput::Interleaved(vec![Block::ZERO; 3]);
        assert!(matches!(wrong.validate(&conf), Err(Error::Configuration(_))));
        let transposed = PprfOutput::by_tree_index(&conf);
        let PprfOutput::ByTreeIndex(arr) = transposed else {
            unreachable!()
        };
        assert!(PprfOutput::ByLeafIndex(arr).validate(&conf).is_err());

        let conf = PprfConfig::new(10, 5).expect("valid conf");
        assert!(PprfOutput::interleaved(&conf).validate(&conf).is_err());
        assert!(PprfOutput::callback(|_, _| {}).validate(&conf).is_err());
        assert!(PprfOutput::by_leaf_index(&conf).validate(&conf).is_ok());
    }
}
