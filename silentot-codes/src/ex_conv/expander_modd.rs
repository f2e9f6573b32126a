use std::mem;

use bytemuck::cast_slice_mut;
use fastdivide::DividerU64;
use silentot_core::Block;

use super::fast_aes_rng::{BUF_BLOCKS, FastAesRng};

const VALS: usize = BUF_BLOCKS * Block::BYTES / mem::size_of::<u64>();

/// Stream of pseudorandom indices in `0..modulus`.
///
/// Values are reduced with a precomputed [`DividerU64`], or a mask if the
/// modulus is a power of two.
pub(crate) struct ExpanderModd {
    rng: FastAesRng,
    modulus: u64,
    divider: DividerU64,
    pow2_mask: Option<u64>,
    idx: usize,
    vals: Box<[u64; VALS]>,
}

impl ExpanderModd {
    /// # Panics
    /// If `modulus == 0`.
    pub(crate) fn new(seed: Block, modulus: u64) -> Self {
        assert_ne!(0, modulus, "modulus must be non-zero");
        let mut this = Self {
            rng: FastAesRng::new(seed),
            modulus,
            divider: DividerU64::divide_by(modulus),
            pow2_mask: modulus.is_power_of_two().then(|| modulus - 1),
            idx: 0,
            vals: Box::new([0; VALS]),
        };
        this.refill();
        this
    }

    #[inline(always)]
    pub(crate) fn get(&mut self) -> usize {
        if self.idx == VALS {
            self.refill();
        }
        let val = self.vals[self.idx];
        self.idx += 1;
        val as usize
    }

    fn refill(&mut self) {
        self.idx = 0;
        self.rng.refill();
        let dest: &mut [Block] = cast_slice_mut(&mut self.vals[..]);
        dest.copy_from_slice(self.rng.blocks());
        match self.pow2_mask {
            Some(mask) => self.vals.iter_mut().for_each(|v| *v &= mask),
            None => {
                for v in self.vals.iter_mut() {
                    *v -= self.divider.divide(*v) * self.modulus;
                }
            }
        }
    }
}
