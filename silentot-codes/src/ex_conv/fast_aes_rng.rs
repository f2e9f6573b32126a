use bytemuck::{cast_mut, cast_ref, cast_slice, cast_slice_mut};
use rand::{RngCore, SeedableRng};
use silentot_core::{Block, aes_rng::AesRng};

/// Number of blocks the generator buffers.
pub(crate) const BUF_BLOCKS: usize = 256;

/// Cheap PRNG for the public code description.
///
/// The initial buffer is AES-CTR output under `seed`. Each refill applies a
/// single AES round to every block, keyed by the block 8 positions before it
/// (wrapping to the end of the buffer for the first 8 blocks).
pub(crate) struct FastAesRng {
    buffer: Box<[Block; BUF_BLOCKS]>,
}

impl FastAesRng {
    pub(crate) fn new(seed: Block) -> Self {
        let mut buffer = Box::new([Block::ZERO; BUF_BLOCKS]);
        AesRng::from_seed(seed).fill_bytes(cast_slice_mut(&mut buffer[..]));
        Self { buffer }
    }

    pub(crate) fn bytes(&self) -> &[u8] {
        cast_slice(&self.buffer[..])
    }

    pub(crate) fn blocks(&self) -> &[Block; BUF_BLOCKS] {
        &self.buffer
    }

    pub(crate) fn refill(&mut self) {
        for i in (0..BUF_BLOCKS).step_by(8) {
            let (before, rest) = self.buffer.split_at_mut(i);
            let (cur, after) = rest.split_at_mut(8);
            let cur: &mut [Block; 8] = cur.try_into().expect("len is 8");
            let key: &[Block; 8] = if i == 0 {
                after[after.len() - 8..].try_into().expect("len is 8")
            } else {
                before[i - 8..].try_into().expect("len is 8")
            };
            aes::hazmat::cipher_round_par(cast_mut(cur), cast_ref(key));
        }
    }
}

#[cfg(test)]
mod tests {
    use silentot_core::Block;

    use super::FastAesRng;

    #[test]
    fn refill_changes_buffer_deterministically() {
        let mut a = FastAesRng::new(Block::from(348324_u128));
        let mut b = FastAesRng::new(Block::from(348324_u128));
        let old = *a.blocks();
        a.refill();
        b.refill();
        assert_ne!(&old, a.blocks());
        assert_eq!(a.blocks(), b.blocks());
    }
}
