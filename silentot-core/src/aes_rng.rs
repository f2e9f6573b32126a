//! RNG based on AES in CTR mode.
//!
//! The construction follows the `AesRng` of the
//! [scuttlebutt](https://github.com/GaloisInc/swanky) crate but uses the
//! [aes](`aes`) crate for the cipher. With hardware AES the generator produces
//! several GiB of randomness per second, which is why the protocols use it for
//! everything that is expanded locally from a seed.
use std::mem;

use aes::{
    Aes128,
    cipher::{BlockCipherEncrypt, KeyInit},
};
use rand::{Rng, SeedableRng};
use rand_core::{
    CryptoRng, RngCore,
    block::{BlockRng, BlockRngCore, CryptoBlockRng},
};

use crate::{AES_PAR_BLOCKS, Block};

/// Blocks produced per call of [`AesRngCore::generate`].
const CORE_BLOCKS: usize = 8;

/// CSPRNG that encrypts a counter with AES keyed by the seed.
#[derive(Clone, Debug)]
pub struct AesRng(BlockRng<AesRngCore>);

impl RngCore for AesRng {
    #[inline]
    fn next_u32(&mut self) -> u32 {
        self.0.next_u32()
    }

    #[inline]
    fn next_u64(&mut self) -> u64 {
        self.0.next_u64()
    }

    #[inline]
    fn fill_bytes(&mut self, dest: &mut [u8]) {
        let block_size = mem::size_of::<aes::Block>();
        let block_len = dest.len() / block_size * block_size;
        let (block_bytes, rest_bytes) = dest.split_at_mut(block_len);
        // encrypt directly into dest instead of going through the u32 buffer
        let blocks = bytemuck::cast_slice_mut::<_, aes::Block>(block_bytes);
        let core = &mut self.0.core;
        for chunk in blocks.chunks_mut(AES_PAR_BLOCKS) {
            for block in chunk.iter_mut() {
                *block = aes::cipher::Array(core.state.to_le_bytes());
                core.state += 1;
            }
            core.aes.encrypt_blocks(chunk);
        }
        self.0.fill_bytes(rest_bytes);
    }
}

impl SeedableRng for AesRng {
    type Seed = Block;

    #[inline]
    fn from_seed(seed: Self::Seed) -> Self {
        AesRng(BlockRng::new(AesRngCore::from_seed(seed)))
    }
}

impl CryptoRng for AesRng {}

impl AesRng {
    /// Create a new generator with a seed from [`rand::random`].
    #[inline]
    pub fn new() -> Self {
        AesRng::from_seed(rand::random::<Block>())
    }

    /// Create a new generator seeded from this one.
    #[inline]
    pub fn fork(&mut self) -> Self {
        let seed = self.random::<Block>();
        AesRng::from_seed(seed)
    }
}

impl Default for AesRng {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

/// The core of [`AesRng`], used with [`BlockRng`].
#[derive(Clone)]
pub struct AesRngCore {
    aes: Aes128,
    state: u128,
}

impl std::fmt::Debug for AesRngCore {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "AesRngCore {{}}")
    }
}

impl BlockRngCore for AesRngCore {
    type Item = u32;
    // Equivalent to `[aes::Block; CORE_BLOCKS]`
    type Results = [u32; CORE_BLOCKS * (mem::size_of::<aes::Block>() / mem::size_of::<u32>())];

    #[inline]
    fn generate(&mut self, results: &mut Self::Results) {
        let blocks = bytemuck::cast_slice_mut::<_, aes::Block>(results);
        blocks.iter_mut().for_each(|blk| {
            *blk = aes::cipher::Array(self.state.to_le_bytes());
            self.state += 1;
        });
        self.aes.encrypt_blocks(blocks);
    }
}

impl CryptoBlockRng for AesRngCore {}

impl SeedableRng for AesRngCore {
    type Seed = Block;

    #[inline]
    fn from_seed(seed: Self::Seed) -> Self {
        AesRngCore {
            aes: Aes128::new(&seed.into()),
            state: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use rand::{Rng, SeedableRng};

    use super::AesRng;
    use crate::Block;

    #[test]
    fn deterministic_per_seed() {
        let mut a = AesRng::from_seed(Block::ONES);
        let mut b = AesRng::from_seed(Block::ONES);
        let x = a.random::<[Block; 8]>();
        assert_eq!(x, b.random::<[Block; 8]>());
        assert_ne!(x, a.random::<[Block; 8]>());
    }

    #[test]
    fn fill_bytes_matches_counter_mode() {
        let mut a = AesRng::from_seed(Block::ZERO);
        let mut b = AesRng::from_seed(Block::ZERO);
        let mut buf = [0_u8; 40];
        a.fill(&mut buf[..]);
        let first: Block = b.random();
        assert_eq!(first.as_bytes(), &buf[..16]);
    }
}
