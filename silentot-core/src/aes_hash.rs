//! Fixed-key AES hashes.
//!
//! [`AesHash`] implements the correlation robust hash `H(x) = π(x) ⊕ x` and the
//! tweakable circular correlation robust variant of
//! <https://eprint.iacr.org/2019/074>, where `π` is AES under a fixed, public key.
//! The same construction with two different keys derives the left and right
//! children of GGM tree nodes.
use std::sync::LazyLock;

use aes::{
    Aes128,
    cipher::{BlockCipherEncrypt, Key, KeyInit},
};
use bytemuck::Pod;

use crate::{AES_PAR_BLOCKS, Block, utils::xor_inplace};

#[derive(Clone)]
pub struct AesHash {
    aes: Aes128,
}

impl AesHash {
    /// Create a new `AesHash` with the given key.
    pub fn new(key: &Key<Aes128>) -> Self {
        Self {
            aes: Aes128::new(key),
        }
    }

    /// Create a new `AesHash` keyed with a block.
    pub fn from_block(key: Block) -> Self {
        Self::new(&key.into())
    }

    /// Correlation robust hash of a single block.
    ///
    /// Only secure in the semi-honest setting, see
    /// <https://eprint.iacr.org/2019/074>.
    #[inline]
    pub fn cr_hash_block(&self, x: Block) -> Block {
        let mut x_enc = x.into();
        self.aes.encrypt_block(&mut x_enc);
        x ^ x_enc.into()
    }

    /// Correlation robust hashes of a fixed number of blocks.
    #[inline]
    pub fn cr_hash_blocks<const N: usize>(&self, x: &[Block; N]) -> [Block; N]
    where
        [Block; N]: Pod,
        [aes::Block; N]: Pod,
    {
        let mut blocks: [aes::Block; N] = bytemuck::cast(*x);
        self.aes.encrypt_blocks(&mut blocks);
        let mut blocks: [Block; N] = bytemuck::cast(blocks);
        xor_inplace(&mut blocks, x);
        blocks
    }

    /// Correlation robust hashes of `inp` written into `out`.
    ///
    /// # Panics
    /// If `N != out.len()`.
    #[inline]
    pub fn cr_hash_blocks_b2b<const N: usize>(&self, inp: &[Block; N], out: &mut [Block])
    where
        [Block; N]: Pod,
        [aes::Block; N]: Pod,
    {
        assert_eq!(N, out.len());
        let inp_aes: &[aes::Block; N] = bytemuck::cast_ref(inp);
        let out_aes: &mut [aes::Block] = bytemuck::cast_slice_mut(out);
        self.aes
            .encrypt_blocks_b2b(inp_aes, out_aes)
            .expect("buffers have equal size");
        xor_inplace(out, inp);
    }

    /// Encrypt a single block with the underlying permutation, without the
    /// feed-forward xor.
    #[inline]
    pub fn permute_block(&self, x: Block) -> Block {
        let mut x_enc = x.into();
        self.aes.encrypt_block(&mut x_enc);
        x_enc.into()
    }

    /// Correlation robust hash of every block in `x`, in place.
    pub fn cr_hash_slice_mut(&self, x: &mut [Block]) {
        let mut tmp = [aes::Block::default(); AES_PAR_BLOCKS];
        for chunk in x.chunks_mut(AES_PAR_BLOCKS) {
            self.aes
                .encrypt_blocks_b2b(bytemuck::cast_slice(chunk), &mut tmp[..chunk.len()])
                .expect("buffers have equal size");
            chunk
                .iter_mut()
                .zip(tmp)
                .for_each(|(x, x_enc)| *x ^= x_enc.into());
        }
    }

    /// Tweakable circular correlation robust hash `π(π(x) ⊕ i) ⊕ π(x)` of every
    /// block in `x`, where the tweak `i` is computed by `tweak_fn` from the
    /// index of the block.
    pub fn tccr_hash_slice_mut(&self, x: &mut [Block], mut tweak_fn: impl FnMut(usize) -> Block) {
        let mut tmp = [aes::Block::default(); AES_PAR_BLOCKS];
        for (chunk_idx, chunk) in x.chunks_mut(AES_PAR_BLOCKS).enumerate() {
            self.aes
                .encrypt_blocks_b2b(bytemuck::cast_slice(chunk), &mut tmp[..chunk.len()])
                .expect("buffers have equal size");
            for (idx, (dest, x_enc)) in chunk.iter_mut().zip(&tmp).enumerate() {
                *dest = Block::from(*x_enc) ^ tweak_fn(chunk_idx * AES_PAR_BLOCKS + idx);
            }
            self.aes.encrypt_blocks(bytemuck::cast_slice_mut(chunk));
            chunk
                .iter_mut()
                .zip(tmp)
                .for_each(|(x, x_enc)| *x ^= x_enc.into());
        }
    }
}

/// An `AesHash` with a fixed, public key. Used as the random oracle that
/// finalizes OT messages and derives the PPRF last-level pads.
pub static FIXED_KEY_HASH: LazyLock<AesHash> = LazyLock::new(|| {
    let key = 193502124791825095790518994062991136444_u128
        .to_le_bytes()
        .into();
    AesHash::new(&key)
});
