//! Linear codes used to compress the sparse noise of Silent OT.
//!
//! The [`ex_conv::ExConvCode`] implements the expand-convolute code of
//! [RRT23](https://eprint.iacr.org/2023/882). Encoding is generic over the
//! element type through [`CoeffCtx`], so the same code compresses 128-bit
//! blocks, choice bytes or GF(2^128) elements.
use bytemuck::Pod;
use silentot_core::{Block, alloc::allocate_zeroed_vec};

pub mod ex_conv;

/// Arithmetic on the elements a code operates on.
///
/// A context is a zero-sized value selecting the field. It is passed by value
/// through the encoder so one element type can be used with different fields.
pub trait CoeffCtx<F: Pod>: Copy + Send + Sync {
    /// `acc = acc + x`
    fn plus(&self, acc: &mut F, x: &F);

    /// Multiply `x` by the fixed constant of this context.
    fn mul_const(&self, x: &mut F);

    fn zero(&self) -> F {
        F::zeroed()
    }

    /// A zero-initialized buffer of `len` elements.
    fn zeroed_vec(&self, len: usize) -> Vec<F> {
        allocate_zeroed_vec(len)
    }
}

/// Binary field: addition is xor and the constant is one.
#[derive(Debug, Default, Clone, Copy)]
pub struct Gf2Ctx;

impl CoeffCtx<Block> for Gf2Ctx {
    #[inline(always)]
    fn plus(&self, acc: &mut Block, x: &Block) {
        *acc ^= *x;
    }

    #[inline(always)]
    fn mul_const(&self, _x: &mut Block) {}
}

impl CoeffCtx<u8> for Gf2Ctx {
    #[inline(always)]
    fn plus(&self, acc: &mut u8, x: &u8) {
        *acc ^= *x;
    }

    #[inline(always)]
    fn mul_const(&self, _x: &mut u8) {}
}

/// GF(2^128): addition is xor, the constant is the element `y = 4234123421`.
#[derive(Debug, Default, Clone, Copy)]
pub struct Gf128Ctx;

impl Gf128Ctx {
    pub const Y: Block = Block::pack(4234123421, 0);
}

impl CoeffCtx<Block> for Gf128Ctx {
    #[inline(always)]
    fn plus(&self, acc: &mut Block, x: &Block) {
        *acc ^= *x;
    }

    #[inline(always)]
    fn mul_const(&self, x: &mut Block) {
        *x = x.gf_mul(&Self::Y);
    }
}
