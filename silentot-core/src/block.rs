use std::{
    fmt,
    ops::{BitAnd, BitAndAssign, BitOr, BitOrAssign, BitXor, BitXorAssign, Shl},
};

use aes::cipher::{self, array::sizes};
use bytemuck::{Pod, Zeroable};
use rand::{Rng, distr::StandardUniform, prelude::Distribution};
use serde::{Deserialize, Serialize};
use subtle::{Choice, ConditionallySelectable, ConstantTimeEq};
use wide::u8x16;
use zeroize::DefaultIsZeroes;

use crate::random_oracle::{Hash, RandomOracle};

pub mod gf128;

/// A 128-bit block. Uses SIMD operations where available.
///
/// Blocks are the unit of everything in the Silent OT stack: PPRF nodes, OT
/// messages, the correlation Δ and elements of GF(2^128). Only the bitwise
/// operations the protocols need are provided. Arithmetic on the integer
/// value goes through `u128`.
#[derive(Clone, Copy, Serialize, Deserialize, Default, Pod, Zeroable)]
#[repr(transparent)]
pub struct Block(u8x16);

impl Block {
    pub const ZERO: Self = Self(u8x16::ZERO);
    pub const ONES: Self = Self(u8x16::MAX);
    pub const ONE: Self = Self::pack(1, 0);
    /// All bits set except the least significant one.
    pub const MASK_LSB: Self = Self::pack(!1, u64::MAX);

    pub const BYTES: usize = 16;
    pub const BITS: usize = 128;

    #[inline]
    pub const fn splat(byte: u8) -> Self {
        Self(u8x16::new([byte; 16]))
    }

    /// Create a block from its low and high 64-bit halves.
    #[inline]
    pub const fn pack(low: u64, high: u64) -> Self {
        let value = ((high as u128) << 64) | low as u128;
        Self(u8x16::new(value.to_ne_bytes()))
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_array_ref()
    }

    #[inline]
    pub fn as_mut_bytes(&mut self) -> &mut [u8; 16] {
        self.0.as_array_mut()
    }

    #[inline]
    pub fn low(&self) -> u64 {
        u128::from(*self) as u64
    }

    #[inline]
    pub fn high(&self) -> u64 {
        (u128::from(*self) >> 64) as u64
    }

    #[inline]
    pub fn lsb(&self) -> bool {
        self.low() & 1 == 1
    }

    /// Iterate over the bits of the block, least significant first.
    #[inline]
    pub fn bits(self) -> impl Iterator<Item = bool> {
        let val = u128::from(self);
        (0..Self::BITS).map(move |i| (val >> i) & 1 == 1)
    }

    /// Hash the block with the [`RandomOracle`].
    #[inline]
    pub fn ro_hash(&self) -> Hash {
        let mut ro = RandomOracle::new();
        ro.update(self.as_bytes());
        ro.finalize()
    }
}

impl fmt::Debug for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Block({:#034x})", u128::from(*self))
    }
}

macro_rules! bit_op {
    ($tr:ident, $f:ident, $assign_tr:ident, $assign_f:ident, $op:tt) => {
        impl $tr for Block {
            type Output = Self;

            #[inline]
            fn $f(self, rhs: Self) -> Self {
                Self(self.0 $op rhs.0)
            }
        }

        impl $assign_tr for Block {
            #[inline]
            fn $assign_f(&mut self, rhs: Self) {
                *self = *self $op rhs;
            }
        }
    };
}

bit_op!(BitAnd, bitand, BitAndAssign, bitand_assign, &);
bit_op!(BitOr, bitor, BitOrAssign, bitor_assign, |);
bit_op!(BitXor, bitxor, BitXorAssign, bitxor_assign, ^);

// Blocks frequently hold secrets, so comparisons are constant time.
impl PartialEq for Block {
    fn eq(&self, other: &Self) -> bool {
        self.as_bytes()[..].ct_eq(&other.as_bytes()[..]).into()
    }
}

impl Eq for Block {}

impl Shl<usize> for Block {
    type Output = Block;

    #[inline]
    fn shl(self, rhs: usize) -> Self::Output {
        Self::from(u128::from(self) << rhs)
    }
}

impl AsRef<[u8]> for Block {
    fn as_ref(&self) -> &[u8] {
        self.as_bytes()
    }
}

impl AsMut<[u8]> for Block {
    #[inline]
    fn as_mut(&mut self) -> &mut [u8] {
        self.as_mut_bytes()
    }
}

// `Block::default()` is all zero bytes
impl DefaultIsZeroes for Block {}

impl ConditionallySelectable for Block {
    #[inline]
    fn conditional_select(a: &Self, b: &Self, choice: Choice) -> Self {
        // all zero for choice 0 and all ones for choice 1
        let mask = Block::splat(0_u8.wrapping_sub(choice.unwrap_u8()));
        *a ^ (mask & (*a ^ *b))
    }
}

impl Distribution<Block> for StandardUniform {
    #[inline]
    fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Block {
        let mut block = Block::ZERO;
        rng.fill_bytes(block.as_mut_bytes());
        block
    }
}

// AES block conversions for the fixed-key hashes and the CTR RNG.
impl From<Block> for cipher::Array<u8, sizes::U16> {
    #[inline]
    fn from(value: Block) -> Self {
        Self(*value.as_bytes())
    }
}

impl From<cipher::Array<u8, sizes::U16>> for Block {
    #[inline]
    fn from(value: cipher::Array<u8, sizes::U16>) -> Self {
        Self(u8x16::new(value.0))
    }
}

impl From<Block> for u128 {
    #[inline]
    fn from(value: Block) -> Self {
        u128::from_ne_bytes(*value.as_bytes())
    }
}

impl From<u128> for Block {
    #[inline]
    fn from(value: u128) -> Self {
        Self(u8x16::new(value.to_ne_bytes()))
    }
}

/// Leaf and tree indices used as AES tweaks.
impl From<usize> for Block {
    #[inline]
    fn from(value: usize) -> Self {
        (value as u128).into()
    }
}

#[cfg(target_arch = "x86_64")]
impl From<std::arch::x86_64::__m128i> for Block {
    #[inline]
    fn from(value: std::arch::x86_64::__m128i) -> Self {
        bytemuck::cast(value)
    }
}

#[cfg(target_arch = "x86_64")]
impl From<Block> for std::arch::x86_64::__m128i {
    #[inline]
    fn from(value: Block) -> Self {
        bytemuck::cast(value)
    }
}
