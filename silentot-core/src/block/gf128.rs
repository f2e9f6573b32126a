//! Arithmetic in GF(2^128) modulo x^128 + x^7 + x^2 + x + 1.
//!
//! Bit `i` of the `u128` representation of a [`Block`] is the coefficient of
//! x^i. Carry-less multiplication uses `pclmulqdq` if the CPU supports it and
//! falls back to a constant-time portable implementation otherwise.
use super::Block;

#[cfg(target_arch = "x86_64")]
cpufeatures::new!(pclmul_cpuid, "pclmulqdq");

impl Block {
    /// Carry-less multiplication of two blocks.
    ///
    /// Returns the unreduced 256-bit product as `(low, high)`.
    #[inline]
    pub fn clmul(&self, rhs: &Self) -> (Self, Self) {
        #[cfg(target_arch = "x86_64")]
        if pclmul_cpuid::get() {
            // Safety: pclmulqdq availability checked at runtime
            return unsafe { clmul_pclmul(*self, *rhs) };
        }
        clmul_portable(*self, *rhs)
    }

    /// Reduce a 256-bit product from [`Block::clmul`] modulo the field
    /// polynomial.
    #[inline]
    pub fn gf_reduce(low: &Self, high: &Self) -> Self {
        let low = u128::from(*low);
        let high = u128::from(*high);
        // x^128 = x^7 + x^2 + x + 1. Bits of `high` shifted beyond 128 are
        // folded back first; they are less than 2^7 so a second fold is not needed.
        let t = high ^ (high >> 127) ^ (high >> 126) ^ (high >> 121);
        Self::from(low ^ t ^ (t << 1) ^ (t << 2) ^ (t << 7))
    }

    /// Multiplication in GF(2^128).
    #[inline]
    pub fn gf_mul(&self, rhs: &Self) -> Self {
        let (low, high) = self.clmul(rhs);
        Self::gf_reduce(&low, &high)
    }

    /// Exponentiation by squaring in GF(2^128).
    pub fn gf_pow(&self, mut exp: u64) -> Self {
        let mut base = *self;
        let mut acc = Block::ONE;
        while exp > 0 {
            if exp & 1 == 1 {
                acc = acc.gf_mul(&base);
            }
            base = base.gf_mul(&base);
            exp >>= 1;
        }
        acc
    }
}

#[inline]
fn clmul64(a: u64, b: u64) -> u128 {
    let a = a as u128;
    let mut r = 0_u128;
    for i in 0..64 {
        let mask = 0_u128.wrapping_sub(((b >> i) & 1) as u128);
        r ^= (a << i) & mask;
    }
    r
}

fn clmul_portable(a: Block, b: Block) -> (Block, Block) {
    let (a0, a1) = (a.low(), a.high());
    let (b0, b1) = (b.low(), b.high());
    let low = clmul64(a0, b0);
    let high = clmul64(a1, b1);
    let mid = clmul64(a0, b1) ^ clmul64(a1, b0);
    (
        Block::from(low ^ (mid << 64)),
        Block::from(high ^ (mid >> 64)),
    )
}

#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "pclmulqdq")]
unsafe fn clmul_pclmul(a: Block, b: Block) -> (Block, Block) {
    use std::arch::x86_64::{
        __m128i, _mm_clmulepi64_si128, _mm_slli_si128, _mm_srli_si128, _mm_xor_si128,
    };
    let a: __m128i = a.into();
    let b: __m128i = b.into();
    let low = _mm_clmulepi64_si128::<0x00>(a, b);
    let high = _mm_clmulepi64_si128::<0x11>(a, b);
    let mid = _mm_xor_si128(
        _mm_clmulepi64_si128::<0x10>(a, b),
        _mm_clmulepi64_si128::<0x01>(a, b),
    );
    let low = _mm_xor_si128(low, _mm_slli_si128::<8>(mid));
    let high = _mm_xor_si128(high, _mm_srli_si128::<8>(mid));
    (low.into(), high.into())
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::clmul_portable;
    use crate::Block;

    fn block() -> impl Strategy<Value = Block> {
        any::<u128>().prop_map(Block::from)
    }

    #[test]
    fn reduce_wraps_x128() {
        // x^127 * x = x^128 = x^7 + x^2 + x + 1
        let x127 = Block::from(1_u128 << 127);
        let x = Block::from(2_u128);
        assert_eq!(Block::from(0x87_u128), x127.gf_mul(&x));
    }

    #[test]
    fn pow_small() {
        let x = Block::from(2_u128);
        assert_eq!(Block::ONE, x.gf_pow(0));
        assert_eq!(Block::from(1_u128 << 100), x.gf_pow(100));
        assert_eq!(Block::from(0x87_u128), x.gf_pow(128));
    }

    proptest! {
        #[test]
        fn clmul_matches_portable(a in block(), b in block()) {
            prop_assert_eq!(clmul_portable(a, b), a.clmul(&b));
        }

        #[test]
        fn mul_commutative_distributive(a in block(), b in block(), c in block()) {
            prop_assert_eq!(a.gf_mul(&b), b.gf_mul(&a));
            prop_assert_eq!(a.gf_mul(&(b ^ c)), a.gf_mul(&b) ^ a.gf_mul(&c));
            prop_assert_eq!(a.gf_mul(&Block::ONE), a);
        }

        #[test]
        fn mul_associative(a in block(), b in block(), c in block()) {
            prop_assert_eq!(a.gf_mul(&b).gf_mul(&c), a.gf_mul(&b.gf_mul(&c)));
        }

        #[test]
        fn pow_adds_exponents(a in block(), e1 in 0_u64..1000, e2 in 0_u64..1000) {
            prop_assert_eq!(a.gf_pow(e1).gf_mul(&a.gf_pow(e2)), a.gf_pow(e1 + e2));
        }
    }
}
