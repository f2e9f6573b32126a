//! Expand-convolute code.
//!
//! The generator is `G = B · A` where `A` is a lower triangular accumulator
//! with unit diagonal and `accumulator_size` pseudorandom sub-diagonals, and
//! `B` is a sparse expander of row weight `expander_weight`. Neither matrix is
//! materialized; both are regenerated from the seed on every encode.
use bytemuck::Pod;
use expander::ExpanderCode;
use fast_aes_rng::FastAesRng;
use seq_macro::seq;
use silentot_core::Block;

use crate::CoeffCtx;

mod expander;
mod expander_modd;
mod fast_aes_rng;

#[derive(Debug, Clone, Copy)]
pub struct ExConvCode {
    expander: ExpanderCode,
    conf: ExConvCodeConfig,
    message_size: usize,
}

#[derive(Debug, Clone, Copy)]
pub struct ExConvCodeConfig {
    pub seed: Block,
    /// Length `n` of the encoded vector. `0` selects `2 * message_size`.
    pub code_size: usize,
    /// Number of pseudorandom sub-diagonals of the accumulator.
    pub accumulator_size: usize,
    /// Fix the first sub-diagonal to ones, scaled by the field constant.
    pub sticky: bool,
    /// Keep the message part of the input and only add the expanded parity part
    /// to it.
    pub systematic: bool,
    pub regular_expander: bool,
    pub expander_weight: usize,
}

impl Default for ExConvCodeConfig {
    fn default() -> Self {
        Self {
            seed: Block::pack(56756745976768754, 9996754675674599),
            code_size: 0,
            accumulator_size: 16,
            sticky: true,
            systematic: true,
            regular_expander: true,
            expander_weight: 7,
        }
    }
}

const CC_BLOCK: Block = Block::splat(0xcc);

impl ExConvCode {
    pub fn new(message_size: usize) -> Self {
        Self::new_with_conf(message_size, ExConvCodeConfig::default())
    }

    /// # Panics
    /// If `code_size < message_size`, if the expander weight is zero, or if
    /// the expander input is shorter than its weight.
    pub fn new_with_conf(message_size: usize, mut conf: ExConvCodeConfig) -> Self {
        if conf.code_size == 0 {
            conf.code_size = 2 * message_size;
        }
        assert!(
            conf.code_size >= message_size,
            "code_size {} must be at least message_size {message_size}",
            conf.code_size
        );
        assert!(conf.expander_weight > 0, "expander_weight must be non-zero");
        let expander_input = if conf.systematic {
            conf.code_size - message_size
        } else {
            conf.code_size
        };
        let expander = ExpanderCode::new(
            expander_input,
            conf.expander_weight,
            conf.regular_expander,
            conf.seed ^ CC_BLOCK,
        );
        Self {
            expander,
            conf,
            message_size,
        }
    }

    pub fn message_size(&self) -> usize {
        self.message_size
    }

    pub fn code_size(&self) -> usize {
        self.conf.code_size
    }

    pub fn conf(&self) -> &ExConvCodeConfig {
        &self.conf
    }

    /// Compress `e` of length `code_size` in place. Afterwards the first
    /// `message_size` entries hold `G · e`; the rest is scratch.
    ///
    /// # Panics
    /// If `e.len() != code_size`.
    pub fn dual_encode<F: Pod, C: CoeffCtx<F>>(&self, e: &mut [F], ctx: C) {
        assert_eq!(self.conf.code_size, e.len(), "e must have len of code_size");
        if self.conf.systematic {
            let (prefix, suffix) = e.split_at_mut(self.message_size);
            self.accumulate(suffix, ctx);
            self.expander.expand::<_, _, true>(suffix, prefix, ctx);
        } else {
            self.accumulate(e, ctx);
            let mut w = ctx.zeroed_vec(self.message_size);
            self.expander.expand::<_, _, false>(e, &mut w, ctx);
            e[..self.message_size].copy_from_slice(&w);
        }
    }

    /// Encode two vectors of possibly different element types with this code.
    pub fn dual_encode2<F, G, C>(&self, e0: &mut [F], e1: &mut [G], ctx: C)
    where
        F: Pod,
        G: Pod,
        C: CoeffCtx<F> + CoeffCtx<G>,
    {
        self.dual_encode(e0, ctx);
        self.dual_encode(e1, ctx);
    }

    fn accumulate<F: Pod, C: CoeffCtx<F>>(&self, x: &mut [F], ctx: C) {
        match self.conf.accumulator_size {
            16 => self.accumulate_fixed::<16, _, _>(x, ctx),
            24 => self.accumulate_fixed::<24, _, _>(x, ctx),
            _ => self.accumulate_generic(x, ctx),
        }
    }

    fn accumulate_fixed<const A: usize, F: Pod, C: CoeffCtx<F>>(&self, x: &mut [F], ctx: C) {
        debug_assert_eq!(A, self.conf.accumulator_size);
        let sticky = self.conf.sticky;
        self.for_each_row(x, A, |x, i, coeffs, range_check| {
            if range_check {
                acc_one::<true, _, _>(x, i, coeffs, A, sticky, ctx)
            } else {
                acc_one::<false, _, _>(x, i, coeffs, A, sticky, ctx)
            }
        });
    }

    fn accumulate_generic<F: Pod, C: CoeffCtx<F>>(&self, x: &mut [F], ctx: C) {
        let a = self.conf.accumulator_size;
        let sticky = self.conf.sticky;
        self.for_each_row(x, a, |x, i, coeffs, range_check| {
            if range_check {
                acc_one::<true, _, _>(x, i, coeffs, a, sticky, ctx)
            } else {
                acc_one::<false, _, _>(x, i, coeffs, a, sticky, ctx)
            }
        });
    }

    /// Drives the accumulator over every row of `x`, supplying each row with
    /// its coefficient bytes. The stream advances one byte per row and is
    /// refilled once fewer than `ceil(a / 8)` bytes remain. Rows within the
    /// last `a + 1` positions need range checks.
    #[inline(always)]
    fn for_each_row<F>(
        &self,
        x: &mut [F],
        a: usize,
        mut row: impl FnMut(&mut [F], usize, &[u8], bool),
    ) {
        let mut rng = FastAesRng::new(self.conf.seed ^ Block::ONE);
        let width = a.div_ceil(8);
        let main = x.len().saturating_sub(1 + a);
        let mut pos = 0;
        for i in 0..x.len() {
            if pos + width > rng.bytes().len() {
                rng.refill();
                pos = 0;
            }
            let coeffs = &rng.bytes()[pos..pos + width];
            row(x, i, coeffs, i >= main);
            pos += 1;
        }
    }
}

/// Add row `i` into the following positions of `x` selected by the first `a`
/// bits of `coeffs`. With `sticky` set, position `i + 1` always receives
/// `(x[i + 1] + x[i]) · c` and the selected positions start at `i + 2`.
#[inline(always)]
fn acc_one<const RANGE_CHECK: bool, F: Pod, C: CoeffCtx<F>>(
    x: &mut [F],
    i: usize,
    coeffs: &[u8],
    a: usize,
    sticky: bool,
    ctx: C,
) {
    let size = x.len();
    let xi = x[i];
    let mut j = i + 1;
    if sticky {
        if !RANGE_CHECK || j < size {
            ctx.plus(&mut x[j], &xi);
            ctx.mul_const(&mut x[j]);
        }
        j += 1;
    }

    let mut k = 0;
    let mut coeffs = coeffs.iter().copied();
    while k + 8 <= a {
        let b = coeffs.next().expect("one coefficient byte per 8 bits");
        acc_one_8::<RANGE_CHECK, _, _>(x, xi, j, b, ctx);
        j += 8;
        k += 8;
    }
    if k < a {
        let mut b = coeffs.next().expect("one coefficient byte per 8 bits");
        while k < a {
            if b & 1 != 0 && (!RANGE_CHECK || j < size) {
                ctx.plus(&mut x[j], &xi);
            }
            b >>= 1;
            j += 1;
            k += 1;
        }
    }
}

#[inline(always)]
fn acc_one_8<const RANGE_CHECK: bool, F: Pod, C: CoeffCtx<F>>(
    x: &mut [F],
    xi: F,
    j: usize,
    b: u8,
    ctx: C,
) {
    if RANGE_CHECK {
        let end = x.len().min(j + 8);
        for (p, xj) in (j..end).enumerate() {
            if (b >> p) & 1 != 0 {
                ctx.plus(&mut x[xj], &xi);
            }
        }
    } else {
        let x: &mut [F; 8] = (&mut x[j..j + 8]).try_into().expect("len is 8");
        seq!(N in 0..8 {
            if b & (1 << N) != 0 {
                ctx.plus(&mut x[N], &xi);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use bytemuck::cast_slice_mut;
    use proptest::prelude::*;
    use rand::{Rng, SeedableRng, rngs::StdRng};
    use silentot_core::Block;

    use super::{ExConvCode, ExConvCodeConfig};
    use crate::{Gf2Ctx, Gf128Ctx};

    fn random_blocks(len: usize, seed: u64) -> Vec<Block> {
        let mut v = vec![Block::ZERO; len];
        StdRng::seed_from_u64(seed).fill(cast_slice_mut::<_, u8>(&mut v));
        v
    }

    fn xor(a: &[Block], b: &[Block]) -> Vec<Block> {
        a.iter().zip(b).map(|(a, b)| *a ^ *b).collect()
    }

    fn configs() -> Vec<ExConvCodeConfig> {
        let base = ExConvCodeConfig::default();
        vec![
            base,
            ExConvCodeConfig {
                accumulator_size: 24,
                ..base
            },
            ExConvCodeConfig {
                accumulator_size: 11,
                ..base
            },
            ExConvCodeConfig {
                accumulator_size: 0,
                systematic: false,
                ..base
            },
            ExConvCodeConfig {
                sticky: false,
                regular_expander: false,
                expander_weight: 21,
                ..base
            },
        ]
    }

    #[test]
    fn default_code_size() {
        let code = ExConvCode::new(100);
        assert_eq!(200, code.code_size());
        assert_eq!(100, code.message_size());
        assert_eq!(16, code.conf().accumulator_size);
        let code = ExConvCode::new_with_conf(
            100,
            ExConvCodeConfig {
                code_size: 250,
                ..Default::default()
            },
        );
        assert_eq!(250, code.code_size());
    }

    #[test]
    fn systematic_zero_tail_keeps_message() {
        for conf in configs().into_iter().filter(|c| c.systematic) {
            let k = 300;
            let code = ExConvCode::new_with_conf(k, conf);
            let msg = random_blocks(k, 7);
            let mut e = msg.clone();
            e.resize(code.code_size(), Block::ZERO);
            code.dual_encode(&mut e, Gf2Ctx);
            assert_eq!(msg, e[..k]);
        }
    }

    #[test]
    fn encoding_is_deterministic_and_mixes() {
        let code = ExConvCode::new(256);
        let e = random_blocks(512, 1);
        let mut a = e.clone();
        let mut b = e.clone();
        code.dual_encode(&mut a, Gf2Ctx);
        code.dual_encode(&mut b, Gf2Ctx);
        assert_eq!(a[..256], b[..256]);
        assert_ne!(e[..256], a[..256]);
    }

    #[test]
    fn tiny_codes_stay_in_range() {
        // fewer parity rows than accumulator width
        for conf in configs() {
            let k = conf.expander_weight;
            let code = ExConvCode::new_with_conf(
                k,
                ExConvCodeConfig {
                    code_size: 2 * k + 1,
                    ..conf
                },
            );
            let mut e = random_blocks(code.code_size(), 3);
            code.dual_encode(&mut e, Gf2Ctx);
        }
    }

    #[test]
    fn bytes_match_block_lsbs() {
        for conf in configs() {
            let code = ExConvCode::new_with_conf(1000, conf);
            let mut blocks = random_blocks(code.code_size(), 11);
            let mut bytes: Vec<u8> = blocks.iter().map(|b| b.lsb() as u8).collect();
            code.dual_encode2(&mut blocks, &mut bytes, Gf2Ctx);
            for (blk, byte) in blocks[..1000].iter().zip(&bytes[..1000]) {
                assert_eq!(blk.lsb() as u8, *byte);
            }
        }
    }

    #[test]
    fn gf128_context_is_linear() {
        let code = ExConvCode::new(128);
        let a = random_blocks(256, 5);
        let b = random_blocks(256, 6);
        let (mut ea, mut eb, mut eab) = (a.clone(), b.clone(), xor(&a, &b));
        code.dual_encode(&mut ea, Gf128Ctx);
        code.dual_encode(&mut eb, Gf128Ctx);
        code.dual_encode(&mut eab, Gf128Ctx);
        assert_eq!(xor(&ea[..128], &eb[..128]), eab[..128]);
        let mut e2 = a.clone();
        code.dual_encode(&mut e2, Gf2Ctx);
        assert_ne!(e2[..128], ea[..128]);
    }

    #[test]
    fn default_seed_known_answer() {
        let conf = ExConvCodeConfig {
            code_size: 40,
            accumulator_size: 24,
            ..Default::default()
        };
        let code = ExConvCode::new_with_conf(6, conf);
        let e: Vec<Block> = (0..40).map(|i| Block::pack(i + 1, i << 32)).collect();

        let mut gf128 = e.clone();
        code.dual_encode(&mut gf128, Gf128Ctx);
        let expected: [u128; 6] = [
            0xde5045e82437f7945dcc24ff47aebc6c,
            0x2fdf17585dcd1427d31f44a8c3a90035,
            0xedd266bbf9a241a216eeae67b020040d,
            0x1488f059ed14c64ef8e8bdcb425f7a29,
            0xfd8bd0047e92e76c1b257c0aa088bce8,
            0x310a7fc373470f44f3eba26a9cc70bda,
        ];
        assert_eq!(expected.map(Block::from), gf128[..6]);

        let mut gf2 = e;
        code.dual_encode(&mut gf2, Gf2Ctx);
        let expected: [u128; 6] = [
            0x1b000000000000000000000020,
            0x20000000000000000000000010,
            0x200000000000000000000000e,
            0x7000000000000000000000031,
            0x400000000000000000000000d,
            0x3100000000000000000000001e,
        ];
        assert_eq!(expected.map(Block::from), gf2[..6]);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]
        #[test]
        fn linear_over_gf2(seed_a: u64, seed_b: u64, k in 32_usize..600, conf_idx in 0_usize..5) {
            let code = ExConvCode::new_with_conf(k, configs()[conf_idx]);
            let a = random_blocks(code.code_size(), seed_a);
            let b = random_blocks(code.code_size(), seed_b);
            let (mut ea, mut eb, mut eab) = (a.clone(), b.clone(), xor(&a, &b));
            code.dual_encode(&mut ea, Gf2Ctx);
            code.dual_encode(&mut eb, Gf2Ctx);
            code.dual_encode(&mut eab, Gf2Ctx);
            prop_assert_eq!(xor(&ea[..k], &eb[..k]), eab[..k].to_vec());
        }
    }
}
