use bytemuck::Pod;
use silentot_core::Block;

use super::expander_modd::ExpanderModd;
use crate::CoeffCtx;

/// Seed offset of the generator for the regular columns.
const REGULAR_SEED: Block = Block::pack(23421341, 342342134);

/// The sparse expander matrix `B` of the code.
///
/// Every output row sums `weight` entries of the input. In regular mode half
/// of them (rounded up) come one from each of `weight - weight / 2` equally
/// sized buckets of the input, the rest are uniform over the whole input.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ExpanderCode {
    seed: Block,
    // number of input elements, i.e. columns of B
    input_size: usize,
    weight: usize,
    regular: bool,
}

impl ExpanderCode {
    /// # Panics
    /// If `input_size` is smaller than the expander weight.
    pub(crate) fn new(input_size: usize, weight: usize, regular: bool, seed: Block) -> Self {
        assert!(
            input_size >= weight,
            "expander input of size {input_size} is smaller than weight {weight}"
        );
        Self {
            seed,
            input_size,
            weight,
            regular,
        }
    }

    /// Compute `out = B · inp`, or `out += B · inp` if `ADD` is set.
    pub(crate) fn expand<F: Pod, C: CoeffCtx<F>, const ADD: bool>(
        &self,
        inp: &[F],
        out: &mut [F],
        ctx: C,
    ) {
        debug_assert_eq!(self.input_size, inp.len());
        let mut uniform = self.weight;
        let mut uni_gen = ExpanderModd::new(self.seed, self.input_size as u64);
        let mut reg_gen = if self.regular {
            uniform = self.weight / 2;
            let reg = self.weight - uniform;
            let step = self.input_size / reg;
            Some((ExpanderModd::new(self.seed ^ REGULAR_SEED, step as u64), reg, step))
        } else {
            None
        };

        for out in out.iter_mut() {
            let mut acc = if ADD { *out } else { ctx.zero() };
            if let Some((reg_gen, reg, step)) = reg_gen.as_mut() {
                for j in 0..*reg {
                    ctx.plus(&mut acc, &inp[reg_gen.get() + j * *step]);
                }
            }
            for _ in 0..uniform {
                ctx.plus(&mut acc, &inp[uni_gen.get()]);
            }
            *out = acc;
        }
    }
}
