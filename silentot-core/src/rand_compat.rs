//! Bridge from `rand_core` 0.9 RNGs to the `rand_core` 0.6 traits.
//!
//! `curve25519-dalek` still samples scalars and points through `rand_core`
//! 0.6, while the rest of the workspace is on 0.9.
use rand_core::{CryptoRng, RngCore};

/// Implements [`rand_core_0_6::RngCore`] and [`rand_core_0_6::CryptoRng`] for
/// the wrapped 0.9 RNG.
pub struct RngCompat<R>(pub R);

impl<R: RngCore> rand_core_0_6::RngCore for RngCompat<R> {
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
        self.0.fill_bytes(dest);
    }

    #[inline]
    fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), rand_core_0_6::Error> {
        self.0.fill_bytes(dest);
        Ok(())
    }
}

impl<R: CryptoRng> rand_core_0_6::CryptoRng for RngCompat<R> {}
