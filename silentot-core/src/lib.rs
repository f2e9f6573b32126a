//! Core utilities for the SilentOT protocol crates.
//!
//! The central type is the 128-bit [`Block`], which doubles as an element of
//! GF(2^128) (see [`block::gf128`]). Around it this crate provides the
//! symmetric primitives the protocols are built from: fixed-key AES hashes
//! ([`aes_hash`]), an AES based CSPRNG ([`aes_rng`]) and a random oracle
//! ([`random_oracle`]).

pub mod aes_hash;
pub mod aes_rng;
pub mod alloc;
pub mod block;
pub mod rand_compat;
pub mod random_oracle;
#[cfg(feature = "__testing")]
pub mod test_utils;
#[cfg(feature = "tokio-rayon")]
pub mod tokio_rayon;
pub mod utils;

pub use block::Block;

/// Number of Blocks for which hardware accelerated AES can make use of ILP.
///
/// This corresponds to `ParBlocksSize` in [`aes::cipher::ParBlocksSizeUser`]
/// for the SIMD backend on the target architecture. Do not depend on the
/// concrete value.
#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
pub const AES_PAR_BLOCKS: usize = 9;
#[cfg(target_arch = "aarch64")]
pub const AES_PAR_BLOCKS: usize = 21;
#[cfg(not(any(target_arch = "x86", target_arch = "x86_64", target_arch = "aarch64")))]
pub const AES_PAR_BLOCKS: usize = 4;
