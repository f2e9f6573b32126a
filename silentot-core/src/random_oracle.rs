//! Random oracle instantiated with blake3.
//!
//! Used wherever the protocols need a hash with 256-bit output, most notably
//! for the digest exchanged in the malicious consistency check.

pub type RandomOracle = blake3::Hasher;
pub type Hash = blake3::Hash;

/// Hash `input` with the random oracle.
pub fn hash(input: &[u8]) -> Hash {
    blake3::hash(input)
}
