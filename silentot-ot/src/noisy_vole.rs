//! Noisy-Vole computes for chosen c and delta, a and b s.t. a = b + c * delta
//! in GF(2^128).
//!
//! The malicious Silent OT check uses it with a single `c`, the sender's Δ,
//! and the receiver's challenge sum as `delta`. The 128 base OTs are received
//! with the bits of `delta` as choices.

use std::io;

use bytemuck::{cast_slice, cast_slice_mut};
use rand::{Rng, SeedableRng};
use silentot_core::{
    Block, alloc::allocate_zeroed_vec, aes_rng::AesRng, tokio_rayon::spawn_compute,
};
use silentot_net::{Connection, ConnectionError};
use subtle::{Choice, ConditionallySelectable};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::Level;

use crate::phase;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("unable to establish sub connection")]
    Connection(#[from] ConnectionError),
    #[error("error in sending/receiving noisy vole data")]
    Io(#[from] io::Error),
    #[error("noisy vole requires {expected} base OTs, got {actual}")]
    BaseOtCount { expected: usize, actual: usize },
}

pub struct NoisyVoleSender {
    conn: Connection,
}

impl NoisyVoleSender {
    pub fn new(conn: Connection) -> Self {
        Self { conn }
    }

    /// For chosen delta compute b s.t. a = b + c * delta.
    ///
    /// Operations are performed in GF(2^128). Note that the bits of `delta`
    /// must be equal to the choice bits for the passed base OTs.
    #[tracing::instrument(target = "silentot_metrics", level = Level::DEBUG, skip_all, fields(phase = phase::NOISY_VOLE))]
    pub async fn send(
        &mut self,
        size: usize,
        delta: Block,
        ots: Vec<Block>,
    ) -> Result<Vec<Block>, Error> {
        if ots.len() != Block::BITS {
            return Err(Error::BaseOtCount {
                expected: Block::BITS,
                actual: ots.len(),
            });
        }
        let mut msg: Vec<Block> = allocate_zeroed_vec(Block::BITS * size);
        let (_, mut rx) = self.conn.byte_stream().await?;
        rx.read_exact(cast_slice_mut(&mut msg)).await?;

        let jh = spawn_compute(move || {
            let mut b = vec![Block::ZERO; size];
            for ((ot, bit), msg) in ots.iter().zip(delta.bits()).zip(msg.chunks_exact(size.max(1))) {
                let mut rng = AesRng::from_seed(*ot);
                for (bj, mj) in b.iter_mut().zip(msg) {
                    let tmp: Block = rng.random();
                    *bj ^= tmp ^ Block::conditional_select(&Block::ZERO, mj, Choice::from(bit as u8));
                }
            }
            b
        });

        Ok(jh.await.expect("worker panic"))
    }
}

pub struct NoisyVoleReceiver {
    conn: Connection,
}

impl NoisyVoleReceiver {
    pub fn new(conn: Connection) -> Self {
        Self { conn }
    }

    /// For chosen c compute a s.t. a = b + c * delta.
    ///
    /// Operations are performed in GF(2^128). Note that the bits of `delta` for
    /// the [`NoisyVoleSender`] must be equal to the choice bits for the
    /// passed base OTs.
    #[tracing::instrument(target = "silentot_metrics", level = Level::DEBUG, skip_all, fields(phase = phase::NOISY_VOLE))]
    pub async fn receive(
        &mut self,
        c: Vec<Block>,
        ots: Vec<[Block; 2]>,
    ) -> Result<Vec<Block>, Error> {
        if ots.len() != Block::BITS {
            return Err(Error::BaseOtCount {
                expected: Block::BITS,
                actual: ots.len(),
            });
        }
        let jh = spawn_compute(move || {
            let mut a: Vec<Block> = allocate_zeroed_vec(c.len());
            let mut msg: Vec<Block> = allocate_zeroed_vec(ots.len() * c.len());

            for (i, ([ot0, ot1], msg)) in ots
                .into_iter()
                .zip(msg.chunks_exact_mut(c.len().max(1)))
                .enumerate()
            {
                // msg_j = r0_j + r1_j + 2^i * c_j, a_j = sum_i r0_j
                let mut rng0 = AesRng::from_seed(ot0);
                let mut rng1 = AesRng::from_seed(ot1);
                let t1 = Block::ONE << i;
                for ((aj, cj), mj) in a.iter_mut().zip(&c).zip(msg.iter_mut()) {
                    let r0: Block = rng0.random();
                    let r1: Block = rng1.random();
                    *aj ^= r0;
                    *mj = r0 ^ r1 ^ t1.gf_mul(cj);
                }
            }
            (msg, a)
        });
        let (mut tx, _) = self.conn.byte_stream().await?;
        let (msg, a) = jh.await.expect("worker panic");
        tx.write_all(cast_slice(&msg)).await?;
        Ok(a)
    }
}

#[cfg(test)]
mod tests {
    use rand::{Rng, SeedableRng, rngs::StdRng};
    use silentot_core::{Block, test_utils::init_tracing, utils::xor_inplace};
    use silentot_net::testing::local_conn;

    use crate::noisy_vole::{Error, NoisyVoleReceiver, NoisyVoleSender};

    #[tokio::test]
    async fn test_noisy_vole() {
        let _g = init_tracing();
        let (c1, c2) = local_conn().await.unwrap();
        let mut sender = NoisyVoleSender::new(c1);
        let mut receiver = NoisyVoleReceiver::new(c2);
        let mut rng = StdRng::seed_from_u64(423423);
        let r_ots: Vec<[Block; 2]> = (0..128).map(|_| rng.random()).collect();
        let delta: Block = rng.random();
        let s_ots: Vec<_> = r_ots
            .iter()
            .zip(delta.bits())
            .map(|(ots, c)| ots[c as usize])
            .collect();

        let size = 200;
        let mut c: Vec<_> = (0..size).map(|_| rng.random()).collect();

        let (mut b, a) = tokio::try_join!(
            sender.send(size, delta, s_ots),
            receiver.receive(c.clone(), r_ots)
        )
        .unwrap();

        for ci in &mut c {
            *ci = ci.gf_mul(&delta);
        }

        xor_inplace(&mut b, &c);

        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn wrong_base_ot_count() {
        let (c1, _c2) = local_conn().await.unwrap();
        let mut sender = NoisyVoleSender::new(c1);
        let res = sender.send(1, Block::ONES, vec![Block::ZERO; 127]).await;
        assert!(matches!(
            res,
            Err(Error::BaseOtCount {
                expected: 128,
                actual: 127
            })
        ));
    }
}
