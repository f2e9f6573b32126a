//! Simplest-OT base OT protocol by [[CO15]] (malicious security).
//!
//! Silent OT consumes a few hundred base OTs per run to key the PPRF, the gap
//! positions and the malicious check. [`SimplestOt`] produces them in three
//! messages:
//!
//! 1. sender → receiver: `A = a·G` and a commitment to a random seed
//! 2. receiver → sender: `B_i = b_i·G + c_i·A` for every choice bit `c_i`
//! 3. sender → receiver: the opened seed
//!
//! Keys are derived from `a·B_i` and `a·(B_i - A)` resp. `b_i·A` with a
//! hash keyed by the seed commitment. Since the receiver learns the seed only
//! after fixing its points, the OTs are uniformly distributed ("uniform
//! message security" as defined by [[MR19]]).
//!
//! [CO15]: https://eprint.iacr.org/2015/267
//! [MR19]: https://eprint.iacr.org/2019/706.pdf

use std::io;

use curve25519_dalek::{RistrettoPoint, Scalar, constants::RISTRETTO_BASEPOINT_TABLE};
use futures::{SinkExt, StreamExt};
use rand::{Rng, SeedableRng, rngs::StdRng};
use serde::{Deserialize, Serialize};
use silentot_core::{Block, rand_compat::RngCompat, random_oracle::RandomOracle};
use silentot_net::{Connection, ConnectionError, ReceiveStream};
use subtle::{Choice, ConditionallySelectable};
use tracing::Level;

use crate::{Connected, Malicious, RotReceiver, RotSender, SemiHonest, phase};

/// Sender and Receiver for the base OT protocol.
pub struct SimplestOt {
    rng: StdRng,
    conn: Connection,
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("unable to open base OT stream")]
    Connection(#[from] ConnectionError),
    #[error("io error during base OTs")]
    Io(#[from] io::Error),
    #[error("peer sent {actual} points, expected {expected}")]
    PointCount { expected: usize, actual: usize },
    #[error("peer closed the base OT stream early")]
    UnexpectedEnd,
    #[error("unexpected base OT message, expected {0}")]
    UnexpectedMessage(&'static str),
    #[error("opened seed does not match its commitment")]
    SeedCommitment,
}

#[derive(Serialize, Deserialize)]
enum SenderMsg {
    Setup {
        point: RistrettoPoint,
        commitment: [u8; 32],
    },
    Open(Block),
}

impl SimplestOt {
    pub fn new(connection: Connection) -> Self {
        Self::new_with_rng(connection, StdRng::from_os_rng())
    }

    pub fn new_with_rng(conn: Connection, rng: StdRng) -> Self {
        Self { rng, conn }
    }

    fn random_scalar(&mut self) -> Scalar {
        Scalar::random(&mut RngCompat(&mut self.rng))
    }
}

impl Connected for SimplestOt {
    fn connection(&mut self) -> &mut Connection {
        &mut self.conn
    }
}

impl SemiHonest for SimplestOt {}

impl Malicious for SimplestOt {}

impl RotSender for SimplestOt {
    type Error = Error;

    #[allow(non_snake_case)]
    #[tracing::instrument(level = Level::DEBUG, skip_all, fields(count = count))]
    #[tracing::instrument(target = "silentot_metrics", level = Level::DEBUG, skip_all, fields(phase = phase::BASE_OT))]
    async fn send(&mut self, count: usize) -> Result<Vec<[Block; 2]>, Self::Error> {
        let (mut tx, mut rx) = self
            .conn
            .request_response_stream::<SenderMsg, Vec<RistrettoPoint>>()
            .await?;

        let a = self.random_scalar();
        let A = RISTRETTO_BASEPOINT_TABLE * &a;
        let seed: Block = self.rng.random();
        let commitment = *seed.ro_hash().as_bytes();
        tx.send(SenderMsg::Setup {
            point: A,
            commitment,
        })
        .await?;

        let B_points = next_msg(&mut rx).await?;
        if B_points.len() != count {
            return Err(Error::PointCount {
                expected: count,
                actual: B_points.len(),
            });
        }
        tx.send(SenderMsg::Open(seed)).await?;

        let kdf = KeyDerivation::new(commitment);
        let aA = A * a;
        let ots = B_points
            .iter()
            .enumerate()
            .map(|(i, B)| {
                let aB = B * a;
                [kdf.derive(i, &aB), kdf.derive(i, &(aB - aA))]
            })
            .collect();
        Ok(ots)
    }
}

impl RotReceiver for SimplestOt {
    type Error = Error;

    #[allow(non_snake_case)]
    #[tracing::instrument(level = Level::DEBUG, skip_all, fields(count = choices.len()))]
    #[tracing::instrument(target = "silentot_metrics", level = Level::DEBUG, skip_all, fields(phase = phase::BASE_OT))]
    async fn receive(&mut self, choices: &[Choice]) -> Result<Vec<Block>, Self::Error> {
        let (mut tx, mut rx) = self
            .conn
            .request_response_stream::<Vec<RistrettoPoint>, SenderMsg>()
            .await?;

        let SenderMsg::Setup {
            point: A,
            commitment,
        } = next_msg(&mut rx).await?
        else {
            return Err(Error::UnexpectedMessage("setup"));
        };

        let mut scalars = Vec::with_capacity(choices.len());
        let mut B_points = Vec::with_capacity(choices.len());
        for choice in choices {
            let b = self.random_scalar();
            let B = RISTRETTO_BASEPOINT_TABLE * &b;
            B_points.push(RistrettoPoint::conditional_select(&B, &(B + A), *choice));
            scalars.push(b);
        }
        tx.send(B_points).await?;

        let SenderMsg::Open(seed) = next_msg(&mut rx).await? else {
            return Err(Error::UnexpectedMessage("seed opening"));
        };
        if *seed.ro_hash().as_bytes() != commitment {
            return Err(Error::SeedCommitment);
        }

        let kdf = KeyDerivation::new(commitment);
        let ots = scalars
            .iter()
            .enumerate()
            .map(|(i, b)| kdf.derive(i, &(A * b)))
            .collect();
        Ok(ots)
    }
}

async fn next_msg<T>(rx: &mut ReceiveStream<T>) -> Result<T, Error>
where
    ReceiveStream<T>: futures::Stream<Item = Result<T, io::Error>> + Unpin,
{
    Ok(rx.next().await.ok_or(Error::UnexpectedEnd)??)
}

/// Hashes shared points to OT keys. The hasher is keyed with the seed
/// commitment, which is public once the seed is opened.
struct KeyDerivation {
    hasher: RandomOracle,
}

impl KeyDerivation {
    fn new(commitment: [u8; 32]) -> Self {
        Self {
            hasher: RandomOracle::new_keyed(&commitment),
        }
    }

    fn derive(&self, idx: usize, point: &RistrettoPoint) -> Block {
        let mut hasher = self.hasher.clone();
        hasher.update(&(idx as u64).to_le_bytes());
        hasher.update(point.compress().as_bytes());
        let mut key = Block::ZERO;
        hasher.finalize_xof().fill(key.as_mut_bytes());
        key
    }
}
