//! Silent OT extension [[BCG+19](https://eprint.iacr.org/2019/1159)].
//!
//! A run of the protocol consists of
//! 1. base OTs (unless provided via `set_silent_base_ots`),
//! 2. a regular multi-point PPRF expansion producing the sparse noise,
//! 3. optional gap positions, derandomized with one base OT each,
//! 4. the optional malicious consistency check of
//!    [[YWL+20](https://dl.acm.org/doi/pdf/10.1145/3372297.3417276)],
//! 5. compression with the dual of an expand-convolute (or expand-accumulate)
//!    code.
//!
//! The sender ends up with `B` and Δ, the receiver with `A` and choice bits
//! `c` such that `A[i] = B[i] ^ c[i] * Δ`.
#![allow(non_snake_case)]
use std::{io, marker::PhantomData, num::NonZeroUsize, thread};

use bitvec::{order::Lsb0, vec::BitVec};
use bytemuck::{cast_slice, cast_slice_mut};
use futures::{SinkExt, StreamExt};
use rand::{Rng, SeedableRng, rngs::StdRng};
use silentot_codes::{
    Gf2Ctx,
    ex_conv::{ExConvCode, ExConvCodeConfig},
};
use silentot_core::{
    AES_PAR_BLOCKS, Block,
    aes_hash::{AesHash, FIXED_KEY_HASH},
    alloc::allocate_zeroed_vec,
    random_oracle::Hash,
    tokio_rayon::spawn_compute,
};
use silentot_net::{Connection, ConnectionError};
use silentot_pprf::{
    OutFormat, PARALLEL_TREES, PprfConfig, PprfOutput, RegularPprfReceiver, RegularPprfSender,
};
use subtle::{Choice, ConditionallySelectable};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{Level, debug, warn};
use zeroize::{Zeroize, Zeroizing};

use crate::{
    Connected, Malicious, MaliciousMarker, RandChoiceRotReceiver, RotReceiver, RotSender,
    Security, SemiHonest, SemiHonestMarker,
    base::SimplestOt,
    noisy_vole::{self, NoisyVoleReceiver, NoisyVoleSender},
    phase, random_choices,
};

pub const SECURITY_PARAMETER: usize = 128;
/// Ratio of the noise vector length to the number of OTs. Only 2 is supported.
pub const SCALER: usize = 2;

pub type SemiHonestSilentOtSender = SilentOtSender<SemiHonestMarker>;
pub type SemiHonestSilentOtReceiver = SilentOtReceiver<SemiHonestMarker>;

pub type MaliciousSilentOtSender = SilentOtSender<MaliciousMarker>;
pub type MaliciousSilentOtReceiver = SilentOtReceiver<MaliciousMarker>;

/// The code used to compress the noise vector.
#[derive(Default, Debug, Copy, Clone, PartialEq, Eq)]
pub enum MultType {
    /// Expand-convolute with expander weight 7 and accumulator size 24.
    #[default]
    ExConv7x24,
    /// Expand-convolute with expander weight 21 and accumulator size 24.
    ExConv21x24,
    /// Expand-accumulate with expander weight 7. Experimental.
    ExAcc7,
    /// Expand-accumulate with expander weight 11. Experimental.
    ExAcc11,
    /// Expand-accumulate with expander weight 21. Experimental.
    ExAcc21,
    /// Expand-accumulate with expander weight 40. Experimental.
    ExAcc40,
}

impl MultType {
    /// Assumed minimum distance of the code relative to its length.
    pub fn min_dist_ratio(self) -> f64 {
        match self {
            MultType::ExConv7x24 => 0.15,
            MultType::ExConv21x24 => 0.2,
            MultType::ExAcc7 => 0.05,
            MultType::ExAcc11 | MultType::ExAcc21 => 0.1,
            MultType::ExAcc40 => 0.2,
        }
    }

    pub fn expander_weight(self) -> usize {
        match self {
            MultType::ExConv7x24 | MultType::ExAcc7 => 7,
            MultType::ExAcc11 => 11,
            MultType::ExConv21x24 | MultType::ExAcc21 => 21,
            MultType::ExAcc40 => 40,
        }
    }

    /// The expand-accumulate codes have no security analysis comparable to
    /// the expand-convolute codes.
    pub fn is_experimental(self) -> bool {
        !matches!(self, MultType::ExConv7x24 | MultType::ExConv21x24)
    }

    fn code_config(self, code_size: usize) -> ExConvCodeConfig {
        let ex_conv = !self.is_experimental();
        ExConvCodeConfig {
            code_size,
            // an expand-accumulate code is an expand-convolute code whose
            // accumulator only has the sticky sub-diagonal
            accumulator_size: if ex_conv { 24 } else { 0 },
            sticky: true,
            systematic: ex_conv,
            expander_weight: self.expander_weight(),
            ..Default::default()
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid silent OT configuration: {0}")]
    Configuration(String),
    #[error("silent OT operation out of order: {0}")]
    ProtocolOrder(&'static str),
    #[error("unable to perform base OTs for silent OTs")]
    BaseOt(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("error in pprf expansion for silent OTs")]
    Pprf(#[from] silentot_pprf::Error),
    #[error("io error during silent OT")]
    Io(#[from] io::Error),
    #[error("error in connection to peer")]
    Connection(#[from] ConnectionError),
    #[error("error in noisy vole during malicious check")]
    NoisyVole(#[from] noisy_vole::Error),
    #[error("sender did not transmit hash in malicious check")]
    MissingSenderHash,
    #[error("receiver did not transmit seed in malicious check")]
    MissingReceiverSeed,
    #[error("receiver did not transmit choice correction")]
    MissingCorrection,
    #[error("received {actual} correction bits, expected {expected}")]
    CorrectionLength { expected: usize, actual: usize },
    #[error("malicious check failed")]
    SecurityAbort,
}

/// Parameters of one silent OT run. Sender and receiver must use equal
/// configurations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    num_ots: usize,
    pprf: PprfConfig,
    gap: usize,
    mult_type: MultType,
    malicious: bool,
}

impl Config {
    /// Derive the noise parameters for `num_ots` OTs.
    ///
    /// The noise weight is chosen such that the code, with its assumed
    /// minimum distance, provides [`SECURITY_PARAMETER`] bits of security.
    pub fn configure(
        num_ots: usize,
        scaler: usize,
        mult_type: MultType,
        malicious: bool,
    ) -> Result<Self, Error> {
        if scaler != SCALER {
            return Err(Error::Configuration(format!(
                "only a scaler of {SCALER} is supported, got {scaler}"
            )));
        }
        if num_ots == 0 {
            return Err(Error::Configuration("num_ots must be positive".into()));
        }
        if mult_type.is_experimental() {
            warn!(?mult_type, "expand-accumulate codes are experimental");
        }
        let num_partitions = get_reg_noise_weight(mult_type.min_dist_ratio(), SECURITY_PARAMETER)?;
        let size_per = (num_ots * scaler)
            .div_ceil(num_partitions)
            .next_multiple_of(PARALLEL_TREES);
        let pprf = PprfConfig::new(size_per, num_partitions)?;
        debug!(num_ots, num_partitions, size_per, ?mult_type, malicious, "configured silent OT");
        Ok(Self {
            num_ots,
            pprf,
            gap: 0,
            mult_type,
            malicious,
        })
    }

    /// Append `gap` noise positions which are not covered by the PPRF. Each
    /// gap position is derandomized with one additional base OT.
    pub fn with_gap(mut self, gap: usize) -> Self {
        self.gap = gap;
        self
    }

    pub fn num_ots(&self) -> usize {
        self.num_ots
    }

    /// Noise weight `t`, the number of PPRF trees.
    pub fn num_partitions(&self) -> usize {
        self.pprf.pnt_count()
    }

    /// Domain size of each PPRF tree.
    pub fn size_per(&self) -> usize {
        self.pprf.domain()
    }

    pub fn gap(&self) -> usize {
        self.gap
    }

    pub fn mult_type(&self) -> MultType {
        self.mult_type
    }

    pub fn is_malicious(&self) -> bool {
        self.malicious
    }

    pub fn pprf_conf(&self) -> PprfConfig {
        self.pprf
    }

    /// Length of the noise vector, which is the code size.
    pub fn noise_len(&self) -> usize {
        self.pprf.size() + self.gap
    }

    /// Base OTs consumed by one run, ordered as PPRF, gap and malicious check
    /// OTs.
    pub fn base_ot_count(&self) -> usize {
        self.pprf.base_ot_count() + self.gap + self.malicious as usize * SECURITY_PARAMETER
    }

    fn code(&self) -> ExConvCode {
        ExConvCode::new_with_conf(self.num_ots, self.mult_type.code_config(self.noise_len()))
    }

    fn check_count(&self, count: usize) -> Result<(), Error> {
        if count != self.num_ots {
            return Err(Error::Configuration(format!(
                "configured for {} OTs, requested {count}",
                self.num_ots
            )));
        }
        Ok(())
    }
}

/// Number of noisy positions `t` for a code with relative minimum distance
/// `min_dist_ratio` such that syndrome decoding has `sec_param` bits of
/// security. The result is at least 128 and a multiple of
/// [`PARALLEL_TREES`].
pub fn get_reg_noise_weight(min_dist_ratio: f64, sec_param: usize) -> Result<usize, Error> {
    if !(min_dist_ratio > 0.0 && min_dist_ratio <= 0.5) {
        return Err(Error::Configuration(format!(
            "min_dist_ratio must be in (0, 0.5], got {min_dist_ratio}"
        )));
    }
    let d = (1.0 - 2.0 * min_dist_ratio).log2();
    let t = 128.max((-(sec_param as f64) / d).ceil() as usize);
    Ok(t.next_multiple_of(PARALLEL_TREES))
}

fn default_num_threads() -> usize {
    thread::available_parallelism().map_or(1, NonZeroUsize::get)
}

fn base_ot_error<E: std::error::Error + Send + Sync + 'static>(err: E) -> Error {
    Error::BaseOt(Box::new(err))
}

pub struct SilentOtSender<S, B = SimplestOt> {
    conn: Connection,
    base_ot: Option<B>,
    rng: StdRng,
    mult_type: MultType,
    num_threads: usize,
    config: Option<Config>,
    silent_base_ots: Option<Vec<[Block; 2]>>,
    s: PhantomData<S>,
}

impl<S: Security> SilentOtSender<S> {
    /// Create a sender which generates its base OTs with [`SimplestOt`].
    pub fn new(mut conn: Connection) -> Self {
        let base_ot = SimplestOt::new(conn.sub_connection());
        Self::new_with_base_ot(conn, Some(base_ot))
    }

    /// Create a sender without a base OT source. The base OTs must be set
    /// with [`Self::set_silent_base_ots`] before every run.
    pub fn new_without_base_ot(conn: Connection) -> Self {
        Self::new_with_base_ot(conn, None)
    }
}

impl<S, B> SilentOtSender<S, B>
where
    S: Security,
    B: RotSender,
    B::Error: std::error::Error + Send + Sync + 'static,
{
    pub fn new_with_base_ot(conn: Connection, base_ot: Option<B>) -> Self {
        Self {
            conn,
            base_ot,
            rng: StdRng::from_os_rng(),
            mult_type: MultType::default(),
            num_threads: default_num_threads(),
            config: None,
            silent_base_ots: None,
            s: PhantomData,
        }
    }

    /// Code used by subsequent [configurations](`Self::configure`).
    pub fn with_mult_type(mut self, mult_type: MultType) -> Self {
        self.mult_type = mult_type;
        self
    }

    /// Maximum number of threads used for the PPRF expansion.
    pub fn with_num_threads(mut self, num_threads: usize) -> Self {
        self.num_threads = num_threads.max(1);
        self
    }

    /// Configure the next run for `num_ots` OTs. Discards base OTs set for a
    /// previous configuration.
    pub fn configure(&mut self, num_ots: usize, scaler: usize) -> Result<Config, Error> {
        let conf = Config::configure(num_ots, scaler, self.mult_type, S::MALICIOUS_SECURITY)?;
        self.set_config(conf)?;
        Ok(conf)
    }

    /// Use an explicit configuration, e.g. one with [gap](`Config::with_gap`)
    /// positions.
    pub fn set_config(&mut self, conf: Config) -> Result<(), Error> {
        if conf.is_malicious() != S::MALICIOUS_SECURITY {
            return Err(Error::Configuration(
                "config security does not match the sender".into(),
            ));
        }
        self.clear();
        self.config = Some(conf);
        Ok(())
    }

    pub fn config(&self) -> Option<Config> {
        self.config
    }

    /// Number of base OTs required by the current configuration.
    pub fn silent_base_ot_count(&self) -> Result<usize, Error> {
        self.config
            .map(|conf| conf.base_ot_count())
            .ok_or(Error::ProtocolOrder("silent OT sender is not configured"))
    }

    /// Provide the base OTs for the next run, ordered as returned by the base
    /// OT sender for [`Self::silent_base_ot_count`] OTs.
    pub fn set_silent_base_ots(&mut self, base_ots: Vec<[Block; 2]>) -> Result<(), Error> {
        let expected = self.silent_base_ot_count()?;
        if base_ots.len() != expected {
            return Err(Error::Configuration(format!(
                "expected {expected} base OTs, got {}",
                base_ots.len()
            )));
        }
        self.silent_base_ots = Some(base_ots);
        Ok(())
    }

    /// Generate the base OTs of the next run with the base OT sender.
    pub async fn gen_silent_base_ots(&mut self) -> Result<(), Error> {
        let count = self.silent_base_ot_count()?;
        let base_ot = self.base_ot.as_mut().ok_or_else(|| {
            Error::Configuration("no base OT sender and no base OTs were provided".into())
        })?;
        let base_ots = base_ot.send(count).await.map_err(base_ot_error)?;
        self.set_silent_base_ots(base_ots)
    }

    /// `count` random OTs.
    ///
    /// The correlated OTs are broken with the fixed-key hash. With malicious
    /// security the tweakable circular correlation robust hash is used.
    #[tracing::instrument(target = "silentot_metrics", level = Level::DEBUG, skip_all, fields(phase = phase::SILENT_RANDOM_EXTENSION))]
    pub async fn random_send(&mut self, count: usize) -> Result<Vec<[Block; 2]>, Error> {
        // Δ only lives for this run
        let delta = Zeroizing::new(self.rng.random::<Block>());
        let correlated = self.silent_send(count, *delta).await?;
        let masked_delta = Zeroizing::new(*delta & Block::MASK_LSB);

        let ots = spawn_compute(move || {
            let mut ots = vec![[Block::ZERO; 2]; count];
            for ((chunk_idx, ot_chunk), corr_chunk) in ots
                .chunks_mut(AES_PAR_BLOCKS)
                .enumerate()
                .zip(correlated.chunks(AES_PAR_BLOCKS))
            {
                for (ots, corr) in ot_chunk.iter_mut().zip(corr_chunk) {
                    let masked = *corr & Block::MASK_LSB;
                    *ots = [masked, masked ^ *masked_delta]
                }
                if S::MALICIOUS_SECURITY {
                    // tweak is the index of the OT, not of the message
                    FIXED_KEY_HASH.tccr_hash_slice_mut(cast_slice_mut(ot_chunk), |i| {
                        Block::from(chunk_idx * AES_PAR_BLOCKS + i / 2)
                    });
                } else {
                    FIXED_KEY_HASH.cr_hash_slice_mut(cast_slice_mut(ot_chunk));
                }
            }
            ots
        })
        .await
        .expect("worker panic");
        Ok(ots)
    }

    /// `count` Δ-correlated OTs `B`, where the receiver obtains
    /// `A[i] = B[i] ^ c[i] * Δ`.
    #[tracing::instrument(target = "silentot_metrics", level = Level::DEBUG, skip_all, fields(phase = phase::SILENT_CORRELATED_EXTENSION))]
    pub async fn correlated_send(&mut self, count: usize, delta: Block) -> Result<Vec<Block>, Error> {
        self.silent_send(count, delta).await
    }

    /// `count` random OTs whose choices are chosen by the receiver with
    /// [`SilentOtReceiver::receive_chosen`].
    #[tracing::instrument(target = "silentot_metrics", level = Level::DEBUG, skip_all, fields(phase = phase::CHOSEN_CONVERSION))]
    pub async fn send_chosen(&mut self, count: usize) -> Result<Vec<[Block; 2]>, Error> {
        let mut ots = self.random_send(count).await?;
        let mut conn = self.conn.sub_connection();
        let (_, mut rx) = conn.stream::<BitVec<u8, Lsb0>>().await?;
        let correction = rx.next().await.ok_or(Error::MissingCorrection)??;
        if correction.len() != count {
            return Err(Error::CorrectionLength {
                expected: count,
                actual: correction.len(),
            });
        }
        for ([m0, m1], bit) in ots.iter_mut().zip(correction.iter().by_vals()) {
            Block::conditional_swap(m0, m1, Choice::from(bit as u8));
        }
        Ok(ots)
    }

    /// Zeroize and drop the base OTs. The configuration is kept.
    pub fn clear(&mut self) {
        if let Some(mut base_ots) = self.silent_base_ots.take() {
            base_ots.zeroize();
        }
    }

    fn ensure_configured(&mut self, count: usize) -> Result<Config, Error> {
        match self.config {
            Some(conf) if conf.num_ots() == count => Ok(conf),
            Some(conf) if self.silent_base_ots.is_some() => {
                conf.check_count(count)?;
                Ok(conf)
            }
            _ => self.configure(count, SCALER),
        }
    }

    async fn silent_send(&mut self, count: usize, delta: Block) -> Result<Vec<Block>, Error> {
        let conf = self.ensure_configured(count)?;
        if self.silent_base_ots.is_none() {
            self.gen_silent_base_ots().await?;
        }
        let mut base_ots = self
            .silent_base_ots
            .take()
            .expect("base OTs are set above");
        let pprf_conf = conf.pprf_conf();
        let mal_check_ots = base_ots.split_off(pprf_conf.base_ot_count() + conf.gap());
        let gap_ots = base_ots.split_off(pprf_conf.base_ot_count());

        let mut pprf_sender = RegularPprfSender::new(pprf_conf);
        pprf_sender.set_base(base_ots)?;
        let mut pprf_conn = self.conn.sub_connection();
        let output = pprf_sender
            .expand(
                &mut pprf_conn,
                &[delta],
                self.rng.random(),
                PprfOutput::interleaved(&pprf_conf),
                true,
                self.num_threads,
            )
            .await?;
        pprf_sender.clear();
        let PprfOutput::Interleaved(mut B) = output else {
            unreachable!("pprf returns the requested output format")
        };

        if conf.gap() > 0 {
            let mut gap_conn = self.conn.sub_connection();
            send_gap(&mut gap_conn, &mut B, &gap_ots, delta).await?;
        }

        if S::MALICIOUS_SECURITY {
            let mut mal_conn = self.conn.sub_connection();
            B = ferret_mal_check_send(&mut mal_conn, delta, B, mal_check_ots).await?;
        }

        let code = conf.code();
        let B = spawn_compute(move || {
            code.dual_encode(&mut B, Gf2Ctx);
            B.truncate(count);
            B
        })
        .await
        .expect("worker panic");
        Ok(B)
    }
}

/// Base OT choices and malicious check values sampled by the receiver before
/// the base OTs are performed.
struct BaseChoices {
    pprf: Vec<u8>,
    gap: Vec<Choice>,
    mal_check_seed: Block,
    mal_check_x: Block,
}

pub struct SilentOtReceiver<S, B = SimplestOt> {
    conn: Connection,
    base_ot: Option<B>,
    rng: StdRng,
    mult_type: MultType,
    num_threads: usize,
    config: Option<Config>,
    base_choices: Option<BaseChoices>,
    silent_base_ots: Option<Vec<Block>>,
    s: PhantomData<S>,
}

impl<S: Security> SilentOtReceiver<S> {
    /// Create a receiver which generates its base OTs with [`SimplestOt`].
    pub fn new(mut conn: Connection) -> Self {
        let base_ot = SimplestOt::new(conn.sub_connection());
        Self::new_with_base_ot(conn, Some(base_ot))
    }

    /// Create a receiver without a base OT source. The base OTs must be
    /// received with the choices of [`Self::sample_silent_base_choices`] and
    /// set with [`Self::set_silent_base_ots`] before every run.
    pub fn new_without_base_ot(conn: Connection) -> Self {
        Self::new_with_base_ot(conn, None)
    }
}

impl<S, B> SilentOtReceiver<S, B>
where
    S: Security,
    B: RotReceiver,
    B::Error: std::error::Error + Send + Sync + 'static,
{
    pub fn new_with_base_ot(conn: Connection, base_ot: Option<B>) -> Self {
        Self {
            conn,
            base_ot,
            rng: StdRng::from_os_rng(),
            mult_type: MultType::default(),
            num_threads: default_num_threads(),
            config: None,
            base_choices: None,
            silent_base_ots: None,
            s: PhantomData,
        }
    }

    pub fn with_mult_type(mut self, mult_type: MultType) -> Self {
        self.mult_type = mult_type;
        self
    }

    pub fn with_num_threads(mut self, num_threads: usize) -> Self {
        self.num_threads = num_threads.max(1);
        self
    }

    pub fn configure(&mut self, num_ots: usize, scaler: usize) -> Result<Config, Error> {
        let conf = Config::configure(num_ots, scaler, self.mult_type, S::MALICIOUS_SECURITY)?;
        self.set_config(conf)?;
        Ok(conf)
    }

    pub fn set_config(&mut self, conf: Config) -> Result<(), Error> {
        if conf.is_malicious() != S::MALICIOUS_SECURITY {
            return Err(Error::Configuration(
                "config security does not match the receiver".into(),
            ));
        }
        self.clear();
        self.config = Some(conf);
        Ok(())
    }

    pub fn config(&self) -> Option<Config> {
        self.config
    }

    pub fn silent_base_ot_count(&self) -> Result<usize, Error> {
        self.config
            .map(|conf| conf.base_ot_count())
            .ok_or(Error::ProtocolOrder("silent OT receiver is not configured"))
    }

    /// Sample the choice bits for the base OTs of the next run.
    ///
    /// The choices of the PPRF OTs encode the noisy positions, followed by
    /// the random gap choices and, with malicious security, the bits of the
    /// check value `x = Σ seed^(p + 1)` over all noisy positions `p`.
    pub fn sample_silent_base_choices(&mut self) -> Result<Vec<Choice>, Error> {
        let conf = self
            .config
            .ok_or(Error::ProtocolOrder("silent OT receiver is not configured"))?;
        let pprf_conf = conf.pprf_conf();
        let pprf =
            pprf_conf.sample_choice_bits(pprf_conf.size(), OutFormat::Interleaved, &mut self.rng)?;
        let gap = random_choices(conf.gap(), &mut self.rng);

        let mut choices: Vec<Choice> = pprf.iter().copied().map(Choice::from).collect();
        choices.extend_from_slice(&gap);

        let mut mal_check_seed = Block::ZERO;
        let mut mal_check_x = Block::ZERO;
        if S::MALICIOUS_SECURITY {
            mal_check_seed = self.rng.random();
            let mut noisy_points = pprf_conf.get_points(OutFormat::Interleaved, &pprf)?;
            noisy_points.extend(gap_points(pprf_conf.size(), &gap));
            mal_check_x = power_sum_points(mal_check_seed, &noisy_points);
            choices.extend(mal_check_x.bits().map(|b| Choice::from(b as u8)));
        }
        self.silent_base_ots = None;
        self.base_choices = Some(BaseChoices {
            pprf,
            gap,
            mal_check_seed,
            mal_check_x,
        });
        Ok(choices)
    }

    /// Provide the base OTs received with the choices of
    /// [`Self::sample_silent_base_choices`].
    pub fn set_silent_base_ots(&mut self, base_ots: Vec<Block>) -> Result<(), Error> {
        if self.base_choices.is_none() {
            return Err(Error::ProtocolOrder(
                "base OT choices must be sampled before setting base OTs",
            ));
        }
        let expected = self.silent_base_ot_count()?;
        if base_ots.len() != expected {
            return Err(Error::Configuration(format!(
                "expected {expected} base OTs, got {}",
                base_ots.len()
            )));
        }
        self.silent_base_ots = Some(base_ots);
        Ok(())
    }

    pub async fn gen_silent_base_ots(&mut self) -> Result<(), Error> {
        if self.base_ot.is_none() {
            return Err(Error::Configuration(
                "no base OT receiver and no base OTs were provided".into(),
            ));
        }
        let choices = self.sample_silent_base_choices()?;
        let base_ot = self.base_ot.as_mut().expect("checked above");
        let base_ots = base_ot.receive(&choices).await.map_err(base_ot_error)?;
        self.set_silent_base_ots(base_ots)
    }

    /// `count` random OTs and their random choices.
    #[tracing::instrument(target = "silentot_metrics", level = Level::DEBUG, skip_all, fields(phase = phase::SILENT_RANDOM_EXTENSION))]
    pub async fn random_receive(&mut self, count: usize) -> Result<(Vec<Block>, Vec<Choice>), Error> {
        let (ots, _) = self.silent_receive(count, ChoiceBitPacking::Packed).await?;

        let (ots, choices) = spawn_compute(move || {
            let mut ots = ots;
            let choices = ots
                .iter_mut()
                .map(|block| {
                    let choice = Choice::from(block.lsb() as u8);
                    *block &= Block::MASK_LSB;
                    choice
                })
                .collect();

            if S::MALICIOUS_SECURITY {
                FIXED_KEY_HASH.tccr_hash_slice_mut(&mut ots, Block::from);
            } else {
                FIXED_KEY_HASH.cr_hash_slice_mut(&mut ots);
            }
            (ots, choices)
        })
        .await
        .expect("worker panic");
        Ok((ots, choices))
    }

    /// `count` correlated OTs and their choices, see
    /// [`SilentOtSender::correlated_send`].
    #[tracing::instrument(target = "silentot_metrics", level = Level::DEBUG, skip_all, fields(phase = phase::SILENT_CORRELATED_EXTENSION))]
    pub async fn correlated_receive(
        &mut self,
        count: usize,
    ) -> Result<(Vec<Block>, Vec<Choice>), Error> {
        let (ots, choices) = self
            .silent_receive(count, ChoiceBitPacking::NotPacked)
            .await?;
        Ok((ots, choices.expect("not choice packed")))
    }

    /// `count` correlated OTs where the choice bit is stored in the least
    /// significant bit of each block. The remaining bits are correlated with
    /// the sender's `Δ` with its lsb masked off.
    #[tracing::instrument(target = "silentot_metrics", level = Level::DEBUG, skip_all, fields(phase = phase::SILENT_CORRELATED_EXTENSION))]
    pub async fn correlated_receive_packed(&mut self, count: usize) -> Result<Vec<Block>, Error> {
        let (ots, _) = self.silent_receive(count, ChoiceBitPacking::Packed).await?;
        Ok(ots)
    }

    /// Random OTs for the chosen `choices`. The sender must call
    /// [`SilentOtSender::send_chosen`].
    #[tracing::instrument(target = "silentot_metrics", level = Level::DEBUG, skip_all, fields(phase = phase::CHOSEN_CONVERSION))]
    pub async fn receive_chosen(&mut self, choices: &[Choice]) -> Result<Vec<Block>, Error> {
        let (ots, rand_choices) = self.random_receive(choices.len()).await?;
        let correction: BitVec<u8, Lsb0> = rand_choices
            .iter()
            .zip(choices)
            .map(|(r, c)| bool::from(*r ^ *c))
            .collect();
        let mut conn = self.conn.sub_connection();
        let (mut tx, _) = conn.stream::<BitVec<u8, Lsb0>>().await?;
        tx.send(correction).await?;
        Ok(ots)
    }

    /// Drop the sampled base choices and zeroize the base OTs. The
    /// configuration is kept.
    pub fn clear(&mut self) {
        if let Some(mut base_ots) = self.silent_base_ots.take() {
            base_ots.zeroize();
        }
        if let Some(mut choices) = self.base_choices.take() {
            choices.mal_check_seed.zeroize();
            choices.mal_check_x.zeroize();
        }
    }

    fn ensure_configured(&mut self, count: usize) -> Result<Config, Error> {
        match self.config {
            Some(conf) if conf.num_ots() == count => Ok(conf),
            Some(conf) if self.base_choices.is_some() => {
                conf.check_count(count)?;
                Ok(conf)
            }
            _ => self.configure(count, SCALER),
        }
    }

    async fn silent_receive(
        &mut self,
        count: usize,
        cb_packing: ChoiceBitPacking,
    ) -> Result<(Vec<Block>, Option<Vec<Choice>>), Error> {
        let conf = self.ensure_configured(count)?;
        if self.silent_base_ots.is_none() {
            self.gen_silent_base_ots().await?;
        }
        let mut base_ots = self
            .silent_base_ots
            .take()
            .expect("base OTs are set above");
        let base_choices = self
            .base_choices
            .take()
            .expect("base OTs are only set with sampled choices");
        let pprf_conf = conf.pprf_conf();
        let mal_check_ots = base_ots.split_off(pprf_conf.base_ot_count() + conf.gap());
        let gap_ots = base_ots.split_off(pprf_conf.base_ot_count());

        let mut pprf_receiver = RegularPprfReceiver::new(pprf_conf);
        pprf_receiver.set_choice_bits(OutFormat::Interleaved, &base_choices.pprf)?;
        let mut noisy_points = pprf_receiver.get_points(OutFormat::Interleaved)?;
        pprf_receiver.set_base(base_ots)?;
        let mut pprf_conn = self.conn.sub_connection();
        let output = pprf_receiver
            .expand(
                &mut pprf_conn,
                PprfOutput::interleaved(&pprf_conf),
                true,
                self.num_threads,
            )
            .await?;
        pprf_receiver.clear();
        let PprfOutput::Interleaved(mut A) = output else {
            unreachable!("pprf returns the requested output format")
        };

        if conf.gap() > 0 {
            let mut gap_conn = self.conn.sub_connection();
            receive_gap(&mut gap_conn, &mut A, &gap_ots, &base_choices.gap).await?;
            noisy_points.extend(gap_points(pprf_conf.size(), &base_choices.gap));
        }

        if S::MALICIOUS_SECURITY {
            let mut mal_conn = self.conn.sub_connection();
            A = ferret_mal_check_receive(
                &mut mal_conn,
                A,
                base_choices.mal_check_seed,
                base_choices.mal_check_x,
                mal_check_ots,
            )
            .await?;
        }

        let code = conf.code();
        Ok(receive_compress(code, A, noisy_points, cb_packing, count).await)
    }
}

#[derive(Default, Debug, Copy, Clone, PartialEq, Eq)]
enum ChoiceBitPacking {
    #[default]
    Packed,
    NotPacked,
}

async fn receive_compress(
    code: ExConvCode,
    mut a: Vec<Block>,
    noisy_points: Vec<usize>,
    cb_packing: ChoiceBitPacking,
    count: usize,
) -> (Vec<Block>, Option<Vec<Choice>>) {
    spawn_compute(move || {
        let choices = match cb_packing {
            ChoiceBitPacking::Packed => {
                // lsb of the noisy positions is 1, all others 0
                for block in a.iter_mut() {
                    *block &= Block::MASK_LSB;
                }
                for idx in noisy_points {
                    a[idx] |= Block::ONE;
                }
                code.dual_encode(&mut a, Gf2Ctx);
                None
            }
            ChoiceBitPacking::NotPacked => {
                let mut choices: Vec<u8> = allocate_zeroed_vec(a.len());
                for idx in noisy_points {
                    choices[idx] = 1;
                }
                code.dual_encode2(&mut a, &mut choices, Gf2Ctx);
                choices.truncate(count);
                Some(choices.into_iter().map(Choice::from).collect())
            }
        };
        a.truncate(count);
        (a, choices)
    })
    .await
    .expect("worker panic")
}

/// Positions of the gap entries with choice 1 in the noise vector.
fn gap_points(pprf_size: usize, gap_choices: &[Choice]) -> impl Iterator<Item = usize> + '_ {
    gap_choices
        .iter()
        .enumerate()
        .filter(|(_, c)| bool::from(**c))
        .map(move |(j, _)| pprf_size + j)
}

/// Decryption pad of a gap message. The sender publishes
/// `pad(m1) ^ m0 ^ Δ` so that a receiver with `m1` learns `m0 ^ Δ`.
fn gap_pad(m1: Block) -> Block {
    AesHash::from_block(m1).permute_block(Block::ZERO)
}

#[tracing::instrument(target = "silentot_metrics", level = Level::DEBUG, skip_all, fields(phase = phase::GAP_CORRECTION))]
async fn send_gap(
    conn: &mut Connection,
    B: &mut Vec<Block>,
    gap_ots: &[[Block; 2]],
    delta: Block,
) -> Result<(), Error> {
    let gap_vals: Vec<Block> = gap_ots
        .iter()
        .map(|[m0, m1]| gap_pad(*m1) ^ *m0 ^ delta)
        .collect();
    B.extend(gap_ots.iter().map(|[m0, _]| *m0));
    let (mut tx, _) = conn.byte_stream().await?;
    tx.write_all(cast_slice(&gap_vals)).await?;
    Ok(())
}

#[tracing::instrument(target = "silentot_metrics", level = Level::DEBUG, skip_all, fields(phase = phase::GAP_CORRECTION))]
async fn receive_gap(
    conn: &mut Connection,
    A: &mut Vec<Block>,
    gap_ots: &[Block],
    gap_choices: &[Choice],
) -> Result<(), Error> {
    let mut gap_vals: Vec<Block> = allocate_zeroed_vec(gap_ots.len());
    let (_, mut rx) = conn.byte_stream().await?;
    rx.read_exact(cast_slice_mut(&mut gap_vals)).await?;
    A.extend(
        gap_ots
            .iter()
            .zip(gap_vals)
            .zip(gap_choices)
            .map(|((msg, gap_val), choice)| {
                Block::conditional_select(msg, &(gap_pad(*msg) ^ gap_val), *choice)
            }),
    );
    Ok(())
}

/// `Σ x^(i + 1) * v[i]` in GF(2^128).
fn power_sum(x: Block, v: &[Block]) -> Block {
    let mut xx = x;
    let (sum_low, sum_high) =
        v.iter()
            .fold((Block::ZERO, Block::ZERO), |(mut sum_low, mut sum_high), v| {
                let (low, high) = xx.clmul(v);
                sum_low ^= low;
                sum_high ^= high;
                xx = xx.gf_mul(&x);
                (sum_low, sum_high)
            });
    Block::gf_reduce(&sum_low, &sum_high)
}

/// `Σ x^(p + 1)` over the noisy positions `p`.
fn power_sum_points(x: Block, points: &[usize]) -> Block {
    points
        .iter()
        .fold(Block::ZERO, |acc, &p| acc ^ x.gf_pow(p as u64 + 1))
}

/// Sender side of the consistency check. Proves to the receiver that the
/// noise vector is consistent with a single `Δ`.
#[tracing::instrument(target = "silentot_metrics", level = Level::DEBUG, skip_all, fields(phase = phase::MALICIOUS_CHECK))]
async fn ferret_mal_check_send(
    conn: &mut Connection,
    delta: Block,
    B: Vec<Block>,
    mal_check_ots: Vec<[Block; 2]>,
) -> Result<Vec<Block>, Error> {
    let (mut tx, mut rx) = conn.request_response_stream::<Hash, Block>().await?;
    let mal_check_seed: Block = rx.next().await.ok_or(Error::MissingReceiverSeed)??;

    let jh = spawn_compute(move || (power_sum(mal_check_seed, &B), B));

    let mut receiver = NoisyVoleReceiver::new(conn.sub_connection());
    let a = receiver.receive(vec![delta], mal_check_ots).await?;

    let (my_sum, B) = jh.await.expect("worker panic");
    let my_hash = (my_sum ^ a[0]).ro_hash();
    tx.send(my_hash).await?;
    Ok(B)
}

/// Receiver side of the consistency check. Fails with
/// [`Error::SecurityAbort`] if the sender's hash does not match.
#[tracing::instrument(target = "silentot_metrics", level = Level::DEBUG, skip_all, fields(phase = phase::MALICIOUS_CHECK))]
async fn ferret_mal_check_receive(
    conn: &mut Connection,
    A: Vec<Block>,
    mal_check_seed: Block,
    mal_check_x: Block,
    mal_check_ots: Vec<Block>,
) -> Result<Vec<Block>, Error> {
    let (mut tx, mut rx) = conn.request_response_stream::<Block, Hash>().await?;
    tx.send(mal_check_seed).await?;

    let jh = spawn_compute(move || (power_sum(mal_check_seed, &A), A));

    let mut sender = NoisyVoleSender::new(conn.sub_connection());
    let b = sender.send(1, mal_check_x, mal_check_ots).await?;

    let (my_sum, A) = jh.await.expect("worker panic");
    let my_hash = (my_sum ^ b[0]).ro_hash();

    let their_hash: Hash = rx.next().await.ok_or(Error::MissingSenderHash)??;
    if my_hash != their_hash {
        return Err(Error::SecurityAbort);
    }
    Ok(A)
}

impl<B> SemiHonest for SilentOtSender<SemiHonestMarker, B> {}
impl<B> SemiHonest for SilentOtReceiver<SemiHonestMarker, B> {}

impl<B> SemiHonest for SilentOtSender<MaliciousMarker, B> {}
impl<B> SemiHonest for SilentOtReceiver<MaliciousMarker, B> {}
impl<B: Malicious> Malicious for SilentOtSender<MaliciousMarker, B> {}
impl<B: Malicious> Malicious for SilentOtReceiver<MaliciousMarker, B> {}

impl<S, B> Connected for SilentOtSender<S, B> {
    fn connection(&mut self) -> &mut Connection {
        &mut self.conn
    }
}

impl<S, B> RotSender for SilentOtSender<S, B>
where
    S: Security,
    B: RotSender,
    B::Error: std::error::Error + Send + Sync + 'static,
{
    type Error = Error;

    async fn send(&mut self, count: usize) -> Result<Vec<[Block; 2]>, Self::Error> {
        self.random_send(count).await
    }
}

impl<S, B> Connected for SilentOtReceiver<S, B> {
    fn connection(&mut self) -> &mut Connection {
        &mut self.conn
    }
}

impl<S, B> RandChoiceRotReceiver for SilentOtReceiver<S, B>
where
    S: Security,
    B: RotReceiver,
    B::Error: std::error::Error + Send + Sync + 'static,
{
    type Error = Error;

    async fn rand_choice_receive(
        &mut self,
        count: usize,
    ) -> Result<(Vec<Block>, Vec<Choice>), Self::Error> {
        self.random_receive(count).await
    }
}

#[cfg(test)]
mod tests {
    use rand::{Rng, SeedableRng, rngs::StdRng};
    use silentot_core::{Block, test_utils::init_tracing};
    use silentot_net::testing::local_conn;
    use subtle::Choice;

    use super::{
        Config, Error, MultType, SCALER, ferret_mal_check_receive, ferret_mal_check_send,
        get_reg_noise_weight, power_sum, power_sum_points,
    };
    use crate::{
        RandChoiceRotReceiver, RotSender, random_choices,
        silent_ot::{
            MaliciousSilentOtReceiver, MaliciousSilentOtSender, SemiHonestSilentOtReceiver,
            SemiHonestSilentOtSender,
        },
    };

    fn check_correlated(a: &[Block], b: &[Block], choice: Option<&[Choice]>, delta: Block) {
        let n = a.len();
        assert_eq!(b.len(), n);
        if let Some(choice) = choice {
            assert_eq!(choice.len(), n)
        }
        let mask = if choice.is_some() {
            // don't mask off lsb when not using choice packing
            Block::ONES
        } else {
            Block::MASK_LSB
        };

        for i in 0..n {
            let m1 = a[i];
            let c = if let Some(choice) = choice {
                choice[i].unwrap_u8() as usize
            } else {
                // extract choice bit from m1
                m1.lsb() as usize
            };
            let m1 = m1 & mask;
            let m2a = b[i] & mask;
            let m2b = (b[i] ^ delta) & mask;

            let eqq = [m1 == m2a, m1 == m2b];
            assert!(
                eqq[c] && !eqq[c ^ 1],
                "Blocks at {i} differ. Choice: {c} {m1:?}, {m2a:?}, {m2b:?}"
            );
        }
    }

    fn check_random(count: usize, s_ot: &[[Block; 2]], r_ot: &[Block], c: &[Choice]) {
        assert_eq!(s_ot.len(), count);
        assert_eq!(r_ot.len(), count);
        assert_eq!(c.len(), count);

        for i in 0..count {
            assert_eq!(
                r_ot[i],
                s_ot[i][c[i].unwrap_u8() as usize],
                "Difference at OT {i}\nr_ot: {:?}\ns_ot: {:?}\nc: {}",
                r_ot[i],
                s_ot[i],
                c[i].unwrap_u8()
            );
        }
    }

    #[test]
    fn noise_weight() {
        assert_eq!(256, get_reg_noise_weight(0.15, 128).unwrap());
        assert_eq!(176, get_reg_noise_weight(0.2, 128).unwrap());
        assert_eq!(128, get_reg_noise_weight(0.5, 128).unwrap());
        assert!(matches!(
            get_reg_noise_weight(0.0, 128),
            Err(Error::Configuration(_))
        ));
        assert!(matches!(
            get_reg_noise_weight(0.6, 128),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn configure_parameters() {
        let conf = Config::configure(1 << 11, SCALER, MultType::ExConv7x24, false).unwrap();
        assert_eq!(256, conf.num_partitions());
        assert_eq!(16, conf.size_per());
        assert_eq!(4096, conf.noise_len());
        assert_eq!(4 * 256, conf.base_ot_count());

        let conf = Config::configure(1 << 11, SCALER, MultType::ExConv7x24, true)
            .unwrap()
            .with_gap(10);
        assert_eq!(4106, conf.noise_len());
        assert_eq!(4 * 256 + 10 + 128, conf.base_ot_count());

        for mult_type in [
            MultType::ExConv21x24,
            MultType::ExAcc7,
            MultType::ExAcc11,
            MultType::ExAcc21,
            MultType::ExAcc40,
        ] {
            let conf = Config::configure(1000, SCALER, mult_type, false).unwrap();
            assert_eq!(0, conf.num_partitions() % 8);
            assert_eq!(0, conf.size_per() % 8);
            assert!(conf.noise_len() >= 2 * 1000);
        }
    }

    #[test]
    fn configure_rejects_invalid_input() {
        assert!(matches!(
            Config::configure(100, 4, MultType::ExConv7x24, false),
            Err(Error::Configuration(_))
        ));
        assert!(matches!(
            Config::configure(0, SCALER, MultType::ExConv7x24, false),
            Err(Error::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn correlated_silent_ot() {
        let _g = init_tracing();
        let (c1, c2) = local_conn().await.unwrap();

        let mut sender = SemiHonestSilentOtSender::new(c1);
        let mut receiver = SemiHonestSilentOtReceiver::new(c2);
        let delta = Block::ONES;
        let count = 2_usize.pow(11);

        let (s_ot, (r_ot, choices)) = tokio::try_join!(
            sender.correlated_send(count, delta),
            receiver.correlated_receive(count)
        )
        .unwrap();

        assert_eq!(s_ot.len(), count);
        assert_eq!(r_ot.len(), count);

        check_correlated(&r_ot, &s_ot, Some(&choices), delta);
    }

    #[tokio::test]
    async fn correlated_packed_silent_ot() {
        let _g = init_tracing();
        let (c1, c2) = local_conn().await.unwrap();

        let mut sender = SemiHonestSilentOtSender::new(c1);
        let mut receiver = SemiHonestSilentOtReceiver::new(c2);
        let delta: Block = StdRng::seed_from_u64(7).random();
        let count = 3000;

        let (s_ot, r_ot) = tokio::try_join!(
            sender.correlated_send(count, delta),
            receiver.correlated_receive_packed(count)
        )
        .unwrap();

        check_correlated(&r_ot, &s_ot, None, delta);
    }

    #[tokio::test]
    async fn random_silent_ot() {
        let _g = init_tracing();
        let (c1, c2) = local_conn().await.unwrap();

        let mut sender = SemiHonestSilentOtSender::new(c1);
        let mut receiver = SemiHonestSilentOtReceiver::new(c2);
        let count = 2_usize.pow(11);

        let (s_ot, (r_ot, choices)) =
            tokio::try_join!(sender.random_send(count), receiver.random_receive(count)).unwrap();

        check_random(count, &s_ot, &r_ot, &choices);
    }

    #[tokio::test]
    async fn repeated_runs() {
        let (c1, c2) = local_conn().await.unwrap();

        let mut sender = SemiHonestSilentOtSender::new(c1);
        let mut receiver = SemiHonestSilentOtReceiver::new(c2);
        for count in [500, 500, 1200] {
            let (s_ot, (r_ot, choices)) =
                tokio::try_join!(sender.random_send(count), receiver.random_receive(count))
                    .unwrap();
            check_random(count, &s_ot, &r_ot, &choices);
        }
    }

    #[tokio::test]
    async fn clear_keeps_only_config() {
        let (c1, c2) = local_conn().await.unwrap();
        let mut sender = MaliciousSilentOtSender::new(c1);
        let mut receiver = MaliciousSilentOtReceiver::new(c2);
        let count = 700;
        let conf = sender.configure(count, SCALER).unwrap();
        receiver.configure(count, SCALER).unwrap();
        tokio::try_join!(sender.gen_silent_base_ots(), receiver.gen_silent_base_ots()).unwrap();
        assert!(sender.silent_base_ots.is_some());
        assert!(receiver.base_choices.is_some());

        sender.clear();
        receiver.clear();
        assert!(sender.silent_base_ots.is_none());
        assert!(receiver.silent_base_ots.is_none());
        assert!(receiver.base_choices.is_none());
        assert_eq!(Some(conf), sender.config());

        // Δ is sampled per run, so a run after clear uses fresh base OTs and
        // leaves nothing behind
        let (s_ot, (r_ot, choices)) =
            tokio::try_join!(sender.random_send(count), receiver.random_receive(count)).unwrap();
        check_random(count, &s_ot, &r_ot, &choices);
        assert!(sender.silent_base_ots.is_none());
        assert!(receiver.base_choices.is_none());
    }

    #[tokio::test]
    async fn test_rot_trait_for_silent_ot() {
        let _g = init_tracing();
        let (c1, c2) = local_conn().await.unwrap();

        let mut sender = SemiHonestSilentOtSender::new(c1);
        let mut receiver = SemiHonestSilentOtReceiver::new(c2);
        let count = 2_usize.pow(11);

        let (s_ot, (r_ot, c)) =
            tokio::try_join!(sender.send(count), receiver.rand_choice_receive(count)).unwrap();

        check_random(count, &s_ot, &r_ot, &c);
    }

    #[tokio::test]
    async fn test_malicious_silent_ot() {
        let _g = init_tracing();
        let (c1, c2) = local_conn().await.unwrap();

        let mut sender = MaliciousSilentOtSender::new(c1);
        let mut receiver = MaliciousSilentOtReceiver::new(c2);
        let count = 2_usize.pow(11);

        let (s_ot, (r_ot, choices)) =
            tokio::try_join!(sender.random_send(count), receiver.random_receive(count)).unwrap();

        check_random(count, &s_ot, &r_ot, &choices);
    }

    #[tokio::test]
    async fn malicious_correlated_with_gap() {
        let _g = init_tracing();
        let (c1, c2) = local_conn().await.unwrap();

        let mut sender = MaliciousSilentOtSender::new(c1);
        let mut receiver = MaliciousSilentOtReceiver::new(c2);
        let count = 1000;
        let conf = Config::configure(count, SCALER, MultType::ExConv7x24, true)
            .unwrap()
            .with_gap(37);
        sender.set_config(conf).unwrap();
        receiver.set_config(conf).unwrap();
        let delta: Block = StdRng::seed_from_u64(99).random();

        let (s_ot, (r_ot, choices)) = tokio::try_join!(
            sender.correlated_send(count, delta),
            receiver.correlated_receive(count)
        )
        .unwrap();

        check_correlated(&r_ot, &s_ot, Some(&choices), delta);
    }

    #[tokio::test]
    async fn semi_honest_gap() {
        let (c1, c2) = local_conn().await.unwrap();

        let mut sender = SemiHonestSilentOtSender::new(c1);
        let mut receiver = SemiHonestSilentOtReceiver::new(c2);
        let count = 700;
        let conf = Config::configure(count, SCALER, MultType::ExConv21x24, false)
            .unwrap()
            .with_gap(8);
        sender.set_config(conf).unwrap();
        receiver.set_config(conf).unwrap();

        let (s_ot, (r_ot, choices)) =
            tokio::try_join!(sender.random_send(count), receiver.random_receive(count)).unwrap();

        check_random(count, &s_ot, &r_ot, &choices);
    }

    #[tokio::test]
    async fn expand_accumulate_codes() {
        for mult_type in [MultType::ExAcc7, MultType::ExAcc40] {
            let (c1, c2) = local_conn().await.unwrap();
            let mut sender = SemiHonestSilentOtSender::new(c1).with_mult_type(mult_type);
            let mut receiver = SemiHonestSilentOtReceiver::new(c2).with_mult_type(mult_type);
            let delta = Block::ONES;
            let count = 1500;

            let (s_ot, (r_ot, choices)) = tokio::try_join!(
                sender.correlated_send(count, delta),
                receiver.correlated_receive(count)
            )
            .unwrap();

            check_correlated(&r_ot, &s_ot, Some(&choices), delta);
        }
    }

    #[tokio::test]
    async fn chosen_silent_ot() {
        let _g = init_tracing();
        let (c1, c2) = local_conn().await.unwrap();

        let mut sender = MaliciousSilentOtSender::new(c1);
        let mut receiver = MaliciousSilentOtReceiver::new(c2);
        let count = 1024;
        let choices = random_choices(count, &mut StdRng::seed_from_u64(5));

        let (s_ot, r_ot) = tokio::try_join!(
            sender.send_chosen(count),
            receiver.receive_chosen(&choices)
        )
        .unwrap();

        check_random(count, &s_ot, &r_ot, &choices);
    }

    #[tokio::test]
    async fn external_base_ots() {
        let (c1, c2) = local_conn().await.unwrap();

        let mut sender = SemiHonestSilentOtSender::new_without_base_ot(c1).with_num_threads(2);
        let mut receiver = SemiHonestSilentOtReceiver::new_without_base_ot(c2).with_num_threads(2);
        let count = 1 << 10;
        sender.configure(count, SCALER).unwrap();
        receiver.configure(count, SCALER).unwrap();

        let base_choices = receiver.sample_silent_base_choices().unwrap();
        let mut rng = StdRng::seed_from_u64(12);
        let s_base: Vec<[Block; 2]> = (0..sender.silent_base_ot_count().unwrap())
            .map(|_| rng.random())
            .collect();
        let r_base = s_base
            .iter()
            .zip(&base_choices)
            .map(|(ot, c)| ot[c.unwrap_u8() as usize])
            .collect();
        sender.set_silent_base_ots(s_base).unwrap();
        receiver.set_silent_base_ots(r_base).unwrap();

        let delta = Block::ONES;
        let (s_ot, (r_ot, choices)) = tokio::try_join!(
            sender.correlated_send(count, delta),
            receiver.correlated_receive(count)
        )
        .unwrap();
        check_correlated(&r_ot, &s_ot, Some(&choices), delta);
    }

    #[tokio::test]
    async fn missing_base_ots() {
        let (c1, c2) = local_conn().await.unwrap();

        let mut sender = SemiHonestSilentOtSender::new_without_base_ot(c1);
        let mut receiver = SemiHonestSilentOtReceiver::new_without_base_ot(c2);
        assert!(matches!(
            sender.correlated_send(100, Block::ONES).await,
            Err(Error::Configuration(_))
        ));
        assert!(matches!(
            receiver.random_receive(100).await,
            Err(Error::Configuration(_))
        ));
        assert!(matches!(
            receiver.set_silent_base_ots(vec![]),
            Err(Error::ProtocolOrder(_))
        ));
        assert!(matches!(
            sender.set_silent_base_ots(vec![]),
            Err(Error::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn security_mismatch_in_config() {
        let (c1, _c2) = local_conn().await.unwrap();
        let mut sender = SemiHonestSilentOtSender::new(c1);
        let conf = Config::configure(100, SCALER, MultType::ExConv7x24, true).unwrap();
        assert!(matches!(
            sender.set_config(conf),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn power_sum_of_unit_vectors() {
        let mut rng = StdRng::seed_from_u64(3);
        let x: Block = rng.random();
        let mut v = vec![Block::ZERO; 50];
        v[4] = Block::ONE;
        v[17] = Block::ONE;
        assert_eq!(power_sum_points(x, &[4, 17]), power_sum(x, &v));
    }

    async fn run_mal_check(flip: Option<usize>, seed: u64) -> Result<(), Error> {
        let (mut c1, mut c2) = local_conn().await.unwrap();
        let mut rng = StdRng::seed_from_u64(seed);
        let delta: Block = rng.random();
        let B: Vec<Block> = (0..1000).map(|_| rng.random()).collect();
        let points = [3, 500, 999];
        let mut A = B.clone();
        for &p in &points {
            A[p] ^= delta;
        }
        if let Some(idx) = flip {
            A[idx] ^= Block::ONE;
        }
        let mal_check_seed: Block = rng.random();
        let x = power_sum_points(mal_check_seed, &points);
        let s_ots: Vec<[Block; 2]> = (0..128).map(|_| rng.random()).collect();
        let r_ots: Vec<Block> = s_ots
            .iter()
            .zip(x.bits())
            .map(|(ot, b)| ot[b as usize])
            .collect();

        let (s_res, r_res) = tokio::join!(
            ferret_mal_check_send(&mut c1, delta, B, s_ots),
            ferret_mal_check_receive(&mut c2, A, mal_check_seed, x, r_ots)
        );
        s_res?;
        r_res?;
        Ok(())
    }

    #[tokio::test]
    async fn mal_check_accepts_consistent_noise() {
        for seed in 0..3 {
            run_mal_check(None, seed).await.unwrap();
        }
    }

    #[tokio::test]
    async fn mal_check_detects_inconsistent_noise() {
        for (seed, idx) in [(0, 0), (1, 3), (2, 741)] {
            let res = run_mal_check(Some(idx), seed).await;
            assert!(matches!(res, Err(Error::SecurityAbort)), "{res:?}");
        }
    }
}
