//! Distributed multi-point puncturable PRF based on GGM trees.
//!
//! The sender expands `pnt_count` GGM trees with `domain` leaves each. Using
//! one base OT per tree level, the receiver learns every leaf except one
//! active leaf per tree. If the active path is programmed, the receiver
//! instead learns the sender's active leaf xored with a correlation value
//! (usually the Silent OT `Δ`), which the receiver never learns.
//!
//! Trees are processed in batches of [`PARALLEL_TREES`], where every node of a
//! batch holds the values of all of its trees. Per batch the sender sends one
//! transcript of masked level sums, and the receiver consumes the transcripts
//! in the same order.
use std::{io, mem, ops::Range};

use bytemuck::{cast_slice, cast_slice_mut};
use ndarray::Array2;
use rand::{CryptoRng, Rng, RngCore};
use rayon::prelude::*;
use silentot_core::{
    Block,
    aes_hash::FIXED_KEY_HASH,
    alloc::allocate_zeroed_vec,
    tokio_rayon::spawn_compute,
    utils::log2_ceil,
};
use silentot_net::{Connection, ConnectionError};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    sync::mpsc::unbounded_channel,
};
use tracing::{Level, debug};

mod output;
mod tree;

pub use output::{LeafCallback, OutFormat, PprfOutput, flatten_leaves, interleave_point};
use tree::{Node, TreeLayout, batch_roots};

/// Number of trees expanded together as one batch.
pub const PARALLEL_TREES: usize = 8;

/// Exclusive upper bound of the tree depth.
pub const MAX_DEPTH: usize = 24;

/// Phase name of the expansion in communication metrics.
pub const COMMUNICATION_PHASE: &str = "pprf-expansion";

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid pprf configuration: {0}")]
    Configuration(String),
    #[error("pprf operation out of order: {0}")]
    ProtocolOrder(&'static str),
    #[error("active point outside of the required range")]
    Range,
    #[error("unable to establish sub-stream to pprf peer")]
    Connection(#[from] ConnectionError),
    #[error("error in sending data to pprf peer")]
    Send(#[source] io::Error),
    #[error("error in receiving data from pprf peer")]
    Receive(#[source] io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Configured,
    BaseOtsSet,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PprfConfig {
    pnt_count: usize,
    domain: usize,
    depth: usize,
}

impl PprfConfig {
    /// Create a config for `pnt_count` trees with `domain` leaves each.
    ///
    /// The domain must be even and at least 2. It does not need to be a power
    /// of two, the tree depth is `⌈log2(domain)⌉` and must be below
    /// [`MAX_DEPTH`].
    pub fn new(domain: usize, pnt_count: usize) -> Result<Self, Error> {
        if domain < 2 || domain % 2 != 0 {
            return Err(Error::Configuration(format!(
                "domain must be even and at least 2, got {domain}"
            )));
        }
        if pnt_count == 0 {
            return Err(Error::Configuration("pnt_count must be positive".into()));
        }
        let depth = log2_ceil(domain);
        if depth >= MAX_DEPTH {
            return Err(Error::Configuration(format!(
                "depth {depth} exceeds the maximum depth {}",
                MAX_DEPTH - 1
            )));
        }
        Ok(Self {
            pnt_count,
            domain,
            depth,
        })
    }

    pub fn base_ot_count(&self) -> usize {
        self.depth * self.pnt_count
    }

    pub fn pnt_count(&self) -> usize {
        self.pnt_count
    }

    pub fn domain(&self) -> usize {
        self.domain
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Total number of leaves.
    pub fn size(&self) -> usize {
        self.domain * self.pnt_count
    }

    fn batches(&self) -> usize {
        self.pnt_count.div_ceil(PARALLEL_TREES)
    }

    /// Number of blocks the sender transmits per batch.
    fn transcript_len(&self, program_active_path: bool) -> usize {
        let program = program_active_path as usize;
        (self.depth - program) * 2 * PARALLEL_TREES + program * 4 * PARALLEL_TREES
    }

    /// Sample choice bits such that the active point of every tree is below
    /// `modulus`, resampling a tree's bits until it is.
    ///
    /// For [`OutFormat::ByLeafIndex`] and [`OutFormat::ByTreeIndex`] the
    /// modulus applies to the leaf index and must be at most `domain`. For
    /// the interleaved formats it applies to the position in the interleaved
    /// output and must be in `[size / 2, size]`.
    ///
    /// The returned bits are ordered by tree and then by level, starting with
    /// the level below the root.
    pub fn sample_choice_bits<R: RngCore + CryptoRng>(
        &self,
        modulus: usize,
        format: OutFormat,
        rng: &mut R,
    ) -> Result<Vec<u8>, Error> {
        let interleaved = matches!(format, OutFormat::Interleaved | OutFormat::Callback);
        if interleaved {
            if modulus > self.size() {
                return Err(Error::Configuration(format!(
                    "modulus {modulus} is larger than the pprf size {}",
                    self.size()
                )));
            }
            if modulus < self.size() / 2 {
                return Err(Error::Configuration(format!(
                    "modulus {modulus} is smaller than half the pprf size {}",
                    self.size()
                )));
            }
        } else if modulus == 0 || modulus > self.domain {
            return Err(Error::Configuration(format!(
                "modulus {modulus} must be in [1, {}]",
                self.domain
            )));
        }

        let mut choices = vec![0_u8; self.base_ot_count()];
        for (tree_idx, bits) in choices.chunks_exact_mut(self.depth).enumerate() {
            if interleaved {
                // at least the first leaf of the tree must be admissible
                match interleave_point(0, tree_idx, self.domain) {
                    Some(first) if first < modulus => {}
                    _ => return Err(Error::Range),
                }
            }
            loop {
                for bit in bits.iter_mut() {
                    *bit = rng.random::<bool>() as u8;
                }
                let point = active_path(bits);
                let idx = if interleaved {
                    interleave_point(point, tree_idx, self.domain)
                } else {
                    Some(point)
                };
                if idx.is_some_and(|idx| idx < modulus) {
                    break;
                }
            }
        }
        Ok(choices)
    }

    /// Check externally chosen choice bits.
    fn validate_choice_bits(&self, format: OutFormat, choices: &[u8]) -> Result<(), Error> {
        if choices.len() != self.base_ot_count() {
            return Err(Error::Configuration(format!(
                "expected {} choice bits, got {}",
                self.base_ot_count(),
                choices.len()
            )));
        }
        if choices.iter().any(|c| *c > 1) {
            return Err(Error::Configuration("choice bits must be 0 or 1".into()));
        }
        self.get_points(format, choices).map(|_| ())
    }

    /// The active point of every tree for the given choice bits, as leaf
    /// index for the matrix formats and as position in the interleaved output
    /// for the interleaved formats.
    pub fn get_points(&self, format: OutFormat, choices: &[u8]) -> Result<Vec<usize>, Error> {
        if choices.len() != self.base_ot_count() {
            return Err(Error::Configuration(format!(
                "expected {} choice bits, got {}",
                self.base_ot_count(),
                choices.len()
            )));
        }
        choices
            .chunks_exact(self.depth)
            .enumerate()
            .map(|(tree_idx, bits)| {
                let point = active_path(bits);
                match format {
                    OutFormat::ByLeafIndex | OutFormat::ByTreeIndex => {
                        (point < self.domain).then_some(point)
                    }
                    OutFormat::Interleaved | OutFormat::Callback => {
                        interleave_point(point, tree_idx, self.domain)
                    }
                }
                .ok_or(Error::Range)
            })
            .collect()
    }
}

/// Index of the active leaf for the choice bits of one tree.
///
/// The bit of level `d` selects the side the receiver learns, so the active
/// path takes the other side. The first bit is the most significant.
pub fn active_path(choice_bits: &[u8]) -> usize {
    let len = choice_bits.len();
    choice_bits
        .iter()
        .enumerate()
        .fold(0, |point, (i, cb)| point | (((1 ^ *cb) as usize) << (len - 1 - i)))
}

pub struct RegularPprfSender {
    conf: PprfConfig,
    // indexed by (tree, level)
    base_ots: Array2<[Block; 2]>,
    state: State,
}

impl RegularPprfSender {
    pub fn new(conf: PprfConfig) -> Self {
        Self {
            conf,
            base_ots: Array2::from_elem([0, 0], [Block::ZERO; 2]),
            state: State::Configured,
        }
    }

    pub fn conf(&self) -> PprfConfig {
        self.conf
    }

    pub fn base_ot_count(&self) -> usize {
        self.conf.base_ot_count()
    }

    /// Set the base OT messages, ordered by tree and then by level.
    pub fn set_base(&mut self, base_ots: Vec<[Block; 2]>) -> Result<(), Error> {
        match self.state {
            State::Done => return Err(Error::ProtocolOrder("pprf sender must be cleared before reuse")),
            State::Configured | State::BaseOtsSet => {}
        }
        if base_ots.len() != self.base_ot_count() {
            return Err(Error::Configuration(format!(
                "expected {} base OTs, got {}",
                self.base_ot_count(),
                base_ots.len()
            )));
        }
        self.base_ots =
            Array2::from_shape_vec([self.conf.pnt_count(), self.conf.depth()], base_ots)
                .expect("base_ots.len() is checked before");
        self.state = State::BaseOtsSet;
        Ok(())
    }

    /// Expand the trees into `output` and send the transcript to the
    /// receiver.
    ///
    /// `value` holds either one correlation value for all trees or one per
    /// tree and is only used if `program_active_path` is set. Up to
    /// `num_threads` batches are expanded in parallel. The base OTs are
    /// consumed, the sender needs to be [cleared](`Self::clear`) before it
    /// is used again.
    #[tracing::instrument(target = "silentot_metrics", level = Level::DEBUG, skip_all, fields(phase = COMMUNICATION_PHASE))]
    pub async fn expand(
        &mut self,
        conn: &mut Connection,
        value: &[Block],
        seed: Block,
        output: PprfOutput,
        program_active_path: bool,
        num_threads: usize,
    ) -> Result<PprfOutput, Error> {
        match self.state {
            State::Configured => return Err(Error::ProtocolOrder("expand called before set_base")),
            State::Done => return Err(Error::ProtocolOrder("pprf sender must be cleared before reuse")),
            State::BaseOtsSet => {}
        }
        output.validate(&self.conf)?;
        let values = if program_active_path {
            self.values(value)?
        } else {
            vec![]
        };
        let conf = self.conf;
        let base_ots = mem::replace(&mut self.base_ots, Array2::from_elem([0, 0], [Block::ZERO; 2]));
        self.state = State::Done;
        let num_threads = num_threads.max(1);
        debug!(
            domain = conf.domain(),
            pnt_count = conf.pnt_count(),
            num_threads,
            "pprf sender expansion"
        );

        let (mut tx, _) = conn.byte_stream().await?;
        let (send, mut recv) = unbounded_channel();
        let jh = spawn_compute(move || {
            let mut output = output;
            let layout = TreeLayout::new(conf.domain(), conf.depth());
            let external_leaves = output.format() == OutFormat::Interleaved;
            let mut trees: Vec<Vec<Node>> = (0..num_threads)
                .map(|_| allocate_zeroed_vec(layout.tree_len(external_leaves)))
                .collect();
            for first in (0..conf.batches()).step_by(num_threads) {
                let batches = first..(first + num_threads).min(conf.batches());
                let transcripts = for_each_batch(
                    &layout,
                    &conf,
                    &mut trees,
                    &mut output,
                    batches,
                    |batch, tree, leaves| {
                        expand_sender_batch(
                            &conf,
                            &layout,
                            &base_ots,
                            &values,
                            seed,
                            program_active_path,
                            batch,
                            tree,
                            leaves,
                        )
                    },
                );
                for transcript in transcripts {
                    if send.send(transcript).is_err() {
                        // sending failed, the error is returned by the async task
                        return output;
                    }
                }
            }
            output
        });

        while let Some(transcript) = recv.recv().await {
            tx.write_all(cast_slice(&transcript))
                .await
                .map_err(Error::Send)?;
        }

        Ok(jh.await.expect("panic in worker thread"))
    }

    fn values(&self, value: &[Block]) -> Result<Vec<Block>, Error> {
        match value.len() {
            1 => Ok(vec![value[0]; self.conf.pnt_count()]),
            len if len == self.conf.pnt_count() => Ok(value.to_vec()),
            len => Err(Error::Configuration(format!(
                "expected 1 or {} correlation values, got {len}",
                self.conf.pnt_count()
            ))),
        }
    }

    /// Drop remaining base OTs and allow the sender to be used again.
    pub fn clear(&mut self) {
        self.base_ots.fill([Block::ZERO; 2]);
        self.base_ots = Array2::from_elem([0, 0], [Block::ZERO; 2]);
        self.state = State::Configured;
    }
}

pub struct RegularPprfReceiver {
    conf: PprfConfig,
    // indexed by (tree, level)
    base_ots: Array2<Block>,
    base_choices: Option<Vec<u8>>,
    state: State,
}

impl RegularPprfReceiver {
    pub fn new(conf: PprfConfig) -> Self {
        Self {
            conf,
            base_ots: Array2::from_elem([0, 0], Block::ZERO),
            base_choices: None,
            state: State::Configured,
        }
    }

    pub fn conf(&self) -> PprfConfig {
        self.conf
    }

    pub fn base_ot_count(&self) -> usize {
        self.conf.base_ot_count()
    }

    /// Sample and store random choice bits, see
    /// [`PprfConfig::sample_choice_bits`]. The base OTs must be received with
    /// the returned choice bits.
    pub fn sample_choice_bits<R: RngCore + CryptoRng>(
        &mut self,
        modulus: usize,
        format: OutFormat,
        rng: &mut R,
    ) -> Result<Vec<u8>, Error> {
        let choices = self.conf.sample_choice_bits(modulus, format, rng)?;
        self.base_choices = Some(choices.clone());
        Ok(choices)
    }

    /// Use externally chosen choice bits. Fails if an active point is
    /// outside of the domain.
    pub fn set_choice_bits(&mut self, format: OutFormat, choices: &[u8]) -> Result<(), Error> {
        self.conf.validate_choice_bits(format, choices)?;
        self.base_choices = Some(choices.to_vec());
        Ok(())
    }

    /// Active point of every tree for the given output format.
    pub fn get_points(&self, format: OutFormat) -> Result<Vec<usize>, Error> {
        let choices = self
            .base_choices
            .as_ref()
            .ok_or(Error::ProtocolOrder("choice bits are not set"))?;
        self.conf.get_points(format, choices)
    }

    /// Set the base OTs received with the choice bits, ordered by tree and
    /// then by level.
    pub fn set_base(&mut self, base_ots: Vec<Block>) -> Result<(), Error> {
        match self.state {
            State::Done => {
                return Err(Error::ProtocolOrder("pprf receiver must be cleared before reuse"));
            }
            State::Configured | State::BaseOtsSet => {}
        }
        if base_ots.len() != self.base_ot_count() {
            return Err(Error::Configuration(format!(
                "expected {} base OTs, got {}",
                self.base_ot_count(),
                base_ots.len()
            )));
        }
        self.base_ots =
            Array2::from_shape_vec([self.conf.pnt_count(), self.conf.depth()], base_ots)
                .expect("base_ots.len() is checked before");
        self.state = State::BaseOtsSet;
        Ok(())
    }

    /// Receive the transcript of the sender and reconstruct all but the
    /// active leaves into `output`. The active leaves are set to the
    /// programmed value if `program_active_path` is set, and to zero
    /// otherwise.
    #[tracing::instrument(target = "silentot_metrics", level = Level::DEBUG, skip_all, fields(phase = COMMUNICATION_PHASE))]
    pub async fn expand(
        &mut self,
        conn: &mut Connection,
        output: PprfOutput,
        program_active_path: bool,
        num_threads: usize,
    ) -> Result<PprfOutput, Error> {
        match self.state {
            State::Configured => return Err(Error::ProtocolOrder("expand called before set_base")),
            State::Done => {
                return Err(Error::ProtocolOrder("pprf receiver must be cleared before reuse"));
            }
            State::BaseOtsSet => {}
        }
        let points = self.get_points(OutFormat::ByLeafIndex)?;
        output.validate(&self.conf)?;
        let conf = self.conf;
        let base_ots = mem::replace(&mut self.base_ots, Array2::from_elem([0, 0], Block::ZERO));
        self.state = State::Done;
        let num_threads = num_threads.max(1);
        debug!(
            domain = conf.domain(),
            pnt_count = conf.pnt_count(),
            num_threads,
            "pprf receiver expansion"
        );

        let (_, mut rx) = conn.byte_stream().await?;
        let layout = TreeLayout::new(conf.domain(), conf.depth());
        let external_leaves = output.format() == OutFormat::Interleaved;
        let trees = (0..num_threads)
            .map(|_| allocate_zeroed_vec(layout.tree_len(external_leaves)))
            .collect();
        let mut job = ReceiveJob {
            conf,
            layout,
            base_ots,
            points,
            program_active_path,
            trees,
            output,
        };
        let transcript_len = conf.transcript_len(program_active_path);
        for first in (0..conf.batches()).step_by(num_threads) {
            let chunk = num_threads.min(conf.batches() - first);
            let mut transcripts = Vec::with_capacity(chunk);
            for _ in 0..chunk {
                let mut transcript: Vec<Block> = allocate_zeroed_vec(transcript_len);
                rx.read_exact(cast_slice_mut(&mut transcript))
                    .await
                    .map_err(Error::Receive)?;
                transcripts.push(transcript);
            }
            job = spawn_compute(move || {
                job.expand_batches(first, &transcripts);
                job
            })
            .await
            .expect("panic in worker thread");
        }
        Ok(job.output)
    }

    /// Drop the choice bits and remaining base OTs and allow the receiver to
    /// be used again.
    pub fn clear(&mut self) {
        self.base_ots.fill(Block::ZERO);
        self.base_ots = Array2::from_elem([0, 0], Block::ZERO);
        self.base_choices = None;
        self.state = State::Configured;
    }
}

/// State of a receiver expansion, moved to the compute pool for every chunk
/// of batches.
struct ReceiveJob {
    conf: PprfConfig,
    layout: TreeLayout,
    base_ots: Array2<Block>,
    points: Vec<usize>,
    program_active_path: bool,
    trees: Vec<Vec<Node>>,
    output: PprfOutput,
}

impl ReceiveJob {
    fn expand_batches(&mut self, first: usize, transcripts: &[Vec<Block>]) {
        let (conf, layout) = (&self.conf, &self.layout);
        let (base_ots, points) = (&self.base_ots, &self.points);
        let program_active_path = self.program_active_path;
        for_each_batch(
            layout,
            conf,
            &mut self.trees,
            &mut self.output,
            first..first + transcripts.len(),
            |batch, tree, leaves| {
                expand_receiver_batch(
                    conf,
                    layout,
                    base_ots,
                    points,
                    program_active_path,
                    batch,
                    tree,
                    leaves,
                    &transcripts[batch - first],
                )
            },
        );
    }
}

/// Run `f` for every batch in `batches` in parallel, each with its own tree
/// and, for interleaved outputs, its region of the output. For the other
/// formats, the leaves are copied to the output in batch order afterwards.
fn for_each_batch<R, F>(
    layout: &TreeLayout,
    conf: &PprfConfig,
    trees: &mut [Vec<Node>],
    output: &mut PprfOutput,
    batches: Range<usize>,
    f: F,
) -> Vec<R>
where
    R: Send,
    F: Fn(usize, &mut [Node], Option<&mut [Node]>) -> R + Send + Sync,
{
    debug_assert!(batches.len() <= trees.len());
    let results: Vec<R> = {
        let mut regions: Vec<Option<&mut [Node]>> = match output {
            PprfOutput::Interleaved(out) => cast_slice_mut::<Block, Node>(out)
                .chunks_exact_mut(conf.domain())
                .skip(batches.start)
                .take(batches.len())
                .map(Some)
                .collect(),
            _ => batches.clone().map(|_| None).collect(),
        };
        trees
            .par_iter_mut()
            .zip(regions.par_iter_mut())
            .zip(batches.clone().into_par_iter())
            .map(|((tree, leaves), batch)| f(batch, tree, leaves.as_deref_mut()))
            .collect()
    };
    if output.format() != OutFormat::Interleaved {
        for (tree, batch) in trees.iter_mut().zip(batches) {
            let leaves = layout.level(tree, None, conf.depth());
            output.copy_out(leaves, batch * PARALLEL_TREES, conf.pnt_count());
        }
    }
    results
}

/// Expand one batch of trees and return its transcript.
#[allow(clippy::too_many_arguments)]
fn expand_sender_batch(
    conf: &PprfConfig,
    layout: &TreeLayout,
    base_ots: &Array2<[Block; 2]>,
    values: &[Block],
    seed: Block,
    program_active_path: bool,
    batch: usize,
    tree: &mut [Node],
    mut leaves: Option<&mut [Node]>,
) -> Vec<Block> {
    let tree_idx = batch * PARALLEL_TREES;
    let lanes = PARALLEL_TREES.min(conf.pnt_count() - tree_idx);
    let depth = conf.depth();

    tree[0] = batch_roots(seed, tree_idx);

    let mut sums = Vec::with_capacity(depth);
    for d in 0..depth {
        let (level0, level1) = layout.cons_levels(tree, leaves.as_deref_mut(), d);
        sums.push(layout.expand_level(level0, level1, d));
    }

    let masked_levels = depth - program_active_path as usize;
    let mut transcript = vec![Block::ZERO; conf.transcript_len(program_active_path)];
    let (level_sums, last_ots) = transcript.split_at_mut(masked_levels * 2 * PARALLEL_TREES);
    for (d, (sum, out)) in sums
        .iter()
        .zip(level_sums.chunks_exact_mut(2 * PARALLEL_TREES))
        .enumerate()
    {
        for (side, out) in out.chunks_exact_mut(PARALLEL_TREES).enumerate() {
            for j in 0..lanes {
                out[j] = sum[side][j] ^ base_ots[(tree_idx + j, d)][side];
            }
        }
    }

    if program_active_path {
        // The receiver learns the two entries for its choice bit on the last
        // level: the inactive child's sum and the active child's sum xor the
        // value. Each entry is masked with a hash of the base OT.
        let d = depth - 1;
        for (j, last) in last_ots.chunks_exact_mut(4).take(lanes).enumerate() {
            let value = values[tree_idx + j];
            let [s0, s1] = [sums[d][0][j], sums[d][1][j]];
            let [ot0, ot1] = base_ots[(tree_idx + j, d)];
            let masks =
                FIXED_KEY_HASH.cr_hash_blocks(&[ot0, ot0 ^ Block::ONES, ot1, ot1 ^ Block::ONES]);
            let entries = [s0, s1 ^ value, s1, s0 ^ value];
            for ((out, entry), mask) in last.iter_mut().zip(entries).zip(masks) {
                *out = entry ^ mask;
            }
        }
    }
    transcript
}

/// Reconstruct one batch of trees from the sender's transcript.
#[allow(clippy::too_many_arguments)]
fn expand_receiver_batch(
    conf: &PprfConfig,
    layout: &TreeLayout,
    base_ots: &Array2<Block>,
    points: &[usize],
    program_active_path: bool,
    batch: usize,
    tree: &mut [Node],
    mut leaves: Option<&mut [Node]>,
    transcript: &[Block],
) {
    let tree_idx = batch * PARALLEL_TREES;
    let lanes = PARALLEL_TREES.min(conf.pnt_count() - tree_idx);
    let depth = conf.depth();
    let masked_levels = depth - program_active_path as usize;
    let (level_sums, last_ots) = transcript.split_at(masked_levels * 2 * PARALLEL_TREES);
    let their_sum = |d: usize, side: usize, j: usize| {
        level_sums[d * 2 * PARALLEL_TREES + side * PARALLEL_TREES + j]
    };

    // The children of the root are the masked sums of level 0, the active
    // child is unknown. If the tree only has the leaf level and it is
    // programmed, both children come from the last level entries.
    let level1 = layout.level(tree, leaves.as_deref_mut(), 1);
    for j in 0..lanes {
        let active = points[tree_idx + j] >> (depth - 1);
        let inactive = active ^ 1;
        level1[active][j] = Block::ZERO;
        level1[inactive][j] = if masked_levels > 0 {
            base_ots[(tree_idx + j, 0)] ^ their_sum(0, inactive, j)
        } else {
            Block::ZERO
        };
    }

    let mut my_sums = [[Block::ZERO; PARALLEL_TREES]; 2];
    for d in 1..depth {
        let (level0, level1) = layout.cons_levels(tree, leaves.as_deref_mut(), d);
        // The children of the active node are expanded from a wrong value. The
        // wrong inactive child is part of my_sums and cancels out below.
        my_sums = layout.expand_level(level0, level1, d);
        if d < masked_levels {
            for j in 0..lanes {
                let active = points[tree_idx + j] >> (depth - 1 - d);
                let inactive = active ^ 1;
                let not_ai = inactive & 1;
                level1[inactive][j] ^=
                    their_sum(d, not_ai, j) ^ my_sums[not_ai][j] ^ base_ots[(tree_idx + j, d)];
            }
        }
    }

    let last_level = layout.level(tree, leaves, depth);
    for j in 0..lanes {
        let active = points[tree_idx + j];
        if !program_active_path {
            last_level[active][j] = Block::ZERO;
            continue;
        }
        let inactive = active ^ 1;
        let not_ai = inactive & 1;
        let base_ot = base_ots[(tree_idx + j, depth - 1)];
        let masks = FIXED_KEY_HASH.cr_hash_blocks(&[base_ot, base_ot ^ Block::ONES]);
        let ot0 = last_ots[j * 4 + 2 * not_ai] ^ masks[0];
        let ot1 = last_ots[j * 4 + 2 * not_ai + 1] ^ masks[1];
        let inactive_sum = my_sums[not_ai][j] ^ last_level[inactive][j];
        let active_sum = my_sums[not_ai ^ 1][j] ^ last_level[active][j];
        last_level[inactive][j] = ot0 ^ inactive_sum;
        last_level[active][j] = ot1 ^ active_sum;
    }
}

/// Intended for testing. Generates consistent base OTs and choice bits for a
/// pprf evaluation without running a base OT protocol.
pub fn fake_base<R: RngCore + CryptoRng>(
    conf: PprfConfig,
    rng: &mut R,
) -> (Vec<[Block; 2]>, Vec<Block>, Vec<u8>) {
    let msg2: Vec<[Block; 2]> = (0..conf.base_ot_count()).map(|_| rng.random()).collect();
    let choices = conf
        .sample_choice_bits(conf.domain(), OutFormat::ByLeafIndex, rng)
        .expect("domain is a valid modulus");
    let msg = msg2
        .iter()
        .zip(&choices)
        .map(|(m, c)| m[*c as usize])
        .collect();
    (msg2, msg, choices)
}
