//! Pipeline driver
//!
//! Wires the stages of one worker together and sizes an epoch so that every
//! worker of every node emits exactly the same number of batches:
//!
//! ```text
//! shards -> shard shuffle -> split by node -> split by worker   (exhaustive)
//! shards -> resample                                            (resampled)
//!        -> prefetch -> archive -> group -> sample shuffle -> preprocess -> batch
//! ```
//!
//! A worker that runs out of shards before its quota starts another pass.
//! Resampled passes without `nshards` are cut to `max(shards, batch_size)`
//! draws so that a pass always ends, and each pass draws a fresh sequence.

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use super::archive::{ArchiveStream, ShardRecords};
use super::batch::{Batch, BatchAssembler};
use super::dataset::{DatasetKind, DatasetSize};
use super::grouper::SampleGrouper;
use super::prefetcher::{FetchedShard, PrefetchStream, PrefetcherConfig};
use super::shard::{ResampledShards, Shard, ShardList, ShardSource};
use super::shuffle::{shuffle_seed, DeterministicShuffle, ShuffleConfig};
use crate::coordinator::partition::splitmix64;
use crate::coordinator::{PartitionSplitter, PipelineState, SharedEpoch, WorkerInfo};
use crate::error::{PipelineError, Result};
use crate::metrics::standard;
use crate::preprocess::{preprocessor_for, PreprocessContext, Preprocessor, Rejection};
use crate::runtime::{PipelineRuntime, RuntimeConfig};
use crate::storage::{ShardStore, StorageConfig};

/// Everything needed to build a pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Shard pattern (`::`-separated, brace and glob expansion)
    pub shards: String,
    /// Preprocessing policy
    pub dataset_kind: DatasetKind,
    /// Samples per batch
    pub batch_size: usize,
    /// Number of nodes
    pub world_size: u32,
    /// This node's index
    pub rank: u32,
    /// Local workers per node
    pub workers: u32,
    /// Base seed; negative derives seeds from worker identity only
    pub seed: i64,
    /// Draw shards with replacement instead of listing them
    pub resampled: bool,
    /// Draws per pass in resampled mode; unbounded when unset
    pub nshards: Option<u64>,
    /// Samples per epoch; read from sidecar metadata when unset
    pub total_samples: Option<u64>,
    /// Round batch counts down instead of up
    pub floor: bool,
    /// Shard-level shuffle buffer
    pub shard_shuffle_bufsize: usize,
    /// Shards buffered before the first is emitted
    pub shard_shuffle_initial: usize,
    /// Sample-level shuffle buffer
    pub sample_shuffle_bufsize: usize,
    /// Samples buffered before the first is emitted
    pub sample_shuffle_initial: usize,
    /// Shards fetched ahead per worker
    pub prefetch_depth: usize,
    /// I/O runtime settings
    pub runtime: RuntimeConfig,
    /// Fetch settings
    pub storage: StorageConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            shards: String::new(),
            dataset_kind: DatasetKind::Paired,
            batch_size: 32,
            world_size: 1,
            rank: 0,
            workers: 1,
            seed: 42,
            resampled: false,
            nshards: None,
            total_samples: None,
            floor: false,
            shard_shuffle_bufsize: ShuffleConfig::SHARDS.bufsize,
            shard_shuffle_initial: ShuffleConfig::SHARDS.initial,
            sample_shuffle_bufsize: ShuffleConfig::SAMPLES.bufsize,
            sample_shuffle_initial: ShuffleConfig::SAMPLES.initial,
            prefetch_depth: PrefetcherConfig::default().prefetch_depth,
            runtime: RuntimeConfig::default(),
            storage: StorageConfig::default(),
        }
    }
}

impl PipelineConfig {
    /// Defaults overlaid with `SHARDSTREAM_*` environment variables
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(shards) = std::env::var("SHARDSTREAM_SHARDS") {
            config.shards = shards;
        }
        if let Some(kind) = env_parse::<DatasetKind>("SHARDSTREAM_DATASET_KIND")? {
            config.dataset_kind = kind;
        }
        if let Some(v) = env_parse("SHARDSTREAM_BATCH_SIZE")? {
            config.batch_size = v;
        }
        if let Some(v) = env_parse("SHARDSTREAM_WORLD_SIZE")? {
            config.world_size = v;
        }
        if let Some(v) = env_parse("SHARDSTREAM_RANK")? {
            config.rank = v;
        }
        if let Some(v) = env_parse("SHARDSTREAM_WORKERS")? {
            config.workers = v;
        }
        if let Some(v) = env_parse("SHARDSTREAM_SEED")? {
            config.seed = v;
        }
        if let Some(v) = env_parse("SHARDSTREAM_RESAMPLED")? {
            config.resampled = v;
        }
        if let Some(v) = env_parse("SHARDSTREAM_NSHARDS")? {
            config.nshards = Some(v);
        }
        if let Some(v) = env_parse("SHARDSTREAM_TOTAL_SAMPLES")? {
            config.total_samples = Some(v);
        }
        if let Some(v) = env_parse("SHARDSTREAM_FLOOR")? {
            config.floor = v;
        }
        if let Some(v) = env_parse("SHARDSTREAM_PREFETCH_DEPTH")? {
            config.prefetch_depth = v;
        }
        if let Some(v) = env_parse("SHARDSTREAM_IO_THREADS")? {
            config.runtime.io_threads = v;
        }
        if let Some(v) = env_parse("SHARDSTREAM_COMPUTE_THREADS")? {
            config.runtime.compute_threads = v;
        }
        if let Some(v) = env_parse("SHARDSTREAM_REQUEST_TIMEOUT_SECS")? {
            config.storage.request_timeout_secs = v;
        }

        Ok(config)
    }

    /// Reject settings no pipeline can run with
    pub fn validate(&self) -> Result<()> {
        if self.shards.trim().is_empty() {
            return Err(PipelineError::invalid_config("shard pattern is empty"));
        }
        if self.batch_size == 0 {
            return Err(PipelineError::invalid_config("batch size must be at least 1"));
        }
        // rank and world size share WorkerInfo's validation
        WorkerInfo::new(self.rank, self.world_size, 0, self.workers.max(1))?;
        Ok(())
    }

    fn shard_shuffle(&self) -> ShuffleConfig {
        ShuffleConfig {
            bufsize: self.shard_shuffle_bufsize,
            initial: self.shard_shuffle_initial,
        }
    }

    fn sample_shuffle(&self) -> ShuffleConfig {
        ShuffleConfig {
            bufsize: self.sample_shuffle_bufsize,
            initial: self.sample_shuffle_initial,
        }
    }
}

fn env_parse<T>(name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| PipelineError::invalid_config(format!("{}={:?}: {}", name, raw, e))),
        Err(_) => Ok(None),
    }
}

/// Batch and sample counts of one epoch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EpochPlan {
    /// Samples consumed per step across all nodes
    pub global_batch_size: u64,
    /// Batches every local worker emits
    pub batches_per_worker: u64,
    /// Batches this node emits (all local workers)
    pub batches_per_epoch: u64,
    /// Samples consumed per epoch across all nodes
    pub samples_per_epoch: u64,
}

impl EpochPlan {
    /// Size an epoch of roughly `total_samples` samples.
    ///
    /// Counts are rounded up unless `floor` is set, then re-derived so every
    /// worker emits the same number of batches.
    pub fn compute(
        total_samples: u64,
        batch_size: usize,
        world_size: u32,
        num_workers: u32,
        floor: bool,
    ) -> Self {
        let round = |n: u64, d: u64| if floor { n / d } else { n.div_ceil(d) };

        let global_batch_size = (batch_size.max(1) as u64) * world_size.max(1) as u64;
        let workers = num_workers.max(1) as u64;
        let total_batches = round(total_samples, global_batch_size);
        let batches_per_worker = round(total_batches, workers);
        let batches_per_epoch = batches_per_worker * workers;

        Self {
            global_batch_size,
            batches_per_worker,
            batches_per_epoch,
            samples_per_epoch: batches_per_epoch * global_batch_size,
        }
    }
}

type BatchIter = Box<dyn Iterator<Item = Batch> + Send>;

struct PipelineInner {
    config: PipelineConfig,
    shards: ShardList,
    plan: EpochPlan,
    epoch: SharedEpoch,
    state: PipelineState,
    preprocessor: Arc<dyn Preprocessor>,
    pad_id: u32,
    store: ShardStore,
    runtime: PipelineRuntime,
}

impl PipelineInner {
    fn worker_info(&self, worker_id: u32) -> Result<WorkerInfo> {
        WorkerInfo::new(
            self.config.rank,
            self.config.world_size,
            worker_id,
            self.config.workers.max(1),
        )
    }

    /// Seed of one worker's stream, mixing in the configured seed when set
    fn stream_seed(&self, info: &WorkerInfo) -> u64 {
        match u64::try_from(self.config.seed) {
            Ok(seed) => splitmix64(seed ^ info.worker_seed()),
            Err(_) => info.worker_seed(),
        }
    }

    /// Where one pass of this worker gets its shards
    fn shard_source(&self, info: &WorkerInfo, pass: u64) -> ShardSource {
        if !self.config.resampled {
            return ShardSource::Exhaustive(self.shards.clone());
        }
        let draws = self.config.nshards.unwrap_or_else(|| {
            (self.shards.len() as u64).max(self.config.batch_size as u64)
        });
        let seed = splitmix64(self.stream_seed(info).wrapping_add(pass));
        ShardSource::Resampled(ResampledShards::new(&self.shards, Some(draws), seed))
    }

    /// Shards this worker reads during one pass
    fn shard_stream(
        &self,
        info: &WorkerInfo,
        epoch: u64,
        pass: u64,
    ) -> Box<dyn Iterator<Item = Shard> + Send> {
        let source = self.shard_source(info, pass);
        let shards = source.iter(epoch);
        if source.is_resampled() {
            return shards;
        }

        // Same permutation on every worker, so the split stays disjoint
        let seed = shuffle_seed(self.config.seed, 0, epoch);
        let shuffled = DeterministicShuffle::new(shards, self.config.shard_shuffle(), seed);
        Box::new(PartitionSplitter::new(*info).split(shuffled))
    }

    /// Build one pass of the worker's chain
    fn build_chain(&self, info: &WorkerInfo, epoch: u64, pass: u64) -> BatchIter {
        let stream_seed = self.stream_seed(info).wrapping_add(epoch);
        debug!(
            "Building pass {} for rank {} worker {} at epoch {}",
            pass, info.rank, info.worker_id, epoch
        );

        let fetched = PrefetchStream::spawn(
            &self.runtime.io_handle(),
            self.shard_stream(info, epoch, pass),
            self.store.clone(),
            PrefetcherConfig {
                prefetch_depth: self.config.prefetch_depth,
            },
        );
        let records = ArchiveStream::new(fetched, self.runtime.compute_handle());
        let samples = SampleGrouper::new(records, self.config.dataset_kind.schema());
        let shuffled =
            DeterministicShuffle::new(samples, self.config.sample_shuffle(), stream_seed);

        let preprocessor = self.preprocessor.clone();
        let mut rng = ChaCha8Rng::seed_from_u64(stream_seed);
        rng.set_stream(1);
        let prepared = shuffled.filter_map(move |sample| {
            match preprocessor.prepare(&sample, &mut rng) {
                Ok(prepared) => Some(prepared),
                Err(rejection) => {
                    standard::SAMPLES_REJECTED.inc();
                    if let Rejection::Decode(e) = &rejection {
                        warn!("Handling decode error ({}). Skipping sample {}", e, sample.id());
                    } else {
                        debug!("Rejected sample {}: {}", sample.id(), rejection);
                    }
                    None
                }
            }
        });

        Box::new(BatchAssembler::new(prepared, self.config.batch_size, self.pad_id))
    }
}

/// Streaming dataset for one node of a training job
///
/// Cheap to share: streams keep the pipeline's internals alive on their own.
#[derive(Clone)]
pub struct Pipeline {
    inner: Arc<PipelineInner>,
}

impl Pipeline {
    /// Build a pipeline starting at epoch 0
    pub fn new(config: PipelineConfig, context: PreprocessContext) -> Result<Self> {
        Self::with_epoch(config, context, SharedEpoch::new(0))
    }

    /// Build a pipeline reading its epoch from `epoch`
    pub fn with_epoch(
        config: PipelineConfig,
        context: PreprocessContext,
        epoch: SharedEpoch,
    ) -> Result<Self> {
        config.validate()?;
        let workers = config.workers.max(1);

        let shards = ShardList::from_pattern(&config.shards)?;
        let required = workers as usize * config.world_size as usize;
        if !config.resampled && shards.len() < required {
            return Err(PipelineError::InsufficientShards {
                num_shards: shards.len(),
                required,
            });
        }

        let size = DatasetSize::discover(&config.shards, shards.shards())?;
        let total_samples = size.resolve(config.total_samples, &config.shards)?;
        let plan = EpochPlan::compute(
            total_samples,
            config.batch_size,
            config.world_size,
            workers,
            config.floor,
        );

        let runtime = PipelineRuntime::new(&config.runtime)?;
        let store = ShardStore::new(&config.storage)?;
        let pad_id = context.text_tokenizer.pad_token_id();
        let preprocessor = preprocessor_for(config.dataset_kind, context);

        info!(
            "Pipeline for {} ({} shards, {}): {} samples requested, {} batches per epoch on rank {}/{}, {} per worker",
            config.shards,
            shards.len(),
            config.dataset_kind,
            total_samples,
            plan.batches_per_epoch,
            config.rank,
            config.world_size,
            plan.batches_per_worker
        );

        Ok(Self {
            inner: Arc::new(PipelineInner {
                config,
                shards,
                plan,
                epoch,
                state: PipelineState::new(),
                preprocessor,
                pad_id,
                store,
                runtime,
            }),
        })
    }

    /// Advance the epoch; streams created afterwards see the new value
    pub fn set_epoch(&self, epoch: u64) {
        self.inner.epoch.set(epoch);
    }

    /// Current epoch
    pub fn epoch(&self) -> u64 {
        self.inner.epoch.get()
    }

    /// Shared epoch cell, for handing to other components
    pub fn shared_epoch(&self) -> SharedEpoch {
        self.inner.epoch.clone()
    }

    /// This node's batches for the current epoch, round-robin over workers
    pub fn iterate(&self) -> PipelineStream {
        let workers = (0..self.inner.config.workers.max(1))
            .filter_map(|w| self.iterate_worker(w).ok())
            .collect();
        PipelineStream {
            workers,
            next: 0,
            remaining: self.inner.plan.batches_per_epoch,
        }
    }

    /// One local worker's batches for the current epoch
    pub fn iterate_worker(&self, worker_id: u32) -> Result<WorkerStream> {
        let info = self.inner.worker_info(worker_id)?;
        let epoch = self.epoch();
        self.inner.state.begin_epoch(worker_id, epoch);
        Ok(WorkerStream {
            chain: None,
            inner: self.inner.clone(),
            info,
            epoch,
            pass: 0,
            emitted: 0,
            emitted_this_pass: 0,
            target: self.inner.plan.batches_per_worker,
        })
    }

    /// Batches this node emits per epoch
    pub fn batches_per_epoch(&self) -> u64 {
        self.inner.plan.batches_per_epoch
    }

    /// Samples consumed per epoch across all nodes
    pub fn samples_per_epoch(&self) -> u64 {
        self.inner.plan.samples_per_epoch
    }

    /// Batches each local worker emits per epoch
    pub fn batches_per_worker(&self) -> u64 {
        self.inner.plan.batches_per_worker
    }

    /// Full epoch sizing
    pub fn plan(&self) -> EpochPlan {
        self.inner.plan
    }

    /// Number of shards in the pattern
    pub fn num_shards(&self) -> usize {
        self.inner.shards.len()
    }

    /// Per-worker progress for the running epoch
    pub fn state(&self) -> &PipelineState {
        &self.inner.state
    }
}

/// Exactly `batches_per_worker` batches from one worker
///
/// When the worker's shards run out early the chain is rebuilt and read
/// again. A pass that yields nothing at all ends the stream instead.
pub struct WorkerStream {
    // Declared first: the chain must be dropped before the runtimes it runs on
    chain: Option<BatchIter>,
    inner: Arc<PipelineInner>,
    info: WorkerInfo,
    epoch: u64,
    pass: u64,
    emitted: u64,
    emitted_this_pass: u64,
    target: u64,
}

impl WorkerStream {
    /// Batches emitted so far
    pub fn emitted(&self) -> u64 {
        self.emitted
    }

    /// Batches this stream will emit in total
    pub fn target(&self) -> u64 {
        self.target
    }
}

impl Iterator for WorkerStream {
    type Item = Batch;

    fn next(&mut self) -> Option<Batch> {
        if self.emitted >= self.target {
            self.chain = None;
            return None;
        }

        loop {
            if self.chain.is_none() {
                self.emitted_this_pass = 0;
                self.chain = Some(self.inner.build_chain(&self.info, self.epoch, self.pass));
            }

            if let Some(batch) = self.chain.as_mut().and_then(|chain| chain.next()) {
                self.emitted += 1;
                self.emitted_this_pass += 1;
                self.inner.state.record_batch(self.info.worker_id);
                standard::BATCHES_EMITTED.inc();
                if self.emitted >= self.target {
                    self.chain = None;
                    debug!(
                        "Worker {} finished epoch {} with {} batches",
                        self.info.worker_id, self.epoch, self.emitted
                    );
                }
                return Some(batch);
            }

            self.chain = None;
            if self.emitted_this_pass == 0 {
                error!(
                    "Worker {} of rank {} produced no batches in a full pass over its shards; \
                     stopping at {}/{} for epoch {}",
                    self.info.worker_id, self.info.rank, self.emitted, self.target, self.epoch
                );
                self.target = self.emitted;
                return None;
            }

            info!(
                "Worker {} exhausted its shards after {}/{} batches, starting another pass",
                self.info.worker_id, self.emitted, self.target
            );
            self.pass += 1;
            standard::EPOCH_ROLLOVERS.inc();
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.target.saturating_sub(self.emitted) as usize;
        (0, Some(remaining))
    }
}

/// This node's batches for one epoch, interleaving local workers
pub struct PipelineStream {
    workers: Vec<WorkerStream>,
    next: usize,
    remaining: u64,
}

impl Iterator for PipelineStream {
    type Item = Batch;

    fn next(&mut self) -> Option<Batch> {
        if self.remaining == 0 || self.workers.is_empty() {
            return None;
        }

        for _ in 0..self.workers.len() {
            let index = self.next;
            self.next = (self.next + 1) % self.workers.len();
            if let Some(batch) = self.workers[index].next() {
                self.remaining -= 1;
                return Some(batch);
            }
        }

        self.remaining = 0;
        None
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (0, Some(self.remaining as usize))
    }
}

/// Record and sample counts of one shard
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ShardCount {
    pub shard: Shard,
    /// Archive entries read
    pub records: u64,
    /// Complete samples for the dataset kind
    pub samples: u64,
    /// Whether fetching or reading failed
    pub failed: bool,
}

/// Walk every shard of `config.shards` once and count its contents
pub fn count_samples(config: &PipelineConfig) -> Result<Vec<ShardCount>> {
    let shards = ShardList::from_pattern(&config.shards)?;
    let runtime = PipelineRuntime::new(&config.runtime)?;
    let store = ShardStore::new(&config.storage)?;
    let schema = config.dataset_kind.schema();

    let fetched = PrefetchStream::spawn(
        &runtime.io_handle(),
        shards.iter(),
        store,
        PrefetcherConfig {
            prefetch_depth: config.prefetch_depth,
        },
    );

    let mut counts = Vec::with_capacity(shards.len());
    for FetchedShard { shard, data } in fetched {
        let bytes = match data {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Counting {} stopped early: {}", shard, e);
                counts.push(ShardCount {
                    shard,
                    records: 0,
                    samples: 0,
                    failed: true,
                });
                continue;
            }
        };

        let mut records = ShardRecords::spawn(&runtime.compute_handle(), shard.clone(), bytes);
        let samples = SampleGrouper::new(records.by_ref(), schema.clone()).count();
        if let Some(e) = records.error() {
            warn!("Counting {} stopped early: {}", shard, e);
        }
        counts.push(ShardCount {
            records: records.read(),
            samples: samples as u64,
            failed: records.error().is_some(),
            shard,
        });
    }

    info!(
        "Counted {} samples in {} shards",
        counts.iter().map(|c| c.samples).sum::<u64>(),
        counts.len()
    );
    Ok(counts)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plan_ceil() {
        let plan = EpochPlan::compute(1000, 8, 2, 3, false);
        assert_eq!(plan.global_batch_size, 16);
        // ceil(1000 / 16) = 63, ceil(63 / 3) = 21
        assert_eq!(plan.batches_per_worker, 21);
        assert_eq!(plan.batches_per_epoch, 63);
        assert_eq!(plan.samples_per_epoch, 1008);
    }

    #[test]
    fn test_plan_floor() {
        let plan = EpochPlan::compute(1000, 8, 2, 3, true);
        // floor(1000 / 16) = 62, floor(62 / 3) = 20
        assert_eq!(plan.batches_per_worker, 20);
        assert_eq!(plan.batches_per_epoch, 60);
        assert_eq!(plan.samples_per_epoch, 960);
    }

    #[test]
    fn test_plan_zero_workers_clamped() {
        let plan = EpochPlan::compute(10, 2, 1, 0, false);
        assert_eq!(plan.batches_per_worker, 5);
        assert_eq!(plan.batches_per_epoch, 5);
    }

    #[test]
    fn test_validate() {
        let mut config = PipelineConfig {
            shards: "x.tar".into(),
            ..Default::default()
        };
        assert!(config.validate().is_ok());

        config.batch_size = 0;
        assert!(config.validate().unwrap_err().is_configuration());

        config.batch_size = 1;
        config.rank = 1;
        assert!(config.validate().unwrap_err().is_configuration());
    }

    #[test]
    fn test_config_deserializes_partial() {
        let config: PipelineConfig =
            serde_json::from_str(r#"{"shards": "a.tar", "dataset_kind": "text_span", "batch_size": 4}"#)
                .unwrap();
        assert_eq!(config.dataset_kind, DatasetKind::TextSpan);
        assert_eq!(config.batch_size, 4);
        assert_eq!(config.sample_shuffle_bufsize, 5000);
    }
}
