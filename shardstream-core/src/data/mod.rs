//! Streaming data pipeline
//!
//! Turns a shard pattern into fixed-size training batches: shard listing,
//! node and worker partitioning, prefetching, tar reading, sample grouping,
//! shuffling and batching.

pub mod archive;
pub mod batch;
pub mod dataset;
pub mod grouper;
pub mod loader;
pub mod pattern;
pub mod prefetcher;
pub mod shard;
pub mod shuffle;

pub use archive::{read_entries, ArchiveStream, RawRecord, ShardRecords};
pub use batch::{Batch, BatchAssembler, BatchTensors};
pub use dataset::{DatasetKind, DatasetSize};
pub use grouper::{GroupedSample, SampleGrouper, SampleSchema};
pub use loader::{
    count_samples, EpochPlan, Pipeline, PipelineConfig, PipelineStream, ShardCount, WorkerStream,
};
pub use pattern::expand_pattern;
pub use prefetcher::{FetchedShard, PrefetchStream, PrefetcherConfig};
pub use shard::{ResampledShards, Shard, ShardList, ShardSource};
pub use shuffle::{shuffle_seed, DeterministicShuffle, ShuffleConfig};
