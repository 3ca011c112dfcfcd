//! Shardstream Core - Streaming sharded datasets into training batches
//!
//! This crate provides:
//! - Shard pattern expansion, resampling and node/worker partitioning
//! - Prefetched reading of tar shards from local disk or HTTP
//! - Sample grouping, deterministic shuffling and batching
//! - Paired, masked-span and interleaved preprocessing policies

pub mod coordinator;
pub mod data;
pub mod error;
pub mod metrics;
pub mod preprocess;
pub mod runtime;
pub mod storage;

pub use coordinator::{SharedEpoch, WorkerInfo};
pub use data::{Batch, BatchTensors, DatasetKind, Pipeline, PipelineConfig};
pub use error::{PipelineError, Result};
pub use preprocess::PreprocessContext;

/// Environment variable read for the log filter before `RUST_LOG`
pub const LOG_ENV: &str = "SHARDSTREAM_LOG";
