//! Coordination shared by all workers of a run
//!
//! Holds the epoch counter and the positional node/worker partitioning.

pub mod epoch;
pub mod partition;

pub use epoch::{PipelineState, SharedEpoch, WorkerProgress};
pub use partition::{split_by_node, split_by_worker, PartitionSplitter, WorkerInfo};
