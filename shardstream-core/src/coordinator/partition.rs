//! Deterministic stream partitioning
//!
//! Splits a stream first by node, then by local worker. Both splits are
//! positional, so no coordination is needed as long as the upstream order is
//! itself deterministic.

use crate::error::{PipelineError, Result};

/// Position of one worker in the distributed job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WorkerInfo {
    /// Node index
    pub rank: u32,
    /// Number of nodes
    pub world_size: u32,
    /// Local worker index within the node
    pub worker_id: u32,
    /// Local workers per node
    pub num_workers: u32,
}

impl WorkerInfo {
    /// Create and validate a worker position
    pub fn new(rank: u32, world_size: u32, worker_id: u32, num_workers: u32) -> Result<Self> {
        if world_size == 0 || num_workers == 0 {
            return Err(PipelineError::invalid_config(
                "world size and worker count must be at least 1",
            ));
        }
        if rank >= world_size {
            return Err(PipelineError::invalid_config(format!(
                "rank {} out of range for world size {}",
                rank, world_size
            )));
        }
        if worker_id >= num_workers {
            return Err(PipelineError::invalid_config(format!(
                "worker {} out of range for {} workers",
                worker_id, num_workers
            )));
        }
        Ok(Self {
            rank,
            world_size,
            worker_id,
            num_workers,
        })
    }

    /// Seed unique to this worker, stable across restarts
    pub fn worker_seed(&self) -> u64 {
        let index = ((self.rank as u64) << 32) | self.worker_id as u64;
        splitmix64(index ^ 0x5EED_5EED_5EED_5EED)
    }
}

/// Positional two-level splitter
#[derive(Debug, Clone, Copy)]
pub struct PartitionSplitter {
    info: WorkerInfo,
}

impl PartitionSplitter {
    /// Create a splitter for one worker
    pub fn new(info: WorkerInfo) -> Self {
        Self { info }
    }

    /// Keep only the elements routed to this worker
    pub fn split<I>(&self, source: I) -> impl Iterator<Item = I::Item>
    where
        I: Iterator,
    {
        let by_node = split_by_node(source, self.info.rank, self.info.world_size);
        split_by_worker(by_node, self.info.worker_id, self.info.num_workers)
    }
}

/// Keep every `world_size`-th element starting at `rank`
pub fn split_by_node<I>(source: I, rank: u32, world_size: u32) -> impl Iterator<Item = I::Item>
where
    I: Iterator,
{
    source.skip(rank as usize).step_by(world_size.max(1) as usize)
}

/// Keep every `num_workers`-th element starting at `worker_id`
pub fn split_by_worker<I>(
    source: I,
    worker_id: u32,
    num_workers: u32,
) -> impl Iterator<Item = I::Item>
where
    I: Iterator,
{
    source
        .skip(worker_id as usize)
        .step_by(num_workers.max(1) as usize)
}

/// SplitMix64 finalizer, used to spread small integers into seeds
pub(crate) fn splitmix64(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9E37_79B9_7F4A_7C15);
    x = (x ^ (x >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    x = (x ^ (x >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    x ^ (x >> 31)
}
