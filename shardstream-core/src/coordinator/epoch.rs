//! Epoch synchronization
//!
//! A single shared counter read by every seeded stage, plus per-worker
//! progress bookkeeping for the current epoch.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

use crate::metrics::standard;

/// Shared epoch cell
///
/// Cloning is cheap and every clone observes the same value. The training
/// loop is the only writer; streams read it once when they start, so every
/// seeded stage of a stream sees the same epoch.
#[derive(Debug, Clone, Default)]
pub struct SharedEpoch {
    value: Arc<AtomicU64>,
}

impl SharedEpoch {
    /// Create a new epoch cell (0 for a fresh run, or a resumed epoch)
    pub fn new(epoch: u64) -> Self {
        standard::CURRENT_EPOCH.set(epoch as i64);
        Self {
            value: Arc::new(AtomicU64::new(epoch)),
        }
    }

    /// Get the current epoch
    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Acquire)
    }

    /// Set the epoch. Epochs never move backwards; a smaller value is ignored.
    pub fn set(&self, epoch: u64) -> u64 {
        let previous = self.value.fetch_max(epoch, Ordering::AcqRel);
        if epoch < previous {
            warn!("Ignoring epoch rollback from {} to {}", previous, epoch);
            return previous;
        }
        if epoch != previous {
            info!("Epoch advanced from {} to {}", previous, epoch);
        }
        standard::CURRENT_EPOCH.set(epoch as i64);
        epoch
    }
}

/// Progress of one worker within an epoch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerProgress {
    /// Epoch the counts belong to
    pub epoch: u64,
    /// Batches emitted so far in that epoch
    pub batches_emitted: u64,
}

/// Per-worker batch counts for the running epoch
///
/// Diagnostics only; nothing here is persisted.
#[derive(Debug, Default)]
pub struct PipelineState {
    workers: RwLock<HashMap<u32, WorkerProgress>>,
}

impl PipelineState {
    /// Create an empty state
    pub fn new() -> Self {
        Self::default()
    }

    /// Reset a worker at the start of an epoch
    pub fn begin_epoch(&self, worker_id: u32, epoch: u64) {
        self.workers.write().insert(
            worker_id,
            WorkerProgress {
                epoch,
                batches_emitted: 0,
            },
        );
    }

    /// Record one emitted batch, returning the worker's running count
    pub fn record_batch(&self, worker_id: u32) -> u64 {
        let mut workers = self.workers.write();
        let progress = workers.entry(worker_id).or_default();
        progress.batches_emitted += 1;
        progress.batches_emitted
    }

    /// Progress of a single worker
    pub fn progress(&self, worker_id: u32) -> Option<WorkerProgress> {
        self.workers.read().get(&worker_id).copied()
    }

}
