//! Tokio runtimes for shard I/O and archive expansion
//!
//! Fetches run on a dedicated I/O runtime so consumers can stay synchronous:
//! they pull batches on their own threads while prefetch tasks keep the
//! network and disk busy. Decompression and tar parsing run on a separate
//! compute runtime so a large shard never stalls a fetch.

use serde::{Deserialize, Serialize};
use tokio::runtime::{Builder, Handle, Runtime};

use crate::error::{PipelineError, Result};

/// Configuration for the pipeline runtimes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Number of threads for I/O operations
    pub io_threads: usize,
    /// Number of threads for archive expansion
    pub compute_threads: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        let cpus = num_cpus::get();
        Self {
            io_threads: (cpus / 2).clamp(2, 8),
            compute_threads: (cpus / 2).max(2),
        }
    }
}

/// Owns the runtimes shared by every stream of a pipeline
///
/// Dropping it waits for running archive readers; they stop as soon as their
/// consumer is gone, so streams must be dropped first.
pub struct PipelineRuntime {
    io_runtime: Runtime,
    compute_runtime: Runtime,
}

impl PipelineRuntime {
    /// Create the runtimes with the given configuration
    pub fn new(config: &RuntimeConfig) -> Result<Self> {
        let io_runtime = Builder::new_multi_thread()
            .worker_threads(config.io_threads.max(1))
            .thread_name("shardstream-io")
            .enable_all()
            .build()
            .map_err(|e| PipelineError::Runtime {
                message: format!("Failed to create I/O runtime: {}", e),
            })?;

        let compute_runtime = Builder::new_multi_thread()
            .worker_threads(1)
            .max_blocking_threads(config.compute_threads.max(1))
            .thread_name("shardstream-compute")
            .build()
            .map_err(|e| PipelineError::Runtime {
                message: format!("Failed to create compute runtime: {}", e),
            })?;

        Ok(Self {
            io_runtime,
            compute_runtime,
        })
    }

    /// Handle for spawning fetches
    pub fn io_handle(&self) -> Handle {
        self.io_runtime.handle().clone()
    }

    /// Handle for spawning blocking archive readers
    pub fn compute_handle(&self) -> Handle {
        self.compute_runtime.handle().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spawned_task_completes() {
        let runtime = PipelineRuntime::new(&RuntimeConfig::default()).unwrap();
        let handle = runtime.io_handle();
        let task = handle.spawn(async { "done" });
        assert_eq!(handle.block_on(task).unwrap(), "done");
    }

    #[test]
    fn test_blocking_work_on_compute_runtime() {
        let config = RuntimeConfig {
            io_threads: 1,
            compute_threads: 1,
        };
        let runtime = PipelineRuntime::new(&config).unwrap();
        let handle = runtime.compute_handle();
        let task = handle.spawn_blocking(|| std::thread::current().name().map(str::to_string));
        let name = handle.block_on(task).unwrap();
        assert_eq!(name.as_deref(), Some("shardstream-compute"));
    }
}
