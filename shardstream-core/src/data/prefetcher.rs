//! Async shard prefetcher
//!
//! Runs on the I/O runtime, fetching shards ahead of consumption in order.
//! The bounded channel is the only backpressure: the task parks on `send`
//! once `prefetch_depth` shards are waiting. Dropping the consumer side stops
//! the task.

use bytes::Bytes;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use super::shard::Shard;
use crate::error::Result;
use crate::metrics::standard;
use crate::storage::ShardStore;

/// A shard and the outcome of fetching it
#[derive(Debug)]
pub struct FetchedShard {
    /// Which shard was fetched
    pub shard: Shard,
    /// Its bytes, or why they could not be read
    pub data: Result<Bytes>,
}

/// Configuration for the prefetcher
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrefetcherConfig {
    /// Shards fetched ahead of the consumer
    pub prefetch_depth: usize,
}

impl Default for PrefetcherConfig {
    fn default() -> Self {
        Self { prefetch_depth: 2 }
    }
}

/// Background task feeding fetched shards into a channel
pub struct Prefetcher<S> {
    sender: mpsc::Sender<FetchedShard>,
    shards: S,
    store: ShardStore,
}

struct ActiveGuard;

impl ActiveGuard {
    fn new() -> Self {
        standard::ACTIVE_PREFETCHERS.inc();
        ActiveGuard
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        standard::ACTIVE_PREFETCHERS.dec();
    }
}

impl<S> Prefetcher<S>
where
    S: Iterator<Item = Shard> + Send + 'static,
{
    /// Create a prefetcher over `shards`
    pub fn new(sender: mpsc::Sender<FetchedShard>, shards: S, store: ShardStore) -> Self {
        Self {
            sender,
            shards,
            store,
        }
    }

    /// Fetch every shard in order until the list ends or the consumer leaves
    pub async fn run(mut self) {
        let _active = ActiveGuard::new();
        let mut fetched = 0usize;

        while let Some(shard) = self.shards.next() {
            if self.sender.is_closed() {
                break;
            }
            let data = self.store.fetch(&shard).await;
            if self.sender.send(FetchedShard { shard, data }).await.is_err() {
                debug!("Prefetcher: consumer dropped, stopping after {} shards", fetched);
                return;
            }
            fetched += 1;
        }

        debug!("Prefetcher completed, {} shards fetched", fetched);
    }
}

/// Consumer side of a running prefetcher
///
/// Iterating blocks the calling thread; it must not be driven from inside an
/// async context. Dropping it aborts the task.
pub struct PrefetchStream {
    receiver: mpsc::Receiver<FetchedShard>,
    task: JoinHandle<()>,
}

impl PrefetchStream {
    /// Spawn a prefetcher for `shards` on `handle`
    pub fn spawn<S>(handle: &Handle, shards: S, store: ShardStore, config: PrefetcherConfig) -> Self
    where
        S: Iterator<Item = Shard> + Send + 'static,
    {
        let (sender, receiver) = mpsc::channel(config.prefetch_depth.max(1));
        let task = handle.spawn(Prefetcher::new(sender, shards, store).run());
        Self { receiver, task }
    }
}

impl Iterator for PrefetchStream {
    type Item = FetchedShard;

    fn next(&mut self) -> Option<FetchedShard> {
        self.receiver.blocking_recv()
    }
}

impl Drop for PrefetchStream {
    fn drop(&mut self) {
        self.receiver.close();
        self.task.abort();
    }
}
