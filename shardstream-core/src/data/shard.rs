//! Shard enumeration and resampling
//!
//! A shard is one archive, identified by path or URL. Shards are either
//! listed exhaustively in pattern order or drawn with replacement from the
//! expanded pool, seeded from `seed + epoch`.

use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::debug;

use super::pattern::{expand_pattern, is_remote};
use crate::error::Result;

/// Identifier of one archive file
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Shard {
    /// Local path or http(s) URL
    pub url: String,
}

impl Shard {
    /// Create a shard identifier
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    /// File name without directories or query string
    pub fn basename(&self) -> &str {
        let path = self.url.split(['?', '#']).next().unwrap_or(&self.url);
        path.rsplit('/').next().unwrap_or(path)
    }

    /// Whether the shard must be fetched over the network
    pub fn is_remote(&self) -> bool {
        is_remote(&self.url)
    }
}

impl fmt::Display for Shard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.url)
    }
}

/// Shards listed once each, in pattern order
#[derive(Debug, Clone)]
pub struct ShardList {
    shards: Arc<[Shard]>,
}

impl ShardList {
    /// Expand a pattern; zero matches is a configuration error
    pub fn from_pattern(pattern: &str) -> Result<Self> {
        let shards: Vec<Shard> = expand_pattern(pattern)?
            .into_iter()
            .map(Shard::new)
            .collect();
        debug!("Pattern {} expanded to {} shards", pattern, shards.len());
        Ok(Self {
            shards: shards.into(),
        })
    }

    /// Build from already known shards
    pub fn from_shards(shards: Vec<Shard>) -> Self {
        Self {
            shards: shards.into(),
        }
    }

    /// All shards
    pub fn shards(&self) -> &[Shard] {
        &self.shards
    }

    /// Number of shards
    pub fn len(&self) -> usize {
        self.shards.len()
    }

    /// Whether the list is empty
    pub fn is_empty(&self) -> bool {
        self.shards.is_empty()
    }

    /// Every shard exactly once
    pub fn iter(&self) -> ShardListIter {
        ShardListIter {
            shards: self.shards.clone(),
            position: 0,
        }
    }
}

/// Owning iterator over a [`ShardList`]
pub struct ShardListIter {
    shards: Arc<[Shard]>,
    position: usize,
}

impl Iterator for ShardListIter {
    type Item = Shard;

    fn next(&mut self) -> Option<Shard> {
        let shard = self.shards.get(self.position)?.clone();
        self.position += 1;
        Some(shard)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.shards.len() - self.position;
        (remaining, Some(remaining))
    }
}

/// Shards drawn uniformly with replacement
#[derive(Debug, Clone)]
pub struct ResampledShards {
    shards: Arc<[Shard]>,
    /// Number of draws per iteration; `None` is unbounded
    nshards: Option<u64>,
    seed: u64,
}

impl ResampledShards {
    /// Create a resampler over `list`, reseeded from `seed + epoch` per iteration
    pub fn new(list: &ShardList, nshards: Option<u64>, seed: u64) -> Self {
        Self {
            shards: list.shards.clone(),
            nshards,
            seed,
        }
    }

    /// Start the draw sequence of `epoch`
    pub fn iter(&self, epoch: u64) -> ResampledIter {
        debug!(
            "Resampling {} shards with seed {} at epoch {}",
            self.shards.len(),
            self.seed,
            epoch
        );
        ResampledIter {
            shards: self.shards.clone(),
            remaining: self.nshards,
            rng: ChaCha8Rng::seed_from_u64(self.seed.wrapping_add(epoch)),
        }
    }
}

/// Iterator over resampled shard draws
pub struct ResampledIter {
    shards: Arc<[Shard]>,
    remaining: Option<u64>,
    rng: ChaCha8Rng,
}

impl Iterator for ResampledIter {
    type Item = Shard;

    fn next(&mut self) -> Option<Shard> {
        if let Some(remaining) = self.remaining.as_mut() {
            if *remaining == 0 {
                return None;
            }
            *remaining -= 1;
        }
        self.shards.choose(&mut self.rng).cloned()
    }
}

/// How shards are enumerated
#[derive(Debug, Clone)]
pub enum ShardSource {
    /// Every shard once per iteration
    Exhaustive(ShardList),
    /// Draws with replacement
    Resampled(ResampledShards),
}

impl ShardSource {
    /// Begin one iteration over shard identifiers for `epoch`
    ///
    /// Exhaustive listing is the same for every epoch; ordering it per epoch
    /// is the shard shuffle's job.
    pub fn iter(&self, epoch: u64) -> Box<dyn Iterator<Item = Shard> + Send> {
        match self {
            ShardSource::Exhaustive(list) => Box::new(list.iter()),
            ShardSource::Resampled(resampled) => Box::new(resampled.iter(epoch)),
        }
    }

    /// Whether shards are drawn with replacement
    pub fn is_resampled(&self) -> bool {
        matches!(self, ShardSource::Resampled(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn list(n: usize) -> ShardList {
        ShardList::from_shards((0..n).map(|i| Shard::new(format!("s{}.tar", i))).collect())
    }

    #[test]
    fn test_basename() {
        let shard = Shard::new("https://host/data/shard-001.tar?sig=abc");
        assert_eq!(shard.basename(), "shard-001.tar");
        assert!(shard.is_remote());
        assert_eq!(Shard::new("/data/x.tar").basename(), "x.tar");
    }

    #[test]
    fn test_exhaustive_yields_each_once() {
        let shards: Vec<Shard> = list(5).iter().collect();
        assert_eq!(shards.len(), 5);
        assert_eq!(shards[4].url, "s4.tar");
    }

    #[test]
    fn test_resampled_reproducible_per_epoch() {
        let resampled = ResampledShards::new(&list(10), Some(20), 7);

        let a: Vec<Shard> = resampled.iter(0).collect();
        let b: Vec<Shard> = resampled.iter(0).collect();
        assert_eq!(a.len(), 20);
        assert_eq!(a, b);

        let c: Vec<Shard> = resampled.iter(1).collect();
        assert_ne!(a, c);
    }

    #[test]
    fn test_resampled_unbounded() {
        let resampled = ResampledShards::new(&list(2), None, 0);
        assert_eq!(resampled.iter(0).take(1000).count(), 1000);
    }
}
