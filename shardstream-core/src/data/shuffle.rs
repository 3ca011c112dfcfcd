//! Bounded-buffer shuffle
//!
//! Approximate shuffle over a stream: items are held in a reservoir of at most
//! `bufsize` entries, nothing is emitted until `initial` items are buffered,
//! then each new item displaces a randomly chosen buffered one. The generator
//! is seeded per iteration, so a given seed and epoch always produce the same
//! permutation of the same input.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

/// Reservoir sizes for one shuffle stage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShuffleConfig {
    /// Maximum buffered items
    pub bufsize: usize,
    /// Items buffered before the first emission
    pub initial: usize,
}

impl ShuffleConfig {
    /// Shard-level defaults
    pub const SHARDS: ShuffleConfig = ShuffleConfig {
        bufsize: 2000,
        initial: 500,
    };

    /// Sample-level defaults
    pub const SAMPLES: ShuffleConfig = ShuffleConfig {
        bufsize: 5000,
        initial: 1000,
    };
}

/// Seed for a shuffle stage at `epoch`.
///
/// A negative configured seed defers to `fallback`, the worker-derived seed.
pub fn shuffle_seed(seed: i64, fallback: u64, epoch: u64) -> u64 {
    let base = u64::try_from(seed).unwrap_or(fallback);
    base.wrapping_add(epoch)
}

/// Iterator adapter emitting `source` in shuffled order
pub struct DeterministicShuffle<I: Iterator> {
    source: I,
    buffer: Vec<I::Item>,
    bufsize: usize,
    initial: usize,
    rng: ChaCha8Rng,
    exhausted: bool,
}

impl<I: Iterator> DeterministicShuffle<I> {
    /// Shuffle `source` with a generator seeded from `seed`
    pub fn new(source: I, config: ShuffleConfig, seed: u64) -> Self {
        let bufsize = config.bufsize.max(1);
        Self {
            source,
            buffer: Vec::with_capacity(bufsize.min(8192)),
            bufsize,
            initial: config.initial.clamp(1, bufsize),
            rng: ChaCha8Rng::seed_from_u64(seed),
            exhausted: false,
        }
    }

    fn pick(&mut self) -> Option<I::Item> {
        if self.buffer.is_empty() {
            return None;
        }
        let k = self.rng.gen_range(0..self.buffer.len());
        Some(self.buffer.swap_remove(k))
    }
}

impl<I: Iterator> Iterator for DeterministicShuffle<I> {
    type Item = I::Item;

    fn next(&mut self) -> Option<I::Item> {
        while !self.exhausted {
            let Some(item) = self.source.next() else {
                self.exhausted = true;
                break;
            };
            self.buffer.push(item);

            if self.buffer.len() < self.bufsize {
                match self.source.next() {
                    Some(extra) => self.buffer.push(extra),
                    None => self.exhausted = true,
                }
            }

            if self.buffer.len() >= self.initial {
                return self.pick();
            }
        }
        self.pick()
    }
}
