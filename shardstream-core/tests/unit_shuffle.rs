//! Unit tests for the bounded-buffer shuffle
//!
//! Tests buffering limits and seed derivation.

use shardstream_core::data::{shuffle_seed, DeterministicShuffle, ShuffleConfig};

fn shuffled(n: u32, config: ShuffleConfig, seed: u64) -> Vec<u32> {
    DeterministicShuffle::new(0..n, config, seed).collect()
}

#[test]
fn test_bufsize_one_preserves_order() {
    let config = ShuffleConfig {
        bufsize: 1,
        initial: 1,
    };
    assert_eq!(shuffled(20, config, 9), (0..20).collect::<Vec<_>>());
}

#[test]
fn test_small_buffer_limits_displacement() {
    let config = ShuffleConfig {
        bufsize: 8,
        initial: 8,
    };
    let out = shuffled(500, config, 21);

    // An item cannot be emitted before it has been read
    for (position, &item) in out.iter().enumerate() {
        assert!(
            item as usize <= position + 8,
            "Item {} emitted too early at {}",
            item,
            position
        );
    }
}

#[test]
fn test_nothing_emitted_before_initial() {
    let config = ShuffleConfig {
        bufsize: 100,
        initial: 50,
    };
    let first = DeterministicShuffle::new(0..1000u32, config, 4).next().unwrap();
    assert!(first < 51, "First item must come from the initial buffer, got {}", first);
}

#[test]
fn test_shuffle_seed() {
    assert_eq!(shuffle_seed(100, 7, 2), 102);
    // Negative seeds defer to the fallback
    assert_eq!(shuffle_seed(-1, 7, 2), 9);
    assert_ne!(shuffle_seed(5, 0, 0), shuffle_seed(5, 0, 1));
}
