//! Unit tests for shard listing and partitioning
//!
//! Tests pattern expansion, resampling and node/worker splits.

use std::collections::HashSet;

use shardstream_core::coordinator::{split_by_node, PartitionSplitter, WorkerInfo};
use shardstream_core::data::{expand_pattern, ResampledShards, Shard, ShardList, ShardSource};
use shardstream_core::PipelineError;

#[test]
fn test_brace_range_expansion() {
    let urls = expand_pattern("/data/shard-{0000..0003}.tar").unwrap();
    assert_eq!(
        urls,
        vec![
            "/data/shard-0000.tar",
            "/data/shard-0001.tar",
            "/data/shard-0002.tar",
            "/data/shard-0003.tar",
        ]
    );
}

#[test]
fn test_pattern_list_concatenates() {
    let urls = expand_pattern("a-{0..1}.tar::http://host/b-{x,y}.tar").unwrap();
    assert_eq!(
        urls,
        vec!["a-0.tar", "a-1.tar", "http://host/b-x.tar", "http://host/b-y.tar"]
    );
}

#[test]
fn test_empty_pattern_rejected() {
    let err = ShardList::from_pattern(" :: ").unwrap_err();
    assert!(matches!(err, PipelineError::EmptyShardPattern { .. }));
    assert!(err.is_configuration());
}

#[test]
fn test_glob_expansion_sorted() {
    let dir = tempfile::tempdir().unwrap();
    for name in ["c.tar", "a.tar", "b.tar", "notes.txt"] {
        std::fs::write(dir.path().join(name), b"").unwrap();
    }

    let pattern = format!("{}/*.tar", dir.path().display());
    let list = ShardList::from_pattern(&pattern).unwrap();
    let names: Vec<&str> = list.shards().iter().map(|s| s.basename()).collect();
    assert_eq!(names, vec!["a.tar", "b.tar", "c.tar"]);
}

#[test]
fn test_resampled_deterministic_per_epoch() {
    let list = ShardList::from_pattern("s-{00..19}.tar").unwrap();
    let resampled = ResampledShards::new(&list, Some(50), 7);

    let first: Vec<Shard> = resampled.iter(0).collect();
    let again: Vec<Shard> = resampled.iter(0).collect();
    assert_eq!(first.len(), 50);
    assert_eq!(first, again, "Same seed and epoch should draw the same shards");

    let next_epoch: Vec<Shard> = resampled.iter(1).collect();
    assert_ne!(first, next_epoch, "A new epoch should draw a new sequence");
}

#[test]
fn test_unbounded_resampling_keeps_going() {
    let list = ShardList::from_pattern("only.tar").unwrap();
    let source = ShardSource::Resampled(ResampledShards::new(&list, None, 1));
    assert!(source.is_resampled());
    assert_eq!(source.iter(0).take(1000).count(), 1000);
}

#[test]
fn test_exhaustive_source_ignores_epoch() {
    let list = ShardList::from_pattern("s-{0..4}.tar").unwrap();
    let source = ShardSource::Exhaustive(list);
    assert!(!source.is_resampled());

    let first: Vec<Shard> = source.iter(0).collect();
    assert_eq!(first.len(), 5);
    assert_eq!(first, source.iter(3).collect::<Vec<_>>());
}

#[test]
fn test_partition_is_disjoint_and_complete() {
    let list = ShardList::from_pattern("s-{000..099}.tar").unwrap();
    let (world, workers) = (3, 4);

    let mut seen = HashSet::new();
    let mut total = 0;
    for rank in 0..world {
        for worker in 0..workers {
            let info = WorkerInfo::new(rank, world, worker, workers).unwrap();
            for shard in PartitionSplitter::new(info).split(list.iter()) {
                assert!(seen.insert(shard.url.clone()), "{} assigned twice", shard);
                total += 1;
            }
        }
    }
    assert_eq!(total, 100);
}

#[test]
fn test_split_by_node_is_strided() {
    let picked: Vec<u32> = split_by_node(0..10u32, 1, 3).collect();
    assert_eq!(picked, vec![1, 4, 7]);
}

#[test]
fn test_worker_info_validation() {
    assert!(WorkerInfo::new(2, 2, 0, 1).is_err());
    assert!(WorkerInfo::new(0, 1, 3, 3).is_err());
    assert!(WorkerInfo::new(0, 0, 0, 1).is_err());

    let a = WorkerInfo::new(0, 2, 1, 2).unwrap();
    let b = WorkerInfo::new(1, 2, 0, 2).unwrap();
    assert_ne!(a.worker_seed(), b.worker_seed());
    assert_eq!(a.worker_seed(), WorkerInfo::new(0, 2, 1, 2).unwrap().worker_seed());
}
