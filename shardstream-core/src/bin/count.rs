//! Shard counting binary
//!
//! Reads every shard of `SHARDSTREAM_SHARDS` (or the first argument) once and
//! prints per-shard record and sample counts, then the pipeline metrics.

use shardstream_core::data::count_samples;
use shardstream_core::metrics::gather_pipeline_metrics;
use shardstream_core::{PipelineConfig, LOG_ENV};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let filter = EnvFilter::try_from_env(LOG_ENV)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut config = PipelineConfig::from_env()?;
    if let Some(pattern) = std::env::args().nth(1) {
        config.shards = pattern;
    }

    info!("Counting {} as {}", config.shards, config.dataset_kind);

    let counts = match count_samples(&config) {
        Ok(counts) => counts,
        Err(e) => {
            error!("Failed to count {}: {}", config.shards, e);
            return Err(e.into());
        }
    };

    for count in &counts {
        let status = if count.failed { " (incomplete)" } else { "" };
        println!("{}\t{}\t{}{}", count.shard, count.records, count.samples, status);
    }
    let total: u64 = counts.iter().map(|c| c.samples).sum();
    println!("total\t{}", total);

    print!("{}", gather_pipeline_metrics());
    Ok(())
}
