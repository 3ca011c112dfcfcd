//! Prometheus-style pipeline metrics
//!
//! Process-wide counters, gauges and histograms. Every worker stream of every
//! pipeline in the process reports into the same statics.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Instant;

/// Counter metric (monotonically increasing)
pub struct Counter {
    value: AtomicU64,
    name: String,
    help: String,
}

impl Counter {
    /// Create a new counter
    pub fn new(name: &str, help: &str) -> Self {
        Self {
            value: AtomicU64::new(0),
            name: name.into(),
            help: help.into(),
        }
    }

    /// Increment by 1
    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment by delta
    pub fn inc_by(&self, delta: u64) {
        self.value.fetch_add(delta, Ordering::Relaxed);
    }

    /// Current value
    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }

    /// Prometheus text exposition
    pub fn to_prometheus(&self) -> String {
        format!(
            "# HELP {} {}\n# TYPE {} counter\n{} {}\n",
            self.name,
            self.help,
            self.name,
            self.name,
            self.get()
        )
    }
}

/// Gauge metric (can go up or down)
pub struct Gauge {
    value: AtomicI64,
    name: String,
    help: String,
}

impl Gauge {
    /// Create a new gauge
    pub fn new(name: &str, help: &str) -> Self {
        Self {
            value: AtomicI64::new(0),
            name: name.into(),
            help: help.into(),
        }
    }

    /// Set value
    pub fn set(&self, val: i64) {
        self.value.store(val, Ordering::Relaxed);
    }

    /// Increment by 1
    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    /// Decrement by 1
    pub fn dec(&self) {
        self.value.fetch_sub(1, Ordering::Relaxed);
    }

    /// Current value
    pub fn get(&self) -> i64 {
        self.value.load(Ordering::Relaxed)
    }

    /// Prometheus text exposition
    pub fn to_prometheus(&self) -> String {
        format!(
            "# HELP {} {}\n# TYPE {} gauge\n{} {}\n",
            self.name,
            self.help,
            self.name,
            self.name,
            self.get()
        )
    }
}

/// Histogram for latency measurements
pub struct Histogram {
    buckets: Vec<(f64, AtomicU64)>,
    sum_micros: AtomicU64,
    count: AtomicU64,
    name: String,
    help: String,
}

impl Histogram {
    /// Create with default latency buckets (seconds)
    pub fn new(name: &str, help: &str) -> Self {
        Self::with_buckets(
            name,
            help,
            vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0],
        )
    }

    /// Create with custom buckets
    pub fn with_buckets(name: &str, help: &str, bounds: Vec<f64>) -> Self {
        let buckets = bounds.into_iter().map(|b| (b, AtomicU64::new(0))).collect();
        Self {
            buckets,
            sum_micros: AtomicU64::new(0),
            count: AtomicU64::new(0),
            name: name.into(),
            help: help.into(),
        }
    }

    /// Observe a value
    pub fn observe(&self, value: f64) {
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum_micros
            .fetch_add((value * 1_000_000.0) as u64, Ordering::Relaxed);
        for (bound, count) in &self.buckets {
            if value <= *bound {
                count.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Start a timer that observes the elapsed seconds when dropped
    pub fn start_timer(&self) -> HistogramTimer<'_> {
        HistogramTimer {
            histogram: self,
            start: Instant::now(),
        }
    }

    /// Number of observations
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    /// Prometheus text exposition
    pub fn to_prometheus(&self) -> String {
        let mut output = format!(
            "# HELP {} {}\n# TYPE {} histogram\n",
            self.name, self.help, self.name
        );

        for (bound, count) in &self.buckets {
            output.push_str(&format!(
                "{}_bucket{{le=\"{}\"}} {}\n",
                self.name,
                bound,
                count.load(Ordering::Relaxed)
            ));
        }
        output.push_str(&format!(
            "{}_bucket{{le=\"+Inf\"}} {}\n",
            self.name,
            self.count()
        ));

        let sum_secs = self.sum_micros.load(Ordering::Relaxed) as f64 / 1_000_000.0;
        output.push_str(&format!("{}_sum {}\n", self.name, sum_secs));
        output.push_str(&format!("{}_count {}\n", self.name, self.count()));
        output
    }
}

/// Guard returned by [`Histogram::start_timer`]
pub struct HistogramTimer<'a> {
    histogram: &'a Histogram,
    start: Instant,
}

impl Drop for HistogramTimer<'_> {
    fn drop(&mut self) {
        self.histogram.observe(self.start.elapsed().as_secs_f64());
    }
}

/// Standard pipeline metrics
pub mod standard {
    use super::*;
    use std::sync::LazyLock;

    pub static SHARDS_OPENED: LazyLock<Counter> = LazyLock::new(|| {
        Counter::new("shardstream_shards_opened_total", "Shards fetched and expanded")
    });

    pub static SHARD_ERRORS: LazyLock<Counter> = LazyLock::new(|| {
        Counter::new(
            "shardstream_shard_errors_total",
            "Shards skipped or cut short by fetch or archive errors",
        )
    });

    pub static BYTES_FETCHED: LazyLock<Counter> = LazyLock::new(|| {
        Counter::new("shardstream_bytes_fetched_total", "Shard bytes read from storage")
    });

    pub static RECORDS_READ: LazyLock<Counter> = LazyLock::new(|| {
        Counter::new("shardstream_records_read_total", "Archive entries read")
    });

    pub static RECORD_ERRORS: LazyLock<Counter> = LazyLock::new(|| {
        Counter::new("shardstream_record_errors_total", "Archive entries that failed to read")
    });

    pub static SAMPLES_GROUPED: LazyLock<Counter> = LazyLock::new(|| {
        Counter::new("shardstream_samples_grouped_total", "Complete samples grouped")
    });

    pub static SAMPLES_INCOMPLETE: LazyLock<Counter> = LazyLock::new(|| {
        Counter::new(
            "shardstream_samples_incomplete_total",
            "Samples dropped for missing required fields",
        )
    });

    pub static SAMPLES_REJECTED: LazyLock<Counter> = LazyLock::new(|| {
        Counter::new("shardstream_samples_rejected_total", "Samples rejected by preprocessing")
    });

    pub static BATCHES_EMITTED: LazyLock<Counter> = LazyLock::new(|| {
        Counter::new("shardstream_batches_emitted_total", "Batches handed to consumers")
    });

    pub static EPOCH_ROLLOVERS: LazyLock<Counter> = LazyLock::new(|| {
        Counter::new(
            "shardstream_epoch_rollovers_total",
            "Worker streams restarted to complete an epoch",
        )
    });

    pub static CURRENT_EPOCH: LazyLock<Gauge> =
        LazyLock::new(|| Gauge::new("shardstream_current_epoch", "Current epoch"));

    pub static ACTIVE_PREFETCHERS: LazyLock<Gauge> = LazyLock::new(|| {
        Gauge::new("shardstream_active_prefetchers", "Running shard prefetch tasks")
    });

    pub static SHARD_FETCH_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
        Histogram::new("shardstream_shard_fetch_duration_seconds", "Shard fetch latency")
    });
}

/// Gather all standard metrics in Prometheus text format
pub fn gather_pipeline_metrics() -> String {
    let mut output = String::new();

    output.push_str(&standard::SHARDS_OPENED.to_prometheus());
    output.push_str(&standard::SHARD_ERRORS.to_prometheus());
    output.push_str(&standard::BYTES_FETCHED.to_prometheus());
    output.push_str(&standard::RECORDS_READ.to_prometheus());
    output.push_str(&standard::RECORD_ERRORS.to_prometheus());
    output.push_str(&standard::SAMPLES_GROUPED.to_prometheus());
    output.push_str(&standard::SAMPLES_INCOMPLETE.to_prometheus());
    output.push_str(&standard::SAMPLES_REJECTED.to_prometheus());
    output.push_str(&standard::BATCHES_EMITTED.to_prometheus());
    output.push_str(&standard::EPOCH_ROLLOVERS.to_prometheus());

    output.push_str(&standard::CURRENT_EPOCH.to_prometheus());
    output.push_str(&standard::ACTIVE_PREFETCHERS.to_prometheus());

    output.push_str(&standard::SHARD_FETCH_DURATION.to_prometheus());

    output
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter() {
        let counter = Counter::new("test_counter", "Test counter");
        assert_eq!(counter.get(), 0);

        counter.inc();
        counter.inc_by(5);
        assert_eq!(counter.get(), 6);
        assert!(counter.to_prometheus().contains("test_counter 6"));
    }

    #[test]
    fn test_gauge() {
        let gauge = Gauge::new("test_gauge", "Test gauge");
        gauge.set(10);
        gauge.dec();
        assert_eq!(gauge.get(), 9);
    }

    #[test]
    fn test_histogram_timer() {
        let histogram = Histogram::new("test_histogram", "Test histogram");
        histogram.observe(0.001);
        {
            let _timer = histogram.start_timer();
        }

        assert_eq!(histogram.count(), 2);
        let text = histogram.to_prometheus();
        assert!(text.contains("test_histogram_count 2"));
        assert!(text.contains("le=\"+Inf\"} 2"));
    }

    #[test]
    fn test_gather_lists_every_family() {
        let text = gather_pipeline_metrics();
        assert!(text.contains("shardstream_samples_rejected_total"));
        assert!(text.contains("shardstream_shard_fetch_duration_seconds_count"));
    }
}
