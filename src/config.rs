use std::sync::Arc;

use crate::errinj::Injection;

/// Configuration for the background maintenance scheduler.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Total number of background write workers, split between the dump
    /// and compaction pools. Must be greater than 1.
    pub write_threads: usize,

    /// Lower bound for the failure throttle timeout, in seconds (default: 1).
    pub timeout_min: f64,

    /// Upper bound for the failure throttle timeout, in seconds (default: 60).
    pub timeout_max: f64,

    /// Error-injection knobs consulted by this scheduler instance.
    pub injection: Arc<Injection>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            write_threads: 4,
            timeout_min: 1.0,
            timeout_max: 60.0,
            injection: Arc::new(Injection::new()),
        }
    }
}

impl SchedulerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the total worker count.
    pub fn write_threads(mut self, count: usize) -> Self {
        self.write_threads = count;
        self
    }

    /// Override the throttle timeout bounds. Tests use this to compress the
    /// 1..60 second production range.
    pub fn throttle_timeouts(mut self, min: f64, max: f64) -> Self {
        self.timeout_min = min;
        self.timeout_max = max;
        self
    }

    /// Install shared error-injection knobs.
    pub fn injection(mut self, injection: Arc<Injection>) -> Self {
        self.injection = injection;
        self
    }

    /// Number of workers reserved for dump tasks. Dumps release memory and
    /// must never wait behind long compactions, so they get their own pool
    /// of a quarter of the threads.
    pub fn dump_threads(&self) -> usize {
        std::cmp::max(1, self.write_threads / 4)
    }

    /// Number of workers reserved for compaction tasks.
    pub fn compact_threads(&self) -> usize {
        self.write_threads - self.dump_threads()
    }
}

/// Per-LSM-tree policy knobs, snapshotted into each task at construction.
#[derive(Debug, Clone)]
pub struct LsmOpts {
    /// Bloom filter false-positive rate for new runs (default: 0.05).
    pub bloom_fpr: f64,

    /// Target data-block size for new runs, in bytes (default: 4096).
    pub page_size: usize,

    /// How many runs a single range level may hold before the range becomes
    /// a compaction candidate (default: 2).
    pub run_count_per_level: usize,

    /// Ratio between the sizes of adjacent range levels used when grouping
    /// slices into levels (default: 2).
    pub run_size_ratio: u64,

    /// Target range size in statements; ranges split above twice this and
    /// coalesce below half of it (default: 1_000_000).
    pub range_size: u64,
}

impl Default for LsmOpts {
    fn default() -> Self {
        Self {
            bloom_fpr: 0.05,
            page_size: 4096,
            run_count_per_level: 2,
            run_size_ratio: 2,
            range_size: 1_000_000,
        }
    }
}

impl LsmOpts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bloom_fpr(mut self, fpr: f64) -> Self {
        self.bloom_fpr = fpr;
        self
    }

    pub fn page_size(mut self, size: usize) -> Self {
        self.page_size = size;
        self
    }

    pub fn run_count_per_level(mut self, count: usize) -> Self {
        self.run_count_per_level = count;
        self
    }

    pub fn range_size(mut self, size: u64) -> Self {
        self.range_size = size;
        self
    }
}
