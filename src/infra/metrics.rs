//! Lock-free metrics collection and periodic reporting
//!
//! Uses atomics for hot-path operations to avoid mutex contention.
//! All counter updates are lock-free; reporting swaps the per-interval
//! counters so each summary covers one interval.
//!
//! Counters use Relaxed ordering. They are statistics only and never gate
//! control flow.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

/// Cycle latency bucket boundaries (microseconds)
/// Buckets: ≤1ms, ≤2ms, ≤5ms, ≤10ms, ≤25ms, ≤50ms, ≤100ms, ≤250ms, ≤500ms, ≤1s, >1s
pub const METRICS_BUCKET_BOUNDS: [u64; 10] =
    [1_000, 2_000, 5_000, 10_000, 25_000, 50_000, 100_000, 250_000, 500_000, 1_000_000];
pub const METRICS_NUM_BUCKETS: usize = 11;

/// Compute bucket index for a latency value using binary search
#[inline]
fn bucket_index(latency_us: u64) -> usize {
    METRICS_BUCKET_BOUNDS.partition_point(|&bound| bound < latency_us)
}

/// Update an atomic max value using compare-and-swap loop
#[inline]
fn update_atomic_max(atomic_max: &AtomicU64, new_value: u64) {
    let mut current_max = atomic_max.load(Ordering::Relaxed);
    while new_value > current_max {
        match atomic_max.compare_exchange_weak(
            current_max,
            new_value,
            Ordering::Relaxed,
            Ordering::Relaxed,
        ) {
            Ok(_) => break,
            Err(actual) => current_max = actual,
        }
    }
}

/// Swap all buckets to zero and return their values
#[inline]
fn swap_buckets(buckets: &[AtomicU64; METRICS_NUM_BUCKETS]) -> [u64; METRICS_NUM_BUCKETS] {
    let mut result = [0u64; METRICS_NUM_BUCKETS];
    for (i, bucket) in buckets.iter().enumerate() {
        result[i] = bucket.swap(0, Ordering::Relaxed);
    }
    result
}

/// Compute percentile from histogram buckets
/// Returns the upper bound of the bucket containing the percentile
fn percentile_from_buckets(buckets: &[u64; METRICS_NUM_BUCKETS], percentile: f64) -> u64 {
    let total: u64 = buckets.iter().sum();
    if total == 0 {
        return 0;
    }

    let target = ((total as f64 * percentile).ceil() as u64).max(1);
    let mut cumulative = 0u64;

    for (i, &count) in buckets.iter().enumerate() {
        cumulative += count;
        if cumulative >= target {
            return METRICS_BUCKET_BOUNDS.get(i).copied().unwrap_or(METRICS_BUCKET_BOUNDS[9] * 2);
        }
    }
    METRICS_BUCKET_BOUNDS[9] * 2
}

/// Lock-free metrics collector
pub struct Metrics {
    cycles_total: AtomicU64,
    cycles_skipped: AtomicU64,
    cycles_superseded: AtomicU64,
    cycles_since_report: AtomicU64,
    cycle_latency_sum_us: AtomicU64,
    cycle_latency_max_us: AtomicU64,
    cycle_latency_buckets: [AtomicU64; METRICS_NUM_BUCKETS],
    fetches_total: AtomicU64,
    fetch_failures: AtomicU64,
    fetches_rate_limited: AtomicU64,
    fetches_suspended: AtomicU64,
    sessions_created: AtomicU64,
    sessions_updated: AtomicU64,
    sessions_ended: AtomicU64,
    publish_failures: AtomicU64,
    /// 1 while a live session is active
    session_active: AtomicU64,
    /// Directory size at the last successful fetch
    directory_size: AtomicU64,
    last_report_time: parking_lot::Mutex<Instant>,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            cycles_total: AtomicU64::new(0),
            cycles_skipped: AtomicU64::new(0),
            cycles_superseded: AtomicU64::new(0),
            cycles_since_report: AtomicU64::new(0),
            cycle_latency_sum_us: AtomicU64::new(0),
            cycle_latency_max_us: AtomicU64::new(0),
            cycle_latency_buckets: Default::default(),
            fetches_total: AtomicU64::new(0),
            fetch_failures: AtomicU64::new(0),
            fetches_rate_limited: AtomicU64::new(0),
            fetches_suspended: AtomicU64::new(0),
            sessions_created: AtomicU64::new(0),
            sessions_updated: AtomicU64::new(0),
            sessions_ended: AtomicU64::new(0),
            publish_failures: AtomicU64::new(0),
            session_active: AtomicU64::new(0),
            directory_size: AtomicU64::new(0),
            last_report_time: parking_lot::Mutex::new(Instant::now()),
        }
    }

    /// Record a completed evaluation cycle with its latency
    #[inline]
    pub fn record_cycle(&self, latency_us: u64) {
        self.cycles_total.fetch_add(1, Ordering::Relaxed);
        self.cycles_since_report.fetch_add(1, Ordering::Relaxed);
        self.cycle_latency_sum_us.fetch_add(latency_us, Ordering::Relaxed);
        update_atomic_max(&self.cycle_latency_max_us, latency_us);
        self.cycle_latency_buckets[bucket_index(latency_us)].fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_cycle_skipped(&self) {
        self.cycles_skipped.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_cycle_superseded(&self) {
        self.cycles_superseded.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a network fetch attempt against the crossing service
    #[inline]
    pub fn record_fetch(&self) {
        self.fetches_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_fetch_failed(&self) {
        self.fetch_failures.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_fetch_rate_limited(&self) {
        self.fetches_rate_limited.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a refresh that was refused because a backoff window is open
    #[inline]
    pub fn record_fetch_suspended(&self) {
        self.fetches_suspended.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn set_directory_size(&self, size: usize) {
        self.directory_size.store(size as u64, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_session_created(&self) {
        self.sessions_created.fetch_add(1, Ordering::Relaxed);
        self.session_active.store(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_session_updated(&self) {
        self.sessions_updated.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_session_ended(&self) {
        self.sessions_ended.fetch_add(1, Ordering::Relaxed);
        self.session_active.store(0, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_publish_failed(&self) {
        self.publish_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn cycles_total(&self) -> u64 {
        self.cycles_total.load(Ordering::Relaxed)
    }

    pub fn fetches_total(&self) -> u64 {
        self.fetches_total.load(Ordering::Relaxed)
    }

    pub fn sessions_created(&self) -> u64 {
        self.sessions_created.load(Ordering::Relaxed)
    }

    pub fn sessions_ended(&self) -> u64 {
        self.sessions_ended.load(Ordering::Relaxed)
    }

    /// Produce a summary and reset the per-interval cycle latency counters
    pub fn report(&self) -> MetricsSummary {
        let now = Instant::now();
        let elapsed_secs = {
            let mut last = self.last_report_time.lock();
            let elapsed = now.duration_since(*last).as_secs_f64();
            *last = now;
            elapsed
        };

        let cycles_interval = self.cycles_since_report.swap(0, Ordering::Relaxed);
        let latency_sum = self.cycle_latency_sum_us.swap(0, Ordering::Relaxed);
        let latency_max = self.cycle_latency_max_us.swap(0, Ordering::Relaxed);
        let buckets = swap_buckets(&self.cycle_latency_buckets);

        let avg_latency_us = if cycles_interval > 0 { latency_sum / cycles_interval } else { 0 };
        let cycles_per_min =
            if elapsed_secs > 0.0 { cycles_interval as f64 * 60.0 / elapsed_secs } else { 0.0 };

        MetricsSummary {
            cycles_total: self.cycles_total.load(Ordering::Relaxed),
            cycles_skipped: self.cycles_skipped.load(Ordering::Relaxed),
            cycles_superseded: self.cycles_superseded.load(Ordering::Relaxed),
            cycles_per_min,
            avg_cycle_latency_us: avg_latency_us,
            max_cycle_latency_us: latency_max,
            cycle_latency_buckets: buckets,
            cycle_p50_us: percentile_from_buckets(&buckets, 0.50),
            cycle_p99_us: percentile_from_buckets(&buckets, 0.99),
            fetches_total: self.fetches_total.load(Ordering::Relaxed),
            fetch_failures: self.fetch_failures.load(Ordering::Relaxed),
            fetches_rate_limited: self.fetches_rate_limited.load(Ordering::Relaxed),
            fetches_suspended: self.fetches_suspended.load(Ordering::Relaxed),
            directory_size: self.directory_size.load(Ordering::Relaxed),
            sessions_created: self.sessions_created.load(Ordering::Relaxed),
            sessions_updated: self.sessions_updated.load(Ordering::Relaxed),
            sessions_ended: self.sessions_ended.load(Ordering::Relaxed),
            publish_failures: self.publish_failures.load(Ordering::Relaxed),
            session_active: self.session_active.load(Ordering::Relaxed) == 1,
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time view of the counters
#[derive(Debug, Clone)]
pub struct MetricsSummary {
    pub cycles_total: u64,
    pub cycles_skipped: u64,
    pub cycles_superseded: u64,
    pub cycles_per_min: f64,
    pub avg_cycle_latency_us: u64,
    pub max_cycle_latency_us: u64,
    pub cycle_latency_buckets: [u64; METRICS_NUM_BUCKETS],
    pub cycle_p50_us: u64,
    pub cycle_p99_us: u64,
    pub fetches_total: u64,
    pub fetch_failures: u64,
    pub fetches_rate_limited: u64,
    pub fetches_suspended: u64,
    pub directory_size: u64,
    pub sessions_created: u64,
    pub sessions_updated: u64,
    pub sessions_ended: u64,
    pub publish_failures: u64,
    pub session_active: bool,
}

impl MetricsSummary {
    pub fn log(&self) {
        info!(
            cycles_total = %self.cycles_total,
            cycles_per_min = format!("{:.1}", self.cycles_per_min),
            skipped = %self.cycles_skipped,
            superseded = %self.cycles_superseded,
            avg_cycle_us = %self.avg_cycle_latency_us,
            p99_cycle_us = %self.cycle_p99_us,
            fetches = %self.fetches_total,
            fetch_failures = %self.fetch_failures,
            rate_limited = %self.fetches_rate_limited,
            crossings = %self.directory_size,
            sessions_created = %self.sessions_created,
            sessions_ended = %self.sessions_ended,
            publish_failures = %self.publish_failures,
            session_active = %self.session_active,
            "metrics"
        );
    }
}
