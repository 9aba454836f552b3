//! Lock-free metrics collection and periodic reporting
//!
//! Counters are plain atomics bumped from the ingest and tracker paths.
//!
//! NOTE: All atomics use Relaxed ordering. They are statistical counters
//! only; never use them for coordination or logic decisions.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

/// Submission latency bucket boundaries (milliseconds)
/// Buckets: ≤10, ≤25, ≤50, ≤100, ≤250, ≤500, ≤1000, ≤2000, ≤5000, ≤10000, >10000
pub const SUBMIT_BUCKET_BOUNDS: [u64; 10] = [10, 25, 50, 100, 250, 500, 1000, 2000, 5000, 10000];
pub const SUBMIT_NUM_BUCKETS: usize = 11;

#[inline]
fn bucket_index(latency_ms: u64) -> usize {
    SUBMIT_BUCKET_BOUNDS.partition_point(|&bound| bound < latency_ms)
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

/// Lock-free metrics collector for the sensor agent
pub struct Metrics {
    /// Lines received from the scanner (monotonic)
    samples_received: AtomicU64,
    /// Lines that failed to parse (monotonic)
    samples_malformed: AtomicU64,
    /// Samples dropped because the ingest channel was full (monotonic)
    samples_dropped: AtomicU64,
    /// Samples ignored by major filter or range limit (monotonic)
    samples_filtered: AtomicU64,
    /// Samples absorbed by a windowed filter without output (monotonic)
    samples_absorbed: AtomicU64,
    sessions_opened: AtomicU64,
    sessions_preserved: AtomicU64,
    deliveries_ok: AtomicU64,
    deliveries_failed: AtomicU64,
    /// Jobs dropped because the delivery queue was full (monotonic)
    deliveries_dropped: AtomicU64,
    snapshots_written: AtomicU64,
    snapshots_failed: AtomicU64,
    /// Current open sessions (gauge, set by the tracker)
    open_sessions: AtomicU64,
    /// Current preserved sessions awaiting delivery (gauge)
    preserved_sessions: AtomicU64,
    /// Submission latency histogram (reset on report)
    submit_buckets: [AtomicU64; SUBMIT_NUM_BUCKETS],
    submit_latency_sum_ms: AtomicU64,
    submit_latency_max_ms: AtomicU64,
    /// Samples since last report (reset on report)
    samples_since_report: AtomicU64,
    last_report_time: parking_lot::Mutex<Instant>,
}

/// Point-in-time view of the metrics
#[derive(Debug, Clone, Default)]
pub struct MetricsSummary {
    pub samples_received: u64,
    pub samples_malformed: u64,
    pub samples_dropped: u64,
    pub samples_filtered: u64,
    pub samples_absorbed: u64,
    pub samples_per_sec: f64,
    pub sessions_opened: u64,
    pub sessions_preserved: u64,
    pub deliveries_ok: u64,
    pub deliveries_failed: u64,
    pub deliveries_dropped: u64,
    pub snapshots_written: u64,
    pub snapshots_failed: u64,
    pub open_sessions: u64,
    pub preserved_sessions: u64,
    pub submit_buckets: [u64; SUBMIT_NUM_BUCKETS],
    pub submit_latency_avg_ms: u64,
    pub submit_latency_max_ms: u64,
}

impl MetricsSummary {
    pub fn log(&self) {
        info!(
            samples = %self.samples_received,
            samples_per_sec = %format!("{:.1}", self.samples_per_sec),
            malformed = %self.samples_malformed,
            dropped = %self.samples_dropped,
            filtered = %self.samples_filtered,
            open = %self.open_sessions,
            preserved = %self.preserved_sessions,
            delivered = %self.deliveries_ok,
            delivery_failures = %self.deliveries_failed,
            submit_avg_ms = %self.submit_latency_avg_ms,
            submit_max_ms = %self.submit_latency_max_ms,
            "metrics"
        );
    }
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            samples_received: AtomicU64::new(0),
            samples_malformed: AtomicU64::new(0),
            samples_dropped: AtomicU64::new(0),
            samples_filtered: AtomicU64::new(0),
            samples_absorbed: AtomicU64::new(0),
            sessions_opened: AtomicU64::new(0),
            sessions_preserved: AtomicU64::new(0),
            deliveries_ok: AtomicU64::new(0),
            deliveries_failed: AtomicU64::new(0),
            deliveries_dropped: AtomicU64::new(0),
            snapshots_written: AtomicU64::new(0),
            snapshots_failed: AtomicU64::new(0),
            open_sessions: AtomicU64::new(0),
            preserved_sessions: AtomicU64::new(0),
            submit_buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            submit_latency_sum_ms: AtomicU64::new(0),
            submit_latency_max_ms: AtomicU64::new(0),
            samples_since_report: AtomicU64::new(0),
            last_report_time: parking_lot::Mutex::new(Instant::now()),
        }
    }

    #[inline]
    pub fn record_sample_received(&self) {
        self.samples_received.fetch_add(1, Ordering::Relaxed);
        self.samples_since_report.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_sample_malformed(&self) {
        self.samples_malformed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_sample_dropped(&self) {
        self.samples_dropped.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_sample_filtered(&self) {
        self.samples_filtered.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_sample_absorbed(&self) {
        self.samples_absorbed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_session_opened(&self) {
        self.sessions_opened.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_session_preserved(&self) {
        self.sessions_preserved.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a successful submission and its round-trip time
    pub fn record_delivery_ok(&self, latency_ms: u64) {
        self.deliveries_ok.fetch_add(1, Ordering::Relaxed);
        self.submit_buckets[bucket_index(latency_ms)].fetch_add(1, Ordering::Relaxed);
        self.submit_latency_sum_ms.fetch_add(latency_ms, Ordering::Relaxed);
        update_atomic_max(&self.submit_latency_max_ms, latency_ms);
    }

    #[inline]
    pub fn record_delivery_failed(&self) {
        self.deliveries_failed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_delivery_dropped(&self) {
        self.deliveries_dropped.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_snapshot(&self, ok: bool) {
        if ok {
            self.snapshots_written.fetch_add(1, Ordering::Relaxed);
        } else {
            self.snapshots_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Set session gauges (called by the tracker after each flush)
    pub fn set_session_counts(&self, open: usize, preserved: usize) {
        self.open_sessions.store(open as u64, Ordering::Relaxed);
        self.preserved_sessions.store(preserved as u64, Ordering::Relaxed);
    }

    /// Snapshot all counters; rates and the latency histogram reset on each call
    pub fn report(&self) -> MetricsSummary {
        let now = Instant::now();
        let elapsed_secs = {
            let mut last = self.last_report_time.lock();
            let elapsed = now.duration_since(*last).as_secs_f64();
            *last = now;
            elapsed
        };

        let samples_since = self.samples_since_report.swap(0, Ordering::Relaxed);
        let mut submit_buckets = [0u64; SUBMIT_NUM_BUCKETS];
        for (i, bucket) in self.submit_buckets.iter().enumerate() {
            submit_buckets[i] = bucket.swap(0, Ordering::Relaxed);
        }
        let submit_count: u64 = submit_buckets.iter().sum();
        let submit_sum = self.submit_latency_sum_ms.swap(0, Ordering::Relaxed);

        MetricsSummary {
            samples_received: self.samples_received.load(Ordering::Relaxed),
            samples_malformed: self.samples_malformed.load(Ordering::Relaxed),
            samples_dropped: self.samples_dropped.load(Ordering::Relaxed),
            samples_filtered: self.samples_filtered.load(Ordering::Relaxed),
            samples_absorbed: self.samples_absorbed.load(Ordering::Relaxed),
            samples_per_sec: if elapsed_secs > 0.0 {
                samples_since as f64 / elapsed_secs
            } else {
                0.0
            },
            sessions_opened: self.sessions_opened.load(Ordering::Relaxed),
            sessions_preserved: self.sessions_preserved.load(Ordering::Relaxed),
            deliveries_ok: self.deliveries_ok.load(Ordering::Relaxed),
            deliveries_failed: self.deliveries_failed.load(Ordering::Relaxed),
            deliveries_dropped: self.deliveries_dropped.load(Ordering::Relaxed),
            snapshots_written: self.snapshots_written.load(Ordering::Relaxed),
            snapshots_failed: self.snapshots_failed.load(Ordering::Relaxed),
            open_sessions: self.open_sessions.load(Ordering::Relaxed),
            preserved_sessions: self.preserved_sessions.load(Ordering::Relaxed),
            submit_buckets,
            submit_latency_avg_ms: if submit_count > 0 { submit_sum / submit_count } else { 0 },
            submit_latency_max_ms: self.submit_latency_max_ms.swap(0, Ordering::Relaxed),
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bucket_index() {
        assert_eq!(bucket_index(0), 0);
        assert_eq!(bucket_index(10), 0);
        assert_eq!(bucket_index(11), 1);
        assert_eq!(bucket_index(2000), 7);
        assert_eq!(bucket_index(50_000), 10);
    }

    #[test]
    fn test_counters_and_report() {
        let metrics = Metrics::new();
        metrics.record_sample_received();
        metrics.record_sample_received();
        metrics.record_sample_malformed();
        metrics.record_delivery_ok(40);
        metrics.record_delivery_ok(60);
        metrics.record_delivery_failed();
        metrics.set_session_counts(3, 1);

        let summary = metrics.report();
        assert_eq!(summary.samples_received, 2);
        assert_eq!(summary.samples_malformed, 1);
        assert_eq!(summary.deliveries_ok, 2);
        assert_eq!(summary.deliveries_failed, 1);
        assert_eq!(summary.open_sessions, 3);
        assert_eq!(summary.preserved_sessions, 1);
        assert_eq!(summary.submit_latency_avg_ms, 50);
        assert_eq!(summary.submit_latency_max_ms, 60);
        assert_eq!(summary.submit_buckets.iter().sum::<u64>(), 2);

        // histogram resets, monotonic counters do not
        let summary = metrics.report();
        assert_eq!(summary.deliveries_ok, 2);
        assert_eq!(summary.submit_buckets.iter().sum::<u64>(), 0);
        assert_eq!(summary.submit_latency_max_ms, 0);
    }
}
