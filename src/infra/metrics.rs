//! Lock-free client metrics and periodic reporting
//!
//! Counters are plain atomics updated from the acquirer, the session manager
//! and the API client. `report()` swaps the windowed histograms to zero and
//! returns a snapshot.
//!
//! NOTE: All atomics use Relaxed ordering intentionally; these are statistical
//! counters only. Do NOT use these atomics for coordination or logic decisions.

use std::sync::atomic::{AtomicU64, Ordering};
use tracing::info;

/// Exponential bucket boundaries (milliseconds)
/// Buckets: ≤50, ≤100, ≤200, ≤400, ≤800, ≤1600, ≤3200, ≤6400, ≤12800, ≤25600, >25600
const BUCKET_BOUNDS: [u64; 10] = [50, 100, 200, 400, 800, 1600, 3200, 6400, 12800, 25600];
const NUM_BUCKETS: usize = 11;

/// Upper bound used when a percentile lands in a bucket (last is 2x the previous bound)
const BUCKET_UPPER_BOUNDS: [u64; NUM_BUCKETS] =
    [50, 100, 200, 400, 800, 1600, 3200, 6400, 12800, 25600, 51200];

#[inline]
fn bucket_index(value_ms: u64) -> usize {
    BUCKET_BOUNDS.partition_point(|&bound| bound < value_ms)
}

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

#[inline]
fn swap_buckets(buckets: &[AtomicU64; NUM_BUCKETS]) -> [u64; NUM_BUCKETS] {
    let mut result = [0u64; NUM_BUCKETS];
    for (i, bucket) in buckets.iter().enumerate() {
        result[i] = bucket.swap(0, Ordering::Relaxed);
    }
    result
}

/// Upper bound of the bucket containing the given percentile
fn percentile_from_buckets(buckets: &[u64; NUM_BUCKETS], percentile: f64) -> u64 {
    let total: u64 = buckets.iter().sum();
    if total == 0 {
        return 0;
    }

    let target = ((total as f64 * percentile).ceil() as u64).max(1);
    let mut cumulative = 0u64;
    for (i, &count) in buckets.iter().enumerate() {
        cumulative += count;
        if cumulative >= target {
            return BUCKET_UPPER_BOUNDS[i];
        }
    }
    BUCKET_UPPER_BOUNDS[NUM_BUCKETS - 1]
}

/// Windowed latency histogram with sum and max
struct Histogram {
    buckets: [AtomicU64; NUM_BUCKETS],
    sum_ms: AtomicU64,
    max_ms: AtomicU64,
}

impl Histogram {
    fn new() -> Self {
        Self {
            buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            sum_ms: AtomicU64::new(0),
            max_ms: AtomicU64::new(0),
        }
    }

    fn record(&self, value_ms: u64) {
        self.buckets[bucket_index(value_ms)].fetch_add(1, Ordering::Relaxed);
        self.sum_ms.fetch_add(value_ms, Ordering::Relaxed);
        update_atomic_max(&self.max_ms, value_ms);
    }

    fn take(&self) -> HistogramSnapshot {
        let buckets = swap_buckets(&self.buckets);
        let sum = self.sum_ms.swap(0, Ordering::Relaxed);
        let max_ms = self.max_ms.swap(0, Ordering::Relaxed);
        let count: u64 = buckets.iter().sum();
        HistogramSnapshot {
            count,
            avg_ms: if count > 0 { sum / count } else { 0 },
            max_ms,
            p95_ms: percentile_from_buckets(&buckets, 0.95),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HistogramSnapshot {
    pub count: u64,
    pub avg_ms: u64,
    pub max_ms: u64,
    pub p95_ms: u64,
}

/// Lock-free metrics collector shared by the client services
pub struct Metrics {
    acquisitions_started: AtomicU64,
    acquisitions_succeeded: AtomicU64,
    acquisitions_failed: AtomicU64,
    acquisitions_cancelled: AtomicU64,
    out_of_geofence_total: AtomicU64,
    acquisition_time: Histogram,
    api_requests_total: AtomicU64,
    api_errors_total: AtomicU64,
    api_latency: Histogram,
    joins_total: AtomicU64,
    checkpoints_total: AtomicU64,
    results_total: AtomicU64,
    leaves_total: AtomicU64,
    position_reports_sent: AtomicU64,
    position_reports_failed: AtomicU64,
    position_reports_skipped: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            acquisitions_started: AtomicU64::new(0),
            acquisitions_succeeded: AtomicU64::new(0),
            acquisitions_failed: AtomicU64::new(0),
            acquisitions_cancelled: AtomicU64::new(0),
            out_of_geofence_total: AtomicU64::new(0),
            acquisition_time: Histogram::new(),
            api_requests_total: AtomicU64::new(0),
            api_errors_total: AtomicU64::new(0),
            api_latency: Histogram::new(),
            joins_total: AtomicU64::new(0),
            checkpoints_total: AtomicU64::new(0),
            results_total: AtomicU64::new(0),
            leaves_total: AtomicU64::new(0),
            position_reports_sent: AtomicU64::new(0),
            position_reports_failed: AtomicU64::new(0),
            position_reports_skipped: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn record_acquisition_started(&self) {
        self.acquisitions_started.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_acquisition_succeeded(&self, elapsed_ms: u64) {
        self.acquisitions_succeeded.fetch_add(1, Ordering::Relaxed);
        self.acquisition_time.record(elapsed_ms);
    }

    #[inline]
    pub fn record_acquisition_failed(&self, out_of_geofence: bool) {
        self.acquisitions_failed.fetch_add(1, Ordering::Relaxed);
        if out_of_geofence {
            self.out_of_geofence_total.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[inline]
    pub fn record_acquisition_cancelled(&self) {
        self.acquisitions_cancelled.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_api_request(&self, latency_ms: u64, ok: bool) {
        self.api_requests_total.fetch_add(1, Ordering::Relaxed);
        if !ok {
            self.api_errors_total.fetch_add(1, Ordering::Relaxed);
        }
        self.api_latency.record(latency_ms);
    }

    #[inline]
    pub fn record_join(&self) {
        self.joins_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_checkpoint(&self) {
        self.checkpoints_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_result(&self) {
        self.results_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_leave(&self) {
        self.leaves_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_position_report(&self, ok: bool) {
        if ok {
            self.position_reports_sent.fetch_add(1, Ordering::Relaxed);
        } else {
            self.position_reports_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[inline]
    pub fn record_position_report_skipped(&self) {
        self.position_reports_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn position_reports_sent(&self) -> u64 {
        self.position_reports_sent.load(Ordering::Relaxed)
    }

    pub fn position_reports_failed(&self) -> u64 {
        self.position_reports_failed.load(Ordering::Relaxed)
    }

    pub fn acquisitions_started(&self) -> u64 {
        self.acquisitions_started.load(Ordering::Relaxed)
    }

    /// Snapshot counters; latency histograms reset on every report
    pub fn report(&self) -> MetricsSummary {
        MetricsSummary {
            acquisitions_started: self.acquisitions_started.load(Ordering::Relaxed),
            acquisitions_succeeded: self.acquisitions_succeeded.load(Ordering::Relaxed),
            acquisitions_failed: self.acquisitions_failed.load(Ordering::Relaxed),
            acquisitions_cancelled: self.acquisitions_cancelled.load(Ordering::Relaxed),
            out_of_geofence_total: self.out_of_geofence_total.load(Ordering::Relaxed),
            acquisition_time: self.acquisition_time.take(),
            api_requests_total: self.api_requests_total.load(Ordering::Relaxed),
            api_errors_total: self.api_errors_total.load(Ordering::Relaxed),
            api_latency: self.api_latency.take(),
            joins_total: self.joins_total.load(Ordering::Relaxed),
            checkpoints_total: self.checkpoints_total.load(Ordering::Relaxed),
            results_total: self.results_total.load(Ordering::Relaxed),
            leaves_total: self.leaves_total.load(Ordering::Relaxed),
            position_reports_sent: self.position_reports_sent.load(Ordering::Relaxed),
            position_reports_failed: self.position_reports_failed.load(Ordering::Relaxed),
            position_reports_skipped: self.position_reports_skipped.load(Ordering::Relaxed),
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone)]
pub struct MetricsSummary {
    pub acquisitions_started: u64,
    pub acquisitions_succeeded: u64,
    pub acquisitions_failed: u64,
    pub acquisitions_cancelled: u64,
    pub out_of_geofence_total: u64,
    /// Time to a validated fix since the previous report
    pub acquisition_time: HistogramSnapshot,
    pub api_requests_total: u64,
    pub api_errors_total: u64,
    /// Request latency since the previous report
    pub api_latency: HistogramSnapshot,
    pub joins_total: u64,
    pub checkpoints_total: u64,
    pub results_total: u64,
    pub leaves_total: u64,
    pub position_reports_sent: u64,
    pub position_reports_failed: u64,
    pub position_reports_skipped: u64,
}

impl MetricsSummary {
    pub fn log(&self) {
        info!(
            acquisitions = %self.acquisitions_started,
            fixes = %self.acquisitions_succeeded,
            fix_failures = %self.acquisitions_failed,
            out_of_geofence = %self.out_of_geofence_total,
            fix_p95_ms = %self.acquisition_time.p95_ms,
            api_requests = %self.api_requests_total,
            api_errors = %self.api_errors_total,
            api_avg_ms = %self.api_latency.avg_ms,
            api_p95_ms = %self.api_latency.p95_ms,
            reports_sent = %self.position_reports_sent,
            reports_failed = %self.position_reports_failed,
            reports_skipped = %self.position_reports_skipped,
            "metrics"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_new() {
        let metrics = Metrics::new();
        assert_eq!(metrics.acquisitions_started(), 0);
        assert_eq!(metrics.position_reports_sent(), 0);
    }

    #[test]
    fn test_bucket_index() {
        assert_eq!(bucket_index(0), 0);
        assert_eq!(bucket_index(50), 0);
        assert_eq!(bucket_index(51), 1);
        assert_eq!(bucket_index(25_600), 9);
        assert_eq!(bucket_index(60_000), 10);
    }

    #[test]
    fn test_api_latency_window_resets() {
        let metrics = Metrics::new();
        metrics.record_api_request(40, true);
        metrics.record_api_request(300, false);

        let first = metrics.report();
        assert_eq!(first.api_requests_total, 2);
        assert_eq!(first.api_errors_total, 1);
        assert_eq!(first.api_latency.count, 2);
        assert_eq!(first.api_latency.max_ms, 300);
        assert_eq!(first.api_latency.avg_ms, 170);
        assert_eq!(first.api_latency.p95_ms, 400);

        let second = metrics.report();
        assert_eq!(second.api_requests_total, 2);
        assert_eq!(second.api_latency.count, 0);
        assert_eq!(second.api_latency.p95_ms, 0);
    }

    #[test]
    fn test_position_report_counters() {
        let metrics = Metrics::new();
        metrics.record_position_report(true);
        metrics.record_position_report(false);
        metrics.record_position_report_skipped();
        let summary = metrics.report();
        assert_eq!(summary.position_reports_sent, 1);
        assert_eq!(summary.position_reports_failed, 1);
        assert_eq!(summary.position_reports_skipped, 1);
    }

    #[test]
    fn test_update_atomic_max() {
        let max = AtomicU64::new(10);
        update_atomic_max(&max, 5);
        assert_eq!(max.load(Ordering::Relaxed), 10);
        update_atomic_max(&max, 20);
        assert_eq!(max.load(Ordering::Relaxed), 20);
    }
}
