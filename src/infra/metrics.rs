//! Lock-free metrics collection and periodic reporting
//!
//! Counter updates are lock-free; reporting swaps the windowed values.
//! The occupancy gauge mirrors the last snapshot the engine computed and is
//! never read back for capacity decisions.
//!
//! NOTE: Relaxed ordering throughout. These are statistical counters only.

use crate::domain::error::AccessError;
use crate::domain::types::{AccessMethod, OccupancyLevel};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::info;

/// Prometheus-style exponential bucket boundaries (microseconds)
/// Buckets: ≤100, ≤200, ≤400, ≤800, ≤1600, ≤3200, ≤6400, ≤12800, ≤25600, ≤51200, >51200
const BUCKET_BOUNDS: [u64; 10] = [100, 200, 400, 800, 1600, 3200, 6400, 12800, 25600, 51200];
const NUM_BUCKETS: usize = 11;

const NUM_METHODS: usize = 3;

/// Compute bucket index for a latency value using binary search
#[inline]
fn bucket_index(latency_us: u64) -> usize {
    BUCKET_BOUNDS.partition_point(|&bound| bound < latency_us)
}

#[inline]
fn method_index(method: AccessMethod) -> usize {
    match method {
        AccessMethod::Automatic => 0,
        AccessMethod::Manual => 1,
        AccessMethod::DeviceScan => 2,
    }
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

/// Read all buckets without resetting them
#[inline]
fn load_buckets(buckets: &[AtomicU64; NUM_BUCKETS]) -> [u64; NUM_BUCKETS] {
    let mut result = [0u64; NUM_BUCKETS];
    for (i, bucket) in buckets.iter().enumerate() {
        result[i] = bucket.load(Ordering::Relaxed);
    }
    result
}

/// Swap all buckets to zero and return their values
#[inline]
fn swap_buckets(buckets: &[AtomicU64; NUM_BUCKETS]) -> [u64; NUM_BUCKETS] {
    let mut result = [0u64; NUM_BUCKETS];
    for (i, bucket) in buckets.iter().enumerate() {
        result[i] = bucket.swap(0, Ordering::Relaxed);
    }
    result
}

/// Compute percentile from histogram buckets
/// Returns the upper bound of the bucket containing the percentile
fn percentile_from_buckets(buckets: &[u64; NUM_BUCKETS], percentile: f64) -> u64 {
    let total: u64 = buckets.iter().sum();
    if total == 0 {
        return 0;
    }

    let target = (total as f64 * percentile) as u64;
    let mut cumulative = 0u64;

    // Upper bounds for each bucket (last bucket uses 2x the previous bound)
    const BUCKET_UPPER_BOUNDS: [u64; NUM_BUCKETS] =
        [100, 200, 400, 800, 1600, 3200, 6400, 12800, 25600, 51200, 102400];

    for (i, &count) in buckets.iter().enumerate() {
        cumulative += count;
        if cumulative >= target {
            return BUCKET_UPPER_BOUNDS[i];
        }
    }
    BUCKET_UPPER_BOUNDS[NUM_BUCKETS - 1]
}

/// Occupancy level values for the Prometheus gauge
pub const LEVEL_NORMAL: u64 = 0;
pub const LEVEL_WARNING: u64 = 1;
pub const LEVEL_CRITICAL: u64 = 2;

fn level_value(level: OccupancyLevel) -> u64 {
    match level {
        OccupancyLevel::Normal => LEVEL_NORMAL,
        OccupancyLevel::Warning => LEVEL_WARNING,
        OccupancyLevel::Critical => LEVEL_CRITICAL,
    }
}

/// Lock-free metrics collector
///
/// All recording operations are lock-free using atomics.
/// The `report()` method atomically swaps counters to get a consistent snapshot.
pub struct Metrics {
    /// Total pings ever processed (monotonic)
    pings_total: AtomicU64,
    /// Pings since last report (reset on report)
    pings_since_report: AtomicU64,
    /// Sum of ping latencies in microseconds (reset on report)
    latency_sum_us: AtomicU64,
    /// Max ping latency in microseconds (reset on report)
    latency_max_us: AtomicU64,
    /// Ping processing latency histogram buckets (reset on report)
    latency_buckets: [AtomicU64; NUM_BUCKETS],
    /// Entries by method: automatic, manual, device_scan (monotonic)
    entries_by_method: [AtomicU64; NUM_METHODS],
    exits_total: AtomicU64,
    rejected_already_open: AtomicU64,
    rejected_no_open_record: AtomicU64,
    rejected_capacity: AtomicU64,
    rejected_subject_not_found: AtomicU64,
    /// Validation errors (bad coordinates / geofences / policy)
    rejected_invalid: AtomicU64,
    /// Pings dropped at ingestion due to channel full (monotonic)
    pings_dropped: AtomicU64,
    alerts_sent: AtomicU64,
    /// Alerts dropped due to channel full (monotonic)
    alerts_dropped: AtomicU64,
    /// Current occupancy count (gauge)
    occupancy: AtomicU64,
    /// Current occupancy level (0=normal, 1=warning, 2=critical)
    occupancy_level: AtomicU64,
    /// Current ping queue depth (updated by sampler)
    ping_queue_depth: AtomicU64,
    /// Last report time (only accessed from reporter, not atomic)
    last_report_time: parking_lot::Mutex<Instant>,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            pings_total: AtomicU64::new(0),
            pings_since_report: AtomicU64::new(0),
            latency_sum_us: AtomicU64::new(0),
            latency_max_us: AtomicU64::new(0),
            latency_buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            entries_by_method: std::array::from_fn(|_| AtomicU64::new(0)),
            exits_total: AtomicU64::new(0),
            rejected_already_open: AtomicU64::new(0),
            rejected_no_open_record: AtomicU64::new(0),
            rejected_capacity: AtomicU64::new(0),
            rejected_subject_not_found: AtomicU64::new(0),
            rejected_invalid: AtomicU64::new(0),
            pings_dropped: AtomicU64::new(0),
            alerts_sent: AtomicU64::new(0),
            alerts_dropped: AtomicU64::new(0),
            occupancy: AtomicU64::new(0),
            occupancy_level: AtomicU64::new(LEVEL_NORMAL),
            ping_queue_depth: AtomicU64::new(0),
            last_report_time: parking_lot::Mutex::new(Instant::now()),
        }
    }

    /// Record a ping was processed with given latency (lock-free)
    #[inline]
    pub fn record_ping_processed(&self, latency_us: u64) {
        self.pings_total.fetch_add(1, Ordering::Relaxed);
        self.pings_since_report.fetch_add(1, Ordering::Relaxed);
        self.latency_sum_us.fetch_add(latency_us, Ordering::Relaxed);

        let bucket = bucket_index(latency_us);
        self.latency_buckets[bucket].fetch_add(1, Ordering::Relaxed);

        update_atomic_max(&self.latency_max_us, latency_us);
    }

    #[inline]
    pub fn pings_total(&self) -> u64 {
        self.pings_total.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn record_entry(&self, method: AccessMethod) {
        self.entries_by_method[method_index(method)].fetch_add(1, Ordering::Relaxed);
    }

    pub fn entries(&self, method: AccessMethod) -> u64 {
        self.entries_by_method[method_index(method)].load(Ordering::Relaxed)
    }

    #[inline]
    pub fn record_exit(&self) {
        self.exits_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn exits_total(&self) -> u64 {
        self.exits_total.load(Ordering::Relaxed)
    }

    /// Count a failed operation by error kind; store failures are not counted
    pub fn record_rejection(&self, error: &AccessError) {
        let counter = match error {
            AccessError::AlreadyOpen(_) => &self.rejected_already_open,
            AccessError::NoOpenRecord(_) => &self.rejected_no_open_record,
            AccessError::CapacityExceeded { .. } => &self.rejected_capacity,
            AccessError::SubjectNotFound(_) => &self.rejected_subject_not_found,
            AccessError::InvalidCoordinates { .. }
            | AccessError::InvalidGeofence(_)
            | AccessError::InvalidPolicy { .. } => &self.rejected_invalid,
            AccessError::Store(_) => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn capacity_rejections(&self) -> u64 {
        self.rejected_capacity.load(Ordering::Relaxed)
    }

    /// Record a ping dropped due to channel full (lock-free)
    #[inline]
    pub fn record_ping_dropped(&self) {
        self.pings_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn pings_dropped(&self) -> u64 {
        self.pings_dropped.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn record_alert_sent(&self) {
        self.alerts_sent.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_alert_dropped(&self) {
        self.alerts_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn alerts_sent(&self) -> u64 {
        self.alerts_sent.load(Ordering::Relaxed)
    }

    /// Update the occupancy gauges after a mutation or query
    #[inline]
    pub fn set_occupancy(&self, count: usize, level: OccupancyLevel) {
        self.occupancy.store(count as u64, Ordering::Relaxed);
        self.occupancy_level.store(level_value(level), Ordering::Relaxed);
    }

    pub fn occupancy(&self) -> u64 {
        self.occupancy.load(Ordering::Relaxed)
    }

    /// Set current ping queue depth (called by sampler)
    #[inline]
    pub fn set_ping_queue_depth(&self, depth: u64) {
        self.ping_queue_depth.store(depth, Ordering::Relaxed);
    }

    /// Calculate and return metrics summary, then reset periodic counters
    ///
    /// This is the only method that resets counters. It uses atomic swap
    /// to get a consistent snapshot while allowing concurrent updates.
    pub fn report(&self) -> MetricsSummary {
        let pings_count = self.pings_since_report.swap(0, Ordering::Relaxed);
        let latency_sum = self.latency_sum_us.swap(0, Ordering::Relaxed);
        let max_latency = self.latency_max_us.swap(0, Ordering::Relaxed);
        let lat_buckets = swap_buckets(&self.latency_buckets);

        let elapsed = {
            let mut last = self.last_report_time.lock();
            let elapsed = last.elapsed();
            *last = Instant::now();
            elapsed
        };

        self.summarize(pings_count, latency_sum, max_latency, lat_buckets, elapsed)
    }

    /// Current values of every counter, leaving the report window untouched
    ///
    /// Windowed figures cover the time since the last `report()`.
    pub fn snapshot(&self) -> MetricsSummary {
        let pings_count = self.pings_since_report.load(Ordering::Relaxed);
        let latency_sum = self.latency_sum_us.load(Ordering::Relaxed);
        let max_latency = self.latency_max_us.load(Ordering::Relaxed);
        let lat_buckets = load_buckets(&self.latency_buckets);
        let elapsed = self.last_report_time.lock().elapsed();

        self.summarize(pings_count, latency_sum, max_latency, lat_buckets, elapsed)
    }

    fn summarize(
        &self,
        pings_count: u64,
        latency_sum: u64,
        max_latency: u64,
        lat_buckets: [u64; NUM_BUCKETS],
        elapsed: Duration,
    ) -> MetricsSummary {
        let pings_per_sec = if elapsed.as_secs_f64() > 0.0 {
            pings_count as f64 / elapsed.as_secs_f64()
        } else {
            0.0
        };
        let avg_latency = if pings_count > 0 { latency_sum / pings_count } else { 0 };

        let load = |a: &AtomicU64| a.load(Ordering::Relaxed);

        MetricsSummary {
            pings_total: load(&self.pings_total),
            pings_per_sec,
            avg_ping_latency_us: avg_latency,
            max_ping_latency_us: max_latency,
            lat_buckets,
            lat_p50_us: percentile_from_buckets(&lat_buckets, 0.50),
            lat_p95_us: percentile_from_buckets(&lat_buckets, 0.95),
            lat_p99_us: percentile_from_buckets(&lat_buckets, 0.99),
            entries_automatic: load(&self.entries_by_method[0]),
            entries_manual: load(&self.entries_by_method[1]),
            entries_device_scan: load(&self.entries_by_method[2]),
            exits_total: load(&self.exits_total),
            rejected_already_open: load(&self.rejected_already_open),
            rejected_no_open_record: load(&self.rejected_no_open_record),
            rejected_capacity: load(&self.rejected_capacity),
            rejected_subject_not_found: load(&self.rejected_subject_not_found),
            rejected_invalid: load(&self.rejected_invalid),
            pings_dropped: load(&self.pings_dropped),
            alerts_sent: load(&self.alerts_sent),
            alerts_dropped: load(&self.alerts_dropped),
            occupancy: load(&self.occupancy),
            occupancy_level: load(&self.occupancy_level),
            ping_queue_depth: load(&self.ping_queue_depth),
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Number of histogram buckets (exported for formatting)
pub const METRICS_NUM_BUCKETS: usize = NUM_BUCKETS;

/// Exported bucket bounds for Prometheus formatting
pub const METRICS_BUCKET_BOUNDS: [u64; 10] = BUCKET_BOUNDS;

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSummary {
    pub pings_total: u64,
    pub pings_per_sec: f64,
    pub avg_ping_latency_us: u64,
    pub max_ping_latency_us: u64,
    /// Ping processing latency histogram buckets
    /// Bounds: ≤100, ≤200, ≤400, ≤800, ≤1600, ≤3200, ≤6400, ≤12800, ≤25600, ≤51200, >51200 µs
    pub lat_buckets: [u64; NUM_BUCKETS],
    pub lat_p50_us: u64,
    pub lat_p95_us: u64,
    pub lat_p99_us: u64,
    pub entries_automatic: u64,
    pub entries_manual: u64,
    pub entries_device_scan: u64,
    pub exits_total: u64,
    pub rejected_already_open: u64,
    pub rejected_no_open_record: u64,
    pub rejected_capacity: u64,
    pub rejected_subject_not_found: u64,
    pub rejected_invalid: u64,
    pub pings_dropped: u64,
    pub alerts_sent: u64,
    pub alerts_dropped: u64,
    pub occupancy: u64,
    /// 0=normal, 1=warning, 2=critical
    pub occupancy_level: u64,
    pub ping_queue_depth: u64,
}

impl MetricsSummary {
    pub fn entries_total(&self) -> u64 {
        self.entries_automatic + self.entries_manual + self.entries_device_scan
    }

    pub fn log(&self) {
        info!(
            pings_total = %self.pings_total,
            pings_per_sec = format!("{:.1}", self.pings_per_sec),
            avg_latency_us = %self.avg_ping_latency_us,
            max_latency_us = %self.max_ping_latency_us,
            p99_us = %self.lat_p99_us,
            entries = %self.entries_total(),
            exits = %self.exits_total,
            capacity_rejections = %self.rejected_capacity,
            occupancy = %self.occupancy,
            pings_dropped = %self.pings_dropped,
            alerts_sent = %self.alerts_sent,
            "metrics"
        );
    }
}
