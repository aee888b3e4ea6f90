//! Lock-free metrics collection and periodic reporting
//!
//! Uses atomics for hot-path operations to avoid mutex contention.
//! All counter updates are lock-free; reporting swaps the periodic
//! counters to zero to get a consistent window.
//!
//! NOTE: All atomics use Relaxed ordering intentionally. These are statistical
//! counters only. Do NOT use these atomics for coordination or logic decisions.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

/// Durable request latency bucket boundaries (milliseconds)
/// Buckets: ≤25, ≤50, ≤100, ≤200, ≤400, ≤800, ≤1600, ≤3200, ≤6400, ≤12800, >12800
pub const METRICS_BUCKET_BOUNDS: [u64; 10] = [25, 50, 100, 200, 400, 800, 1600, 3200, 6400, 12800];
pub const METRICS_NUM_BUCKETS: usize = 11;

/// Compute bucket index for a latency value using binary search
#[inline]
fn bucket_index(latency_ms: u64) -> usize {
    METRICS_BUCKET_BOUNDS.partition_point(|&bound| bound < latency_ms)
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

/// Load all bucket values without resetting
#[inline]
fn load_buckets(buckets: &[AtomicU64; METRICS_NUM_BUCKETS]) -> [u64; METRICS_NUM_BUCKETS] {
    let mut result = [0u64; METRICS_NUM_BUCKETS];
    for (i, bucket) in buckets.iter().enumerate() {
        result[i] = bucket.load(Ordering::Relaxed);
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

    let target = (total as f64 * percentile).ceil() as u64;
    let mut cumulative = 0u64;

    const BUCKET_UPPER_BOUNDS: [u64; METRICS_NUM_BUCKETS] =
        [25, 50, 100, 200, 400, 800, 1600, 3200, 6400, 12800, 25600];

    for (i, &count) in buckets.iter().enumerate() {
        cumulative += count;
        if cumulative >= target {
            return BUCKET_UPPER_BOUNDS[i];
        }
    }
    BUCKET_UPPER_BOUNDS[METRICS_NUM_BUCKETS - 1]
}

/// Lock-free metrics collector
pub struct Metrics {
    /// Samples forwarded by the sampler (monotonic)
    samples_total: AtomicU64,
    /// Samples since last report (reset on report)
    samples_since_report: AtomicU64,
    /// Fixes discarded for invalid coordinates (monotonic)
    fixes_discarded_total: AtomicU64,
    /// Sampler events dropped because the session queue was full (monotonic)
    sampler_events_dropped: AtomicU64,
    /// Sensor failures reported by the source (monotonic)
    sensor_failures_total: AtomicU64,
    /// Automatic sampler restarts (monotonic)
    sampler_restarts_total: AtomicU64,
    /// Durable channel deliveries acknowledged (monotonic)
    durable_ok_total: AtomicU64,
    /// Durable channel deliveries failed (monotonic)
    durable_failed_total: AtomicU64,
    /// Durable request latency histogram (reset on report)
    durable_latency_buckets: [AtomicU64; METRICS_NUM_BUCKETS],
    durable_latency_sum_ms: AtomicU64,
    durable_latency_max_ms: AtomicU64,
    durable_since_report: AtomicU64,
    /// Samples handed to the live channel (monotonic)
    live_pushed_total: AtomicU64,
    /// Samples skipped by the live channel while offline (monotonic)
    live_dropped_total: AtomicU64,
    /// Successful live channel connections (monotonic)
    live_connects_total: AtomicU64,
    /// Live channel connections lost (monotonic)
    live_disconnects_total: AtomicU64,
    /// Automatic reconnection attempts (monotonic)
    live_reconnect_attempts_total: AtomicU64,
    /// Current live channel state (0=disconnected, 1=connecting, 2=connected)
    live_state: AtomicU64,
    /// Last report time (only accessed from reporter)
    last_report_time: parking_lot::Mutex<Instant>,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            samples_total: AtomicU64::new(0),
            samples_since_report: AtomicU64::new(0),
            fixes_discarded_total: AtomicU64::new(0),
            sampler_events_dropped: AtomicU64::new(0),
            sensor_failures_total: AtomicU64::new(0),
            sampler_restarts_total: AtomicU64::new(0),
            durable_ok_total: AtomicU64::new(0),
            durable_failed_total: AtomicU64::new(0),
            durable_latency_buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            durable_latency_sum_ms: AtomicU64::new(0),
            durable_latency_max_ms: AtomicU64::new(0),
            durable_since_report: AtomicU64::new(0),
            live_pushed_total: AtomicU64::new(0),
            live_dropped_total: AtomicU64::new(0),
            live_connects_total: AtomicU64::new(0),
            live_disconnects_total: AtomicU64::new(0),
            live_reconnect_attempts_total: AtomicU64::new(0),
            live_state: AtomicU64::new(0),
            last_report_time: parking_lot::Mutex::new(Instant::now()),
        }
    }

    #[inline]
    pub fn record_sample(&self) {
        self.samples_total.fetch_add(1, Ordering::Relaxed);
        self.samples_since_report.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_fix_discarded(&self) {
        self.fixes_discarded_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_sampler_event_dropped(&self) {
        self.sampler_events_dropped.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_sensor_failure(&self) {
        self.sensor_failures_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_sampler_restart(&self) {
        self.sampler_restarts_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a completed durable request (lock-free)
    #[inline]
    pub fn record_durable_delivery(&self, ok: bool, latency_ms: u64) {
        if ok {
            self.durable_ok_total.fetch_add(1, Ordering::Relaxed);
        } else {
            self.durable_failed_total.fetch_add(1, Ordering::Relaxed);
        }
        self.durable_since_report.fetch_add(1, Ordering::Relaxed);
        self.durable_latency_sum_ms.fetch_add(latency_ms, Ordering::Relaxed);
        self.durable_latency_buckets[bucket_index(latency_ms)].fetch_add(1, Ordering::Relaxed);
        update_atomic_max(&self.durable_latency_max_ms, latency_ms);
    }

    #[inline]
    pub fn record_live_push(&self, sent: bool) {
        if sent {
            self.live_pushed_total.fetch_add(1, Ordering::Relaxed);
        } else {
            self.live_dropped_total.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[inline]
    pub fn record_live_connect(&self) {
        self.live_connects_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_live_disconnect(&self) {
        self.live_disconnects_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_reconnect_attempt(&self) {
        self.live_reconnect_attempts_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Set live channel state gauge (0=disconnected, 1=connecting, 2=connected)
    #[inline]
    pub fn set_live_state(&self, state: u64) {
        self.live_state.store(state, Ordering::Relaxed);
    }

    #[cfg(test)]
    pub fn samples_total(&self) -> u64 {
        self.samples_total.load(Ordering::Relaxed)
    }

    pub fn durable_ok_total(&self) -> u64 {
        self.durable_ok_total.load(Ordering::Relaxed)
    }

    pub fn durable_failed_total(&self) -> u64 {
        self.durable_failed_total.load(Ordering::Relaxed)
    }

    #[cfg(test)]
    pub fn live_reconnect_attempts_total(&self) -> u64 {
        self.live_reconnect_attempts_total.load(Ordering::Relaxed)
    }

    /// Snapshot of the durable latency histogram without resetting it
    #[cfg(test)]
    pub fn durable_latency_buckets(&self) -> [u64; METRICS_NUM_BUCKETS] {
        load_buckets(&self.durable_latency_buckets)
    }

    /// Build a report, resetting the periodic window
    pub fn report(&self) -> MetricsSummary {
        self.summarize(true)
    }

    /// Build a summary of the current window without resetting it
    pub fn snapshot(&self) -> MetricsSummary {
        self.summarize(false)
    }

    fn summarize(&self, reset: bool) -> MetricsSummary {
        let take = |counter: &AtomicU64| {
            if reset {
                counter.swap(0, Ordering::Relaxed)
            } else {
                counter.load(Ordering::Relaxed)
            }
        };
        let samples_count = take(&self.samples_since_report);
        let durable_count = take(&self.durable_since_report);
        let durable_latency_sum = take(&self.durable_latency_sum_ms);
        let durable_latency_max = take(&self.durable_latency_max_ms);
        let durable_buckets = if reset {
            swap_buckets(&self.durable_latency_buckets)
        } else {
            load_buckets(&self.durable_latency_buckets)
        };

        let elapsed = {
            let mut last = self.last_report_time.lock();
            let elapsed = last.elapsed();
            if reset {
                *last = Instant::now();
            }
            elapsed
        };

        let samples_per_min = if elapsed.as_secs_f64() > 0.0 {
            samples_count as f64 * 60.0 / elapsed.as_secs_f64()
        } else {
            0.0
        };

        MetricsSummary {
            samples_total: self.samples_total.load(Ordering::Relaxed),
            samples_per_min,
            fixes_discarded_total: self.fixes_discarded_total.load(Ordering::Relaxed),
            sampler_events_dropped: self.sampler_events_dropped.load(Ordering::Relaxed),
            sensor_failures_total: self.sensor_failures_total.load(Ordering::Relaxed),
            sampler_restarts_total: self.sampler_restarts_total.load(Ordering::Relaxed),
            durable_ok_total: self.durable_ok_total.load(Ordering::Relaxed),
            durable_failed_total: self.durable_failed_total.load(Ordering::Relaxed),
            durable_lat_buckets: durable_buckets,
            durable_lat_avg_ms: if durable_count > 0 { durable_latency_sum / durable_count } else { 0 },
            durable_lat_max_ms: durable_latency_max,
            durable_lat_p95_ms: percentile_from_buckets(&durable_buckets, 0.95),
            live_pushed_total: self.live_pushed_total.load(Ordering::Relaxed),
            live_dropped_total: self.live_dropped_total.load(Ordering::Relaxed),
            live_connects_total: self.live_connects_total.load(Ordering::Relaxed),
            live_disconnects_total: self.live_disconnects_total.load(Ordering::Relaxed),
            live_reconnect_attempts_total: self
                .live_reconnect_attempts_total
                .load(Ordering::Relaxed),
            live_state: self.live_state.load(Ordering::Relaxed),
        }
    }
}

/// Summary of metrics for one reporting window
#[derive(Debug, Clone)]
pub struct MetricsSummary {
    pub samples_total: u64,
    pub samples_per_min: f64,
    pub fixes_discarded_total: u64,
    pub sampler_events_dropped: u64,
    pub sensor_failures_total: u64,
    pub sampler_restarts_total: u64,
    pub durable_ok_total: u64,
    pub durable_failed_total: u64,
    pub durable_lat_buckets: [u64; METRICS_NUM_BUCKETS],
    pub durable_lat_avg_ms: u64,
    pub durable_lat_max_ms: u64,
    pub durable_lat_p95_ms: u64,
    pub live_pushed_total: u64,
    pub live_dropped_total: u64,
    pub live_connects_total: u64,
    pub live_disconnects_total: u64,
    pub live_reconnect_attempts_total: u64,
    pub live_state: u64,
}

impl MetricsSummary {
    /// Log the summary
    pub fn log(&self) {
        info!(
            samples_total = %self.samples_total,
            samples_per_min = format!("{:.1}", self.samples_per_min),
            fixes_discarded = %self.fixes_discarded_total,
            sensor_failures = %self.sensor_failures_total,
            sampler_restarts = %self.sampler_restarts_total,
            durable_ok = %self.durable_ok_total,
            durable_failed = %self.durable_failed_total,
            durable_avg_ms = %self.durable_lat_avg_ms,
            durable_p95_ms = %self.durable_lat_p95_ms,
            live_pushed = %self.live_pushed_total,
            live_dropped = %self.live_dropped_total,
            live_reconnects = %self.live_reconnect_attempts_total,
            live_state = %self.live_state,
            "metrics"
        );
    }
}
