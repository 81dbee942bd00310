//! Counters and dispatch latency for one runtime.

use hdrhistogram::Histogram;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Largest latency the histogram tracks: one hour in nanoseconds.
const MAX_LATENCY_NS: u64 = 3_600_000_000_000;

#[derive(Debug)]
pub struct Metrics {
    enabled: bool,
    dispatches: AtomicU64,
    dispatch_failures: AtomicU64,
    builds: AtomicU64,
    build_failures: AtomicU64,
    transfers: AtomicU64,
    bytes_transferred: AtomicU64,

    // Host-side dispatch latency, submission to return
    latency_histogram: RwLock<Option<Histogram<u64>>>,

    start_time: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        let histogram = Histogram::new_with_max(MAX_LATENCY_NS, 3).ok();
        Self {
            enabled: true,
            dispatches: AtomicU64::new(0),
            dispatch_failures: AtomicU64::new(0),
            builds: AtomicU64::new(0),
            build_failures: AtomicU64::new(0),
            transfers: AtomicU64::new(0),
            bytes_transferred: AtomicU64::new(0),
            latency_histogram: RwLock::new(histogram),
            start_time: Instant::now(),
        }
    }

    /// A collector that ignores every record call.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            latency_histogram: RwLock::new(None),
            ..Self::new()
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn record_dispatch(&self, elapsed: Duration) {
        if !self.enabled {
            return;
        }
        self.dispatches.fetch_add(1, Ordering::Relaxed);
        let nanos = u64::try_from(elapsed.as_nanos()).unwrap_or(MAX_LATENCY_NS);
        if let Some(mut hist) = self.latency_histogram.try_write() {
            if let Some(hist) = hist.as_mut() {
                let _ = hist.record(nanos.clamp(1, MAX_LATENCY_NS));
            }
        }
    }

    pub fn record_dispatch_failure(&self) {
        if !self.enabled {
            return;
        }
        self.dispatch_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_build(&self, success: bool) {
        if !self.enabled {
            return;
        }
        self.builds.fetch_add(1, Ordering::Relaxed);
        if !success {
            self.build_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_transfer(&self, bytes: usize) {
        if !self.enabled {
            return;
        }
        self.transfers.fetch_add(1, Ordering::Relaxed);
        self.bytes_transferred.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let histogram = self.latency_histogram.read();
        let quantile = |q: f64| histogram.as_ref().map_or(0, |h| h.value_at_quantile(q));

        MetricsSnapshot {
            timestamp: Instant::now(),
            uptime: self.start_time.elapsed(),
            dispatches: self.dispatches.load(Ordering::Relaxed),
            dispatch_failures: self.dispatch_failures.load(Ordering::Relaxed),
            builds: self.builds.load(Ordering::Relaxed),
            build_failures: self.build_failures.load(Ordering::Relaxed),
            transfers: self.transfers.load(Ordering::Relaxed),
            bytes_transferred: self.bytes_transferred.load(Ordering::Relaxed),
            avg_latency_ns: histogram
                .as_ref()
                .filter(|h| h.len() > 0)
                .map_or(0, |h| h.mean() as u64),
            p50_latency_ns: quantile(0.50),
            p99_latency_ns: quantile(0.99),
            max_latency_ns: histogram.as_ref().map_or(0, |h| h.max()),
        }
    }

    pub fn reset(&self) {
        self.dispatches.store(0, Ordering::Relaxed);
        self.dispatch_failures.store(0, Ordering::Relaxed);
        self.builds.store(0, Ordering::Relaxed);
        self.build_failures.store(0, Ordering::Relaxed);
        self.transfers.store(0, Ordering::Relaxed);
        self.bytes_transferred.store(0, Ordering::Relaxed);

        if let Some(mut hist) = self.latency_histogram.try_write() {
            if let Some(hist) = hist.as_mut() {
                hist.reset();
            }
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub timestamp: Instant,
    pub uptime: Duration,
    pub dispatches: u64,
    pub dispatch_failures: u64,
    pub builds: u64,
    pub build_failures: u64,
    pub transfers: u64,
    pub bytes_transferred: u64,
    pub avg_latency_ns: u64,
    pub p50_latency_ns: u64,
    pub p99_latency_ns: u64,
    pub max_latency_ns: u64,
}

impl MetricsSnapshot {
    pub fn dispatches_per_second(&self) -> f64 {
        let seconds = self.uptime.as_secs_f64();
        if seconds == 0.0 {
            return 0.0;
        }
        self.dispatches as f64 / seconds
    }

    /// Share of dispatches that failed, 0.0 to 1.0.
    pub fn failure_rate(&self) -> f64 {
        let total = self.dispatches + self.dispatch_failures;
        if total == 0 {
            return 0.0;
        }
        self.dispatch_failures as f64 / total as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_basic() {
        let metrics = Metrics::new();

        metrics.record_dispatch(Duration::from_micros(10));
        metrics.record_dispatch(Duration::from_micros(30));
        metrics.record_dispatch_failure();
        metrics.record_build(true);
        metrics.record_build(false);
        metrics.record_transfer(4096);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.dispatches, 2);
        assert_eq!(snapshot.build_failures, 1);
        assert_eq!(snapshot.bytes_transferred, 4096);
        assert!(snapshot.avg_latency_ns > 0);
        assert!((snapshot.failure_rate() - 1.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_disabled_ignores_records() {
        let metrics = Metrics::disabled();
        metrics.record_dispatch(Duration::from_micros(5));
        metrics.record_transfer(64);
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.dispatches, 0);
        assert_eq!(snapshot.transfers, 0);
        assert!(!metrics.is_enabled());
    }

    #[test]
    fn test_metrics_reset() {
        let metrics = Metrics::new();

        metrics.record_dispatch(Duration::from_nanos(1000));
        assert_eq!(metrics.snapshot().dispatches, 1);

        metrics.reset();
        assert_eq!(metrics.snapshot().dispatches, 0);
        assert_eq!(metrics.snapshot().max_latency_ns, 0);
    }
}
