//! Runtime telemetry.
//!
//! Counts dispatches, builds and transfers and keeps a dispatch latency
//! histogram. Without the `telemetry` feature every call is a no-op.

#[cfg(feature = "telemetry")]
pub mod metrics;

#[cfg(feature = "telemetry")]
pub use metrics::{Metrics, MetricsSnapshot};

// Stub implementations when telemetry is disabled
#[cfg(not(feature = "telemetry"))]
pub mod metrics {
    use std::time::Duration;

    #[derive(Debug, Clone, Default)]
    pub struct Metrics;

    impl Metrics {
        pub fn new() -> Self {
            Self
        }
        pub fn disabled() -> Self {
            Self
        }
        pub fn is_enabled(&self) -> bool {
            false
        }
        pub fn record_dispatch(&self, _: Duration) {}
        pub fn record_dispatch_failure(&self) {}
        pub fn record_build(&self, _: bool) {}
        pub fn record_transfer(&self, _: usize) {}
        pub fn reset(&self) {}
        pub fn snapshot(&self) -> MetricsSnapshot {
            MetricsSnapshot::default()
        }
    }

    #[derive(Debug, Clone, Default)]
    pub struct MetricsSnapshot {
        pub dispatches: u64,
        pub dispatch_failures: u64,
        pub builds: u64,
        pub build_failures: u64,
        pub transfers: u64,
        pub bytes_transferred: u64,
    }
}

#[cfg(not(feature = "telemetry"))]
pub use metrics::{Metrics, MetricsSnapshot};
