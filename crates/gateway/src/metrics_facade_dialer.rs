//! Facade mirroring [`crate::metrics_facade`] for the dialer's (C7) cache
//! hit/miss/eviction counters, so `relay-gateway` builds with the `metrics`
//! feature off.

#[cfg(feature = "metrics")]
mod enabled {
    use std::sync::Arc;

    use relay_metrics::{DialerMetrics, DialerMetricsSnapshot};

    #[derive(Clone)]
    pub struct DialerMetricsHandle(Arc<DialerMetrics>);

    impl DialerMetricsHandle {
        #[must_use]
        pub fn new() -> Self {
            Self(Arc::new(DialerMetrics::new()))
        }

        pub fn record_cache_hit(&self) {
            self.0.record_cache_hit();
        }

        pub fn record_cache_miss(&self) {
            self.0.record_cache_miss();
        }

        pub fn record_eviction(&self) {
            self.0.record_eviction();
        }

        pub fn record_dial_error(&self) {
            self.0.record_dial_error();
        }

        #[must_use]
        pub fn snapshot(&self) -> DialerMetricsSnapshot {
            self.0.snapshot()
        }
    }

    impl Default for DialerMetricsHandle {
        fn default() -> Self {
            Self::new()
        }
    }
}

#[cfg(not(feature = "metrics"))]
mod disabled {
    #[derive(Debug, Clone, Copy, Default, PartialEq)]
    pub struct DialerMetricsSnapshot {
        pub cache_hits_total: u64,
        pub cache_misses_total: u64,
        pub pool_evictions_total: u64,
        pub dial_errors_total: u64,
        pub reuse_ratio: f64,
    }

    #[derive(Clone, Default)]
    pub struct DialerMetricsHandle;

    impl DialerMetricsHandle {
        #[must_use]
        pub fn new() -> Self {
            Self
        }

        pub fn record_cache_hit(&self) {}
        pub fn record_cache_miss(&self) {}
        pub fn record_eviction(&self) {}
        pub fn record_dial_error(&self) {}

        #[must_use]
        pub fn snapshot(&self) -> DialerMetricsSnapshot {
            DialerMetricsSnapshot::default()
        }
    }
}

#[cfg(feature = "metrics")]
pub use enabled::DialerMetricsHandle;
#[cfg(not(feature = "metrics"))]
pub use disabled::{DialerMetricsHandle, DialerMetricsSnapshot};
#[cfg(feature = "metrics")]
pub use relay_metrics::DialerMetricsSnapshot;
