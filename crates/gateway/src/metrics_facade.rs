//! Thin facade so the scheduler/dialer compile identically whether or not
//! the `metrics` feature (and its `relay-metrics` dependency) is enabled.

/// Which C5 layer satisfied a `Select` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    StickyPrevious,
    StickySession,
    LoadBalance,
}

#[cfg(feature = "metrics")]
mod enabled {
    use std::sync::Arc;

    use relay_metrics::{SchedulerMetrics, SchedulerMetricsSnapshot, SelectOutcome};

    use super::RecordOutcome;

    #[derive(Clone)]
    pub struct SchedulerMetricsHandle(Arc<SchedulerMetrics>);

    impl SchedulerMetricsHandle {
        #[must_use]
        pub fn new() -> Self {
            Self(Arc::new(SchedulerMetrics::new()))
        }

        #[must_use]
        pub fn new_for_test() -> Self {
            Self::new()
        }

        pub fn record(&self, outcome: RecordOutcome, latency_ms: u64, load_skew: f64) {
            let mapped = match outcome {
                RecordOutcome::StickyPrevious => SelectOutcome::StickyPrevious,
                RecordOutcome::StickySession => SelectOutcome::StickySession,
                RecordOutcome::LoadBalance => SelectOutcome::LoadBalance,
            };
            self.0.record_select(mapped, latency_ms, load_skew);
        }

        pub fn record_account_switch(&self) {
            self.0.record_account_switch();
        }

        pub fn record_no_available_account(&self) {
            self.0.record_no_available_account();
        }

        #[must_use]
        pub fn snapshot(&self) -> SchedulerMetricsSnapshot {
            self.0.snapshot()
        }
    }

    impl Default for SchedulerMetricsHandle {
        fn default() -> Self {
            Self::new()
        }
    }
}

#[cfg(not(feature = "metrics"))]
mod disabled {
    use super::RecordOutcome;

    #[derive(Clone, Default)]
    pub struct SchedulerMetricsHandle;

    impl SchedulerMetricsHandle {
        #[must_use]
        pub fn new() -> Self {
            Self
        }

        #[must_use]
        pub fn new_for_test() -> Self {
            Self
        }

        pub fn record(&self, _outcome: RecordOutcome, _latency_ms: u64, _load_skew: f64) {}

        pub fn record_account_switch(&self) {}

        pub fn record_no_available_account(&self) {}
    }
}

#[cfg(feature = "metrics")]
pub use enabled::SchedulerMetricsHandle;
#[cfg(not(feature = "metrics"))]
pub use disabled::SchedulerMetricsHandle;
