//! In-process atomic counters for the scheduler (C5), dialer (C7), and
//! sticky-key compatibility fallback, with point-in-time snapshots.
//!
//! These mirror what's pushed through the `metrics` facade (and, with the
//! `prometheus` feature, exported as Prometheus text) but are also readable
//! directly — e.g. for `SnapshotOpenAIAccountSchedulerMetrics`.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Atomic counters backing the account scheduler's metrics (C5, C9).
#[derive(Default)]
pub struct SchedulerMetrics {
    select_total: AtomicU64,
    sticky_previous_hit_total: AtomicU64,
    sticky_session_hit_total: AtomicU64,
    load_balance_select_total: AtomicU64,
    account_switch_total: AtomicU64,
    no_available_account_total: AtomicU64,
    latency_ms_sum: AtomicU64,
    load_skew_x1000_sum: AtomicU64,
}

/// Which layer satisfied a `Select` call, for counter bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectOutcome {
    StickyPrevious,
    StickySession,
    LoadBalance,
}

impl SchedulerMetrics {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a completed `Select` call. `load_skew` is only meaningful when
    /// the load-balance layer ran; pass `0.0` otherwise.
    pub fn record_select(&self, outcome: SelectOutcome, latency_ms: u64, load_skew: f64) {
        self.select_total.fetch_add(1, Ordering::Relaxed);
        match outcome {
            SelectOutcome::StickyPrevious => {
                self.sticky_previous_hit_total.fetch_add(1, Ordering::Relaxed);
            }
            SelectOutcome::StickySession => {
                self.sticky_session_hit_total.fetch_add(1, Ordering::Relaxed);
            }
            SelectOutcome::LoadBalance => {
                self.load_balance_select_total.fetch_add(1, Ordering::Relaxed);
                self.load_skew_x1000_sum
                    .fetch_add((load_skew * 1000.0) as u64, Ordering::Relaxed);
            }
        }
        self.latency_ms_sum.fetch_add(latency_ms, Ordering::Relaxed);
    }

    pub fn record_account_switch(&self) {
        self.account_switch_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_no_available_account(&self) {
        self.no_available_account_total
            .fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn snapshot(&self) -> SchedulerMetricsSnapshot {
        let select_total = self.select_total.load(Ordering::Relaxed);
        let sticky_previous_hit_total = self.sticky_previous_hit_total.load(Ordering::Relaxed);
        let sticky_session_hit_total = self.sticky_session_hit_total.load(Ordering::Relaxed);
        let load_balance_select_total = self.load_balance_select_total.load(Ordering::Relaxed);

        let avg_latency_ms = if select_total == 0 {
            0.0
        } else {
            self.latency_ms_sum.load(Ordering::Relaxed) as f64 / select_total as f64
        };
        let avg_load_skew = if load_balance_select_total == 0 {
            0.0
        } else {
            (self.load_skew_x1000_sum.load(Ordering::Relaxed) as f64 / 1000.0)
                / load_balance_select_total as f64
        };
        let sticky_hit_ratio = if select_total == 0 {
            0.0
        } else {
            (sticky_previous_hit_total + sticky_session_hit_total) as f64 / select_total as f64
        };

        SchedulerMetricsSnapshot {
            select_total,
            sticky_previous_hit_total,
            sticky_session_hit_total,
            load_balance_select_total,
            account_switch_total: self.account_switch_total.load(Ordering::Relaxed),
            no_available_account_total: self.no_available_account_total.load(Ordering::Relaxed),
            avg_latency_ms,
            avg_load_skew,
            sticky_hit_ratio,
        }
    }
}

/// Point-in-time view of [`SchedulerMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SchedulerMetricsSnapshot {
    pub select_total: u64,
    pub sticky_previous_hit_total: u64,
    pub sticky_session_hit_total: u64,
    pub load_balance_select_total: u64,
    pub account_switch_total: u64,
    pub no_available_account_total: u64,
    pub avg_latency_ms: f64,
    pub avg_load_skew: f64,
    pub sticky_hit_ratio: f64,
}

/// Atomic counters backing the WS client dialer's transport pool (C7).
#[derive(Default)]
pub struct DialerMetrics {
    cache_hits_total: AtomicU64,
    cache_misses_total: AtomicU64,
    pool_evictions_total: AtomicU64,
    dial_errors_total: AtomicU64,
}

impl DialerMetrics {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_cache_hit(&self) {
        self.cache_hits_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_miss(&self) {
        self.cache_misses_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_eviction(&self) {
        self.pool_evictions_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dial_error(&self) {
        self.dial_errors_total.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn snapshot(&self) -> DialerMetricsSnapshot {
        let cache_hits_total = self.cache_hits_total.load(Ordering::Relaxed);
        let cache_misses_total = self.cache_misses_total.load(Ordering::Relaxed);
        let total = cache_hits_total + cache_misses_total;
        let reuse_ratio = if total == 0 {
            0.0
        } else {
            cache_hits_total as f64 / total as f64
        };

        DialerMetricsSnapshot {
            cache_hits_total,
            cache_misses_total,
            pool_evictions_total: self.pool_evictions_total.load(Ordering::Relaxed),
            dial_errors_total: self.dial_errors_total.load(Ordering::Relaxed),
            reuse_ratio,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct DialerMetricsSnapshot {
    pub cache_hits_total: u64,
    pub cache_misses_total: u64,
    pub pool_evictions_total: u64,
    pub dial_errors_total: u64,
    pub reuse_ratio: f64,
}

/// Sticky-key schema migration fallback counters.
#[derive(Default)]
pub struct CompatMetrics {
    legacy_key_fallback_total: AtomicU64,
    session_hash_dual_write_total: AtomicU64,
}

impl CompatMetrics {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_legacy_key_fallback(&self) {
        self.legacy_key_fallback_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dual_write(&self) {
        self.session_hash_dual_write_total
            .fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn snapshot(&self) -> CompatMetricsSnapshot {
        CompatMetricsSnapshot {
            legacy_key_fallback_total: self.legacy_key_fallback_total.load(Ordering::Relaxed),
            session_hash_dual_write_total: self
                .session_hash_dual_write_total
                .load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CompatMetricsSnapshot {
    pub legacy_key_fallback_total: u64,
    pub session_hash_dual_write_total: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scheduler_snapshot_computes_sticky_hit_ratio() {
        let metrics = SchedulerMetrics::new();
        metrics.record_select(SelectOutcome::StickyPrevious, 2, 0.0);
        metrics.record_select(SelectOutcome::StickySession, 3, 0.0);
        metrics.record_select(SelectOutcome::LoadBalance, 10, 4.5);

        let snap = metrics.snapshot();
        assert_eq!(snap.select_total, 3);
        assert!((snap.sticky_hit_ratio - (2.0 / 3.0)).abs() < 1e-9);
        assert!((snap.avg_load_skew - 4.5).abs() < 1e-6);
        assert!((snap.avg_latency_ms - 5.0).abs() < 1e-9);
    }

    #[test]
    fn scheduler_snapshot_is_zeroed_with_no_samples() {
        let snap = SchedulerMetrics::new().snapshot();
        assert_eq!(snap, SchedulerMetricsSnapshot::default());
    }

    #[test]
    fn dialer_snapshot_computes_reuse_ratio() {
        let metrics = DialerMetrics::new();
        metrics.record_cache_hit();
        metrics.record_cache_hit();
        metrics.record_cache_hit();
        metrics.record_cache_miss();

        let snap = metrics.snapshot();
        assert_eq!(snap.cache_hits_total, 3);
        assert_eq!(snap.cache_misses_total, 1);
        assert!((snap.reuse_ratio - 0.75).abs() < 1e-9);
    }

    #[test]
    fn compat_metrics_snapshot_counts_independently() {
        let metrics = CompatMetrics::new();
        metrics.record_legacy_key_fallback();
        metrics.record_dual_write();
        metrics.record_dual_write();

        let snap = metrics.snapshot();
        assert_eq!(snap.legacy_key_fallback_total, 1);
        assert_eq!(snap.session_hash_dual_write_total, 2);
    }

}
