//! Runtime stats (C2): EWMA-smoothed per-account error rate and
//! time-to-first-token, consulted by the load-balance layer of the scheduler.

use dashmap::DashMap;
use relay_protocol::{AccountRuntimeStat, EWMA_ALPHA};

/// Per-account EWMA tracker. One process-wide instance; never persisted.
#[derive(Default)]
pub struct RuntimeStats {
    stats: DashMap<String, AccountRuntimeStat>,
}

impl RuntimeStats {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the outcome of one upstream turn. `first_token_ms` is `None`
    /// when no token was ever streamed back (e.g. a pre-stream failure).
    pub fn report(&self, account_id: &str, success: bool, first_token_ms: Option<u64>) {
        let mut entry = self.stats.entry(account_id.to_string()).or_default();

        let error_sample = if success { 0.0 } else { 1.0 };
        entry.error_rate_ewma = ewma(entry.error_rate_ewma, error_sample);

        if let Some(ms) = first_token_ms.filter(|ms| *ms > 0) {
            let ms = ms as f64;
            entry.ttft_ewma_ms = if entry.has_ttft { ewma(entry.ttft_ewma_ms, ms) } else { ms };
            entry.has_ttft = true;
        }
    }

    #[must_use]
    pub fn snapshot(&self, account_id: &str) -> AccountRuntimeStat {
        self.stats.get(account_id).map_or_else(AccountRuntimeStat::default, |s| *s)
    }
}

fn ewma(previous: f64, sample: f64) -> f64 {
    EWMA_ALPHA * sample + (1.0 - EWMA_ALPHA) * previous
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_account_reports_a_zeroed_snapshot() {
        let stats = RuntimeStats::new();
        let snapshot = stats.snapshot("ghost");
        assert_eq!(snapshot.error_rate_ewma, 0.0);
        assert!(!snapshot.has_ttft);
    }

    #[test]
    fn repeated_success_decays_error_rate_toward_zero() {
        let stats = RuntimeStats::new();
        stats.report("acct-1", false, None);
        let after_failure = stats.snapshot("acct-1").error_rate_ewma;
        assert!(after_failure > 0.0);

        for _ in 0..50 {
            stats.report("acct-1", true, None);
        }
        let after_successes = stats.snapshot("acct-1").error_rate_ewma;
        assert!(after_successes < after_failure);
        assert!(after_successes < 0.01);
    }

    #[test]
    fn first_ttft_sample_seeds_the_average_directly() {
        let stats = RuntimeStats::new();
        stats.report("acct-1", true, Some(120));
        let snapshot = stats.snapshot("acct-1");
        assert!(snapshot.has_ttft);
        assert_eq!(snapshot.ttft_ewma_ms, 120.0);
    }

    #[test]
    fn subsequent_ttft_samples_are_smoothed_not_replaced() {
        let stats = RuntimeStats::new();
        stats.report("acct-1", true, Some(100));
        stats.report("acct-1", true, Some(300));
        let snapshot = stats.snapshot("acct-1");
        assert!(snapshot.ttft_ewma_ms > 100.0 && snapshot.ttft_ewma_ms < 300.0);
    }

    #[test]
    fn zero_first_token_ms_is_treated_as_no_sample() {
        let stats = RuntimeStats::new();
        stats.report("acct-1", true, Some(0));
        assert!(!stats.snapshot("acct-1").has_ttft);
    }
}
