//! Metric name and label definitions.
//!
//! Centralizing these as constants keeps the Prometheus exporter, the
//! in-process snapshot, and the places that actually call `counter!`/`gauge!`
//! in sync.

/// Account scheduler metrics (C5).
pub mod scheduler {
    /// Total `Select` calls.
    pub const SELECT_TOTAL: &str = "relay_scheduler_select_total";
    /// Selections satisfied by the previous_response_id sticky layer.
    pub const STICKY_PREVIOUS_HIT_TOTAL: &str = "relay_scheduler_sticky_previous_hit_total";
    /// Selections satisfied by the session_hash sticky layer.
    pub const STICKY_SESSION_HIT_TOTAL: &str = "relay_scheduler_sticky_session_hit_total";
    /// Selections that fell through to the load-balance layer.
    pub const LOAD_BALANCE_SELECT_TOTAL: &str = "relay_scheduler_load_balance_select_total";
    /// Times a client connection's account differed from its previous turn.
    pub const ACCOUNT_SWITCH_TOTAL: &str = "relay_scheduler_account_switch_total";
    /// `Select` call latency.
    pub const SELECT_LATENCY_SECONDS: &str = "relay_scheduler_select_latency_seconds";
    /// Population standard deviation of candidate load rates, per selection.
    pub const LOAD_SKEW: &str = "relay_scheduler_load_skew";
    /// `Select` calls that found no schedulable candidate.
    pub const NO_AVAILABLE_ACCOUNT_TOTAL: &str = "relay_scheduler_no_available_account_total";
}

/// WS client dialer metrics (C7).
pub mod dialer {
    /// Transport pool cache hits.
    pub const CACHE_HITS_TOTAL: &str = "relay_dialer_transport_cache_hits_total";
    /// Transport pool cache misses (a fresh transport was built).
    pub const CACHE_MISSES_TOTAL: &str = "relay_dialer_transport_cache_misses_total";
    /// Entries evicted from a per-proxy transport pool (LRU, over capacity).
    pub const POOL_EVICTIONS_TOTAL: &str = "relay_dialer_transport_pool_evictions_total";
    /// Upstream dial duration.
    pub const DIAL_DURATION_SECONDS: &str = "relay_dialer_dial_duration_seconds";
    /// Dial attempts that failed.
    pub const DIAL_ERRORS_TOTAL: &str = "relay_dialer_dial_errors_total";
}

/// Backward-compatibility fallback counters for sticky-key schema migration.
pub mod compat {
    /// Reads that fell back to the legacy (pre-group-scoped) cache key.
    pub const LEGACY_KEY_FALLBACK_TOTAL: &str = "relay_compat_legacy_key_fallback_total";
    /// Writes that also wrote the legacy cache key alongside the current one.
    pub const SESSION_HASH_DUAL_WRITE_TOTAL: &str = "relay_compat_session_hash_dual_write_total";
}

/// WS ingress proxy metrics (C8).
pub mod ingress {
    /// Currently open client WS connections.
    pub const CONNECTIONS_ACTIVE: &str = "relay_ingress_connections_active";
    /// Total client WS connections accepted.
    pub const CONNECTIONS_TOTAL: &str = "relay_ingress_connections_total";
    /// Total turns proxied across all connections.
    pub const TURNS_TOTAL: &str = "relay_ingress_turns_total";
    /// Connections that ended in a client-initiated disconnect.
    pub const CLIENT_DISCONNECT_TOTAL: &str = "relay_ingress_client_disconnect_total";
    /// Connections closed for a policy violation.
    pub const POLICY_VIOLATION_TOTAL: &str = "relay_ingress_policy_violation_total";
    /// Panics recovered by the proxy loop's panic-safety wrapper.
    pub const PANIC_TOTAL: &str = "relay_ingress_panic_total";
    /// `previous_response_id` recovery retries performed.
    pub const PREVIOUS_RESPONSE_NOT_FOUND_RETRY_TOTAL: &str =
        "relay_ingress_previous_response_not_found_retry_total";
}

/// Common label keys used across metrics.
pub mod labels {
    pub const ACCOUNT_ID: &str = "account_id";
    pub const LAYER: &str = "layer";
    pub const TRANSPORT: &str = "transport";
    pub const REASON: &str = "reason";
}

/// Standard histogram buckets for the durations this core records.
pub mod buckets {
    use once_cell::sync::Lazy;

    /// Scheduler `Select` latency buckets (in seconds). Covers 100µs to 1s —
    /// the scheduler is a pure/local-cache operation and should stay fast.
    pub static SELECT_LATENCY: Lazy<Vec<f64>> = Lazy::new(|| {
        vec![
            0.0001, 0.0005, 0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0,
        ]
    });

    /// Upstream dial duration buckets (in seconds). Covers 10ms to 30s.
    pub static DIAL_DURATION: Lazy<Vec<f64>> = Lazy::new(|| {
        vec![
            0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 20.0, 30.0,
        ]
    });
}
