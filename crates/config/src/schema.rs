//! Configuration schema for the OpenAI-compatible upstream gateway core.
//!
//! Every field carries a `serde(default)` so a missing or partial config file
//! degrades to documented defaults rather than failing to parse.

use serde::{Deserialize, Serialize};

fn default_read_timeout_seconds() -> u64 {
    relay_protocol::DEFAULT_READ_IDLE_TIMEOUT_SECS
}

fn default_sticky_session_ttl_seconds() -> u64 {
    relay_protocol::STICKY_RESPONSE_TTL_SECS
}

fn default_lb_top_k() -> usize {
    relay_protocol::DEFAULT_LB_TOP_K
}

/// Root configuration for this core. Everything not under `openai_ws` is out
/// of scope for this crate and lives in the embedding application's own
/// config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub openai_ws: OpenAiWsConfig,
}

/// The `openai_ws.*` surface named in the external-interfaces contract.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OpenAiWsConfig {
    /// Master switch; `false` forces every account to HTTP-SSE (C4 rule 1).
    pub enabled: bool,
    /// Whether OAuth-authenticated accounts may use a WS transport.
    pub oauth_enabled: bool,
    /// Whether API-key-authenticated accounts may use a WS transport.
    pub apikey_enabled: bool,
    /// Global override forcing HTTP-SSE regardless of per-account settings.
    pub force_http: bool,
    /// Enables the WS-v1 transport.
    pub responses_websockets: bool,
    /// Enables the WS-v2 transport (mode-routed, per C4 rule 4).
    pub responses_websockets_v2: bool,
    /// Enables the per-account ingress-mode router (C4 rule 3).
    pub mode_router_v2_enabled: bool,
    /// Ingress mode assumed for an account with no explicit override.
    pub ingress_mode_default: relay_protocol::IngressMode,
    /// Enables the single-retry "previous response not found" recovery (§7).
    pub ingress_previous_response_recovery_enabled: bool,
    /// Upstream read-idle timeout (C8 step 7). Lower-clamped at 120s for
    /// explicitly configured non-zero values; `0` means "use the default".
    #[serde(default = "default_read_timeout_seconds")]
    pub read_timeout_seconds: u64,
    /// TTL applied to a session→account sticky binding on refresh.
    #[serde(default = "default_sticky_session_ttl_seconds")]
    pub sticky_session_ttl_seconds: u64,
    /// Top-K candidates considered by the load-balance layer (C5).
    #[serde(default = "default_lb_top_k")]
    pub lb_top_k: usize,
    /// Score weights for the load-balance layer.
    pub scheduler_score_weights: SchedulerScoreWeights,
    /// Read session→account bindings under the legacy (pre-migration) cache
    /// key when the current key misses.
    pub session_hash_read_old_fallback: bool,
    /// Also write the legacy cache key alongside the current one, so readers
    /// still on the old key keep working during a rolling migration.
    pub session_hash_dual_write_old: bool,
    /// Maximum queued waiters for a session-hash sticky wait plan (C5 layer 2).
    pub sticky_session_max_waiting: u32,
    /// Wait-plan timeout for a session-hash sticky wait plan (C5 layer 2).
    pub sticky_session_wait_timeout_seconds: u64,
    /// Wait-plan timeout for the load-balance layer's fallback wait (C5 layer 3).
    pub fallback_wait_timeout_seconds: u64,
    /// Maximum queued waiters for the load-balance layer's fallback wait.
    pub fallback_max_waiting: u32,
}

impl Default for OpenAiWsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            oauth_enabled: true,
            apikey_enabled: true,
            force_http: false,
            responses_websockets: true,
            responses_websockets_v2: false,
            mode_router_v2_enabled: false,
            ingress_mode_default: relay_protocol::IngressMode::Shared,
            ingress_previous_response_recovery_enabled: true,
            read_timeout_seconds: default_read_timeout_seconds(),
            sticky_session_ttl_seconds: default_sticky_session_ttl_seconds(),
            lb_top_k: default_lb_top_k(),
            scheduler_score_weights: SchedulerScoreWeights::default(),
            session_hash_read_old_fallback: false,
            session_hash_dual_write_old: false,
            sticky_session_max_waiting: 8,
            sticky_session_wait_timeout_seconds: 10,
            fallback_wait_timeout_seconds: 5,
            fallback_max_waiting: 16,
        }
    }
}

/// Weights applied to the five C5 load-balance scoring factors.
///
/// Defaults match the spec's documented safe defaults
/// `{1.0, 1.0, 0.7, 0.8, 0.5}`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerScoreWeights {
    pub priority: f64,
    pub load: f64,
    pub queue: f64,
    pub error_rate: f64,
    pub ttft: f64,
}

impl Default for SchedulerScoreWeights {
    fn default() -> Self {
        Self {
            priority: 1.0,
            load: 1.0,
            queue: 0.7,
            error_rate: 0.8,
            ttft: 0.5,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_enables_the_ws_surface_with_shared_ingress() {
        let cfg = RelayConfig::default();
        assert!(cfg.openai_ws.enabled);
        assert_eq!(
            cfg.openai_ws.ingress_mode_default,
            relay_protocol::IngressMode::Shared
        );
        assert!(!cfg.openai_ws.mode_router_v2_enabled);
    }

    #[test]
    fn default_score_weights_match_documented_defaults() {
        let w = SchedulerScoreWeights::default();
        assert_eq!((w.priority, w.load, w.queue, w.error_rate, w.ttft), (1.0, 1.0, 0.7, 0.8, 0.5));
    }

    #[test]
    fn missing_fields_deserialize_to_defaults() {
        let cfg: RelayConfig = toml::from_str("").unwrap();
        assert_eq!(cfg.openai_ws.lb_top_k, relay_protocol::DEFAULT_LB_TOP_K);
    }

    #[test]
    fn partial_toml_overrides_only_named_fields() {
        let cfg: RelayConfig = toml::from_str(
            r#"
            [openai_ws]
            enabled = false
            lb_top_k = 5
            "#,
        )
        .unwrap();
        assert!(!cfg.openai_ws.enabled);
        assert_eq!(cfg.openai_ws.lb_top_k, 5);
        // Untouched fields keep their defaults.
        assert!(cfg.openai_ws.oauth_enabled);
    }
}
