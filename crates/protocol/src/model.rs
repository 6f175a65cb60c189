use std::time::Duration;

use secrecy::Secret;
use serde::{Deserialize, Serialize};

// ── Account ──────────────────────────────────────────────────────────────────

/// Upstream LLM platform family an [`Account`] authenticates against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    OpenAi,
    Sora,
    Anthropic,
    Other,
}

impl Platform {
    /// OpenAI and Sora share the Responses-API upstream surface this core
    /// schedules for; everything else takes the HTTP-SSE path unconditionally.
    #[must_use]
    pub fn is_openai_family(self) -> bool {
        matches!(self, Self::OpenAi | Self::Sora)
    }
}

/// How an [`Account`] authenticates to its upstream platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthType {
    OAuth,
    ApiKey,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountStatus {
    Active,
    Suspended,
    Disabled,
}

/// Credential material for an account. Secrets are wrapped so they never
/// leak into `Debug`/log output by accident.
#[derive(Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Credential {
    ApiKey { key: Secret<String> },
    OAuth {
        access_token: Secret<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        refresh_token: Option<Secret<String>>,
    },
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ApiKey { .. } => f.debug_struct("ApiKey").finish(),
            Self::OAuth { .. } => f.debug_struct("OAuth").finish(),
        }
    }
}

/// Per-account ingress mode for the WS-v2 proxy path (C4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IngressMode {
    Off,
    Shared,
    Dedicated,
}

/// An upstream account the scheduler can route a turn to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: String,
    pub name: String,
    pub platform: Platform,
    pub auth_type: AuthType,
    /// Lower is preferred.
    pub priority: i32,
    /// Hard cap on in-flight requests for this account.
    pub concurrency: u32,
    pub schedulable: bool,
    pub status: AccountStatus,
    pub credential: Credential,
    /// Opaque per-account overrides: ws-v2 mode, model rate-limit reset
    /// timestamps, a force-HTTP flag, etc. Never interpreted wholesale —
    /// only named keys are read.
    #[serde(default)]
    pub extra: serde_json::Map<String, serde_json::Value>,
    /// Models this account is permitted to serve. Empty means "all models".
    #[serde(default)]
    pub models: Vec<String>,
}

impl Account {
    /// A non-schedulable or non-`Active` account is never selected.
    #[must_use]
    pub fn is_usable(&self) -> bool {
        self.schedulable && self.status == AccountStatus::Active
    }

    #[must_use]
    pub fn supports_model(&self, model: &str) -> bool {
        self.models.is_empty() || self.models.iter().any(|m| m == model)
    }

    #[must_use]
    pub fn force_http(&self) -> bool {
        self.extra
            .get("force_http")
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(false)
    }

    /// `openai_apikey_responses_websockets_v2_mode` override, if present.
    #[must_use]
    pub fn ws_v2_mode_override(&self) -> Option<IngressMode> {
        match self
            .extra
            .get("openai_apikey_responses_websockets_v2_mode")
            .and_then(serde_json::Value::as_str)
        {
            Some("off") => Some(IngressMode::Off),
            Some("shared") => Some(IngressMode::Shared),
            Some("dedicated") => Some(IngressMode::Dedicated),
            _ => None,
        }
    }
}

// ── Scheduling ───────────────────────────────────────────────────────────────

/// Transient per-batch load sample produced by the concurrency broker (C3).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountLoadInfo {
    pub account_id: String,
    /// Percentage in `[0, 100]`.
    pub load_rate: f64,
    pub waiting_count: u32,
}

/// EWMA-smoothed per-account runtime stat (C2).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AccountRuntimeStat {
    /// In `[0, 1]`.
    pub error_rate_ewma: f64,
    pub ttft_ewma_ms: f64,
    pub has_ttft: bool,
}

impl Default for AccountRuntimeStat {
    fn default() -> Self {
        Self {
            error_rate_ewma: 0.0,
            ttft_ewma_ms: 0.0,
            has_ttft: false,
        }
    }
}

/// Immutable per-call scheduling request (C5).
#[derive(Debug, Clone, Default)]
pub struct ScheduleRequest {
    pub group_id: Option<String>,
    pub session_hash: String,
    pub previous_response_id: String,
    pub requested_model: String,
    pub excluded_ids: Vec<String>,
}

/// Which layer of the three-layer scheduler produced a [`ScheduleDecision`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleLayer {
    PreviousResponseId,
    SessionHash,
    LoadBalance,
}

/// The transport chosen by the protocol resolver (C4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Transport {
    HttpSse,
    WsV1,
    WsV2,
}

/// Outcome of the protocol resolver (C4): a transport plus the reason it was
/// chosen, for observability.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportDecision {
    pub transport: Transport,
    pub reason: String,
}

/// Observability record produced per `Select` call (C5).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleDecision {
    pub layer: ScheduleLayer,
    pub sticky_previous_hit: bool,
    pub sticky_session_hit: bool,
    pub candidate_count: usize,
    pub top_k: usize,
    pub latency_ms: u64,
    pub load_skew: f64,
    pub selected_account_id: String,
    pub selected_account_type: Platform,
}

/// A deferred slot-acquisition descriptor returned when no concurrency slot
/// is immediately available but queuing is permitted.
#[derive(Debug, Clone, PartialEq)]
pub struct WaitPlan {
    pub account_id: String,
    pub max_concurrency: u32,
    pub timeout: Duration,
    pub max_waiting: u32,
}

// ── Usage ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestType {
    Sync,
    Stream,
    WsV2,
}

/// Emitted once per terminal response event; the only billing-shaped output
/// this core produces (actual bookkeeping is an external collaborator).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UsageRecord {
    pub request_type: Option<RequestType>,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_read_input_tokens: u64,
    pub request_id: String,
    #[serde(default)]
    pub pending_function_call_ids: Vec<String>,
}

/// Partial turn state preserved on an error path so callers can still emit
/// half-turn telemetry. Must be cloned before mutation by the caller.
#[derive(Debug, Clone, Default)]
pub struct PartialTurnResult {
    pub request_id: String,
    pub usage: Option<UsageRecord>,
    pub pending_function_call_ids: Vec<String>,
}

/// Per-`(group, session_hash)` turn bookkeeping the payload normalizer (C6)
/// needs across turns of the same client WS connection. Lives in the sticky
/// state store's session→turnState local map.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionTurnState {
    /// `previous_response_id` the normalizer expects the client to send on
    /// the next turn; empty when unknown or cleared.
    pub expected_previous_response_id: String,
    /// `call_id`s from `function_call_output` items the upstream is still
    /// owed an output for.
    pub pending_expected_call_ids: Vec<String>,
    /// Whether this session has `store: false` set on its upstream turns.
    pub store_disabled: bool,
    /// The `input` array from the last turn replayed to the upstream, used
    /// to detect a store-disabled edit (§4.6).
    pub last_turn_replay_input: Option<serde_json::Value>,
}

// ── Sticky binding keys ──────────────────────────────────────────────────────

/// Builds the shared-cache key for a `response -> account` binding:
/// `openai:response:<hex(sha256(response_id))>`, scoped by group.
#[must_use]
pub fn response_account_cache_key(group_id: Option<&str>, response_id: &str) -> String {
    use sha2::{Digest, Sha256};

    let mut hasher = Sha256::new();
    hasher.update(response_id.trim().as_bytes());
    let digest = hasher.finalize();
    let hex = digest.iter().fold(String::with_capacity(64), |mut acc, b| {
        use std::fmt::Write as _;
        let _ = write!(acc, "{b:02x}");
        acc
    });
    match group_id {
        Some(g) if !g.is_empty() => format!("openai:response:{g}:{hex}"),
        _ => format!("openai:response:{hex}"),
    }
}
