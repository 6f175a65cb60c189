//! Shared domain model and error taxonomy for the OpenAI-compatible upstream
//! gateway core.
//!
//! This crate carries no behavior of its own: it is the vocabulary (`Account`,
//! `ScheduleRequest`/`ScheduleDecision`, usage records, sticky-binding keys) and
//! error taxonomy that every other crate in the workspace builds on.

pub mod error;
pub mod model;

pub use error::{ErrorShape, GatewayError, Result};
pub use model::*;

// ── Constants ────────────────────────────────────────────────────────────────

/// EWMA smoothing factor used by runtime stats (C2) and load-skew bookkeeping.
pub const EWMA_ALPHA: f64 = 0.2;

/// Default TTL for a `response -> account` sticky binding (C1).
pub const STICKY_RESPONSE_TTL_SECS: u64 = 3_600;

/// Deadline for every shared-cache (C1) round trip.
pub const STICKY_CACHE_DEADLINE_MS: u64 = 3_000;

/// Hard cap on entries per local sticky map (C1); overflow evicts one
/// arbitrary existing entry.
pub const STICKY_MAP_CAPACITY: usize = 65_536;

/// Minimum interval between incremental sweeps of a single sticky map.
pub const STICKY_SWEEP_INTERVAL_SECS: u64 = 60;

/// Maximum number of expired entries removed per sweep pass.
pub const STICKY_SWEEP_BATCH: usize = 512;

/// Default read-idle timeout for an established upstream WS connection (C8).
pub const DEFAULT_READ_IDLE_TIMEOUT_SECS: u64 = 1_800;

/// Lower clamp applied to an explicitly configured, non-zero read-idle timeout.
pub const MIN_READ_IDLE_TIMEOUT_SECS: u64 = 120;

/// Default top-K candidates considered by the load-balance layer (C5).
pub const DEFAULT_LB_TOP_K: usize = 3;

/// Default per-proxy transport pool capacity (C7).
pub const DEFAULT_TRANSPORT_POOL_CAPACITY: usize = 256;

/// Default idle TTL for a pooled per-proxy transport (C7).
pub const DEFAULT_TRANSPORT_IDLE_TTL_SECS: u64 = 900;

/// `MaxIdleConnsPerHost` applied to every pooled transport (C7).
pub const TRANSPORT_MAX_IDLE_PER_HOST: usize = 64;

/// Minimum single-frame WS read buffer raised on every dialed upstream
/// connection (C7).
pub const MIN_WS_FRAME_SIZE_BYTES: usize = 16 * 1024 * 1024;

/// Minimum SSE line length considered when scanning for the
/// `"response.completed"` sentinel on the HTTP-SSE path (C8).
pub const MIN_SSE_COMPLETION_LINE_LEN: usize = 80;
