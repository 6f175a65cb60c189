//! Configuration validation.
//!
//! Serde already rejects the wrong shape on load; this module catches values
//! that parse fine but are semantically unusable (zero timeouts, negative
//! weights, an empty candidate window).

use crate::schema::RelayConfig;

/// Severity level for a diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Error,
    Warning,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Error => write!(f, "error"),
            Self::Warning => write!(f, "warning"),
        }
    }
}

/// A single validation diagnostic.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub severity: Severity,
    /// Dotted path, e.g. "openai_ws.lb_top_k"
    pub path: String,
    pub message: String,
}

/// Result of validating a configuration.
#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    pub diagnostics: Vec<Diagnostic>,
}

impl ValidationResult {
    /// Returns `true` if any diagnostic is an error.
    #[must_use]
    pub fn has_errors(&self) -> bool {
        self.diagnostics
            .iter()
            .any(|d| d.severity == Severity::Error)
    }

    fn push(&mut self, severity: Severity, path: &str, message: impl Into<String>) {
        self.diagnostics.push(Diagnostic {
            severity,
            path: path.to_string(),
            message: message.into(),
        });
    }
}

/// Validate a loaded config's semantic invariants.
///
/// `lb_top_k == 0` and all-zero weights are errors — the scheduler's
/// load-balance layer (C5 layer 3) cannot make a decision with either. Weight
/// values below zero are warnings: they invert the intended ranking but
/// don't prevent a decision.
#[must_use]
pub fn validate(config: &RelayConfig) -> ValidationResult {
    let mut result = ValidationResult::default();
    let ws = &config.openai_ws;

    if ws.lb_top_k == 0 {
        result.push(
            Severity::Error,
            "openai_ws.lb_top_k",
            "must be at least 1; the load-balance layer needs at least one candidate",
        );
    }

    let weights = &ws.scheduler_score_weights;
    let all_zero = [
        weights.priority,
        weights.load,
        weights.queue,
        weights.error_rate,
        weights.ttft,
    ]
    .iter()
    .all(|w| *w == 0.0);
    if all_zero {
        result.push(
            Severity::Error,
            "openai_ws.scheduler_score_weights",
            "at least one weight must be non-zero",
        );
    }
    for (name, weight) in [
        ("priority", weights.priority),
        ("load", weights.load),
        ("queue", weights.queue),
        ("error_rate", weights.error_rate),
        ("ttft", weights.ttft),
    ] {
        if weight < 0.0 {
            result.push(
                Severity::Warning,
                &format!("openai_ws.scheduler_score_weights.{name}"),
                "negative weight inverts the ranking for this factor",
            );
        }
    }

    if ws.sticky_session_wait_timeout_seconds == 0 {
        result.push(
            Severity::Error,
            "openai_ws.sticky_session_wait_timeout_seconds",
            "must be non-zero; a zero wait timeout can never be satisfied",
        );
    }
    if ws.fallback_wait_timeout_seconds == 0 {
        result.push(
            Severity::Error,
            "openai_ws.fallback_wait_timeout_seconds",
            "must be non-zero; a zero wait timeout can never be satisfied",
        );
    }
    if ws.sticky_session_max_waiting == 0 {
        result.push(
            Severity::Warning,
            "openai_ws.sticky_session_max_waiting",
            "zero waiters means layer 2 always falls through immediately to layer 3",
        );
    }
    if ws.fallback_max_waiting == 0 {
        result.push(
            Severity::Warning,
            "openai_ws.fallback_max_waiting",
            "zero waiters means layer 3 never waits, only selects immediately or fails",
        );
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let result = validate(&RelayConfig::default());
        assert!(!result.has_errors());
    }

    #[test]
    fn zero_top_k_is_an_error() {
        let mut cfg = RelayConfig::default();
        cfg.openai_ws.lb_top_k = 0;
        let result = validate(&cfg);
        assert!(result.has_errors());
    }

    #[test]
    fn all_zero_weights_is_an_error() {
        let mut cfg = RelayConfig::default();
        cfg.openai_ws.scheduler_score_weights = crate::schema::SchedulerScoreWeights {
            priority: 0.0,
            load: 0.0,
            queue: 0.0,
            error_rate: 0.0,
            ttft: 0.0,
        };
        let result = validate(&cfg);
        assert!(result.has_errors());
    }

    #[test]
    fn negative_weight_is_only_a_warning() {
        let mut cfg = RelayConfig::default();
        cfg.openai_ws.scheduler_score_weights.priority = -1.0;
        let result = validate(&cfg);
        assert!(!result.has_errors());
        assert!(
            result
                .diagnostics
                .iter()
                .any(|d| d.severity == Severity::Warning)
        );
    }

    #[test]
    fn zero_wait_timeout_is_an_error() {
        let mut cfg = RelayConfig::default();
        cfg.openai_ws.sticky_session_wait_timeout_seconds = 0;
        let result = validate(&cfg);
        assert!(result.has_errors());
    }
}
