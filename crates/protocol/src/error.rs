use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

/// The error taxonomy this core can surface to a caller (HTTP error body or
/// WS close frame). Every variant maps to a stable wire `code` via
/// [`ErrorShape::from`].
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("no schedulable account available for model {model:?}")]
    NoAvailableAccount { model: String },

    #[error("no concurrency slot available for account {account_id}")]
    ConcurrencySlotUnavailable { account_id: String },

    #[error("failed to dial upstream for account {account_id}: {reason}")]
    UpstreamDial { account_id: String, reason: String },

    #[error("upstream read failed for account {account_id}: {reason}")]
    UpstreamRead { account_id: String, reason: String },

    #[error("client disconnected: {reason}")]
    ClientDisconnect { reason: String },

    #[error("policy violation: {reason}")]
    PolicyViolation { reason: String },

    #[error("previous_response_id {response_id} has no known binding")]
    PreviousResponseNotFound { response_id: String },

    #[error("failed to parse payload: {reason}")]
    PayloadParse { reason: String },

    #[error("internal panic recovered: {reason}")]
    InternalPanic { reason: String },
}

impl GatewayError {
    /// Stable machine-readable wire code for this variant.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::NoAvailableAccount { .. } => "no_available_account",
            Self::ConcurrencySlotUnavailable { .. } => "concurrency_slot_unavailable",
            Self::UpstreamDial { .. } => "upstream_dial_failed",
            Self::UpstreamRead { .. } => "upstream_read_failed",
            Self::ClientDisconnect { .. } => "client_disconnect",
            Self::PolicyViolation { .. } => "policy_violation",
            Self::PreviousResponseNotFound { .. } => "previous_response_not_found",
            Self::PayloadParse { .. } => "payload_parse_error",
            Self::InternalPanic { .. } => "internal_panic",
        }
    }

    /// Whether a client may reasonably retry the same request as-is.
    ///
    /// `ClientDisconnect` has no retryable meaning — there is no longer a
    /// client to retell.
    #[must_use]
    pub fn retryable(&self) -> Option<bool> {
        match self {
            Self::NoAvailableAccount { .. }
            | Self::ConcurrencySlotUnavailable { .. }
            | Self::UpstreamDial { .. }
            | Self::UpstreamRead { .. } => Some(true),
            Self::PolicyViolation { .. }
            | Self::PreviousResponseNotFound { .. }
            | Self::PayloadParse { .. } => Some(false),
            Self::ClientDisconnect { .. } | Self::InternalPanic { .. } => None,
        }
    }

    #[must_use]
    pub fn details(&self) -> Option<Value> {
        match self {
            Self::NoAvailableAccount { model } => Some(serde_json::json!({ "model": model })),
            Self::ConcurrencySlotUnavailable { account_id }
            | Self::UpstreamDial { account_id, .. }
            | Self::UpstreamRead { account_id, .. } => {
                Some(serde_json::json!({ "account_id": account_id }))
            }
            Self::PreviousResponseNotFound { response_id } => {
                Some(serde_json::json!({ "response_id": response_id }))
            }
            Self::ClientDisconnect { .. }
            | Self::PolicyViolation { .. }
            | Self::PayloadParse { .. }
            | Self::InternalPanic { .. } => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;

/// Wire shape for an error surfaced to a client, used both as an HTTP error
/// body and as the payload of a WS close frame's reason text.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorShape {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retryable: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl From<&GatewayError> for ErrorShape {
    fn from(err: &GatewayError) -> Self {
        Self {
            code: err.code().to_string(),
            message: err.to_string(),
            retryable: err.retryable(),
            details: err.details(),
        }
    }
}

impl From<GatewayError> for ErrorShape {
    fn from(err: GatewayError) -> Self {
        Self::from(&err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disconnect_has_no_retryable_verdict() {
        let err = GatewayError::ClientDisconnect {
            reason: "read timeout".into(),
        };
        let shape = ErrorShape::from(&err);
        assert_eq!(shape.code, "client_disconnect");
        assert!(shape.retryable.is_none());
    }

    #[test]
    fn no_available_account_carries_model_in_details() {
        let err = GatewayError::NoAvailableAccount {
            model: "gpt-5".into(),
        };
        let shape = ErrorShape::from(&err);
        assert_eq!(shape.retryable, Some(true));
        assert_eq!(shape.details.unwrap()["model"], "gpt-5");
    }

    #[test]
    fn policy_violation_is_not_retryable() {
        let err = GatewayError::PolicyViolation {
            reason: "model not permitted for account".into(),
        };
        assert_eq!(ErrorShape::from(&err).retryable, Some(false));
    }
}
