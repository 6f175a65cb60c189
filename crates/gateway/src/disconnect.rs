//! Disconnect classification (C8 point 10).
//!
//! Distinguishes a client walking away from a real upstream/proxy error so
//! the ingress loop can log at `debug` instead of `warn` and skip emitting
//! an error close frame for something that was never really a failure.

use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;

/// String markers that identify a client-initiated disconnect surfaced as
/// an I/O error string rather than a structured close frame.
const DISCONNECT_MARKERS: &[&str] = &[
    "eof",
    "connection reset",
    "reset by peer",
    "broken pipe",
    "connection closed",
    "net closed",
    "context canceled",
    "context deadline exceeded",
];

/// True when `message` (a raw I/O / transport error string) looks like the
/// client going away rather than an upstream failure.
#[must_use]
pub fn is_disconnect_message(message: &str) -> bool {
    let lower = message.to_lowercase();
    DISCONNECT_MARKERS.iter().any(|marker| lower.contains(marker))
}

/// True when `code` is a WS close code that represents a normal client exit
/// rather than a protocol/policy failure. `PolicyViolation`-equivalent codes
/// are deliberately excluded — those are errors this core raised itself.
#[must_use]
pub fn is_disconnect_close_code(code: CloseCode) -> bool {
    matches!(
        code,
        CloseCode::Normal | CloseCode::Away | CloseCode::Status | CloseCode::Abnormal
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eof_is_a_disconnect() {
        assert!(is_disconnect_message("read tcp 127.0.0.1:443: EOF"));
    }

    #[test]
    fn reset_by_peer_is_a_disconnect() {
        assert!(is_disconnect_message("connection reset by peer"));
    }

    #[test]
    fn broken_pipe_is_a_disconnect() {
        assert!(is_disconnect_message("write: broken pipe"));
    }

    #[test]
    fn context_canceled_is_a_disconnect() {
        assert!(is_disconnect_message("context canceled"));
    }

    #[test]
    fn an_unrelated_upstream_error_is_not_a_disconnect() {
        assert!(!is_disconnect_message("invalid json payload"));
    }

    #[test]
    fn normal_and_away_and_abnormal_close_codes_are_disconnects() {
        assert!(is_disconnect_close_code(CloseCode::Normal));
        assert!(is_disconnect_close_code(CloseCode::Away));
        assert!(is_disconnect_close_code(CloseCode::Abnormal));
    }

    #[test]
    fn policy_violation_code_is_not_a_disconnect() {
        assert!(!is_disconnect_close_code(CloseCode::Policy));
    }
}
