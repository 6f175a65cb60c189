//! WS client dialer (C7): per-proxy transport pool for outbound upstream
//! connections.

use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use dashmap::DashMap;
use relay_protocol::{
    DEFAULT_TRANSPORT_IDLE_TTL_SECS, DEFAULT_TRANSPORT_POOL_CAPACITY, MIN_WS_FRAME_SIZE_BYTES,
    TRANSPORT_MAX_IDLE_PER_HOST,
};
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async_with_config,
    tungstenite::{
        client::IntoClientRequest,
        protocol::{CloseFrame, WebSocketConfig, frame::coding::CloseCode},
    },
};
use tracing::{debug, warn};

pub type UpstreamConnection = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

#[derive(Debug, thiserror::Error)]
pub enum DialError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("dial failed (status {status:?}): {reason}")]
    Failed {
        status: Option<u16>,
        reason: String,
        response_headers: Vec<(String, String)>,
    },
}

struct PooledTransport {
    last_used_unix_nanos: AtomicU64,
}

/// Per-proxy-URL transport pool. The pool entries here track *usage
/// recency*, not live connections — each dial still opens a fresh upstream
/// WS (tokio-tungstenite connections are single-use), but callers reuse the
/// same proxy/TLS configuration and this struct's hit/miss/eviction
/// bookkeeping mirrors what a persistent-connection-pool implementation
/// would expose.
pub struct WsDialer {
    pool: DashMap<String, PooledTransport>,
    capacity: usize,
    idle_ttl: Duration,
    metrics: crate::metrics_facade_dialer::DialerMetricsHandle,
}

impl Default for WsDialer {
    fn default() -> Self {
        Self::new()
    }
}

impl WsDialer {
    #[must_use]
    pub fn new() -> Self {
        Self::with_limits(DEFAULT_TRANSPORT_POOL_CAPACITY, Duration::from_secs(DEFAULT_TRANSPORT_IDLE_TTL_SECS))
    }

    #[must_use]
    pub fn with_limits(capacity: usize, idle_ttl: Duration) -> Self {
        Self {
            pool: DashMap::new(),
            capacity,
            idle_ttl,
            metrics: crate::metrics_facade_dialer::DialerMetricsHandle::new(),
        }
    }

    fn normalize_proxy_key(proxy_url: Option<&str>) -> String {
        proxy_url.map_or_else(|| "__default__".to_string(), str::to_string)
    }

    fn touch(&self, key: &str) {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos() as u64;

        if let Some(entry) = self.pool.get(key) {
            self.metrics.record_cache_hit();
            entry.last_used_unix_nanos.store(now, Ordering::Relaxed);
            return;
        }

        self.metrics.record_cache_miss();
        if self.pool.len() >= self.capacity {
            self.evict_lru();
        }
        self.pool.insert(
            key.to_string(),
            PooledTransport {
                last_used_unix_nanos: AtomicU64::new(now),
            },
        );
    }

    fn evict_lru(&self) {
        let victim = self
            .pool
            .iter()
            .min_by_key(|e| e.last_used_unix_nanos.load(Ordering::Relaxed))
            .map(|e| e.key().clone());
        if let Some(key) = victim {
            self.pool.remove(&key);
            self.metrics.record_eviction();
            debug!(proxy_key = key, "evicted idle transport pool entry");
        }
    }

    /// Drops pool entries idle past `idle_ttl`. Intended to run on a
    /// background tick; safe to call from a test with no timer at all.
    pub fn sweep_idle(&self) {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos() as u64;
        let ttl_nanos = self.idle_ttl.as_nanos() as u64;
        let expired: Vec<String> = self
            .pool
            .iter()
            .filter(|e| now.saturating_sub(e.last_used_unix_nanos.load(Ordering::Relaxed)) > ttl_nanos)
            .map(|e| e.key().clone())
            .collect();
        for key in expired {
            self.pool.remove(&key);
        }
    }

    #[must_use]
    pub fn snapshot(&self) -> crate::metrics_facade_dialer::DialerMetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Dials `ws_url`, attaching `headers`. `proxy_url` only affects pool
    /// bookkeeping here — per-proxy transport selection at the TCP layer is
    /// the embedding binary's concern; this core tracks reuse, not sockets.
    pub async fn dial(
        &self,
        ws_url: &str,
        headers: &[(String, String)],
        proxy_url: Option<&str>,
    ) -> Result<UpstreamConnection, DialError> {
        self.touch(&Self::normalize_proxy_key(proxy_url));

        let mut request = ws_url
            .into_client_request()
            .map_err(|err| DialError::InvalidRequest(err.to_string()))?;
        for (name, value) in headers {
            if let (Ok(name), Ok(value)) = (
                tokio_tungstenite::tungstenite::http::HeaderName::try_from(name.as_str()),
                tokio_tungstenite::tungstenite::http::HeaderValue::try_from(value.as_str()),
            ) {
                request.headers_mut().insert(name, value);
            }
        }

        let config = WebSocketConfig::default().max_frame_size(Some(MIN_WS_FRAME_SIZE_BYTES));

        match connect_async_with_config(request, Some(config), false).await {
            Ok((stream, response)) => {
                debug!(ws_url, status = %response.status(), "dialed upstream ws");
                Ok(stream)
            },
            Err(tokio_tungstenite::tungstenite::Error::Http(response)) => {
                self.metrics.record_dial_error();
                let status = Some(response.status().as_u16());
                let response_headers = response
                    .headers()
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_str().unwrap_or_default().to_string()))
                    .collect();
                warn!(ws_url, ?status, "upstream dial rejected");
                Err(DialError::Failed {
                    status,
                    reason: "upstream returned a non-101 response".into(),
                    response_headers,
                })
            },
            Err(err) => {
                self.metrics.record_dial_error();
                warn!(ws_url, error = %err, "upstream dial failed");
                Err(DialError::Failed {
                    status: None,
                    reason: err.to_string(),
                    response_headers: Vec::new(),
                })
            },
        }
    }

    /// Idempotent close: best-effort normal-closure frame, then drop.
    pub async fn close(conn: &mut UpstreamConnection) {
        use futures::SinkExt;

        let _ = conn
            .send(tokio_tungstenite::tungstenite::Message::Close(Some(CloseFrame {
                code: CloseCode::Normal,
                reason: "done".into(),
            })))
            .await;
        let _ = conn.close(None).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_touch_on_a_proxy_key_is_a_miss_then_a_hit() {
        let dialer = WsDialer::new();
        dialer.touch("proxy-a");
        assert_eq!(dialer.snapshot().cache_misses_total, 1);
        dialer.touch("proxy-a");
        assert_eq!(dialer.snapshot().cache_hits_total, 1);
    }

    #[test]
    fn overflow_evicts_the_least_recently_touched_entry() {
        let dialer = WsDialer::with_limits(2, Duration::from_secs(900));
        dialer.touch("a");
        std::thread::sleep(Duration::from_millis(2));
        dialer.touch("b");
        std::thread::sleep(Duration::from_millis(2));
        dialer.touch("c");
        assert_eq!(dialer.pool.len(), 2);
        assert!(!dialer.pool.contains_key("a"));
        assert_eq!(dialer.snapshot().pool_evictions_total, 1);
    }

    #[test]
    fn default_proxy_key_is_used_when_none_given() {
        let dialer = WsDialer::new();
        dialer.touch(&WsDialer::normalize_proxy_key(None));
        assert!(dialer.pool.contains_key("__default__"));
    }
}
