//! Sticky state store (C1).
//!
//! Four TTL-bounded bindings: `response -> account` (mirrored in the shared
//! [`GatewayCache`] so it survives across replicas), `response -> conn`,
//! `session -> account`, `session -> conn`, and `session -> turnState`, all
//! local-only except the first.

use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use dashmap::DashMap;
use relay_contracts::GatewayCache;
use relay_protocol::{
    STICKY_CACHE_DEADLINE_MS, STICKY_MAP_CAPACITY, STICKY_SWEEP_BATCH, STICKY_SWEEP_INTERVAL_SECS,
    SessionTurnState, response_account_cache_key,
};
use tracing::{debug, warn};

struct TtlEntry<V> {
    value: V,
    expires_at: Instant,
}

/// A bounded, lazily-swept TTL map. Generic over each of C1's local
/// bindings.
pub struct TtlMap<V> {
    entries: DashMap<String, TtlEntry<V>>,
    capacity: usize,
    sweep_interval: Duration,
    sweep_batch: usize,
    anchor: Instant,
    last_sweep_nanos: AtomicU64,
}

impl<V: Clone> Default for TtlMap<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V: Clone> TtlMap<V> {
    #[must_use]
    pub fn new() -> Self {
        Self::with_limits(
            STICKY_MAP_CAPACITY,
            Duration::from_secs(STICKY_SWEEP_INTERVAL_SECS),
            STICKY_SWEEP_BATCH,
        )
    }

    #[must_use]
    pub fn with_limits(capacity: usize, sweep_interval: Duration, sweep_batch: usize) -> Self {
        Self {
            entries: DashMap::new(),
            capacity,
            sweep_interval,
            sweep_batch,
            anchor: Instant::now(),
            last_sweep_nanos: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<V> {
        self.get_at(key, Instant::now())
    }

    #[must_use]
    pub fn get_at(&self, key: &str, now: Instant) -> Option<V> {
        self.maybe_sweep(now);
        self.entries
            .get(key)
            .filter(|e| e.expires_at > now)
            .map(|e| e.value.clone())
    }

    pub fn insert(&self, key: String, value: V, ttl: Duration) {
        self.insert_at(key, value, ttl, Instant::now());
    }

    pub fn insert_at(&self, key: String, value: V, ttl: Duration, now: Instant) {
        self.maybe_sweep(now);
        if self.entries.len() >= self.capacity && !self.entries.contains_key(&key) {
            // Bounded memory over sticky precision: evict one arbitrary entry.
            if let Some(victim) = self.entries.iter().next().map(|e| e.key().clone()) {
                self.entries.remove(&victim);
            }
        }
        self.entries.insert(key, TtlEntry {
            value,
            expires_at: now + ttl,
        });
    }

    pub fn remove(&self, key: &str) {
        self.entries.remove(key);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn maybe_sweep(&self, now: Instant) {
        let now_nanos = now.duration_since(self.anchor).as_nanos() as u64;
        let last = self.last_sweep_nanos.load(Ordering::Relaxed);
        if now_nanos.saturating_sub(last) < self.sweep_interval.as_nanos() as u64 {
            return;
        }
        if self
            .last_sweep_nanos
            .compare_exchange(last, now_nanos, Ordering::Relaxed, Ordering::Relaxed)
            .is_err()
        {
            // Another thread is sweeping this tick.
            return;
        }
        let mut removed = 0usize;
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|e| e.expires_at <= now)
            .take(self.sweep_batch)
            .map(|e| e.key().clone())
            .collect();
        for key in expired {
            self.entries.remove(&key);
            removed += 1;
            if removed >= self.sweep_batch {
                break;
            }
        }
    }
}

fn local_key(group_id: Option<&str>, id: &str) -> String {
    let id = id.trim();
    match group_id {
        Some(g) if !g.is_empty() => format!("{g}:{id}"),
        _ => id.to_string(),
    }
}

fn session_key(group_id: Option<&str>, session_hash: &str) -> String {
    local_key(group_id, session_hash)
}

/// C1: the sticky state store.
pub struct StickyStore {
    response_account_local: TtlMap<String>,
    response_conn: TtlMap<String>,
    session_account: TtlMap<String>,
    session_conn: TtlMap<String>,
    session_turn_state: TtlMap<SessionTurnState>,
    cache: Arc<dyn GatewayCache>,
}

impl StickyStore {
    #[must_use]
    pub fn new(cache: Arc<dyn GatewayCache>) -> Self {
        Self {
            response_account_local: TtlMap::new(),
            response_conn: TtlMap::new(),
            session_account: TtlMap::new(),
            session_conn: TtlMap::new(),
            session_turn_state: TtlMap::new(),
            cache,
        }
    }

    // ── response -> account (shared) ────────────────────────────────────

    /// Binds `response_id -> account_id`. Writes the local mirror first,
    /// then the shared cache under the same deadline. A shared-cache write
    /// error is returned so the caller can log it without failing the turn.
    pub async fn bind_response_account(
        &self,
        group_id: Option<&str>,
        response_id: &str,
        account_id: &str,
        ttl: Duration,
    ) -> Result<(), relay_contracts::ServiceError> {
        self.response_account_local
            .insert(local_key(group_id, response_id), account_id.to_string(), ttl);

        let key = response_account_cache_key(group_id, response_id);
        match tokio::time::timeout(
            Duration::from_millis(STICKY_CACHE_DEADLINE_MS),
            self.cache.set_session_account_id(group_id, &key, account_id, ttl),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => {
                warn!(response_id, "sticky cache write timed out");
                Err(relay_contracts::ServiceError::message("sticky cache write timed out"))
            },
        }
    }

    /// Looks up `response_id -> account_id`. Local map first; on miss,
    /// falls through to the shared cache with a bounded deadline. Any cache
    /// fault degrades to `None` rather than failing the caller.
    pub async fn get_response_account(
        &self,
        group_id: Option<&str>,
        response_id: &str,
    ) -> Option<String> {
        if let Some(hit) = self.response_account_local.get(&local_key(group_id, response_id)) {
            return Some(hit);
        }

        let key = response_account_cache_key(group_id, response_id);
        match tokio::time::timeout(
            Duration::from_millis(STICKY_CACHE_DEADLINE_MS),
            self.cache.get_session_account_id(group_id, &key),
        )
        .await
        {
            Ok(Ok(Some(account_id))) => {
                debug!(response_id, account_id, "sticky cache hit on response->account");
                Some(account_id)
            },
            Ok(Ok(None)) => None,
            Ok(Err(err)) => {
                warn!(response_id, error = %err, "sticky cache read failed");
                None
            },
            Err(_) => {
                warn!(response_id, "sticky cache read timed out");
                None
            },
        }
    }

    pub async fn delete_response_account(&self, group_id: Option<&str>, response_id: &str) {
        self.response_account_local.remove(&local_key(group_id, response_id));
        let key = response_account_cache_key(group_id, response_id);
        let _ = tokio::time::timeout(
            Duration::from_millis(STICKY_CACHE_DEADLINE_MS),
            self.cache.delete_session_account_id(group_id, &key),
        )
        .await;
    }

    // ── response -> conn (local only) ───────────────────────────────────

    pub fn bind_response_conn(&self, response_id: &str, conn_id: &str, ttl: Duration) {
        self.response_conn
            .insert(response_id.trim().to_string(), conn_id.to_string(), ttl);
    }

    #[must_use]
    pub fn get_response_conn(&self, response_id: &str) -> Option<String> {
        self.response_conn.get(response_id.trim())
    }

    pub fn delete_response_conn(&self, response_id: &str) {
        self.response_conn.remove(response_id.trim());
    }

    // ── session -> account (local only) ─────────────────────────────────

    pub fn bind_session_account(
        &self,
        group_id: Option<&str>,
        session_hash: &str,
        account_id: &str,
        ttl: Duration,
    ) {
        self.session_account
            .insert(session_key(group_id, session_hash), account_id.to_string(), ttl);
    }

    #[must_use]
    pub fn get_session_account(&self, group_id: Option<&str>, session_hash: &str) -> Option<String> {
        self.session_account.get(&session_key(group_id, session_hash))
    }

    pub fn delete_session_account(&self, group_id: Option<&str>, session_hash: &str) {
        self.session_account.remove(&session_key(group_id, session_hash));
    }

    /// Refresh TTL on a successful layer-2 hit without changing the value.
    pub fn refresh_session_account_ttl(
        &self,
        group_id: Option<&str>,
        session_hash: &str,
        ttl: Duration,
    ) {
        let key = session_key(group_id, session_hash);
        if let Some(account_id) = self.session_account.get(&key) {
            self.session_account.insert(key, account_id, ttl);
        }
    }

    // ── session -> conn (local only) ────────────────────────────────────

    pub fn bind_session_conn(&self, group_id: Option<&str>, session_hash: &str, conn_id: &str, ttl: Duration) {
        self.session_conn
            .insert(session_key(group_id, session_hash), conn_id.to_string(), ttl);
    }

    #[must_use]
    pub fn get_session_conn(&self, group_id: Option<&str>, session_hash: &str) -> Option<String> {
        self.session_conn.get(&session_key(group_id, session_hash))
    }

    pub fn delete_session_conn(&self, group_id: Option<&str>, session_hash: &str) {
        self.session_conn.remove(&session_key(group_id, session_hash));
    }

    // ── session -> turnState (local only) ───────────────────────────────

    pub fn bind_session_turn_state(
        &self,
        group_id: Option<&str>,
        session_hash: &str,
        state: SessionTurnState,
        ttl: Duration,
    ) {
        self.session_turn_state
            .insert(session_key(group_id, session_hash), state, ttl);
    }

    #[must_use]
    pub fn get_session_turn_state(
        &self,
        group_id: Option<&str>,
        session_hash: &str,
    ) -> Option<SessionTurnState> {
        self.session_turn_state.get(&session_key(group_id, session_hash))
    }

    pub fn delete_session_turn_state(&self, group_id: Option<&str>, session_hash: &str) {
        self.session_turn_state.remove(&session_key(group_id, session_hash));
    }
}

#[cfg(test)]
mod tests {
    use relay_contracts::NoopGatewayCache;

    use super::*;

    fn store() -> StickyStore {
        StickyStore::new(Arc::new(NoopGatewayCache))
    }

    #[test]
    fn ttl_map_roundtrips_within_ttl() {
        let map: TtlMap<String> = TtlMap::new();
        let now = Instant::now();
        map.insert_at("k".into(), "v".into(), Duration::from_secs(10), now);
        assert_eq!(map.get_at("k", now + Duration::from_secs(5)), Some("v".to_string()));
    }

    #[test]
    fn ttl_map_expires_after_ttl() {
        let map: TtlMap<String> = TtlMap::new();
        let now = Instant::now();
        map.insert_at("k".into(), "v".into(), Duration::from_secs(10), now);
        assert_eq!(map.get_at("k", now + Duration::from_secs(11)), None);
    }

    #[test]
    fn ttl_map_evicts_on_overflow() {
        let map: TtlMap<u32> = TtlMap::with_limits(2, Duration::from_secs(60), 512);
        let now = Instant::now();
        map.insert_at("a".into(), 1, Duration::from_secs(60), now);
        map.insert_at("b".into(), 2, Duration::from_secs(60), now);
        assert_eq!(map.len(), 2);
        map.insert_at("c".into(), 3, Duration::from_secs(60), now);
        assert_eq!(map.len(), 2);
    }

    #[tokio::test]
    async fn response_account_bind_then_get_roundtrips() {
        let store = store();
        store
            .bind_response_account(None, "resp_A", "42", Duration::from_secs(3600))
            .await
            .unwrap();
        assert_eq!(store.get_response_account(None, "resp_A").await, Some("42".to_string()));
    }

    #[tokio::test]
    async fn response_account_delete_then_get_is_none() {
        let store = store();
        store
            .bind_response_account(None, "resp_A", "42", Duration::from_secs(3600))
            .await
            .unwrap();
        store.delete_response_account(None, "resp_A").await;
        assert_eq!(store.get_response_account(None, "resp_A").await, None);
    }

    #[test]
    fn session_account_refresh_preserves_value() {
        let store = store();
        store.bind_session_account(None, "S1", "17", Duration::from_secs(60));
        store.refresh_session_account_ttl(None, "S1", Duration::from_secs(120));
        assert_eq!(store.get_session_account(None, "S1"), Some("17".to_string()));
    }

    #[test]
    fn session_account_missing_refresh_is_a_no_op() {
        let store = store();
        store.refresh_session_account_ttl(None, "missing", Duration::from_secs(60));
        assert_eq!(store.get_session_account(None, "missing"), None);
    }

    #[test]
    fn group_scoping_keeps_same_session_hash_independent_per_group() {
        let store = store();
        store.bind_session_account(Some("g1"), "S1", "17", Duration::from_secs(60));
        store.bind_session_account(Some("g2"), "S1", "99", Duration::from_secs(60));
        assert_eq!(store.get_session_account(Some("g1"), "S1"), Some("17".to_string()));
        assert_eq!(store.get_session_account(Some("g2"), "S1"), Some("99".to_string()));
    }
}
