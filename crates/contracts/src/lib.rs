//! Trait interfaces for the services this core consumes but does not own.
//!
//! Each trait has a `Noop` implementation so the gateway can run standalone
//! (e.g. in tests) before the real repositories/cache/concurrency backend are
//! wired in.

use std::time::Duration;

use async_trait::async_trait;
use relay_protocol::{Account, AccountLoadInfo};
use serde_json::Value;

/// Error type returned by consumed-service methods.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("{message}")]
    Message { message: String },
    #[error("{0}")]
    Serde(#[from] serde_json::Error),
}

impl ServiceError {
    #[must_use]
    pub fn message(message: impl std::fmt::Display) -> Self {
        Self::Message {
            message: message.to_string(),
        }
    }
}

impl From<String> for ServiceError {
    fn from(value: String) -> Self {
        Self::message(value)
    }
}

impl From<&str> for ServiceError {
    fn from(value: &str) -> Self {
        Self::message(value)
    }
}

pub type ServiceResult<T> = Result<T, ServiceError>;

// ── Account repository ──────────────────────────────────────────────────────

#[async_trait]
pub trait AccountRepository: Send + Sync {
    /// List schedulable accounts in a group (or the default group when `None`).
    async fn list_schedulable(&self, group_id: Option<&str>) -> ServiceResult<Vec<Account>>;
    async fn get(&self, account_id: &str) -> ServiceResult<Option<Account>>;
    /// Persist a status/schedulability change (e.g. after a hard upstream
    /// failure marks an account suspended).
    async fn mark_state(
        &self,
        account_id: &str,
        schedulable: bool,
        status: relay_protocol::AccountStatus,
    ) -> ServiceResult<()>;
}

pub struct NoopAccountRepository;

#[async_trait]
impl AccountRepository for NoopAccountRepository {
    async fn list_schedulable(&self, _group_id: Option<&str>) -> ServiceResult<Vec<Account>> {
        Ok(Vec::new())
    }

    async fn get(&self, _account_id: &str) -> ServiceResult<Option<Account>> {
        Ok(None)
    }

    async fn mark_state(
        &self,
        _account_id: &str,
        _schedulable: bool,
        _status: relay_protocol::AccountStatus,
    ) -> ServiceResult<()> {
        Ok(())
    }
}

// ── User / group / subscription (billing context only) ─────────────────────

#[async_trait]
pub trait UserRepository: Send + Sync {
    async fn get(&self, user_id: &str) -> ServiceResult<Option<Value>>;
}

pub struct NoopUserRepository;

#[async_trait]
impl UserRepository for NoopUserRepository {
    async fn get(&self, _user_id: &str) -> ServiceResult<Option<Value>> {
        Ok(None)
    }
}

#[async_trait]
pub trait GroupRepository: Send + Sync {
    async fn get(&self, group_id: &str) -> ServiceResult<Option<Value>>;
}

pub struct NoopGroupRepository;

#[async_trait]
impl GroupRepository for NoopGroupRepository {
    async fn get(&self, _group_id: &str) -> ServiceResult<Option<Value>> {
        Ok(None)
    }
}

#[async_trait]
pub trait SubscriptionRepository: Send + Sync {
    async fn get_for_user(&self, user_id: &str) -> ServiceResult<Option<Value>>;
}

pub struct NoopSubscriptionRepository;

#[async_trait]
impl SubscriptionRepository for NoopSubscriptionRepository {
    async fn get_for_user(&self, _user_id: &str) -> ServiceResult<Option<Value>> {
        Ok(None)
    }
}

// ── Gateway cache (C1 shared-cache backend) ─────────────────────────────────

/// The shared (cross-process) half of the sticky `response -> account`
/// binding. The gateway's own in-process map is layered on top of this.
#[async_trait]
pub trait GatewayCache: Send + Sync {
    async fn set_session_account_id(
        &self,
        group_id: Option<&str>,
        key: &str,
        account_id: &str,
        ttl: Duration,
    ) -> ServiceResult<()>;

    async fn get_session_account_id(
        &self,
        group_id: Option<&str>,
        key: &str,
    ) -> ServiceResult<Option<String>>;

    async fn delete_session_account_id(
        &self,
        group_id: Option<&str>,
        key: &str,
    ) -> ServiceResult<()>;

    async fn refresh_session_ttl(
        &self,
        group_id: Option<&str>,
        key: &str,
        ttl: Duration,
    ) -> ServiceResult<()>;
}

pub struct NoopGatewayCache;

#[async_trait]
impl GatewayCache for NoopGatewayCache {
    async fn set_session_account_id(
        &self,
        _group_id: Option<&str>,
        _key: &str,
        _account_id: &str,
        _ttl: Duration,
    ) -> ServiceResult<()> {
        Ok(())
    }

    async fn get_session_account_id(
        &self,
        _group_id: Option<&str>,
        _key: &str,
    ) -> ServiceResult<Option<String>> {
        Ok(None)
    }

    async fn delete_session_account_id(
        &self,
        _group_id: Option<&str>,
        _key: &str,
    ) -> ServiceResult<()> {
        Ok(())
    }

    async fn refresh_session_ttl(
        &self,
        _group_id: Option<&str>,
        _key: &str,
        _ttl: Duration,
    ) -> ServiceResult<()> {
        Ok(())
    }
}

// ── Concurrency service (C3 backend) ────────────────────────────────────────

/// Outcome of a slot-acquisition attempt against the concurrency backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotAcquisition {
    Acquired,
    Unavailable,
}

#[async_trait]
pub trait ConcurrencyService: Send + Sync {
    async fn get_accounts_load_batch(
        &self,
        account_ids: &[String],
    ) -> ServiceResult<Vec<AccountLoadInfo>>;

    async fn get_account_waiting_count(&self, account_id: &str) -> ServiceResult<u32>;

    async fn try_acquire_account_slot(
        &self,
        account_id: &str,
        max_concurrency: u32,
    ) -> ServiceResult<SlotAcquisition>;

    async fn release_account_slot(&self, account_id: &str) -> ServiceResult<()>;
}

pub struct NoopConcurrencyService;

#[async_trait]
impl ConcurrencyService for NoopConcurrencyService {
    async fn get_accounts_load_batch(
        &self,
        _account_ids: &[String],
    ) -> ServiceResult<Vec<AccountLoadInfo>> {
        Ok(Vec::new())
    }

    async fn get_account_waiting_count(&self, _account_id: &str) -> ServiceResult<u32> {
        Ok(0)
    }

    async fn try_acquire_account_slot(
        &self,
        _account_id: &str,
        _max_concurrency: u32,
    ) -> ServiceResult<SlotAcquisition> {
        Ok(SlotAcquisition::Acquired)
    }

    async fn release_account_slot(&self, _account_id: &str) -> ServiceResult<()> {
        Ok(())
    }
}

// ── Upstream OAuth client ───────────────────────────────────────────────────

/// Fresh token pair returned by a refresh/exchange call.
#[derive(Debug, Clone)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_in: Option<Duration>,
}

#[async_trait]
pub trait UpstreamOAuthClient: Send + Sync {
    async fn exchange_code(&self, code: &str) -> ServiceResult<TokenPair>;

    /// The only method this core actually calls: refresh an expired
    /// credential using the account's registered OAuth client id.
    async fn refresh_token_with_client_id(
        &self,
        client_id: &str,
        refresh_token: &str,
    ) -> ServiceResult<TokenPair>;
}

pub struct NoopUpstreamOAuthClient;

#[async_trait]
impl UpstreamOAuthClient for NoopUpstreamOAuthClient {
    async fn exchange_code(&self, _code: &str) -> ServiceResult<TokenPair> {
        Err("oauth client not configured".into())
    }

    async fn refresh_token_with_client_id(
        &self,
        _client_id: &str,
        _refresh_token: &str,
    ) -> ServiceResult<TokenPair> {
        Err("oauth client not configured".into())
    }
}

// ── Contracts bundle ─────────────────────────────────────────────────────────

use std::sync::Arc;

/// Bundle of all externally-consumed service trait objects.
///
/// The gateway depends on this bundle rather than on concrete repository/cache
/// implementations, so it can run standalone (every field defaults to its
/// `Noop` impl) until the real backends are wired in by the embedding binary.
pub struct Contracts {
    pub accounts: Arc<dyn AccountRepository>,
    pub users: Arc<dyn UserRepository>,
    pub groups: Arc<dyn GroupRepository>,
    pub subscriptions: Arc<dyn SubscriptionRepository>,
    pub cache: Arc<dyn GatewayCache>,
    pub concurrency: Arc<dyn ConcurrencyService>,
    pub oauth: Arc<dyn UpstreamOAuthClient>,
}

impl Default for Contracts {
    fn default() -> Self {
        Self {
            accounts: Arc::new(NoopAccountRepository),
            users: Arc::new(NoopUserRepository),
            groups: Arc::new(NoopGroupRepository),
            subscriptions: Arc::new(NoopSubscriptionRepository),
            cache: Arc::new(NoopGatewayCache),
            concurrency: Arc::new(NoopConcurrencyService),
            oauth: Arc::new(NoopUpstreamOAuthClient),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn noop_account_repository_has_nothing_to_schedule() {
        let repo = NoopAccountRepository;
        assert!(repo.list_schedulable(None).await.unwrap().is_empty());
        assert!(repo.get("acct-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn noop_concurrency_service_always_acquires() {
        let svc = NoopConcurrencyService;
        let result = svc.try_acquire_account_slot("acct-1", 4).await.unwrap();
        assert_eq!(result, SlotAcquisition::Acquired);
    }

    #[tokio::test]
    async fn noop_oauth_client_refuses_refresh() {
        let client = NoopUpstreamOAuthClient;
        assert!(
            client
                .refresh_token_with_client_id("client", "refresh")
                .await
                .is_err()
        );
    }

    #[test]
    fn default_contracts_bundle_constructs() {
        let _bundle = Contracts::default();
    }
}
