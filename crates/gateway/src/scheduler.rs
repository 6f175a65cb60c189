//! Account scheduler (C5): the three-layer `Select` pipeline.
//!
//! Layer 1 tries the `previous_response_id` sticky binding, layer 2 the
//! `session_hash` sticky binding, layer 3 falls back to scored load
//! balancing across all schedulable accounts. First layer to produce an
//! acquired account wins.

use std::{sync::Arc, time::Instant};

use relay_config::{OpenAiWsConfig, SchedulerScoreWeights};
use relay_contracts::{Contracts, SlotAcquisition};
use relay_protocol::{
    Account, GatewayError, ScheduleDecision, ScheduleLayer, ScheduleRequest, WaitPlan,
};

use crate::{metrics_facade::SchedulerMetricsHandle, stats::RuntimeStats, sticky::StickyStore};

/// Outcome of a `Select` call: either an acquired account ready to use, or a
/// wait plan the caller must block on (via
/// [`crate::concurrency::LocalConcurrencyBroker::await_slot`]) before
/// retrying.
#[derive(Debug)]
pub enum SelectOutcome {
    Acquired {
        account: Account,
        decision: ScheduleDecision,
    },
    Wait {
        plan: WaitPlan,
        decision: ScheduleDecision,
    },
}

pub struct Scheduler {
    contracts: Arc<Contracts>,
    sticky: Arc<StickyStore>,
    stats: Arc<RuntimeStats>,
    metrics: SchedulerMetricsHandle,
}

impl Scheduler {
    #[must_use]
    pub fn new(
        contracts: Arc<Contracts>,
        sticky: Arc<StickyStore>,
        stats: Arc<RuntimeStats>,
        metrics: SchedulerMetricsHandle,
    ) -> Self {
        Self {
            contracts,
            sticky,
            stats,
            metrics,
        }
    }

    pub async fn select(
        &self,
        req: &ScheduleRequest,
        config: &OpenAiWsConfig,
    ) -> relay_protocol::Result<SelectOutcome> {
        let started = Instant::now();

        if let Some(outcome) = self.try_layer1(req).await? {
            let decision = self.record(
                &outcome,
                crate::metrics_facade::RecordOutcome::StickyPrevious,
                started,
                req.session_hash.clone(),
                0,
                1,
                0.0,
                true,
                false,
            );
            return Ok(self.finish(outcome, decision));
        }

        if let Some(outcome) = self.try_layer2(req, config).await? {
            let decision = self.record(
                &outcome,
                crate::metrics_facade::RecordOutcome::StickySession,
                started,
                req.session_hash.clone(),
                0,
                1,
                0.0,
                false,
                true,
            );
            return Ok(self.finish(outcome, decision));
        }

        let (outcome, candidate_count, top_k, load_skew) = self.layer3(req, config).await?;
        let decision = self.record(
            &outcome,
            crate::metrics_facade::RecordOutcome::LoadBalance,
            started,
            req.session_hash.clone(),
            candidate_count,
            top_k,
            load_skew,
            false,
            false,
        );
        Ok(self.finish(outcome, decision))
    }

    fn finish(&self, outcome: Layer3Inner, decision: ScheduleDecision) -> SelectOutcome {
        match outcome {
            Layer3Inner::Acquired(account) => SelectOutcome::Acquired { account, decision },
            Layer3Inner::Wait(plan) => SelectOutcome::Wait { plan, decision },
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn record(
        &self,
        outcome: &Layer3Inner,
        kind: crate::metrics_facade::RecordOutcome,
        started: Instant,
        _session_hash: String,
        candidate_count: usize,
        top_k: usize,
        load_skew: f64,
        sticky_previous_hit: bool,
        sticky_session_hit: bool,
    ) -> ScheduleDecision {
        let latency_ms = started.elapsed().as_millis() as u64;
        let layer = match kind {
            crate::metrics_facade::RecordOutcome::StickyPrevious => ScheduleLayer::PreviousResponseId,
            crate::metrics_facade::RecordOutcome::StickySession => ScheduleLayer::SessionHash,
            crate::metrics_facade::RecordOutcome::LoadBalance => ScheduleLayer::LoadBalance,
        };
        self.metrics.record(kind, latency_ms, load_skew);

        let (selected_account_id, selected_account_type) = match outcome {
            Layer3Inner::Acquired(account) => (account.id.clone(), account.platform),
            Layer3Inner::Wait(plan) => (plan.account_id.clone(), relay_protocol::Platform::OpenAi),
        };

        ScheduleDecision {
            layer,
            sticky_previous_hit,
            sticky_session_hit,
            candidate_count,
            top_k,
            latency_ms,
            load_skew,
            selected_account_id,
            selected_account_type,
        }
    }

    // ── Layer 1: previous_response_id ───────────────────────────────────

    async fn try_layer1(&self, req: &ScheduleRequest) -> relay_protocol::Result<Option<Layer3Inner>> {
        if req.previous_response_id.trim().is_empty() {
            return Ok(None);
        }

        let Some(account_id) = self
            .sticky
            .get_response_account(req.group_id.as_deref(), &req.previous_response_id)
            .await
        else {
            return Ok(None);
        };

        if req.excluded_ids.iter().any(|id| id == &account_id) {
            return Ok(None);
        }

        let Some(account) = self.load_account(&account_id).await? else {
            return Ok(None);
        };
        if !account.is_usable() || !account.supports_model(&req.requested_model) {
            return Ok(None);
        }

        match self
            .contracts
            .concurrency
            .try_acquire_account_slot(&account.id, account.concurrency)
            .await
            .map_err(service_err)?
        {
            SlotAcquisition::Acquired => {
                if !req.session_hash.trim().is_empty() {
                    self.sticky.bind_session_account(
                        req.group_id.as_deref(),
                        &req.session_hash,
                        &account.id,
                        std::time::Duration::from_secs(3600),
                    );
                }
                Ok(Some(Layer3Inner::Acquired(account)))
            },
            SlotAcquisition::Unavailable => Ok(None),
        }
    }

    // ── Layer 2: session_hash ───────────────────────────────────────────

    async fn try_layer2(
        &self,
        req: &ScheduleRequest,
        config: &OpenAiWsConfig,
    ) -> relay_protocol::Result<Option<Layer3Inner>> {
        if req.session_hash.trim().is_empty() {
            return Ok(None);
        }

        let Some(account_id) = self
            .sticky
            .get_session_account(req.group_id.as_deref(), &req.session_hash)
        else {
            return Ok(None);
        };

        let loaded = self.load_account(&account_id).await?;
        let stale = match &loaded {
            None => true,
            Some(account) => !account.is_usable() || !account.supports_model(&req.requested_model),
        };
        if stale {
            self.sticky.delete_session_account(req.group_id.as_deref(), &req.session_hash);
            return Ok(None);
        }
        let account = loaded.expect("checked above");

        match self
            .contracts
            .concurrency
            .try_acquire_account_slot(&account.id, account.concurrency)
            .await
            .map_err(service_err)?
        {
            SlotAcquisition::Acquired => {
                self.sticky.refresh_session_account_ttl(
                    req.group_id.as_deref(),
                    &req.session_hash,
                    std::time::Duration::from_secs(config.sticky_session_ttl_seconds),
                );
                Ok(Some(Layer3Inner::Acquired(account)))
            },
            SlotAcquisition::Unavailable => {
                let waiting_count = self
                    .contracts
                    .concurrency
                    .get_account_waiting_count(&account.id)
                    .await
                    .map_err(service_err)?;
                if waiting_count < config.sticky_session_max_waiting {
                    Ok(Some(Layer3Inner::Wait(WaitPlan {
                        account_id: account.id,
                        max_concurrency: account.concurrency,
                        timeout: std::time::Duration::from_secs(config.sticky_session_wait_timeout_seconds),
                        max_waiting: config.sticky_session_max_waiting,
                    })))
                } else {
                    Ok(None)
                }
            },
        }
    }

    // ── Layer 3: load balance ────────────────────────────────────────────

    async fn layer3(
        &self,
        req: &ScheduleRequest,
        config: &OpenAiWsConfig,
    ) -> relay_protocol::Result<(Layer3Inner, usize, usize, f64)> {
        let all = self
            .contracts
            .accounts
            .list_schedulable(req.group_id.as_deref())
            .await
            .map_err(service_err)?;

        let candidates: Vec<Account> = all
            .into_iter()
            .filter(|a| !req.excluded_ids.iter().any(|id| id == &a.id))
            .filter(Account::is_usable)
            .filter(|a| a.platform.is_openai_family())
            .filter(|a| a.supports_model(&req.requested_model))
            .collect();

        if candidates.is_empty() {
            self.metrics.record_no_available_account();
            return Err(GatewayError::NoAvailableAccount {
                model: req.requested_model.clone(),
            });
        }

        let ids: Vec<String> = candidates.iter().map(|a| a.id.clone()).collect();
        let loads = self
            .contracts
            .concurrency
            .get_accounts_load_batch(&ids)
            .await
            .map_err(service_err)?;
        let load_by_id: std::collections::HashMap<String, relay_protocol::AccountLoadInfo> = loads
            .into_iter()
            .map(|l| (l.account_id.clone(), l))
            .collect();

        let load_skew = population_stddev(
            &candidates
                .iter()
                .map(|a| load_by_id.get(&a.id).map_or(0.0, |l| l.load_rate))
                .collect::<Vec<_>>(),
        );

        let mut scored = score_candidates(
            &candidates,
            &load_by_id,
            &self.stats,
            &config.scheduler_score_weights,
            config.fallback_max_waiting,
        );
        scored.sort_by(tie_break);

        let top_k = config.lb_top_k.clamp(1, scored.len());
        for scored_candidate in &scored[..top_k] {
            let account = scored_candidate.account.clone();
            match self
                .contracts
                .concurrency
                .try_acquire_account_slot(&account.id, account.concurrency)
                .await
                .map_err(service_err)?
            {
                SlotAcquisition::Acquired => {
                    if !req.session_hash.trim().is_empty() {
                        self.sticky.bind_session_account(
                            req.group_id.as_deref(),
                            &req.session_hash,
                            &account.id,
                            std::time::Duration::from_secs(config.sticky_session_ttl_seconds),
                        );
                    }
                    return Ok((Layer3Inner::Acquired(account), candidates.len(), top_k, load_skew));
                },
                SlotAcquisition::Unavailable => {},
            }
        }

        let top1 = scored[0].account.clone();
        let plan = WaitPlan {
            account_id: top1.id,
            max_concurrency: top1.concurrency,
            timeout: std::time::Duration::from_secs(config.fallback_wait_timeout_seconds),
            max_waiting: config.fallback_max_waiting,
        };
        Ok((Layer3Inner::Wait(plan), candidates.len(), top_k, load_skew))
    }

    async fn load_account(&self, account_id: &str) -> relay_protocol::Result<Option<Account>> {
        self.contracts.accounts.get(account_id).await.map_err(service_err)
    }
}

enum Layer3Inner {
    Acquired(Account),
    Wait(WaitPlan),
}

fn service_err(err: relay_contracts::ServiceError) -> GatewayError {
    GatewayError::UpstreamRead {
        account_id: String::new(),
        reason: err.to_string(),
    }
}

struct ScoredCandidate {
    account: Account,
    score: f64,
    priority: i32,
    load_rate: f64,
    waiting_count: u32,
}

fn score_candidates(
    candidates: &[Account],
    load_by_id: &std::collections::HashMap<String, relay_protocol::AccountLoadInfo>,
    stats: &RuntimeStats,
    weights: &SchedulerScoreWeights,
    max_waiting: u32,
) -> Vec<ScoredCandidate> {
    let priorities: Vec<i32> = candidates.iter().map(|a| a.priority).collect();
    let pmin = priorities.iter().copied().min().unwrap_or(0);
    let pmax = priorities.iter().copied().max().unwrap_or(0);

    let ttft_samples: Vec<f64> = candidates
        .iter()
        .filter_map(|a| {
            let s = stats.snapshot(&a.id);
            s.has_ttft.then_some(s.ttft_ewma_ms)
        })
        .collect();
    let ttft_min = ttft_samples.iter().copied().fold(f64::INFINITY, f64::min);
    let ttft_max = ttft_samples.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let ttft_span = if ttft_samples.len() >= 2 { ttft_max - ttft_min } else { 0.0 };

    candidates
        .iter()
        .map(|account| {
            let load = load_by_id.get(&account.id).cloned().unwrap_or(relay_protocol::AccountLoadInfo {
                account_id: account.id.clone(),
                load_rate: 0.0,
                waiting_count: 0,
            });
            let stat = stats.snapshot(&account.id);

            let priority_factor = if pmax == pmin {
                1.0
            } else {
                1.0 - f64::from(account.priority - pmin) / f64::from(pmax - pmin)
            };
            let load_factor = 1.0 - clamp01(load.load_rate / 100.0);
            let queue_factor = 1.0 - clamp01(f64::from(load.waiting_count) / f64::from(max_waiting.max(1)));
            let error_factor = 1.0 - stat.error_rate_ewma;
            let ttft_factor = if stat.has_ttft && ttft_span > 0.0 {
                1.0 - clamp01((stat.ttft_ewma_ms - ttft_min) / ttft_span)
            } else {
                0.5
            };

            let score = weights.priority * priority_factor
                + weights.load * load_factor
                + weights.queue * queue_factor
                + weights.error_rate * error_factor
                + weights.ttft * ttft_factor;

            ScoredCandidate {
                account: account.clone(),
                score,
                priority: account.priority,
                load_rate: load.load_rate,
                waiting_count: load.waiting_count,
            }
        })
        .collect()
}

fn clamp01(v: f64) -> f64 {
    v.clamp(0.0, 1.0)
}

fn tie_break(a: &ScoredCandidate, b: &ScoredCandidate) -> std::cmp::Ordering {
    b.score
        .partial_cmp(&a.score)
        .unwrap_or(std::cmp::Ordering::Equal)
        .then_with(|| a.priority.cmp(&b.priority))
        .then_with(|| a.load_rate.partial_cmp(&b.load_rate).unwrap_or(std::cmp::Ordering::Equal))
        .then_with(|| a.waiting_count.cmp(&b.waiting_count))
        .then_with(|| a.account.id.cmp(&b.account.id))
}

fn population_stddev(values: &[f64]) -> f64 {
    if values.len() <= 1 {
        return 0.0;
    }
    let mean = values.iter().sum::<f64>() / values.len() as f64;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / values.len() as f64;
    variance.sqrt()
}

#[cfg(test)]
mod tests {
    use relay_contracts::{AccountRepository, ConcurrencyService, NoopUpstreamOAuthClient, NoopGroupRepository, NoopSubscriptionRepository, NoopUserRepository};
    use relay_protocol::{AccountStatus, AuthType, Credential, Platform};
    use secrecy::Secret;

    use super::*;
    use crate::{concurrency::LocalConcurrencyBroker, metrics_facade::SchedulerMetricsHandle};

    fn account(id: &str, priority: i32, concurrency: u32) -> Account {
        Account {
            id: id.into(),
            name: id.into(),
            platform: Platform::OpenAi,
            auth_type: AuthType::ApiKey,
            priority,
            concurrency,
            schedulable: true,
            status: AccountStatus::Active,
            credential: Credential::ApiKey {
                key: Secret::new("sk-test".into()),
            },
            extra: serde_json::Map::new(),
            models: Vec::new(),
        }
    }

    struct FixedAccountRepository(Vec<Account>);

    #[async_trait::async_trait]
    impl AccountRepository for FixedAccountRepository {
        async fn list_schedulable(&self, _group_id: Option<&str>) -> relay_contracts::ServiceResult<Vec<Account>> {
            Ok(self.0.clone())
        }

        async fn get(&self, account_id: &str) -> relay_contracts::ServiceResult<Option<Account>> {
            Ok(self.0.iter().find(|a| a.id == account_id).cloned())
        }

        async fn mark_state(
            &self,
            _account_id: &str,
            _schedulable: bool,
            _status: AccountStatus,
        ) -> relay_contracts::ServiceResult<()> {
            Ok(())
        }
    }

    fn scheduler_with(accounts: Vec<Account>) -> (Scheduler, Arc<LocalConcurrencyBroker>) {
        let broker = Arc::new(LocalConcurrencyBroker::new());
        let contracts = Arc::new(Contracts {
            accounts: Arc::new(FixedAccountRepository(accounts)),
            users: Arc::new(NoopUserRepository),
            groups: Arc::new(NoopGroupRepository),
            subscriptions: Arc::new(NoopSubscriptionRepository),
            cache: Arc::new(relay_contracts::NoopGatewayCache),
            concurrency: broker.clone(),
            oauth: Arc::new(NoopUpstreamOAuthClient),
        });
        let sticky = Arc::new(StickyStore::new(Arc::new(relay_contracts::NoopGatewayCache)));
        let stats = Arc::new(RuntimeStats::new());
        let scheduler = Scheduler::new(contracts, sticky, stats, SchedulerMetricsHandle::new_for_test());
        (scheduler, broker)
    }

    #[tokio::test]
    async fn load_balance_picks_the_only_candidate() {
        let (scheduler, _broker) = scheduler_with(vec![account("a1", 0, 4)]);
        let req = ScheduleRequest {
            requested_model: "gpt-5".into(),
            ..Default::default()
        };
        let config = OpenAiWsConfig::default();
        let outcome = scheduler.select(&req, &config).await.unwrap();
        match outcome {
            SelectOutcome::Acquired { account, decision } => {
                assert_eq!(account.id, "a1");
                assert_eq!(decision.layer, ScheduleLayer::LoadBalance);
            },
            SelectOutcome::Wait { .. } => panic!("expected an immediate acquisition"),
        }
    }

    #[tokio::test]
    async fn no_candidates_is_no_available_account() {
        let (scheduler, _broker) = scheduler_with(vec![]);
        let req = ScheduleRequest {
            requested_model: "gpt-5".into(),
            ..Default::default()
        };
        let config = OpenAiWsConfig::default();
        let err = scheduler.select(&req, &config).await.unwrap_err();
        assert!(matches!(err, GatewayError::NoAvailableAccount { .. }));
    }

    #[tokio::test]
    async fn previous_response_sticky_binding_wins_over_load_balance() {
        let (scheduler, broker) = scheduler_with(vec![account("a1", 0, 4), account("a2", 0, 4)]);
        scheduler
            .sticky
            .bind_response_account(None, "resp_1", "a2", std::time::Duration::from_secs(60))
            .await
            .unwrap();
        let req = ScheduleRequest {
            previous_response_id: "resp_1".into(),
            requested_model: "gpt-5".into(),
            ..Default::default()
        };
        let config = OpenAiWsConfig::default();
        let outcome = scheduler.select(&req, &config).await.unwrap();
        match outcome {
            SelectOutcome::Acquired { account, decision } => {
                assert_eq!(account.id, "a2");
                assert_eq!(decision.layer, ScheduleLayer::PreviousResponseId);
            },
            SelectOutcome::Wait { .. } => panic!("expected an immediate acquisition"),
        }
        broker.release_account_slot("a2").await.unwrap();
    }

    #[tokio::test]
    async fn load_balance_returns_wait_plan_when_all_candidates_are_full() {
        let (scheduler, broker) = scheduler_with(vec![account("a1", 0, 1)]);
        broker.try_acquire_account_slot("a1", 1).await.unwrap();
        let req = ScheduleRequest {
            requested_model: "gpt-5".into(),
            ..Default::default()
        };
        let config = OpenAiWsConfig::default();
        let outcome = scheduler.select(&req, &config).await.unwrap();
        match outcome {
            SelectOutcome::Wait { plan, .. } => assert_eq!(plan.account_id, "a1"),
            SelectOutcome::Acquired { .. } => panic!("expected a wait plan"),
        }
    }
}
