//! Concurrency broker (C3): the default in-process implementation of
//! [`ConcurrencyService`]. A counting semaphore per account, not a rate
//! limiter — it bounds in-flight turns, it does not shape request rate.

use std::sync::{
    Arc,
    atomic::{AtomicU32, Ordering},
};

use async_trait::async_trait;
use dashmap::DashMap;
use relay_contracts::{AccountLoadInfo, ConcurrencyService, ServiceResult, SlotAcquisition};
use tokio::sync::Semaphore;

struct AccountSlots {
    semaphore: Arc<Semaphore>,
    max_concurrency: u32,
    waiting: AtomicU32,
}

/// `DashMap`-backed counting semaphore per account. Created lazily on first
/// acquire with whatever `max_concurrency` the caller supplies; a later call
/// with a different `max_concurrency` for the same account resizes nothing —
/// the slot count is fixed at first use, matching a scheduler that reads an
/// account's concurrency cap once per process lifetime.
#[derive(Default)]
pub struct LocalConcurrencyBroker {
    accounts: DashMap<String, AccountSlots>,
}

impl LocalConcurrencyBroker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn slots(&self, account_id: &str, max_concurrency: u32) -> Arc<Semaphore> {
        self.accounts
            .entry(account_id.to_string())
            .or_insert_with(|| AccountSlots {
                semaphore: Arc::new(Semaphore::new(max_concurrency.max(1) as usize)),
                max_concurrency: max_concurrency.max(1),
                waiting: AtomicU32::new(0),
            })
            .semaphore
            .clone()
    }
}

#[async_trait]
impl ConcurrencyService for LocalConcurrencyBroker {
    async fn get_accounts_load_batch(
        &self,
        account_ids: &[String],
    ) -> ServiceResult<Vec<AccountLoadInfo>> {
        let mut out = Vec::with_capacity(account_ids.len());
        for account_id in account_ids {
            let (load_rate, waiting_count) = match self.accounts.get(account_id) {
                Some(slots) => {
                    let available = slots.semaphore.available_permits() as f64;
                    let total = f64::from(slots.max_concurrency);
                    let in_flight = (total - available).max(0.0);
                    let load_rate = if total > 0.0 { (in_flight / total) * 100.0 } else { 0.0 };
                    (load_rate, slots.waiting.load(Ordering::Relaxed))
                },
                None => (0.0, 0),
            };
            out.push(AccountLoadInfo {
                account_id: account_id.clone(),
                load_rate,
                waiting_count,
            });
        }
        Ok(out)
    }

    async fn get_account_waiting_count(&self, account_id: &str) -> ServiceResult<u32> {
        Ok(self
            .accounts
            .get(account_id)
            .map_or(0, |s| s.waiting.load(Ordering::Relaxed)))
    }

    async fn try_acquire_account_slot(
        &self,
        account_id: &str,
        max_concurrency: u32,
    ) -> ServiceResult<SlotAcquisition> {
        let semaphore = self.slots(account_id, max_concurrency);
        match semaphore.try_acquire_owned() {
            Ok(permit) => {
                permit.forget();
                Ok(SlotAcquisition::Acquired)
            },
            Err(_) => Ok(SlotAcquisition::Unavailable),
        }
    }

    /// Idempotent: releasing a slot for an account that isn't tracked (or
    /// has no outstanding permits taken) is a no-op, not an error, since
    /// callers may release on a best-effort cleanup path that doesn't know
    /// whether the original acquire actually succeeded.
    async fn release_account_slot(&self, account_id: &str) -> ServiceResult<()> {
        if let Some(slots) = self.accounts.get(account_id) {
            if (slots.semaphore.available_permits() as u32) < slots.max_concurrency {
                slots.semaphore.add_permits(1);
            }
        }
        Ok(())
    }
}

impl LocalConcurrencyBroker {
    /// Marks one more waiter queued behind this account's slots (used while
    /// a caller blocks on [`Self::await_slot`]). Not part of the
    /// `ConcurrencyService` contract — it's bookkeeping the in-process
    /// broker exposes so `GetAccountWaitingCount` reflects live waiters.
    pub fn mark_waiting(&self, account_id: &str, max_concurrency: u32) -> WaitingGuard<'_> {
        self.slots(account_id, max_concurrency);
        if let Some(slots) = self.accounts.get(account_id) {
            slots.waiting.fetch_add(1, Ordering::Relaxed);
        }
        WaitingGuard {
            broker: self,
            account_id: account_id.to_string(),
        }
    }

    /// Blocks up to `plan.timeout` attempting to acquire a slot for
    /// `plan.account_id`, polling on a short interval. Registers as a waiter
    /// for the duration so concurrent `Select` calls see an accurate
    /// `GetAccountWaitingCount`. This is the orchestration C8 drives when a
    /// `Select` call returns a wait plan instead of an immediate account —
    /// it is deliberately not part of the narrow `ConcurrencyService`
    /// contract, which only exposes non-blocking operations.
    pub async fn await_slot(&self, plan: &relay_protocol::WaitPlan) -> SlotAcquisition {
        const POLL_INTERVAL: std::time::Duration = std::time::Duration::from_millis(25);

        let _guard = self.mark_waiting(&plan.account_id, plan.max_concurrency);
        let deadline = tokio::time::Instant::now() + plan.timeout;
        loop {
            let semaphore = self.slots(&plan.account_id, plan.max_concurrency);
            if let Ok(permit) = semaphore.try_acquire_owned() {
                permit.forget();
                return SlotAcquisition::Acquired;
            }
            if tokio::time::Instant::now() >= deadline {
                return SlotAcquisition::Unavailable;
            }
            tokio::time::sleep(POLL_INTERVAL.min(deadline - tokio::time::Instant::now())).await;
        }
    }
}

/// Decrements the waiting counter when dropped, whether the wait succeeded,
/// timed out, or the caller disconnected.
pub struct WaitingGuard<'a> {
    broker: &'a LocalConcurrencyBroker,
    account_id: String,
}

impl Drop for WaitingGuard<'_> {
    fn drop(&mut self) {
        if let Some(slots) = self.broker.accounts.get(&self.account_id) {
            slots.waiting.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |w| Some(w.saturating_sub(1))).ok();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn first_acquire_within_limit_succeeds() {
        let broker = LocalConcurrencyBroker::new();
        let result = broker.try_acquire_account_slot("acct-1", 2).await.unwrap();
        assert_eq!(result, SlotAcquisition::Acquired);
    }

    #[tokio::test]
    async fn acquire_beyond_max_concurrency_is_unavailable() {
        let broker = LocalConcurrencyBroker::new();
        assert_eq!(
            broker.try_acquire_account_slot("acct-1", 1).await.unwrap(),
            SlotAcquisition::Acquired
        );
        assert_eq!(
            broker.try_acquire_account_slot("acct-1", 1).await.unwrap(),
            SlotAcquisition::Unavailable
        );
    }

    #[tokio::test]
    async fn release_frees_a_slot_for_reacquisition() {
        let broker = LocalConcurrencyBroker::new();
        broker.try_acquire_account_slot("acct-1", 1).await.unwrap();
        broker.release_account_slot("acct-1").await.unwrap();
        assert_eq!(
            broker.try_acquire_account_slot("acct-1", 1).await.unwrap(),
            SlotAcquisition::Acquired
        );
    }

    #[tokio::test]
    async fn release_on_unknown_account_is_a_no_op() {
        let broker = LocalConcurrencyBroker::new();
        broker.release_account_slot("ghost").await.unwrap();
    }

    #[tokio::test]
    async fn waiting_guard_increments_then_decrements_on_drop() {
        let broker = LocalConcurrencyBroker::new();
        broker.try_acquire_account_slot("acct-1", 1).await.unwrap();
        {
            let _guard = broker.mark_waiting("acct-1", 1);
            assert_eq!(broker.get_account_waiting_count("acct-1").await.unwrap(), 1);
        }
        assert_eq!(broker.get_account_waiting_count("acct-1").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn await_slot_times_out_when_never_freed() {
        let broker = LocalConcurrencyBroker::new();
        broker.try_acquire_account_slot("acct-1", 1).await.unwrap();
        let plan = relay_protocol::WaitPlan {
            account_id: "acct-1".into(),
            max_concurrency: 1,
            timeout: std::time::Duration::from_millis(60),
            max_waiting: 8,
        };
        assert_eq!(broker.await_slot(&plan).await, SlotAcquisition::Unavailable);
    }

    #[tokio::test]
    async fn await_slot_succeeds_once_a_slot_frees_up() {
        let broker = Arc::new(LocalConcurrencyBroker::new());
        broker.try_acquire_account_slot("acct-1", 1).await.unwrap();
        let releaser = broker.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            releaser.release_account_slot("acct-1").await.unwrap();
        });
        let plan = relay_protocol::WaitPlan {
            account_id: "acct-1".into(),
            max_concurrency: 1,
            timeout: std::time::Duration::from_millis(500),
            max_waiting: 8,
        };
        assert_eq!(broker.await_slot(&plan).await, SlotAcquisition::Acquired);
    }

    #[tokio::test]
    async fn load_batch_reports_in_flight_rate() {
        let broker = LocalConcurrencyBroker::new();
        broker.try_acquire_account_slot("acct-1", 4).await.unwrap();
        let batch = broker
            .get_accounts_load_batch(&["acct-1".to_string()])
            .await
            .unwrap();
        assert_eq!(batch.len(), 1);
        assert!((batch[0].load_rate - 25.0).abs() < f64::EPSILON);
    }
}
