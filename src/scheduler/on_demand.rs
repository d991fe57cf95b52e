use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use crate::account::{Account, AccountPool};
use crate::health::HealthTracker;

use super::{Scheduler, SelectOutcome};

struct ActiveRequest {
    email: String,
    was_disabled: bool,
}

/// Borrows a disabled account for the duration of one request instead of
/// requiring every pool member to stay `enabled`. Refcounted per email so
/// two in-flight requests against the same borrowed account don't race to
/// re-disable it out from under each other.
pub struct OnDemandScheduler {
    pool: Arc<AccountPool>,
    health: Arc<HealthTracker>,
    global_quota_threshold: f64,
    active_requests: RwLock<HashMap<String, ActiveRequest>>,
    borrow_refcount: RwLock<HashMap<String, u32>>,
}

impl OnDemandScheduler {
    pub fn new(pool: Arc<AccountPool>, health: Arc<HealthTracker>, global_quota_threshold: f64) -> Self {
        Self {
            pool,
            health,
            global_quota_threshold,
            active_requests: RwLock::new(HashMap::new()),
            borrow_refcount: RwLock::new(HashMap::new()),
        }
    }

    /// Same eligibility predicate as `HealthTracker::usable`, minus the
    /// `enabled` check — a disabled account can still be borrowed.
    fn eligible_ignoring_enabled(account: &Account, model_id: &str, global_threshold: f64, now: chrono::DateTime<Utc>) -> bool {
        if account.is_invalid {
            return false;
        }
        if account.is_auto_disabled(now) {
            return false;
        }
        if account.is_rate_limited(model_id, now) {
            return false;
        }
        let eff_threshold = account.effective_threshold(model_id, global_threshold);
        if eff_threshold > 0.0 {
            if let Some(fraction) = account.remaining_fraction(model_id) {
                if fraction < eff_threshold {
                    return false;
                }
            }
        }
        true
    }
}

#[async_trait]
impl Scheduler for OnDemandScheduler {
    async fn select_account(&self, model_id: &str, request_id: &str) -> SelectOutcome {
        let accounts = self.pool.snapshot(model_id).await;
        if accounts.is_empty() {
            return SelectOutcome::Exhausted;
        }
        let n = accounts.len();
        let now = Utc::now();
        let start = (self.pool.active_index().await + 1) % n;

        let mut chosen = None;
        for offset in 0..n {
            let idx = (start + offset) % n;
            if Self::eligible_ignoring_enabled(&accounts[idx], model_id, self.global_quota_threshold, now) {
                chosen = Some(idx);
                break;
            }
        }

        let Some(idx) = chosen else {
            return SelectOutcome::Exhausted;
        };
        self.pool.set_active_index(idx).await;
        let account = accounts[idx].clone();
        let was_disabled = !account.enabled;

        if was_disabled {
            if let Err(err) = self
                .pool
                .with_account_mut(&account.email, |a| a.enabled = true)
                .await
            {
                tracing::warn!(email = %account.email, error = %err, "failed to borrow disabled account");
                return SelectOutcome::Exhausted;
            }
        }

        *self
            .borrow_refcount
            .write()
            .await
            .entry(account.email.clone())
            .or_insert(0) += 1;
        self.active_requests.write().await.insert(
            request_id.to_string(),
            ActiveRequest {
                email: account.email.clone(),
                was_disabled,
            },
        );

        SelectOutcome::Selected(account)
    }

    async fn on_success(&self, _email: &str, _model_id: &str) {}
    async fn on_rate_limit(&self, _email: &str, _model_id: &str) {}
    async fn on_failure(&self, _email: &str, _model_id: &str) {}

    async fn release(&self, request_id: &str) {
        let entry = self.active_requests.write().await.remove(request_id);
        let Some(entry) = entry else {
            return;
        };
        if !entry.was_disabled {
            return;
        }

        let mut refcounts = self.borrow_refcount.write().await;
        let remaining = refcounts
            .get_mut(&entry.email)
            .map(|count| {
                *count = count.saturating_sub(1);
                *count
            })
            .unwrap_or(0);
        if remaining > 0 {
            return;
        }
        refcounts.remove(&entry.email);
        drop(refcounts);

        if let Err(err) = self
            .pool
            .with_account_mut(&entry.email, |a| a.enabled = false)
            .await
        {
            tracing::warn!(email = %entry.email, error = %err, "failed to re-disable borrowed account");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::{AccountSource, Quota, Subscription};
    use crate::health::HealthPolicy;
    use std::collections::HashMap as Map;
    use std::time::Duration;

    fn account(email: &str, enabled: bool) -> Account {
        Account {
            email: email.to_string(),
            source: AccountSource::Oauth,
            credential_ref: "cred".into(),
            project_id: None,
            enabled,
            is_invalid: false,
            invalid_reason: None,
            verify_url: None,
            added_at: None,
            last_used: None,
            model_rate_limits: Map::new(),
            model_health: Map::new(),
            auto_disabled_until: None,
            quota: Quota::default(),
            quota_threshold: None,
            model_quota_thresholds: Map::new(),
            subscription: Subscription::default(),
        }
    }

    fn policy() -> HealthPolicy {
        HealthPolicy {
            consecutive_failure_threshold: 3,
            auto_recovery: Duration::from_secs(60),
        }
    }

    #[tokio::test]
    async fn borrows_disabled_account_and_restores_on_release() {
        let dir = tempfile::tempdir().unwrap();
        let pool = Arc::new(AccountPool::load(dir.path().join("accounts.json")).await.unwrap());
        pool.add_account(account("a@example.com", false)).await.unwrap();
        let health = Arc::new(HealthTracker::new(pool.clone(), policy()));
        let scheduler = OnDemandScheduler::new(pool.clone(), health, 0.0);

        let selected = match scheduler.select_account("claude-sonnet-4-5", "req1").await {
            SelectOutcome::Selected(account) => account,
            _ => panic!("expected a selection"),
        };
        assert!(selected.enabled);

        let snapshot = pool.snapshot("claude-sonnet-4-5").await;
        assert!(snapshot[0].enabled);

        scheduler.release("req1").await;
        let snapshot = pool.snapshot("claude-sonnet-4-5").await;
        assert!(!snapshot[0].enabled);
    }

    #[tokio::test]
    async fn keeps_account_enabled_while_another_request_holds_it() {
        let dir = tempfile::tempdir().unwrap();
        let pool = Arc::new(AccountPool::load(dir.path().join("accounts.json")).await.unwrap());
        pool.add_account(account("a@example.com", false)).await.unwrap();
        let health = Arc::new(HealthTracker::new(pool.clone(), policy()));
        let scheduler = OnDemandScheduler::new(pool.clone(), health, 0.0);

        scheduler.select_account("claude-sonnet-4-5", "req1").await;
        scheduler.select_account("claude-sonnet-4-5", "req2").await;

        scheduler.release("req1").await;
        let snapshot = pool.snapshot("claude-sonnet-4-5").await;
        assert!(snapshot[0].enabled, "still held by req2");

        scheduler.release("req2").await;
        let snapshot = pool.snapshot("claude-sonnet-4-5").await;
        assert!(!snapshot[0].enabled);
    }
}
