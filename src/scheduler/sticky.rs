use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use crate::account::{Account, AccountPool};
use crate::health::HealthTracker;
use crate::models::ModelDescriptor;

use super::{Scheduler, SelectOutcome};

/// Prefers the per-family current account to maximize upstream prompt-cache
/// hit rate; only switches when the current account is ineligible.
pub struct StickyScheduler {
    pool: Arc<AccountPool>,
    health: Arc<HealthTracker>,
    global_quota_threshold: f64,
    max_wait_before_error: Duration,
}

impl StickyScheduler {
    pub fn new(pool: Arc<AccountPool>, health: Arc<HealthTracker>, global_quota_threshold: f64) -> Self {
        Self {
            pool,
            health,
            global_quota_threshold,
            max_wait_before_error: Duration::from_secs(5),
        }
    }

    pub fn with_max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait_before_error = max_wait;
        self
    }

    fn cooldown_remaining(account: &Account, model_id: &str, now: chrono::DateTime<Utc>) -> Option<Duration> {
        account.model_rate_limits.get(model_id).and_then(|r| {
            if r.is_rate_limited && r.reset_time > now {
                (r.reset_time - now).to_std().ok()
            } else {
                None
            }
        })
    }
}

#[async_trait]
impl Scheduler for StickyScheduler {
    async fn select_account(&self, model_id: &str, _request_id: &str) -> SelectOutcome {
        let accounts = self.pool.snapshot(model_id).await;
        if accounts.is_empty() {
            return SelectOutcome::Exhausted;
        }
        let now = Utc::now();
        let family = ModelDescriptor::family_of(model_id);
        let n = accounts.len();
        let current_idx = self.pool.active_index_for_family(family).await.min(n - 1);

        if HealthTracker::usable(&accounts[current_idx], model_id, self.global_quota_threshold, now) {
            return SelectOutcome::Selected(accounts[current_idx].clone());
        }

        // Scan the rest for the largest remaining_fraction, tie-broken by
        // smallest cooldown remaining, then by index.
        let mut best: Option<(usize, f64, Duration)> = None;
        for (idx, account) in accounts.iter().enumerate() {
            if idx == current_idx {
                continue;
            }
            if !HealthTracker::usable(account, model_id, self.global_quota_threshold, now) {
                continue;
            }
            let fraction = account.remaining_fraction(model_id).unwrap_or(1.0);
            let cooldown = Self::cooldown_remaining(account, model_id, now).unwrap_or(Duration::ZERO);
            let better = match &best {
                None => true,
                Some((_, best_frac, best_cd)) => {
                    fraction > *best_frac || (fraction == *best_frac && cooldown < *best_cd)
                }
            };
            if better {
                best = Some((idx, fraction, cooldown));
            }
        }

        if let Some((idx, _, _)) = best {
            self.pool.set_active_index_for_family(family, idx).await;
            tracing::warn!(
                model = %model_id,
                from = %accounts[current_idx].email,
                to = %accounts[idx].email,
                "sticky continuity broken, switching account"
            );
            return SelectOutcome::Selected(accounts[idx].clone());
        }

        if let Some(cooldown) = Self::cooldown_remaining(&accounts[current_idx], model_id, now) {
            if cooldown <= self.max_wait_before_error {
                return SelectOutcome::Wait(cooldown);
            }
        }

        SelectOutcome::Exhausted
    }

    async fn on_success(&self, _email: &str, _model_id: &str) {}
    async fn on_rate_limit(&self, _email: &str, _model_id: &str) {}
    async fn on_failure(&self, _email: &str, _model_id: &str) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::{Account, AccountSource, Quota, Subscription};
    use crate::health::HealthPolicy;
    use std::collections::HashMap;

    fn account(email: &str) -> Account {
        Account {
            email: email.to_string(),
            source: AccountSource::Oauth,
            credential_ref: "cred".into(),
            project_id: None,
            enabled: true,
            is_invalid: false,
            invalid_reason: None,
            verify_url: None,
            added_at: None,
            last_used: None,
            model_rate_limits: HashMap::new(),
            model_health: HashMap::new(),
            auto_disabled_until: None,
            quota: Quota::default(),
            quota_threshold: None,
            model_quota_thresholds: HashMap::new(),
            subscription: Subscription::default(),
        }
    }

    async fn build_pool(emails: &[&str]) -> Arc<AccountPool> {
        let dir = tempfile::tempdir().unwrap();
        let pool = Arc::new(AccountPool::load(dir.path().join("accounts.json")).await.unwrap());
        for email in emails {
            pool.add_account(account(email)).await.unwrap();
        }
        pool
    }

    fn policy() -> HealthPolicy {
        HealthPolicy {
            consecutive_failure_threshold: 3,
            auto_recovery: Duration::from_secs(60),
        }
    }

    #[tokio::test]
    async fn sticks_to_same_account_across_requests() {
        let pool = build_pool(&["a@example.com", "b@example.com", "c@example.com"]).await;
        let health = Arc::new(HealthTracker::new(pool.clone(), policy()));
        let scheduler = StickyScheduler::new(pool, health, 0.0);

        let first = match scheduler.select_account("claude-sonnet-4-5", "req1").await {
            SelectOutcome::Selected(account) => account.email,
            _ => panic!("expected a selection"),
        };
        let second = match scheduler.select_account("claude-sonnet-4-5", "req2").await {
            SelectOutcome::Selected(account) => account.email,
            _ => panic!("expected a selection"),
        };
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn switches_when_current_is_rate_limited() {
        let pool = build_pool(&["a@example.com", "b@example.com"]).await;
        let health = Arc::new(HealthTracker::new(pool.clone(), policy()));
        let scheduler = StickyScheduler::new(pool.clone(), health.clone(), 0.0);

        // current_idx starts at 0 (active_index_by_family default).
        health
            .mark_rate_limited(
                "a@example.com",
                "claude-sonnet-4-5",
                Utc::now() + chrono::Duration::seconds(3600),
                "rate_limit",
            )
            .await
            .unwrap();

        match scheduler.select_account("claude-sonnet-4-5", "req").await {
            SelectOutcome::Selected(account) => assert_eq!(account.email, "b@example.com"),
            other => panic!("expected switch to b@example.com, got exhaustion/wait: {}", matches!(other, SelectOutcome::Wait(_))),
        }
    }
}
