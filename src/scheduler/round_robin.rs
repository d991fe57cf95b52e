use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;

use crate::account::AccountPool;
use crate::health::HealthTracker;

use super::{Scheduler, SelectOutcome};

/// Starts the scan at `(active_index + 1) mod n`, advances `active_index` to
/// the chosen account. Falls back to the highest-`remaining_fraction`
/// account (ignoring the quota threshold) when nothing clears the threshold
/// and one is configured.
pub struct RoundRobinScheduler {
    pool: Arc<AccountPool>,
    health: Arc<HealthTracker>,
    global_quota_threshold: f64,
}

impl RoundRobinScheduler {
    pub fn new(pool: Arc<AccountPool>, health: Arc<HealthTracker>, global_quota_threshold: f64) -> Self {
        Self {
            pool,
            health,
            global_quota_threshold,
        }
    }
}

#[async_trait]
impl Scheduler for RoundRobinScheduler {
    async fn select_account(&self, model_id: &str, _request_id: &str) -> SelectOutcome {
        let accounts = self.pool.snapshot(model_id).await;
        if accounts.is_empty() {
            return SelectOutcome::Exhausted;
        }
        let n = accounts.len();
        let now = Utc::now();
        let start = (self.pool.active_index().await + 1) % n;

        for offset in 0..n {
            let idx = (start + offset) % n;
            if HealthTracker::usable(&accounts[idx], model_id, self.global_quota_threshold, now) {
                self.pool.set_active_index(idx).await;
                return SelectOutcome::Selected(accounts[idx].clone());
            }
        }

        if self.global_quota_threshold > 0.0 {
            // Fall back to the eligible-ignoring-threshold account with the
            // highest remaining_fraction, ties broken by lowest index.
            let mut best: Option<(usize, f64)> = None;
            for (idx, account) in accounts.iter().enumerate() {
                if account.is_invalid || !account.enabled || account.is_rate_limited(model_id, now) {
                    continue;
                }
                let fraction = account.remaining_fraction(model_id).unwrap_or(0.0);
                if best.map(|(_, best_frac)| fraction > best_frac).unwrap_or(true) {
                    best = Some((idx, fraction));
                }
            }
            if let Some((idx, _)) = best {
                tracing::warn!(
                    model = %model_id,
                    email = %accounts[idx].email,
                    "quota threshold exhausted for all accounts, falling back to highest remaining fraction"
                );
                self.pool.set_active_index(idx).await;
                return SelectOutcome::Selected(accounts[idx].clone());
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
    use std::time::Duration;

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
    async fn cycles_through_accounts_in_order() {
        let pool = build_pool(&["a@example.com", "b@example.com", "c@example.com"]).await;
        let health = Arc::new(HealthTracker::new(pool.clone(), policy()));
        let scheduler = RoundRobinScheduler::new(pool, health, 0.0);

        let mut picked = Vec::new();
        for _ in 0..3 {
            match scheduler.select_account("claude-sonnet-4-5", "req").await {
                SelectOutcome::Selected(account) => picked.push(account.email),
                _ => panic!("expected a selection"),
            }
        }
        assert_eq!(picked, vec!["b@example.com", "c@example.com", "a@example.com"]);
    }

    #[tokio::test]
    async fn skips_rate_limited_accounts() {
        let pool = build_pool(&["a@example.com", "b@example.com"]).await;
        let health = Arc::new(HealthTracker::new(pool.clone(), policy()));
        let scheduler = RoundRobinScheduler::new(pool.clone(), health.clone(), 0.0);

        health
            .mark_rate_limited(
                "b@example.com",
                "claude-sonnet-4-5",
                Utc::now() + chrono::Duration::seconds(60),
                "rate_limit",
            )
            .await
            .unwrap();

        match scheduler.select_account("claude-sonnet-4-5", "req").await {
            SelectOutcome::Selected(account) => assert_eq!(account.email, "a@example.com"),
            _ => panic!("expected a selection"),
        }
        match scheduler.select_account("claude-sonnet-4-5", "req").await {
            SelectOutcome::Selected(account) => assert_eq!(account.email, "a@example.com"),
            _ => panic!("expected to skip the rate-limited account and wrap back to a"),
        }
    }

    #[tokio::test]
    async fn exhausted_when_all_rate_limited() {
        let pool = build_pool(&["a@example.com"]).await;
        let health = Arc::new(HealthTracker::new(pool.clone(), policy()));
        let scheduler = RoundRobinScheduler::new(pool.clone(), health.clone(), 0.0);
        health
            .mark_rate_limited(
                "a@example.com",
                "claude-sonnet-4-5",
                Utc::now() + chrono::Duration::seconds(60),
                "rate_limit",
            )
            .await
            .unwrap();
        assert!(matches!(
            scheduler.select_account("claude-sonnet-4-5", "req").await,
            SelectOutcome::Exhausted
        ));
    }
}
