use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use crate::account::AccountPool;
use crate::health::HealthTracker;

use super::{Scheduler, SelectOutcome};

/// Issues recorded on the current account before `switch_threshold` is
/// reached, it rotates. Transient, in-strategy state — not persisted.
const DEFAULT_SWITCH_THRESHOLD: u32 = 1;

pub struct AggressiveScheduler {
    pool: Arc<AccountPool>,
    health: Arc<HealthTracker>,
    global_quota_threshold: f64,
    switch_threshold: u32,
    issue_tracker: RwLock<HashMap<String, u32>>,
}

impl AggressiveScheduler {
    pub fn new(pool: Arc<AccountPool>, health: Arc<HealthTracker>, global_quota_threshold: f64) -> Self {
        Self {
            pool,
            health,
            global_quota_threshold,
            switch_threshold: DEFAULT_SWITCH_THRESHOLD,
            issue_tracker: RwLock::new(HashMap::new()),
        }
    }

    async fn record_issue(&self, email: &str, model_id: &str) {
        let accounts = self.pool.snapshot(model_id).await;
        let now = Utc::now();
        let n = accounts.len();
        if n == 0 {
            return;
        }

        let mut tracker = self.issue_tracker.write().await;
        let count = tracker.entry(email.to_string()).or_insert(0);
        *count += 1;

        let current_idx = self.pool.active_index().await.min(n.saturating_sub(1));
        if accounts[current_idx].email != email || *count < self.switch_threshold {
            return;
        }

        // Rotate: scan for the next eligible account.
        for offset in 1..=n {
            let idx = (current_idx + offset) % n;
            let candidate_over_threshold =
                tracker.get(&accounts[idx].email).copied().unwrap_or(0) >= self.switch_threshold;
            if candidate_over_threshold {
                continue;
            }
            if HealthTracker::usable(&accounts[idx], model_id, self.global_quota_threshold, now) {
                drop(tracker);
                self.pool.set_active_index(idx).await;
                return;
            }
        }

        // Every account is at or above threshold: fresh generation.
        tracing::warn!("all accounts exceeded aggressive switch threshold, resetting counters");
        tracker.clear();
    }
}

#[async_trait]
impl Scheduler for AggressiveScheduler {
    async fn select_account(&self, model_id: &str, _request_id: &str) -> SelectOutcome {
        let accounts = self.pool.snapshot(model_id).await;
        if accounts.is_empty() {
            return SelectOutcome::Exhausted;
        }
        let n = accounts.len();
        let now = Utc::now();
        let start = self.pool.active_index().await % n;

        for offset in 0..n {
            let idx = (start + offset) % n;
            if HealthTracker::usable(&accounts[idx], model_id, self.global_quota_threshold, now) {
                if idx != start {
                    self.pool.set_active_index(idx).await;
                }
                return SelectOutcome::Selected(accounts[idx].clone());
            }
        }
        SelectOutcome::Exhausted
    }

    async fn on_success(&self, email: &str, _model_id: &str) {
        self.issue_tracker.write().await.remove(email);
    }

    async fn on_rate_limit(&self, email: &str, model_id: &str) {
        self.record_issue(email, model_id).await;
    }

    async fn on_failure(&self, email: &str, model_id: &str) {
        self.record_issue(email, model_id).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::{Account, AccountSource, Quota, Subscription};
    use crate::health::HealthPolicy;
    use std::collections::HashMap as Map;
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
            model_rate_limits: Map::new(),
            model_health: Map::new(),
            auto_disabled_until: None,
            quota: Quota::default(),
            quota_threshold: None,
            model_quota_thresholds: Map::new(),
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
    async fn rotates_after_single_issue_on_current_account() {
        let pool = build_pool(&["a@example.com", "b@example.com"]).await;
        let health = Arc::new(HealthTracker::new(pool.clone(), policy()));
        let scheduler = AggressiveScheduler::new(pool, health, 0.0);

        let first = match scheduler.select_account("claude-sonnet-4-5", "req").await {
            SelectOutcome::Selected(account) => account.email,
            _ => panic!("expected a selection"),
        };
        scheduler.on_failure(&first, "claude-sonnet-4-5").await;
        let second = match scheduler.select_account("claude-sonnet-4-5", "req").await {
            SelectOutcome::Selected(account) => account.email,
            _ => panic!("expected a selection"),
        };
        assert_ne!(first, second);
    }

    #[tokio::test]
    async fn success_clears_issue_counter() {
        let pool = build_pool(&["a@example.com", "b@example.com"]).await;
        let health = Arc::new(HealthTracker::new(pool.clone(), policy()));
        let scheduler = AggressiveScheduler::new(pool, health, 0.0);
        scheduler.on_success("a@example.com", "claude-sonnet-4-5").await;
        assert!(!scheduler.issue_tracker.read().await.contains_key("a@example.com"));
    }
}
