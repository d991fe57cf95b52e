//! Rate-limit & health state machine (§4.2).
//!
//! A thin, config-driven layer over `AccountPool` that implements
//! `mark_rate_limited`, `clear_expired`, `record_success`, `record_failure`,
//! and `snapshot`, including the consecutive-failure auto-disable /
//! auto-recovery policy.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::account::{Account, AccountPool, FailureKind};
use crate::config::Config;

#[derive(Debug, Clone)]
pub struct HealthPolicy {
    pub consecutive_failure_threshold: u32,
    pub auto_recovery: std::time::Duration,
}

impl From<&Config> for HealthPolicy {
    fn from(config: &Config) -> Self {
        Self {
            consecutive_failure_threshold: config.consecutive_failure_threshold,
            auto_recovery: config.auto_recovery,
        }
    }
}

/// Drives rate-limit/health mutations against the shared pool.
pub struct HealthTracker {
    pool: Arc<AccountPool>,
    policy: HealthPolicy,
}

impl HealthTracker {
    pub fn new(pool: Arc<AccountPool>, policy: HealthPolicy) -> Self {
        Self { pool, policy }
    }

    pub async fn mark_rate_limited(
        &self,
        email: &str,
        model_id: &str,
        reset_time: DateTime<Utc>,
        reason: &str,
    ) -> anyhow::Result<()> {
        self.pool
            .with_account_mut(email, |account| {
                account.mark_rate_limited(model_id, reset_time, reason);
            })
            .await?;
        Ok(())
    }

    pub async fn record_success(&self, email: &str, model_id: &str) -> anyhow::Result<()> {
        self.pool
            .with_account_mut(email, |account| {
                account.health_for(model_id).record_success();
                account.last_used = Some(Utc::now());
            })
            .await?;
        Ok(())
    }

    /// Record a classified failure and apply auto-disable if the
    /// consecutive-failure threshold is crossed.
    pub async fn record_failure(
        &self,
        email: &str,
        model_id: &str,
        kind: FailureKind,
    ) -> anyhow::Result<()> {
        let threshold = self.policy.consecutive_failure_threshold;
        let recovery = self.policy.auto_recovery;
        self.pool
            .with_account_mut(email, |account| {
                let health = account.health_for(model_id);
                health.record_failure(kind);
                if health.consecutive_failures >= threshold {
                    account.auto_disabled_until = Some(Utc::now() + to_chrono(recovery));
                    tracing::warn!(
                        email = %email,
                        model = %model_id,
                        consecutive_failures = health.consecutive_failures,
                        "account auto-disabled after consecutive failures"
                    );
                }
            })
            .await?;
        Ok(())
    }

    /// Mark an account permanently unusable until an operator/external
    /// collaborator clears it (§3: set by the controller on persistent auth
    /// failures or an explicit validation requirement from upstream).
    pub async fn mark_invalid(
        &self,
        email: &str,
        reason: String,
        verify_url: Option<String>,
    ) -> anyhow::Result<()> {
        self.pool
            .with_account_mut(email, move |account| {
                account.is_invalid = true;
                account.invalid_reason = Some(reason);
                account.verify_url = verify_url;
            })
            .await?;
        Ok(())
    }

    /// Usable per §4.1's common eligibility predicate, minus the caller's
    /// own `current_model` / strategy-specific filtering.
    pub fn usable(account: &Account, model_id: &str, global_threshold: f64, now: DateTime<Utc>) -> bool {
        if account.is_invalid {
            return false;
        }
        if !account.enabled {
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
            // Fail-open when fraction is unknown.
        }
        true
    }

    pub async fn snapshot(&self) -> Vec<AccountHealthView> {
        let accounts = self.pool.snapshot("*").await;
        let now = Utc::now();
        accounts
            .iter()
            .map(|account| AccountHealthView::from_account(account, now))
            .collect()
    }
}

fn to_chrono(d: std::time::Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or(chrono::Duration::zero())
}

/// Snapshot view of an account's health, used by `/health`.
#[derive(Debug, Clone, Serialize)]
pub struct AccountHealthView {
    pub email: String,
    pub enabled: bool,
    pub is_invalid: bool,
    pub is_auto_disabled: bool,
    pub model_rate_limits: Vec<ModelRateLimitView>,
    pub model_health: Vec<ModelHealthView>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ModelRateLimitView {
    pub model_id: String,
    pub reset_time: DateTime<Utc>,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ModelHealthView {
    pub model_id: String,
    pub health_score: u8,
    pub consecutive_failures: u32,
}

impl AccountHealthView {
    fn from_account(account: &Account, now: DateTime<Utc>) -> Self {
        Self {
            email: account.email.clone(),
            enabled: account.enabled,
            is_invalid: account.is_invalid,
            is_auto_disabled: account.is_auto_disabled(now),
            model_rate_limits: account
                .model_rate_limits
                .iter()
                .filter(|(_, r)| r.is_rate_limited && r.reset_time > now)
                .map(|(model_id, r)| ModelRateLimitView {
                    model_id: model_id.clone(),
                    reset_time: r.reset_time,
                    reason: r.reason.clone(),
                })
                .collect(),
            model_health: account
                .model_health
                .iter()
                .map(|(model_id, h)| ModelHealthView {
                    model_id: model_id.clone(),
                    health_score: h.health_score,
                    consecutive_failures: h.consecutive_failures,
                })
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::{Account, AccountSource, Quota, Subscription};
    use std::collections::HashMap;

    fn sample_account(email: &str) -> Account {
        Account {
            email: email.to_string(),
            source: AccountSource::Oauth,
            credential_ref: "cred".to_string(),
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

    #[test]
    fn usable_rejects_invalid_and_disabled() {
        let now = Utc::now();
        let mut account = sample_account("a@example.com");
        assert!(HealthTracker::usable(&account, "claude-sonnet-4-5", 0.0, now));
        account.is_invalid = true;
        assert!(!HealthTracker::usable(&account, "claude-sonnet-4-5", 0.0, now));
        account.is_invalid = false;
        account.enabled = false;
        assert!(!HealthTracker::usable(&account, "claude-sonnet-4-5", 0.0, now));
    }

    #[test]
    fn usable_fails_open_on_unknown_quota_fraction() {
        let now = Utc::now();
        let account = sample_account("a@example.com");
        assert!(HealthTracker::usable(&account, "claude-sonnet-4-5", 0.5, now));
    }

    #[test]
    fn usable_rejects_under_quota_threshold() {
        let now = Utc::now();
        let mut account = sample_account("a@example.com");
        account.quota.models.insert(
            "claude-sonnet-4-5".to_string(),
            crate::account::ModelQuota {
                remaining_fraction: Some(0.1),
                reset_time: None,
            },
        );
        assert!(!HealthTracker::usable(&account, "claude-sonnet-4-5", 0.5, now));
        assert!(HealthTracker::usable(&account, "claude-sonnet-4-5", 0.05, now));
    }

    #[tokio::test]
    async fn auto_disable_trips_after_threshold_and_recovers() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("accounts.json");
        let pool = Arc::new(AccountPool::load(path).await.unwrap());
        pool.add_account(sample_account("a@example.com")).await.unwrap();
        let tracker = HealthTracker::new(
            pool.clone(),
            HealthPolicy {
                consecutive_failure_threshold: 2,
                auto_recovery: std::time::Duration::from_millis(50),
            },
        );
        tracker.record_failure("a@example.com", "claude-sonnet-4-5", FailureKind::Server).await.unwrap();
        tracker.record_failure("a@example.com", "claude-sonnet-4-5", FailureKind::Server).await.unwrap();
        let accounts = pool.snapshot("claude-sonnet-4-5").await;
        let account = accounts.iter().find(|a| a.email == "a@example.com").unwrap();
        assert!(account.is_auto_disabled(Utc::now()));
    }
}
