//! Account pool: identity, credentials, and per-account rate-limit/health state.
//!
//! Persisted to a single JSON file, written atomically (temp file + rename)
//! and protected by a file lock so two processes never interleave writes.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::models::ModelFamily;

/// Where an account's credentials originate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AccountSource {
    Oauth,
    ApiKey,
    HostDatabase,
}

/// Per-model rate-limit record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitRecord {
    pub is_rate_limited: bool,
    pub reset_time: DateTime<Utc>,
    pub hit_at: DateTime<Utc>,
    pub reason: String,
}

/// Per-model health record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelHealth {
    #[serde(default)]
    pub success_count: u64,
    #[serde(default)]
    pub fail_count: u64,
    #[serde(default)]
    pub consecutive_failures: u32,
    #[serde(default = "default_health_score")]
    pub health_score: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_failure_at: Option<DateTime<Utc>>,
}

fn default_health_score() -> u8 {
    100
}

impl Default for ModelHealth {
    fn default() -> Self {
        Self {
            success_count: 0,
            fail_count: 0,
            consecutive_failures: 0,
            health_score: 100,
            last_failure_at: None,
        }
    }
}

/// Penalty subtracted from `health_score` for a given failure kind (§3).
#[derive(Debug, Clone, Copy)]
pub enum FailureKind {
    RateLimit,
    Auth,
    Server,
    Network,
}

impl FailureKind {
    fn penalty(self) -> u8 {
        match self {
            FailureKind::RateLimit => 5,
            FailureKind::Auth => 20,
            FailureKind::Server => 10,
            FailureKind::Network => 3,
        }
    }
}

impl ModelHealth {
    pub fn record_success(&mut self) {
        self.success_count += 1;
        self.consecutive_failures = 0;
        self.health_score = self.health_score.saturating_add(1).min(100);
    }

    pub fn record_failure(&mut self, kind: FailureKind) {
        self.fail_count += 1;
        self.consecutive_failures += 1;
        self.health_score = self.health_score.saturating_sub(kind.penalty());
        self.last_failure_at = Some(Utc::now());
    }
}

/// Per-model quota snapshot.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ModelQuota {
    pub remaining_fraction: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reset_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Quota {
    #[serde(default)]
    pub models: HashMap<String, ModelQuota>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_checked: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Subscription {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tier: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detected_at: Option<DateTime<Utc>>,
}

/// A single Google Cloud Code account in the pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub email: String,
    pub source: AccountSource,
    /// Opaque handle the token provider resolves into an access token; not
    /// interpreted here (token refresh is an external collaborator).
    pub credential_ref: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub is_invalid: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invalid_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verify_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub added_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_used: Option<DateTime<Utc>>,
    #[serde(default)]
    pub model_rate_limits: HashMap<String, RateLimitRecord>,
    #[serde(default)]
    pub model_health: HashMap<String, ModelHealth>,
    /// Set when `consecutive_failures` on some model crossed the configured
    /// threshold; cleared automatically once `auto_recovery_ms` has elapsed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_disabled_until: Option<DateTime<Utc>>,
    #[serde(default)]
    pub quota: Quota,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quota_threshold: Option<f64>,
    #[serde(default)]
    pub model_quota_thresholds: HashMap<String, f64>,
    #[serde(default)]
    pub subscription: Subscription,
}

fn default_true() -> bool {
    true
}

impl Account {
    /// A stable identifier for health/scheduler bookkeeping that does not
    /// require the email to round-trip through a hash map key comparison.
    pub fn id(&self) -> Uuid {
        stable_account_uuid(&self.email)
    }

    /// Drop rate-limit and health records whose cooldown has elapsed.
    /// Called lazily before every selection pass (§3 Rate-Limit Record Lifecycle).
    pub fn clear_expired(&mut self, now: DateTime<Utc>) {
        self.model_rate_limits.retain(|_, r| r.reset_time > now);
    }

    pub fn is_rate_limited(&self, model_id: &str, now: DateTime<Utc>) -> bool {
        self.model_rate_limits
            .get(model_id)
            .map(|r| r.is_rate_limited && r.reset_time > now)
            .unwrap_or(false)
    }

    pub fn remaining_fraction(&self, model_id: &str) -> Option<f64> {
        self.quota.models.get(model_id).and_then(|q| q.remaining_fraction)
    }

    pub fn effective_threshold(&self, model_id: &str, global_threshold: f64) -> f64 {
        self.model_quota_thresholds
            .get(model_id)
            .copied()
            .or(self.quota_threshold)
            .unwrap_or(global_threshold)
    }

    pub fn mark_rate_limited(&mut self, model_id: &str, reset_time: DateTime<Utc>, reason: &str) {
        let now = Utc::now();
        match self.model_rate_limits.get_mut(model_id) {
            Some(existing) => {
                // Monotonic: keep the later reset time.
                if reset_time > existing.reset_time {
                    existing.reset_time = reset_time;
                }
                existing.is_rate_limited = true;
                existing.hit_at = now;
                existing.reason = reason.to_string();
            }
            None => {
                self.model_rate_limits.insert(
                    model_id.to_string(),
                    RateLimitRecord {
                        is_rate_limited: true,
                        reset_time,
                        hit_at: now,
                        reason: reason.to_string(),
                    },
                );
            }
        }
    }

    pub fn health_for(&mut self, model_id: &str) -> &mut ModelHealth {
        self.model_health.entry(model_id.to_string()).or_default()
    }

    pub fn is_auto_disabled(&self, now: DateTime<Utc>) -> bool {
        self.auto_disabled_until.map(|until| until > now).unwrap_or(false)
    }
}

/// Deterministic UUID derived from an account email, so the same account
/// keeps the same scheduler/health identity across process restarts.
pub fn stable_account_uuid(email: &str) -> Uuid {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(b"cloudcode-proxy:account:");
    hasher.update(email.as_bytes());
    let hash = hasher.finalize();
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&hash[..16]);
    bytes[6] = (bytes[6] & 0x0f) | 0x40;
    bytes[8] = (bytes[8] & 0x3f) | 0x80;
    Uuid::from_bytes(bytes)
}

fn family_key(family: ModelFamily) -> &'static str {
    match family {
        ModelFamily::Claude => "claude",
        ModelFamily::Gemini => "gemini",
        ModelFamily::Other => "other",
    }
}

/// Persisted shape of the account file (§6).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PersistedPool {
    accounts: Vec<Account>,
    #[serde(default)]
    settings: serde_json::Value,
    #[serde(default)]
    active_index: usize,
    #[serde(default)]
    active_index_by_family: HashMap<String, usize>,
}

/// In-memory account pool with disk persistence.
///
/// Accounts, `active_index`, and `active_index_by_family` are all mutated
/// under the same write lock (§5 single writer discipline).
pub struct AccountPool {
    inner: RwLock<PoolState>,
    storage_path: PathBuf,
}

struct PoolState {
    accounts: Vec<Account>,
    active_index: usize,
    active_index_by_family: HashMap<ModelFamily, usize>,
}

impl AccountPool {
    pub async fn load(storage_path: PathBuf) -> anyhow::Result<Self> {
        let persisted = if storage_path.exists() {
            Self::read_from_path(&storage_path)?
        } else {
            PersistedPool::default()
        };

        let mut accounts = persisted.accounts;
        for account in &mut accounts {
            // On startup, clear stale invalidation unless it's a verification
            // lockout (which must be resolved by the external token provider).
            if account.is_invalid && account.verify_url.is_none() {
                account.is_invalid = false;
                account.invalid_reason = None;
            }
        }

        let n = accounts.len();
        let active_index = if n == 0 { 0 } else { persisted.active_index.min(n - 1) };

        let mut active_index_by_family = HashMap::new();
        for family in [ModelFamily::Claude, ModelFamily::Gemini, ModelFamily::Other] {
            let stored = persisted.active_index_by_family.get(family_key(family)).copied();
            // §9 Open Question: default a missing family index to active_index
            // (clamped), not to 0, so Sticky inherits Round-Robin's position.
            let idx = stored.unwrap_or(active_index);
            let idx = if n == 0 { 0 } else { idx.min(n - 1) };
            active_index_by_family.insert(family, idx);
        }

        Ok(Self {
            inner: RwLock::new(PoolState {
                accounts,
                active_index,
                active_index_by_family,
            }),
            storage_path,
        })
    }

    fn read_from_path(path: &Path) -> anyhow::Result<PersistedPool> {
        let contents = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&contents)?)
    }

    fn write_to_path(path: &Path, persisted: &PersistedPool) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp_path = path.with_extension("tmp");
        let contents = serde_json::to_string_pretty(persisted)?;
        // Hold an exclusive lock on the real path while we swap in the new
        // contents, so a concurrent process's writer can't interleave.
        let lock_file = std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .open(path)?;
        lock_file.lock_exclusive()?;
        std::fs::write(&tmp_path, contents)?;
        std::fs::rename(&tmp_path, path)?;
        FileExt::unlock(&lock_file)?;
        Ok(())
    }

    async fn persist(&self, state: &PoolState) -> anyhow::Result<()> {
        let persisted = PersistedPool {
            accounts: state.accounts.clone(),
            settings: serde_json::Value::Null,
            active_index: state.active_index,
            active_index_by_family: state
                .active_index_by_family
                .iter()
                .map(|(family, idx)| (family_key(*family).to_string(), *idx))
                .collect(),
        };
        let path = self.storage_path.clone();
        tokio::task::spawn_blocking(move || Self::write_to_path(&path, &persisted)).await??;
        Ok(())
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.accounts.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Snapshot of accounts with expired rate-limit records already cleared.
    pub async fn snapshot(&self, model_id: &str) -> Vec<Account> {
        let mut state = self.inner.write().await;
        let now = Utc::now();
        for account in &mut state.accounts {
            account.clear_expired(now);
        }
        let _ = model_id;
        state.accounts.clone()
    }

    pub async fn active_index(&self) -> usize {
        self.inner.read().await.active_index
    }

    pub async fn active_index_for_family(&self, family: ModelFamily) -> usize {
        self.inner
            .read()
            .await
            .active_index_by_family
            .get(&family)
            .copied()
            .unwrap_or(0)
    }

    pub async fn set_active_index(&self, index: usize) {
        let mut state = self.inner.write().await;
        if state.accounts.is_empty() {
            return;
        }
        state.active_index = index % state.accounts.len();
    }

    pub async fn set_active_index_for_family(&self, family: ModelFamily, index: usize) {
        let mut state = self.inner.write().await;
        if state.accounts.is_empty() {
            return;
        }
        let n = state.accounts.len();
        state.active_index_by_family.insert(family, index % n);
    }

    /// Mutate one account by email, then persist. Returns `false` if not found.
    pub async fn with_account_mut<F>(&self, email: &str, f: F) -> anyhow::Result<bool>
    where
        F: FnOnce(&mut Account),
    {
        let mut state = self.inner.write().await;
        let found = if let Some(account) = state.accounts.iter_mut().find(|a| a.email == email) {
            f(account);
            true
        } else {
            false
        };
        if found {
            self.persist(&state).await?;
        }
        Ok(found)
    }

    /// Append a new account to the pool and persist. Intended for the
    /// external configuration/OAuth-enrollment collaborator; duplicate
    /// emails are rejected since `email` is the pool's identity key.
    pub async fn add_account(&self, account: Account) -> anyhow::Result<bool> {
        let mut state = self.inner.write().await;
        if state.accounts.iter().any(|a| a.email == account.email) {
            return Ok(false);
        }
        state.accounts.push(account);
        self.persist(&state).await?;
        Ok(true)
    }

    pub async fn clear_all_rate_limits(&self) -> anyhow::Result<()> {
        let mut state = self.inner.write().await;
        for account in &mut state.accounts {
            account.model_rate_limits.clear();
        }
        self.persist(&state).await
    }
}

pub type SharedAccountPool = Arc<AccountPool>;

#[cfg(test)]
mod tests {
    use super::*;

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

    #[tokio::test]
    async fn persists_and_reloads_across_pool_instances() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("accounts.json");

        let pool = AccountPool::load(path.clone()).await.unwrap();
        pool.add_account(sample_account("a@example.com")).await.unwrap();
        pool.add_account(sample_account("b@example.com")).await.unwrap();

        let reloaded = AccountPool::load(path).await.unwrap();
        assert_eq!(reloaded.len().await, 2);
    }

    #[tokio::test]
    async fn clear_expired_drops_past_rate_limits_lazily() {
        let mut account = sample_account("a@example.com");
        let past = Utc::now() - chrono::Duration::seconds(10);
        account.mark_rate_limited("claude-sonnet-4-5", past, "rate_limit");
        assert!(!account.is_rate_limited("claude-sonnet-4-5", Utc::now()));
        account.clear_expired(Utc::now());
        assert!(account.model_rate_limits.is_empty());
    }

    #[test]
    fn health_score_stays_in_bounds() {
        let mut health = ModelHealth::default();
        for _ in 0..200 {
            health.record_failure(FailureKind::Auth);
        }
        assert_eq!(health.health_score, 0);
        for _ in 0..200 {
            health.record_success();
        }
        assert_eq!(health.health_score, 100);
    }

    #[test]
    fn stable_uuid_is_deterministic() {
        assert_eq!(stable_account_uuid("a@example.com"), stable_account_uuid("a@example.com"));
        assert_ne!(stable_account_uuid("a@example.com"), stable_account_uuid("b@example.com"));
    }
}
