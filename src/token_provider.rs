//! Token Provider (external collaborator, §2): resolves an account's
//! `credential_ref` into a bearer token and project id. OAuth device flow
//! and refresh live outside this crate; what's implemented here is the
//! narrow interface the failover controller depends on, plus the caching
//! wrapper's retry-on-401 behavior.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::account::Account;
use crate::error::ProxyError;

#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn get_token(&self, account: &Account, force_refresh: bool) -> Result<String, ProxyError>;
    async fn get_project(&self, account: &Account) -> Result<Option<String>, ProxyError>;
}

/// Treats `credential_ref` as an already-valid access token. Suitable for
/// API-key accounts and for tests against the in-process echo upstream;
/// a real OAuth-backed provider is an external collaborator per spec.
pub struct StaticTokenProvider {
    cache: RwLock<HashMap<String, String>>,
}

impl StaticTokenProvider {
    pub fn new() -> Self {
        Self { cache: RwLock::new(HashMap::new()) }
    }
}

impl Default for StaticTokenProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TokenProvider for StaticTokenProvider {
    async fn get_token(&self, account: &Account, force_refresh: bool) -> Result<String, ProxyError> {
        if !force_refresh {
            if let Some(cached) = self.cache.read().await.get(&account.email) {
                return Ok(cached.clone());
            }
        }
        let token = account.credential_ref.clone();
        self.cache.write().await.insert(account.email.clone(), token.clone());
        Ok(token)
    }

    async fn get_project(&self, account: &Account) -> Result<Option<String>, ProxyError> {
        Ok(account.project_id.clone())
    }
}

pub type SharedTokenProvider = Arc<dyn TokenProvider>;
