//! Account Selection Scheduler (§4.1).
//!
//! Four strategies share one capability set (`Scheduler`); strategy-private
//! state (Aggressive's issue tracker, On-Demand's refcounted requests) is
//! owned exclusively by the concrete type.

mod aggressive;
mod on_demand;
mod round_robin;
mod sticky;

pub use aggressive::AggressiveScheduler;
pub use on_demand::OnDemandScheduler;
pub use round_robin::RoundRobinScheduler;
pub use sticky::StickyScheduler;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::account::{Account, AccountPool};
use crate::health::HealthTracker;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrategyKind {
    RoundRobin,
    Sticky,
    Aggressive,
    OnDemand,
}

impl StrategyKind {
    /// Parses a strategy name, accepting `"hybrid"` as an alias for Sticky
    /// (§9 Open Question — no distinct fifth strategy exists in this codebase).
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.to_ascii_lowercase().as_str() {
            "round-robin" | "round_robin" => Some(Self::RoundRobin),
            "sticky" => Some(Self::Sticky),
            "hybrid" => {
                tracing::info!("strategy 'hybrid' resolved to Sticky (alias)");
                Some(Self::Sticky)
            }
            "aggressive" => Some(Self::Aggressive),
            "on-demand" | "on_demand" => Some(Self::OnDemand),
            _ => None,
        }
    }
}

/// Outcome of a selection attempt.
pub enum SelectOutcome {
    /// An eligible account was chosen; the caller is responsible for calling
    /// `on_success` / `on_rate_limit` / `on_failure` once the attempt resolves.
    Selected(Account),
    /// No account is immediately usable, but the preferred one frees up in
    /// this much time. The caller may sleep (if within `max_wait_before_error`)
    /// or surface a 429 with this value as `Retry-After`.
    Wait(Duration),
    /// No account can serve this model at all right now.
    Exhausted,
}

/// Capability set implemented by all four strategies.
#[async_trait]
pub trait Scheduler: Send + Sync {
    async fn select_account(&self, model_id: &str, request_id: &str) -> SelectOutcome;
    async fn on_success(&self, email: &str, model_id: &str);
    async fn on_rate_limit(&self, email: &str, model_id: &str);
    async fn on_failure(&self, email: &str, model_id: &str);
    /// Called when a request that acquired an account via `select_account`
    /// is done (success or exhausted retries), so refcounted strategies
    /// (On-Demand) can release state. A no-op for the other strategies.
    async fn release(&self, _request_id: &str) {}
}

pub fn build_scheduler(
    kind: StrategyKind,
    pool: Arc<AccountPool>,
    health: Arc<HealthTracker>,
    global_quota_threshold: f64,
    max_wait_before_error: Duration,
) -> Arc<dyn Scheduler> {
    match kind {
        StrategyKind::RoundRobin => {
            Arc::new(RoundRobinScheduler::new(pool, health, global_quota_threshold))
        }
        StrategyKind::Sticky => Arc::new(
            StickyScheduler::new(pool, health, global_quota_threshold).with_max_wait(max_wait_before_error),
        ),
        StrategyKind::Aggressive => {
            Arc::new(AggressiveScheduler::new(pool, health, global_quota_threshold))
        }
        StrategyKind::OnDemand => Arc::new(OnDemandScheduler::new(pool, health, global_quota_threshold)),
    }
}
