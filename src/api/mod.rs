//! HTTP surface (§4.6): axum router wiring request auth, `/v1/messages`,
//! `/v1/messages/count_tokens`, `/v1/models`, and `/health`.

pub mod health;
pub mod messages;
pub mod models;

use std::sync::Arc;

use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::error::ProxyError;
use crate::failover::FailoverController;
use crate::health::HealthTracker;
use crate::models::ModelCatalog;

pub struct AppState {
    pub failover: Arc<FailoverController>,
    pub catalog: Arc<ModelCatalog>,
    pub health: Arc<HealthTracker>,
    pub proxy_secret: Option<String>,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/messages", post(messages::create_message))
        .route("/v1/messages/count_tokens", post(messages::count_tokens))
        .route("/v1/models", get(models::list_models))
        .route("/health", get(health::health))
        .fallback(not_found)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Bearer-token check against `PROXY_SECRET`; a no-op when unset.
pub fn authorize(state: &AppState, headers: &HeaderMap) -> Result<(), ProxyError> {
    let Some(expected) = &state.proxy_secret else {
        return Ok(());
    };
    let provided = headers
        .get("x-api-key")
        .or_else(|| headers.get(axum::http::header::AUTHORIZATION))
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim_start_matches("Bearer ").trim());

    match provided {
        Some(value) if value == expected => Ok(()),
        _ => Err(ProxyError::AuthenticationFailed {
            message: "missing or invalid API key".to_string(),
        }),
    }
}

pub async fn not_found() -> (StatusCode, &'static str) {
    (StatusCode::NOT_FOUND, "not found")
}
