//! `GET /health` (§4.6): account pool summary and per-account quota/rate-limit view.

use std::sync::Arc;

use axum::extract::State;
use axum::Json;
use serde::Serialize;

use crate::health::AccountHealthView;

use super::AppState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    status: &'static str,
    accounts: Vec<AccountHealthView>,
}

pub async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let accounts = state.health.snapshot().await;
    Json(HealthResponse { status: "ok", accounts })
}
