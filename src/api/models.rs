//! `GET /v1/models` (§4.6).
//!
//! Lists the known catalog rather than round-tripping upstream `listModels`:
//! the catalog is the proxy's source of truth for which model ids route
//! anywhere, so a client enumerating models sees exactly the set the
//! failover controller can actually serve.

use std::sync::Arc;

use axum::extract::State;
use axum::Json;
use serde::Serialize;

use super::AppState;

#[derive(Debug, Serialize)]
pub struct ModelEntry {
    id: String,
    #[serde(rename = "type")]
    kind: &'static str,
    display_name: String,
}

#[derive(Debug, Serialize)]
pub struct ModelsResponse {
    data: Vec<ModelEntry>,
}

pub async fn list_models(State(state): State<Arc<AppState>>) -> Json<ModelsResponse> {
    let data = state
        .catalog
        .ids()
        .into_iter()
        .map(|id| ModelEntry {
            display_name: id.clone(),
            id,
            kind: "model",
        })
        .collect();
    Json(ModelsResponse { data })
}
