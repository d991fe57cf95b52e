//! `POST /v1/messages` and `POST /v1/messages/count_tokens` (§4.6).

use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::StreamExt;
use serde::Serialize;
use uuid::Uuid;

use crate::anthropic::MessagesRequest;
use crate::failover::Outcome;

use super::{authorize, AppState};

pub async fn create_message(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<MessagesRequest>,
) -> Response {
    if let Err(err) = authorize(&state, &headers) {
        return err.into_response();
    }

    let request_id = format!("req_{}", Uuid::new_v4().simple());
    tracing::info!(request_id = %request_id, model = %request.model, stream = request.stream.unwrap_or(false), "handling /v1/messages");

    match state.failover.handle(request, &request_id).await {
        Ok(Outcome::Buffered(response)) => Json(response).into_response(),
        Ok(Outcome::Streaming(stream)) => {
            let events = stream.map(|event| {
                let name = event_name(&event);
                let data = serde_json::to_string(&event).unwrap_or_else(|_| "{}".to_string());
                Ok::<Event, Infallible>(Event::default().event(name).data(data))
            });
            Sse::new(events).keep_alive(KeepAlive::new()).into_response()
        }
        Err(err) => err.into_response(),
    }
}

fn event_name(event: &crate::anthropic::StreamEvent) -> &'static str {
    use crate::anthropic::StreamEvent::*;
    match event {
        MessageStart { .. } => "message_start",
        ContentBlockStart { .. } => "content_block_start",
        ContentBlockDelta { .. } => "content_block_delta",
        ContentBlockStop { .. } => "content_block_stop",
        MessageDelta { .. } => "message_delta",
        MessageStop => "message_stop",
        Error { .. } => "error",
    }
}

#[derive(Debug, Serialize)]
struct CountTokensResponse {
    input_tokens: u32,
}

pub async fn count_tokens(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<MessagesRequest>,
) -> Response {
    if let Err(err) = authorize(&state, &headers) {
        return err.into_response();
    }
    let descriptor = state.catalog.get_or_default(&request.model);
    let input_tokens = crate::token_counter::count_tokens(&request, descriptor.family);
    Json(CountTokensResponse { input_tokens }).into_response()
}
