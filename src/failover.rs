//! Failover Controller (§4.3): the retry loop tying scheduler, translator,
//! health tracker, and upstream transport together for one request.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures::{Stream, StreamExt};

use crate::account::{Account, FailureKind};
use crate::anthropic::{MessagesRequest, MessagesResponse, StreamEvent};
use crate::error::ProxyError;
use crate::google::RequestEnvelope;
use crate::health::HealthTracker;
use crate::models::{ModelCatalog, ModelFamily};
use crate::scheduler::{Scheduler, SelectOutcome};
use crate::token_provider::TokenProvider;
use crate::transport::{SseFrameParser, UpstreamTransport};
use crate::translator::{ThinkingTagMode, Translators};

/// Absolute cap on attempts within one request, independent of pool size,
/// so a pathological pool can't wedge a request forever.
const ABSOLUTE_RETRY_CAP: u32 = 32;

pub struct FailoverController {
    pub catalog: Arc<ModelCatalog>,
    pub scheduler: Arc<dyn Scheduler>,
    pub health: Arc<HealthTracker>,
    pub token_provider: Arc<dyn TokenProvider>,
    pub transport: Arc<UpstreamTransport>,
    pub translators: Arc<Translators>,
    pub fallback_enabled: bool,
    pub max_wait_before_error: Duration,
    pub thinking_tag_mode: ThinkingTagMode,
}

pub enum Outcome {
    Buffered(MessagesResponse),
    /// Typed event stream; the handler renders each item as one axum SSE event.
    Streaming(std::pin::Pin<Box<dyn Stream<Item = StreamEvent> + Send>>),
}

impl FailoverController {
    pub async fn handle(&self, request: MessagesRequest, request_id: &str) -> Result<Outcome, ProxyError> {
        if request.messages.is_empty() {
            return Err(ProxyError::invalid_request("messages must not be empty"));
        }

        let streaming = request.stream.unwrap_or(false);
        let requested_model = request.model.clone();
        let mut current_model = requested_model.clone();
        let mut tried: HashSet<String> = HashSet::new();
        let mut attempts_total: u32 = 0;

        loop {
            if attempts_total >= ABSOLUTE_RETRY_CAP {
                return Err(ProxyError::service_unavailable("retry budget exhausted", None));
            }

            let descriptor = self.catalog.get_or_default(&current_model);
            let outcome = self.scheduler.select_account(&current_model, request_id).await;

            let account = match outcome {
                SelectOutcome::Selected(account) => account,
                SelectOutcome::Wait(wait) if wait <= self.max_wait_before_error => {
                    tokio::time::sleep(wait).await;
                    continue;
                }
                SelectOutcome::Wait(wait) => {
                    return Err(ProxyError::RateLimited {
                        message: format!("soonest account frees up in {wait:?}"),
                        retry_after: Some(wait),
                    });
                }
                SelectOutcome::Exhausted => {
                    tried.insert(current_model.clone());
                    if self.fallback_enabled {
                        if let Some(next_model) = self.catalog.fallback_for(&current_model) {
                            if !tried.contains(next_model) {
                                tracing::info!(from = %current_model, to = %next_model, "falling back to next model");
                                current_model = next_model.to_string();
                                continue;
                            }
                        }
                    }
                    self.scheduler.release(request_id).await;
                    return Err(ProxyError::service_unavailable(
                        format!("no account available for model '{current_model}'"),
                        None,
                    ));
                }
            };

            attempts_total += 1;
            let mut attempt_result = self
                .attempt(&account, &current_model, &descriptor, &request, streaming, request_id, false)
                .await;

            // §4.3 step 9 / §3: a 401 gets one same-account retry with a
            // forced token refresh before the account is given up on. Only
            // if that retry also fails does the account get marked invalid.
            if let Err(ProxyError::AuthenticationFailed { .. }) = &attempt_result {
                tracing::warn!(email = %account.email, model = %current_model, "authentication failed, retrying with forced token refresh");
                attempt_result = self
                    .attempt(&account, &current_model, &descriptor, &request, streaming, request_id, true)
                    .await;
                if let Err(err) = &attempt_result {
                    self.invalidate_account(&account, err).await;
                    self.scheduler.on_failure(&account.email, &current_model).await;
                    continue;
                }
            }

            match attempt_result {
                Ok(AttemptOutcome::Buffered(response)) => {
                    self.scheduler.on_success(&account.email, &current_model).await;
                    self.scheduler.release(request_id).await;
                    let mut response = response;
                    response.model = requested_model;
                    return Ok(Outcome::Buffered(response));
                }
                Ok(AttemptOutcome::Streaming(stream)) => {
                    self.scheduler.on_success(&account.email, &current_model).await;
                    let guarded = self.release_on_completion(stream, request_id);
                    return Ok(Outcome::Streaming(guarded));
                }
                Err(ProxyError::ValidationRequired { message, verify_url }) => {
                    // No forced-refresh retry here: upstream is asking for an
                    // out-of-band verification step, not a stale token.
                    let _ = self.health.mark_invalid(&account.email, message.clone(), verify_url.clone()).await;
                    self.scheduler.on_failure(&account.email, &current_model).await;
                }
                Err(err) => {
                    if !self.handle_attempt_error(&account, &current_model, &err).await {
                        self.scheduler.release(request_id).await;
                        return Err(err);
                    }
                }
            }
        }
    }

    /// Sets `is_invalid`/`invalid_reason` (and `verify_url` when present) on
    /// the account that just failed a forced-refresh retry.
    async fn invalidate_account(&self, account: &Account, err: &ProxyError) {
        let (reason, verify_url) = match err {
            ProxyError::ValidationRequired { message, verify_url } => (message.clone(), verify_url.clone()),
            other => (other.to_string(), None),
        };
        let _ = self.health.mark_invalid(&account.email, reason, verify_url).await;
    }

    /// Wraps a streaming attempt so `scheduler.release` runs once the stream
    /// is drained, or on early drop if the client disconnects mid-stream.
    fn release_on_completion(
        &self,
        stream: std::pin::Pin<Box<dyn Stream<Item = StreamEvent> + Send>>,
        request_id: &str,
    ) -> std::pin::Pin<Box<dyn Stream<Item = StreamEvent> + Send>> {
        let scheduler = self.scheduler.clone();
        let request_id = request_id.to_string();
        let wrapped = async_stream::stream! {
            let mut guard = ReleaseGuard::new(scheduler, request_id);
            let mut inner = stream;
            while let Some(item) = inner.next().await {
                yield item;
            }
            guard.release().await;
        };
        Box::pin(wrapped)
    }

    /// Applies §4.3 step 9's state updates for a failed attempt. Returns
    /// `true` if the controller should retry with another account/model.
    ///
    /// `AuthenticationFailed` and `ValidationRequired` never reach here: both
    /// are intercepted earlier in `handle` so the auth-retry/invalidate
    /// lifecycle runs exactly once per account.
    async fn handle_attempt_error(&self, account: &Account, model_id: &str, err: &ProxyError) -> bool {
        match err {
            ProxyError::RateLimited { retry_after, .. } | ProxyError::QuotaExhausted { retry_after, .. } => {
                let wait = chrono::Duration::from_std(retry_after.unwrap_or(Duration::from_secs(60)))
                    .unwrap_or_else(|_| chrono::Duration::zero());
                let reset = chrono::Utc::now() + wait;
                let _ = self.health.mark_rate_limited(&account.email, model_id, reset, "rate_limit").await;
                self.scheduler.on_rate_limit(&account.email, model_id).await;
                true
            }
            ProxyError::ServerError { .. } | ProxyError::NetworkError { .. } | ProxyError::Timeout { .. } => {
                let kind = if matches!(err, ProxyError::NetworkError { .. } | ProxyError::Timeout { .. }) {
                    FailureKind::Network
                } else {
                    FailureKind::Server
                };
                let _ = self.health.record_failure(&account.email, model_id, kind).await;
                self.scheduler.on_failure(&account.email, model_id).await;
                true
            }
            // client_error-equivalent kinds: do not retry, surface verbatim.
            ProxyError::InvalidRequest { .. }
            | ProxyError::PermissionDenied { .. }
            | ProxyError::NotImplemented { .. }
            | ProxyError::ServiceUnavailable { .. } => false,
            ProxyError::AuthenticationFailed { .. } | ProxyError::ValidationRequired { .. } => false,
        }
    }

    async fn attempt(
        &self,
        account: &Account,
        current_model: &str,
        descriptor: &crate::models::ModelDescriptor,
        request: &MessagesRequest,
        streaming: bool,
        request_id: &str,
        force_refresh: bool,
    ) -> Result<AttemptOutcome, ProxyError> {
        let access_token = self.token_provider.get_token(account, force_refresh).await?;
        let project = self.token_provider.get_project(account).await?.unwrap_or_default();

        let translator = self.translators.request_translator();
        let mut google_request = translator.translate(request, descriptor);
        if let Some(hint) = translator.interleaved_thinking_hint(descriptor, request) {
            let hint_part = crate::google::Part::text(hint);
            match &mut google_request.system_instruction {
                Some(sys) => sys.parts.push(hint_part),
                None => {
                    google_request.system_instruction = Some(crate::google::Content {
                        role: "system".to_string(),
                        parts: vec![hint_part],
                    })
                }
            }
        }

        let envelope = RequestEnvelope {
            project,
            model: current_model.to_string(),
            request: google_request,
            user_agent: "cloudcode-proxy".to_string(),
            request_id: request_id.to_string(),
        };

        let interleaved = descriptor.family == ModelFamily::Claude && descriptor.is_thinking;

        if !streaming {
            let response = self.transport.generate_content(&envelope, &access_token, interleaved).await?;
            let responder = self.translators.response_translator();
            let translated = responder.translate(&response, &request.model, descriptor.family);
            return Ok(AttemptOutcome::Buffered(translated));
        }

        let upstream = self.transport.stream_generate_content(&envelope, &access_token, interleaved).await?;
        let family = descriptor.family;
        let mode = self.thinking_tag_mode;
        let signature_cache_handle = self.translators.clone();
        let requested_model = request.model.clone();
        let request_id = request_id.to_string();

        let stream = async_stream::stream! {
            let mut parser = SseFrameParser::new();
            let mut translator = signature_cache_handle.stream_translator(mode);
            let mut started = false;
            let mut final_finish_reason: Option<String> = None;
            let mut has_tool_use = false;
            let mut output_tokens: i64 = 0;
            let mut upstream = upstream;

            loop {
                let chunk = match upstream.chunk().await {
                    Ok(Some(bytes)) => bytes,
                    Ok(None) => break,
                    Err(err) => {
                        yield StreamEvent::Error {
                            error: crate::error::AnthropicErrorBody {
                                error_type: "api_error",
                                message: format!("upstream stream read failed: {err}"),
                            },
                        };
                        return;
                    }
                };
                let text = String::from_utf8_lossy(&chunk).to_string();
                for frame in parser.feed(&text) {
                    if frame.data.is_empty() || frame.data == "[DONE]" {
                        continue;
                    }
                    let parsed: Result<crate::google::GenerateContentResponse, _> = serde_json::from_str(&frame.data);
                    let Ok(parsed_chunk) = parsed else {
                        tracing::warn!(request_id = %request_id, "skipping malformed SSE frame");
                        continue;
                    };

                    if !started {
                        let prompt_tokens = parsed_chunk
                            .usage_metadata
                            .map(|m| m.prompt_token_count)
                            .unwrap_or(0);
                        yield translator.message_start(&requested_model, prompt_tokens);
                        started = true;
                    }

                    if let Some(candidate) = parsed_chunk.candidates.first() {
                        if let Some(reason) = &candidate.finish_reason {
                            final_finish_reason = Some(reason.clone());
                        }
                        if let Some(content) = &candidate.content {
                            has_tool_use = has_tool_use || content.parts.iter().any(|p| p.function_call.is_some());
                        }
                    }
                    if let Some(usage) = &parsed_chunk.usage_metadata {
                        output_tokens = usage.candidates_token_count;
                    }

                    for event in translator.process_chunk(&parsed_chunk, family) {
                        yield event;
                    }
                }
            }

            if !started {
                yield translator.message_start(&requested_model, 0);
            }
            for event in translator.finish(final_finish_reason.as_deref(), has_tool_use, output_tokens) {
                yield event;
            }
        };

        Ok(AttemptOutcome::Streaming(Box::pin(stream)))
    }
}

enum AttemptOutcome {
    Buffered(MessagesResponse),
    Streaming(std::pin::Pin<Box<dyn Stream<Item = StreamEvent> + Send>>),
}

/// Guarantees `Scheduler::release` runs exactly once for a streamed request,
/// whether the stream drains normally or is dropped early (client disconnect).
struct ReleaseGuard {
    scheduler: Option<Arc<dyn Scheduler>>,
    request_id: String,
}

impl ReleaseGuard {
    fn new(scheduler: Arc<dyn Scheduler>, request_id: String) -> Self {
        Self { scheduler: Some(scheduler), request_id }
    }

    /// Releases immediately and disarms the drop handler.
    async fn release(&mut self) {
        if let Some(scheduler) = self.scheduler.take() {
            scheduler.release(&self.request_id).await;
        }
    }
}

impl Drop for ReleaseGuard {
    fn drop(&mut self) {
        if let Some(scheduler) = self.scheduler.take() {
            let request_id = std::mem::take(&mut self.request_id);
            tokio::spawn(async move {
                scheduler.release(&request_id).await;
            });
        }
    }
}
