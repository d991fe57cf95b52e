//! Upstream Transport (§4.5): the shared HTTP client, endpoint fallback list,
//! and SSE frame parser used against Google's `generateContent` surface.

use std::time::Duration;

use reqwest::{Client, StatusCode};

use crate::error::ProxyError;
use crate::google::{GenerateContentResponse, RequestEnvelope, GENERATE_CONTENT_PATH, STREAM_GENERATE_CONTENT_PATH};

const USER_AGENT: &str = "google-api-nodejs-client/9.15.1";
const CLIENT_HEADER: &str = "gl-node/20.0.0";

/// One shared client per process; connection pooling across requests.
pub fn build_client() -> reqwest::Result<Client> {
    Client::builder().user_agent(USER_AGENT).build()
}

pub struct UpstreamTransport {
    client: Client,
    endpoints: Vec<String>,
    request_timeout: Duration,
}

impl UpstreamTransport {
    pub fn new(client: Client, endpoints: Vec<String>, request_timeout: Duration) -> Self {
        Self { client, endpoints, request_timeout }
    }

    /// Buffered (non-streaming) call. Tries each endpoint in order until one
    /// returns a non-network status or all fail.
    pub async fn generate_content(
        &self,
        envelope: &RequestEnvelope,
        access_token: &str,
        interleaved_thinking: bool,
    ) -> Result<GenerateContentResponse, ProxyError> {
        let mut last_network_err: Option<ProxyError> = None;

        for base in &self.endpoints {
            let url = format!("{}/{}", base.trim_end_matches('/'), GENERATE_CONTENT_PATH);
            let mut request = self
                .client
                .post(&url)
                .bearer_auth(access_token)
                .header("x-goog-api-client", CLIENT_HEADER)
                .timeout(self.request_timeout)
                .json(envelope);
            if interleaved_thinking {
                request = request.header("anthropic-beta", crate::google::INTERLEAVED_THINKING_BETA);
            }

            let response = match request.send().await {
                Ok(response) => response,
                Err(err) => {
                    last_network_err = Some(classify_send_error(&err));
                    continue;
                }
            };

            let status = response.status();
            if status.is_success() {
                let body = response.text().await.map_err(|err| ProxyError::NetworkError {
                    message: format!("failed to read response body: {err}"),
                })?;
                return serde_json::from_str(&body).map_err(|err| ProxyError::ServerError {
                    message: format!("malformed upstream response: {err}"),
                });
            }

            // Non-network status: this endpoint answered, stop trying fallbacks
            // and classify the error instead of moving on.
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, &body));
        }

        Err(last_network_err.unwrap_or_else(|| ProxyError::ServiceUnavailable {
            message: "all upstream endpoints failed".to_string(),
            retry_after: None,
        }))
    }

    /// Streaming call: returns the raw response for the caller to decode as
    /// SSE frames via [`SseFrameParser`]. No per-request timeout is applied,
    /// matching the transport's policy of leaving streaming bodies unbounded.
    pub async fn stream_generate_content(
        &self,
        envelope: &RequestEnvelope,
        access_token: &str,
        interleaved_thinking: bool,
    ) -> Result<reqwest::Response, ProxyError> {
        let mut last_network_err: Option<ProxyError> = None;

        for base in &self.endpoints {
            let url = format!("{}/{}?alt=sse", base.trim_end_matches('/'), STREAM_GENERATE_CONTENT_PATH);
            let mut request = self
                .client
                .post(&url)
                .bearer_auth(access_token)
                .header("x-goog-api-client", CLIENT_HEADER)
                .json(envelope);
            if interleaved_thinking {
                request = request.header("anthropic-beta", crate::google::INTERLEAVED_THINKING_BETA);
            }

            let response = match request.send().await {
                Ok(response) => response,
                Err(err) => {
                    last_network_err = Some(classify_send_error(&err));
                    continue;
                }
            };

            let status = response.status();
            if status.is_success() {
                return Ok(response);
            }
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, &body));
        }

        Err(last_network_err.unwrap_or_else(|| ProxyError::ServiceUnavailable {
            message: "all upstream endpoints failed".to_string(),
            retry_after: None,
        }))
    }
}

fn classify_send_error(err: &reqwest::Error) -> ProxyError {
    if err.is_timeout() {
        ProxyError::Timeout { message: format!("upstream request timed out: {err}") }
    } else {
        ProxyError::NetworkError { message: format!("upstream request failed: {err}") }
    }
}

fn classify_status(status: StatusCode, body: &str) -> ProxyError {
    let message = truncate(body, 2000);
    match status {
        StatusCode::TOO_MANY_REQUESTS => ProxyError::RateLimited {
            message,
            retry_after: parse_quota_reset(body),
        },
        StatusCode::UNAUTHORIZED => ProxyError::AuthenticationFailed { message },
        StatusCode::FORBIDDEN => ProxyError::PermissionDenied { message },
        StatusCode::BAD_REQUEST => ProxyError::InvalidRequest { message },
        StatusCode::NOT_IMPLEMENTED => ProxyError::NotImplemented { message },
        s if s.is_server_error() => ProxyError::ServerError { message },
        _ => ProxyError::ServerError { message },
    }
}

fn truncate(body: &str, max: usize) -> String {
    if body.len() <= max {
        body.to_string()
    } else {
        format!("{}...", &body[..max])
    }
}

/// Extracts a `Retry-After`-equivalent duration from a Google 429 body's
/// "quota will reset after 1h0m0s" style message, when present.
fn parse_quota_reset(body: &str) -> Option<Duration> {
    let marker = "reset after ";
    let start = body.find(marker)? + marker.len();
    parse_go_duration(&body[start..])
}

/// Parses a Go-style duration prefix (`1h0m0s`, `90s`, `5m`) from the start
/// of `input`, ignoring any trailing characters.
fn parse_go_duration(input: &str) -> Option<Duration> {
    let mut total = Duration::ZERO;
    let mut number = String::new();
    let mut matched_any = false;
    for ch in input.chars() {
        if ch.is_ascii_digit() || ch == '.' {
            number.push(ch);
        } else if matches!(ch, 'h' | 'm' | 's') {
            let value: f64 = number.parse().ok()?;
            number.clear();
            matched_any = true;
            let unit_secs = match ch {
                'h' => 3600.0,
                'm' => 60.0,
                's' => 1.0,
                _ => unreachable!(),
            };
            total += Duration::from_secs_f64(value * unit_secs);
        } else {
            break;
        }
    }
    matched_any.then_some(total)
}

/// Splits an SSE byte stream on blank-line boundaries, decoding `event:`/`data:`
/// lines and ignoring comments (`:`-prefixed) and `:keep-alive`.
pub struct SseFrameParser {
    buffer: String,
}

#[derive(Debug, Clone, Default)]
pub struct SseFrame {
    pub event: Option<String>,
    pub data: String,
}

impl SseFrameParser {
    pub fn new() -> Self {
        Self { buffer: String::new() }
    }

    /// Feed newly received bytes; returns any complete frames found so far.
    pub fn feed(&mut self, chunk: &str) -> Vec<SseFrame> {
        self.buffer.push_str(chunk);
        let mut frames = Vec::new();

        while let Some(boundary) = find_blank_line(&self.buffer) {
            let raw_frame: String = self.buffer.drain(..boundary).collect();
            // Drop the blank-line separator itself.
            let sep_len = if self.buffer.starts_with("\r\n") { 2 } else { 1 };
            self.buffer.drain(..sep_len);

            if let Some(frame) = parse_frame(&raw_frame) {
                frames.push(frame);
            }
        }

        frames
    }
}

impl Default for SseFrameParser {
    fn default() -> Self {
        Self::new()
    }
}

fn find_blank_line(buffer: &str) -> Option<usize> {
    if let Some(pos) = buffer.find("\n\n") {
        return Some(pos);
    }
    buffer.find("\r\n\r\n")
}

fn parse_frame(raw: &str) -> Option<SseFrame> {
    let mut frame = SseFrame::default();
    let mut data_lines = Vec::new();
    let mut saw_field = false;

    for line in raw.lines() {
        if line.is_empty() || line.starts_with(':') {
            continue; // comment, e.g. `:keep-alive`
        }
        if let Some(value) = line.strip_prefix("event:") {
            frame.event = Some(value.trim().to_string());
            saw_field = true;
        } else if let Some(value) = line.strip_prefix("data:") {
            data_lines.push(value.trim_start().to_string());
            saw_field = true;
        }
        // Malformed lines (no recognized field) are silently skipped, not fatal.
    }

    if !saw_field {
        return None;
    }
    frame.data = data_lines.join("\n");
    Some(frame)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_quota_reset_duration() {
        let body = "quota will reset after 1h0m0s, please retry";
        assert_eq!(parse_quota_reset(body), Some(Duration::from_secs(3600)));
    }

    #[test]
    fn sse_parser_splits_frames_on_blank_lines() {
        let mut parser = SseFrameParser::new();
        let frames = parser.feed("event: message_start\ndata: {\"a\":1}\n\nevent: message_stop\ndata: {}\n\n");
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].event.as_deref(), Some("message_start"));
        assert_eq!(frames[1].data, "{}");
    }

    #[test]
    fn sse_parser_buffers_partial_frames_across_feeds() {
        let mut parser = SseFrameParser::new();
        let frames = parser.feed("event: message_start\ndata: {\"a\"");
        assert!(frames.is_empty());
        let frames = parser.feed(":1}\n\n");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].data, "{\"a\":1}");
    }

    #[test]
    fn sse_parser_ignores_keepalive_comments() {
        let mut parser = SseFrameParser::new();
        let frames = parser.feed(":keep-alive\n\nevent: message_stop\ndata: {}\n\n");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].event.as_deref(), Some("message_stop"));
    }
}
