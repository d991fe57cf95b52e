//! Proxy error kinds with HTTP/Anthropic-envelope rendering and retry classification.
//!
//! Distinguishes transient errors (retry with another account) from permanent
//! ones (surface to the caller verbatim).

use std::time::Duration;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

/// Error from the request path: scheduling, transport, or translation.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("rate limited: {message}")]
    RateLimited {
        message: String,
        retry_after: Option<Duration>,
    },

    #[error("quota exhausted: {message}")]
    QuotaExhausted {
        message: String,
        retry_after: Option<Duration>,
    },

    #[error("authentication failed: {message}")]
    AuthenticationFailed { message: String },

    #[error("validation required: {message}")]
    ValidationRequired {
        message: String,
        verify_url: Option<String>,
    },

    #[error("invalid request: {message}")]
    InvalidRequest { message: String },

    #[error("permission denied: {message}")]
    PermissionDenied { message: String },

    #[error("server error: {message}")]
    ServerError { message: String },

    #[error("network error: {message}")]
    NetworkError { message: String },

    #[error("upstream timeout: {message}")]
    Timeout { message: String },

    #[error("service unavailable: {message}")]
    ServiceUnavailable {
        message: String,
        retry_after: Option<Duration>,
    },

    #[error("not implemented: {message}")]
    NotImplemented { message: String },
}

impl ProxyError {
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest {
            message: message.into(),
        }
    }

    pub fn service_unavailable(message: impl Into<String>, retry_after: Option<Duration>) -> Self {
        Self::ServiceUnavailable {
            message: message.into(),
            retry_after,
        }
    }

    /// Whether a failover loop should try another account/model for this error,
    /// as opposed to surfacing it to the caller immediately.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::RateLimited { .. }
                | Self::QuotaExhausted { .. }
                | Self::ServerError { .. }
                | Self::NetworkError { .. }
                | Self::Timeout { .. }
        )
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after, .. }
            | Self::QuotaExhausted { retry_after, .. }
            | Self::ServiceUnavailable { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            Self::RateLimited { .. } | Self::QuotaExhausted { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::AuthenticationFailed { .. } => StatusCode::UNAUTHORIZED,
            Self::ValidationRequired { .. } | Self::PermissionDenied { .. } => StatusCode::FORBIDDEN,
            Self::InvalidRequest { .. } => StatusCode::BAD_REQUEST,
            Self::ServerError { .. } | Self::NetworkError { .. } | Self::Timeout { .. } => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            Self::ServiceUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::NotImplemented { .. } => StatusCode::NOT_IMPLEMENTED,
        }
    }

    /// Anthropic error `type` discriminant (`error.type` in the envelope).
    fn anthropic_type(&self) -> &'static str {
        match self {
            Self::RateLimited { .. } => "rate_limit_error",
            Self::QuotaExhausted { .. } => "rate_limit_error",
            Self::AuthenticationFailed { .. } => "authentication_error",
            Self::ValidationRequired { .. } => "permission_error",
            Self::InvalidRequest { .. } => "invalid_request_error",
            Self::PermissionDenied { .. } => "permission_error",
            Self::ServerError { .. } => "api_error",
            Self::NetworkError { .. } => "api_error",
            Self::Timeout { .. } => "api_error",
            Self::ServiceUnavailable { .. } => "overloaded_error",
            Self::NotImplemented { .. } => "invalid_request_error",
        }
    }

    fn message(&self) -> String {
        match self {
            Self::RateLimited { message, .. }
            | Self::QuotaExhausted { message, .. }
            | Self::AuthenticationFailed { message }
            | Self::ValidationRequired { message, .. }
            | Self::InvalidRequest { message }
            | Self::PermissionDenied { message }
            | Self::ServerError { message }
            | Self::NetworkError { message }
            | Self::Timeout { message }
            | Self::ServiceUnavailable { message, .. }
            | Self::NotImplemented { message } => message.clone(),
        }
    }

    /// Render as the Anthropic error envelope body.
    pub fn to_envelope(&self) -> AnthropicErrorEnvelope {
        AnthropicErrorEnvelope {
            envelope_type: "error",
            error: AnthropicErrorBody {
                error_type: self.anthropic_type(),
                message: self.message(),
            },
        }
    }
}

#[derive(Debug, Serialize)]
pub struct AnthropicErrorBody {
    #[serde(rename = "type")]
    pub error_type: &'static str,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct AnthropicErrorEnvelope {
    #[serde(rename = "type")]
    pub envelope_type: &'static str,
    pub error: AnthropicErrorBody,
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let status = self.status();
        let retry_after = self.retry_after();
        let envelope = self.to_envelope();
        let mut response = (status, axum::Json(envelope)).into_response();
        if let Some(delay) = retry_after {
            if let Ok(value) = axum::http::HeaderValue::from_str(&delay.as_secs().to_string()) {
                response.headers_mut().insert(axum::http::header::RETRY_AFTER, value);
            }
        }
        response
    }
}
