use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Application-wide error taxonomy.
///
/// Every variant maps to exactly one client-facing status code; nothing
/// here ever carries a stack trace across the wire.
#[derive(Error, Debug)]
pub enum WafProxyError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("malformed request: {0}")]
    RequestMalformed(String),

    #[error("request blocked by WAF (score {score})")]
    VerdictBlock { score: u32, rule_ids: Vec<String> },

    #[error("rate limit exceeded")]
    RateLimited,

    #[error("request body too large")]
    PayloadTooLarge,

    #[error("no upstream available")]
    UpstreamUnavailable,

    #[error("upstream timeout: {0}")]
    UpstreamTimeout(String),

    #[error("upstream connect failed: {0}")]
    UpstreamConnect(String),

    #[error("upstream read failed: {0}")]
    UpstreamRead(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl WafProxyError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            WafProxyError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            WafProxyError::RequestMalformed(_) => StatusCode::BAD_REQUEST,
            WafProxyError::VerdictBlock { .. } => StatusCode::FORBIDDEN,
            WafProxyError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            WafProxyError::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            WafProxyError::UpstreamUnavailable => StatusCode::BAD_GATEWAY,
            WafProxyError::UpstreamTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            WafProxyError::UpstreamConnect(_) => StatusCode::BAD_GATEWAY,
            WafProxyError::UpstreamRead(_) => StatusCode::BAD_GATEWAY,
            WafProxyError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            WafProxyError::Config(_) => "config_error",
            WafProxyError::RequestMalformed(_) => "bad_request",
            WafProxyError::VerdictBlock { .. } => "waf_blocked",
            WafProxyError::RateLimited => "rate_limited",
            WafProxyError::PayloadTooLarge => "payload_too_large",
            WafProxyError::UpstreamUnavailable => "no_upstream",
            WafProxyError::UpstreamTimeout(_) => "upstream_timeout",
            WafProxyError::UpstreamConnect(_) => "upstream_connect",
            WafProxyError::UpstreamRead(_) => "upstream_read",
            WafProxyError::Internal(_) => "internal_error",
        }
    }

    /// True for errors that must refuse startup (exit code 2).
    pub fn is_config_fatal(&self) -> bool {
        matches!(self, WafProxyError::Config(_))
    }
}

impl IntoResponse for WafProxyError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        let body = match &self {
            // Contractual block body: exactly these four keys.
            WafProxyError::VerdictBlock { score, rule_ids } => json!({
                "blocked": true,
                "reason": "waf",
                "score": score,
                "rule_ids": rule_ids,
            }),
            WafProxyError::RateLimited => json!({
                "error": "rate_limited",
            }),
            other => json!({
                "error": other.error_code(),
            }),
        };

        (status, Json(body)).into_response()
    }
}

pub type Result<T> = std::result::Result<T, WafProxyError>;
