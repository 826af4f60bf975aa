//! Streaming forward client.
//!
//! One shared `reqwest::Client` carries every upstream call: bounded
//! connection pool, keep-alive expiry, and a total request timeout
//! covering connect, response headers and body. Bodies stream in both
//! directions; nothing is materialized in memory.

use std::fmt;
use std::time::Duration;

use axum::body::Body;
use axum::http::{HeaderMap, Method};
use axum::response::Response;
use futures::TryStreamExt;
use tracing::debug;

use crate::config::ProxySettings;
use crate::error::{Result, WafProxyError};
use crate::observability::metrics;

use super::headers::filter_response_headers;
use super::router::Upstream;

/// Classified forward failure; each kind maps to its own metric label
/// and client status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardErrorKind {
    /// Total request deadline exceeded -> 504.
    Timeout,
    /// DNS, TCP or TLS failure before the request got out -> 502.
    Connect,
    /// Upstream died or truncated after the request was sent -> 502,
    /// or a torn client connection if headers already left.
    Read,
}

impl ForwardErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ForwardErrorKind::Timeout => "timeout",
            ForwardErrorKind::Connect => "connect",
            ForwardErrorKind::Read => "read",
        }
    }
}

#[derive(Debug)]
pub struct ForwardError {
    pub kind: ForwardErrorKind,
    message: String,
}

impl fmt::Display for ForwardError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind.as_str(), self.message)
    }
}

impl From<ForwardError> for WafProxyError {
    fn from(e: ForwardError) -> Self {
        match e.kind {
            ForwardErrorKind::Timeout => WafProxyError::UpstreamTimeout(e.message),
            ForwardErrorKind::Connect => WafProxyError::UpstreamConnect(e.message),
            ForwardErrorKind::Read => WafProxyError::UpstreamRead(e.message),
        }
    }
}

/// Where the forward was when it failed. The dial and header phases
/// surface as `send()` errors; the response-stream phase can only fail
/// after headers have been relayed.
#[derive(Debug, Clone, Copy)]
enum ForwardPhase {
    Dialing,
    Streaming,
}

fn classify(e: &reqwest::Error, phase: ForwardPhase) -> ForwardErrorKind {
    if e.is_timeout() {
        ForwardErrorKind::Timeout
    } else if e.is_connect() {
        ForwardErrorKind::Connect
    } else {
        match phase {
            ForwardPhase::Dialing => ForwardErrorKind::Connect,
            ForwardPhase::Streaming => ForwardErrorKind::Read,
        }
    }
}

/// Shared outbound HTTP client.
pub struct ForwardClient {
    client: reqwest::Client,
}

impl ForwardClient {
    pub fn new(settings: &ProxySettings) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs_f64(settings.timeout_seconds))
            .connect_timeout(Duration::from_secs_f64(settings.connect_timeout_seconds))
            .pool_max_idle_per_host(settings.max_keepalive_connections)
            .pool_idle_timeout(Duration::from_secs_f64(settings.keepalive_expiry_seconds))
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| WafProxyError::Internal(format!("failed to build HTTP client: {e}")))?;

        Ok(Self { client })
    }

    /// Forward a request to the chosen upstream and hand back a
    /// streaming response.
    ///
    /// The caller passes the raw path and query (the upstream must see
    /// exactly what the client sent) and headers that already went
    /// through hop-by-hop filtering and `X-Forwarded-*` synthesis.
    /// Errors before response headers are returned as `ForwardError`;
    /// mid-stream errors after that are recorded against the read/
    /// timeout metric from inside the relayed body stream.
    pub async fn forward(
        &self,
        upstream: &Upstream,
        method: Method,
        path_raw: &str,
        query_raw: &str,
        headers: HeaderMap,
        body: Option<Body>,
    ) -> std::result::Result<Response, ForwardError> {
        let url = build_upstream_url(&upstream.base_url, path_raw, query_raw);
        debug!(%url, "forwarding request");

        let mut request = self.client.request(method, &url).headers(headers);
        if let Some(body) = body {
            request = request.body(reqwest::Body::wrap_stream(body.into_data_stream()));
        }

        let upstream_response = request.send().await.map_err(|e| ForwardError {
            kind: classify(&e, ForwardPhase::Dialing),
            message: e.to_string(),
        })?;

        let status = upstream_response.status();
        let response_headers = filter_response_headers(upstream_response.headers());

        // Headers are committed once we return; stream failures after
        // this point tear the client connection and are recorded here.
        let body_stream = upstream_response.bytes_stream().map_err(|e| {
            let kind = classify(&e, ForwardPhase::Streaming);
            metrics::record_upstream_error(kind.as_str());
            axum::Error::new(e)
        });

        let mut builder = Response::builder().status(status);
        if let Some(header_map) = builder.headers_mut() {
            *header_map = response_headers;
        }

        builder
            .body(Body::from_stream(body_stream))
            .map_err(|e| ForwardError {
                kind: ForwardErrorKind::Read,
                message: e.to_string(),
            })
    }
}

fn build_upstream_url(base_url: &str, path: &str, query: &str) -> String {
    let base = base_url.trim_end_matches('/');
    if query.is_empty() {
        format!("{base}{path}")
    } else {
        format!("{base}{path}?{query}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_upstream_url_from_raw_parts() {
        assert_eq!(
            build_upstream_url("http://app:9000/", "/a/b", ""),
            "http://app:9000/a/b"
        );
        assert_eq!(
            build_upstream_url("http://app:9000", "/a", "q=1&q=2"),
            "http://app:9000/a?q=1&q=2"
        );
        // Raw (still encoded) forms pass through untouched.
        assert_eq!(
            build_upstream_url("http://app:9000", "/%2e%2e/x", "v=%27"),
            "http://app:9000/%2e%2e/x?v=%27"
        );
    }

    #[test]
    fn error_kinds_map_to_statuses() {
        let err = WafProxyError::from(ForwardError {
            kind: ForwardErrorKind::Timeout,
            message: "deadline".into(),
        });
        assert_eq!(err.status_code(), axum::http::StatusCode::GATEWAY_TIMEOUT);

        let err = WafProxyError::from(ForwardError {
            kind: ForwardErrorKind::Connect,
            message: "refused".into(),
        });
        assert_eq!(err.status_code(), axum::http::StatusCode::BAD_GATEWAY);

        let err = WafProxyError::from(ForwardError {
            kind: ForwardErrorKind::Read,
            message: "truncated".into(),
        });
        assert_eq!(err.status_code(), axum::http::StatusCode::BAD_GATEWAY);
    }
}
