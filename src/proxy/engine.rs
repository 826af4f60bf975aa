//! Middleware orchestrator: the request pipeline.
//!
//! Sequences normalizer, IP gates, rate limiter, rule engine, router
//! and forward client in the fixed order, stamps the decision headers
//! on every exit, and owns the observability sidechannels. Admin
//! endpoints (`/healthz`, `/readyz`, `/metrics`) are matched before the
//! pipeline fallback and never touch WAF logic.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::{ConnectInfo, Request, State},
    http::{header, HeaderMap, HeaderValue},
    response::{IntoResponse, Json, Response},
    routing::get,
};
use ipnet::IpNet;
use metrics_exporter_prometheus::PrometheusHandle;
use serde_json::json;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::{Config, ServerConfig};
use crate::error::{Result, WafProxyError};
use crate::observability::{metrics, AccessLogger};
use crate::waf::engine::IpGate;
use crate::waf::normalize::{
    decode_path, extract_header_subset, normalize_path, normalize_query, resolve_client_ip,
};
use crate::waf::{Decision, RateLimiter, RequestContext, SecurityEngine, Verdict};

use super::client::ForwardClient;
use super::headers::{apply_forwarding_headers, filter_request_headers};
use super::router::Router;

/// Counts a client abort unless the pipeline reached a normal exit.
/// Dropping the handler future mid-flight (the client went away) runs
/// this without a disarm, which also cancels the upstream call.
struct AbortGuard {
    armed: bool,
}

impl AbortGuard {
    fn new() -> Self {
        Self { armed: true }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for AbortGuard {
    fn drop(&mut self) {
        if self.armed {
            metrics::record_client_abort();
        }
    }
}

/// The reverse proxy: long-lived, shared by every connection.
pub struct ReverseProxy {
    security: SecurityEngine,
    limiter: Arc<RateLimiter>,
    router: Router,
    client: ForwardClient,
    logger: AccessLogger,
    trusted_proxies: Vec<IpNet>,
    max_body_bytes: u64,
    metrics_handle: PrometheusHandle,
}

impl std::fmt::Debug for ReverseProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReverseProxy").finish_non_exhaustive()
    }
}

impl ReverseProxy {
    pub fn new(config: &Config) -> Result<Self> {
        Ok(Self {
            security: SecurityEngine::new(config)?,
            limiter: Arc::new(RateLimiter::new(&config.rate_limits)),
            router: Router::new(&config.upstreams),
            client: ForwardClient::new(&config.proxy_settings)?,
            logger: AccessLogger::new(),
            trusted_proxies: config.trusted_proxy_nets()?,
            max_body_bytes: config.waf_settings.max_body_bytes,
            metrics_handle: metrics::install_recorder()?,
        })
    }

    pub fn rate_limiter(&self) -> Arc<RateLimiter> {
        self.limiter.clone()
    }

    /// Build the axum application: admin routes first, everything else
    /// falls through to the pipeline.
    pub fn app(self: &Arc<Self>) -> axum::Router {
        let handle = self.metrics_handle.clone();

        axum::Router::new()
            .route("/healthz", get(|| async { Json(json!({"status": "healthy"})) }))
            .route("/readyz", get(|| async { Json(json!({"status": "ready"})) }))
            .route(
                "/metrics",
                get(move || {
                    let handle = handle.clone();
                    async move {
                        (
                            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
                            handle.render(),
                        )
                    }
                }),
            )
            .fallback(pipeline_entry)
            .layer(TraceLayer::new_for_http())
            .with_state(self.clone())
    }

    /// Bind and serve until the shutdown future resolves.
    pub async fn serve<F>(self: Arc<Self>, server: &ServerConfig, shutdown: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let addr = format!("{}:{}", server.host, server.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| WafProxyError::Internal(format!("failed to bind {addr}: {e}")))?;

        info!(%addr, "reverse proxy listening");

        axum::serve(
            listener,
            self.app().into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| WafProxyError::Internal(format!("server error: {e}")))
    }

    /// The pipeline for one request. Every exit goes through `finish`,
    /// which stamps the decision headers and records exactly one log
    /// line and one request metric.
    pub async fn handle(&self, req: Request, peer: IpAddr) -> Response {
        let guard = AbortGuard::new();
        let (parts, body) = req.into_parts();

        let forwarded_for = parts
            .headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok());
        let (client_ip, peer_trusted) =
            resolve_client_ip(peer, &self.trusted_proxies, forwarded_for);

        let path_raw = parts.uri.path().to_string();
        let path_decoded = decode_path(&path_raw);
        let path_norm = normalize_path(&path_decoded);
        let query_raw = parts.uri.query().unwrap_or("").to_string();

        let ctx = RequestContext {
            request_id: Uuid::new_v4(),
            client_ip,
            peer_trusted,
            method: parts.method.to_string(),
            path_raw,
            path_decoded,
            path_norm,
            query_norm: normalize_query(&query_raw),
            query_raw,
            headers: extract_header_subset(&parts.headers),
            start: Instant::now(),
        };

        // Body size gate, header-declared only: the body itself streams.
        let declared = match declared_content_length(&parts.headers) {
            Ok(declared) => declared,
            Err(e) => return self.finish(&ctx, &Decision::allow(), None, e.into_response(), guard),
        };
        if declared.is_some_and(|len| len > self.max_body_bytes) {
            warn!(request_id = %ctx.request_id, "request body exceeds limit");
            return self.finish(
                &ctx,
                &Decision::allow(),
                None,
                WafProxyError::PayloadTooLarge.into_response(),
                guard,
            );
        }

        // IP policy gates, then admission, then rules.
        let decision = match self.security.check_ip(client_ip) {
            Some(IpGate::Allow) => Decision::allow(),
            Some(IpGate::Block) => {
                let decision = self.security.blocklist_decision();
                if decision.effective == Verdict::Block {
                    warn!(request_id = %ctx.request_id, %client_ip, "blocklisted peer");
                    return self.finish_blocked(&ctx, decision, guard);
                }
                decision
            }
            None => {
                if !self.limiter.admit(&client_ip.to_string(), &ctx.path_norm) {
                    metrics::record_rate_limited(&client_ip.to_string());
                    return self.finish(
                        &ctx,
                        &Decision::allow(),
                        None,
                        WafProxyError::RateLimited.into_response(),
                        guard,
                    );
                }

                let decision = self.security.evaluate(&ctx);
                for rule_id in &decision.rule_hits {
                    metrics::record_rule_hit(rule_id);
                }
                if decision.effective == Verdict::Block {
                    return self.finish_blocked(&ctx, decision, guard);
                }
                decision
            }
        };

        // Routing over the normalized path.
        let host = ctx.header("host").map(str::to_string);
        let Some(upstream) = self.router.route(host.as_deref(), &ctx.path_norm) else {
            warn!(request_id = %ctx.request_id, "no upstream for request");
            return self.finish(
                &ctx,
                &decision,
                None,
                WafProxyError::UpstreamUnavailable.into_response(),
                guard,
            );
        };

        // Outbound header hygiene and forwarding identity.
        let mut outbound = filter_request_headers(&parts.headers);
        apply_forwarding_headers(
            &mut outbound,
            client_ip,
            peer_trusted,
            parts.uri.scheme_str().unwrap_or("http"),
            host.as_deref(),
        );
        if decision.effective == Verdict::Suspicious {
            mark_suspicious(&mut outbound, &decision);
        }

        let body = declared_body(&parts.headers).then_some(body);

        let forward_started = Instant::now();
        let result = self
            .client
            .forward(
                &upstream,
                parts.method.clone(),
                &ctx.path_raw,
                &ctx.query_raw,
                outbound,
                body,
            )
            .await;

        match result {
            Ok(response) => {
                metrics::record_upstream_latency(forward_started.elapsed().as_secs_f64());
                self.finish(&ctx, &decision, Some(&upstream.name), response, guard)
            }
            Err(e) => {
                warn!(request_id = %ctx.request_id, upstream = %upstream.name, error = %e, "forward failed");
                metrics::record_upstream_error(e.kind.as_str());
                let response = WafProxyError::from(e).into_response();
                self.finish(&ctx, &decision, Some(&upstream.name), response, guard)
            }
        }
    }

    fn finish_blocked(&self, ctx: &RequestContext, decision: Decision, guard: AbortGuard) -> Response {
        let response = WafProxyError::VerdictBlock {
            score: decision.score,
            rule_ids: decision.rule_hits.clone(),
        }
        .into_response();
        self.finish(ctx, &decision, None, response, guard)
    }

    /// Single exit funnel: decision headers on every response, one
    /// access-log line, one `requests_total` increment.
    fn finish(
        &self,
        ctx: &RequestContext,
        decision: &Decision,
        upstream: Option<&str>,
        mut response: Response,
        guard: AbortGuard,
    ) -> Response {
        guard.disarm();
        stamp_decision_headers(response.headers_mut(), ctx.request_id, decision);

        let status = response.status().as_u16();
        metrics::record_request(&decision.verdict.to_string(), status);
        self.logger.log_request(
            &ctx.request_id,
            &ctx.client_ip,
            &ctx.method,
            &ctx.path_norm,
            decision.verdict,
            decision.score,
            &decision.rule_hits,
            upstream,
            status,
            ctx.start.elapsed().as_millis() as u64,
        );

        response
    }
}

async fn pipeline_entry(
    State(proxy): State<Arc<ReverseProxy>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    req: Request,
) -> Response {
    proxy.handle(req, peer.ip()).await
}

fn stamp_decision_headers(headers: &mut HeaderMap, request_id: Uuid, decision: &Decision) {
    if let Ok(value) = HeaderValue::from_str(&decision.verdict.to_string()) {
        headers.insert("x-waf-decision", value);
    }
    if let Ok(value) = HeaderValue::from_str(&decision.score.to_string()) {
        headers.insert("x-waf-score", value);
    }
    if let Ok(value) = HeaderValue::from_str(&request_id.to_string()) {
        headers.insert("x-request-id", value);
    }
}

/// Marker headers carried to the upstream for suspicious traffic.
fn mark_suspicious(headers: &mut HeaderMap, decision: &Decision) {
    headers.insert(
        "x-waf-decision",
        HeaderValue::from_static("SUSPICIOUS"),
    );
    if let Ok(value) = HeaderValue::from_str(&decision.score.to_string()) {
        headers.insert("x-waf-score", value);
    }
}

fn declared_content_length(headers: &HeaderMap) -> Result<Option<u64>> {
    match headers.get(header::CONTENT_LENGTH) {
        None => Ok(None),
        Some(value) => value
            .to_str()
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .map(Some)
            .ok_or_else(|| {
                WafProxyError::RequestMalformed("invalid content-length".to_string())
            }),
    }
}

/// Whether the inbound request declared a body worth streaming.
fn declared_body(headers: &HeaderMap) -> bool {
    let has_length = headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse::<u64>().ok())
        .is_some_and(|len| len > 0);
    has_length || headers.contains_key(header::TRANSFER_ENCODING)
}
