//! Prometheus metrics for the pipeline.
//!
//! Metric names and labels are contractual; everything here is fed by
//! the orchestrator (and, for mid-stream read failures, the forward
//! client). Counters and histograms are lock-free on the hot path.

use std::sync::{Mutex, OnceLock};

use dashmap::DashSet;
use metrics::{counter, describe_counter, describe_histogram, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};

use crate::error::{Result, WafProxyError};

/// Latency buckets in seconds for `upstream_latency_seconds`.
const LATENCY_BUCKETS: [f64; 9] = [0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0];

/// Cap on distinct `client_ip` label values for the rate-limit
/// counter; everything beyond is bucketed as `other`.
const MAX_IP_LABELS: usize = 1024;

static HANDLE: Mutex<Option<PrometheusHandle>> = Mutex::new(None);

/// Install the process-wide Prometheus recorder, or return the handle
/// installed earlier. The registry is the only process-global in the
/// crate.
pub fn install_recorder() -> Result<PrometheusHandle> {
    let mut guard = HANDLE
        .lock()
        .map_err(|_| WafProxyError::Internal("metrics handle lock poisoned".to_string()))?;

    if let Some(handle) = guard.as_ref() {
        return Ok(handle.clone());
    }

    let handle = PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Full("upstream_latency_seconds".to_string()),
            &LATENCY_BUCKETS,
        )
        .map_err(|e| WafProxyError::Internal(format!("invalid metric buckets: {e}")))?
        .install_recorder()
        .map_err(|e| WafProxyError::Internal(format!("failed to install recorder: {e}")))?;

    describe_metrics();
    *guard = Some(handle.clone());
    Ok(handle)
}

fn describe_metrics() {
    describe_counter!("requests_total", "Total requests by verdict and status");
    describe_counter!("waf_rule_hits_total", "Total WAF rule hits by rule id");
    describe_counter!(
        "rate_limited_requests_total",
        "Total rate-limited requests by client IP"
    );
    describe_histogram!(
        "upstream_latency_seconds",
        "Latency of upstream requests in seconds"
    );
    describe_counter!("upstream_errors_total", "Total upstream errors by type");
    describe_counter!(
        "client_aborts_total",
        "Requests abandoned by the client before completion"
    );
}

pub fn record_request(verdict: &str, status: u16) {
    counter!(
        "requests_total",
        "verdict" => verdict.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

pub fn record_rule_hit(rule_id: &str) {
    counter!("waf_rule_hits_total", "rule_id" => rule_id.to_string()).increment(1);
}

/// Record a rate-limit rejection. Label cardinality is bounded: once
/// the tracked-IP set is full, new addresses share the `other` label.
pub fn record_rate_limited(client_ip: &str) {
    static SEEN_IPS: OnceLock<DashSet<String>> = OnceLock::new();
    let seen = SEEN_IPS.get_or_init(DashSet::new);

    let label = if seen.contains(client_ip) {
        client_ip.to_string()
    } else if seen.len() < MAX_IP_LABELS {
        seen.insert(client_ip.to_string());
        client_ip.to_string()
    } else {
        "other".to_string()
    };

    counter!("rate_limited_requests_total", "client_ip" => label).increment(1);
}

pub fn record_upstream_latency(seconds: f64) {
    histogram!("upstream_latency_seconds").record(seconds);
}

pub fn record_upstream_error(error_type: &str) {
    counter!("upstream_errors_total", "error_type" => error_type.to_string()).increment(1);
}

pub fn record_client_abort() {
    counter!("client_aborts_total").increment(1);
}
