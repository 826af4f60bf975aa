//! Structured access logging.
//!
//! One JSON object per completed request, written to stdout at request
//! completion. Diagnostic logging goes through `tracing`; this file
//! only owns the per-request access line whose keys are contractual.

use chrono::{SecondsFormat, Utc};
use serde::Serialize;

use crate::waf::Verdict;

/// At most this many rule ids appear in a single log line.
const MAX_LOGGED_RULE_IDS: usize = 16;

/// A single access-log line.
#[derive(Debug, Serialize)]
pub struct RequestLog<'a> {
    pub timestamp: String,
    pub level: &'static str,
    pub request_id: String,
    pub client_ip: String,
    pub method: &'a str,
    pub path: &'a str,
    pub verdict: String,
    pub score: u32,
    pub rule_ids: &'a [String],
    pub upstream: Option<&'a str>,
    pub status: u16,
    pub latency_ms: u64,
}

/// Writes one JSON object per request to stdout.
pub struct AccessLogger;

impl AccessLogger {
    pub fn new() -> Self {
        Self
    }

    #[allow(clippy::too_many_arguments)]
    pub fn log_request(
        &self,
        request_id: &uuid::Uuid,
        client_ip: &std::net::IpAddr,
        method: &str,
        path: &str,
        verdict: Verdict,
        score: u32,
        rule_ids: &[String],
        upstream: Option<&str>,
        status: u16,
        latency_ms: u64,
    ) {
        let truncated = &rule_ids[..rule_ids.len().min(MAX_LOGGED_RULE_IDS)];

        let entry = RequestLog {
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            level: if verdict == Verdict::Block { "WARN" } else { "INFO" },
            request_id: request_id.to_string(),
            client_ip: client_ip.to_string(),
            method,
            path,
            verdict: verdict.to_string(),
            score,
            rule_ids: truncated,
            upstream,
            status,
            latency_ms,
        };

        match serde_json::to_string(&entry) {
            Ok(line) => println!("{line}"),
            Err(e) => tracing::error!("failed to serialize access log entry: {e}"),
        }
    }
}

impl Default for AccessLogger {
    fn default() -> Self {
        Self::new()
    }
}
