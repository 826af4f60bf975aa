pub mod engine;
pub mod normalize;
pub mod rate_limiter;

use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;
use std::time::Instant;

use uuid::Uuid;

pub use engine::SecurityEngine;
pub use rate_limiter::RateLimiter;

/// Three-valued outcome of rule evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Allow,
    Suspicious,
    Block,
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verdict::Allow => write!(f, "ALLOW"),
            Verdict::Suspicious => write!(f, "SUSPICIOUS"),
            Verdict::Block => write!(f, "BLOCK"),
        }
    }
}

/// Outcome of an evaluation pass.
///
/// `verdict` is what the rules decided and is what logs and metrics
/// record; `effective` is what the pipeline enforces. The two differ
/// only in monitor mode, where BLOCK is softened to SUSPICIOUS for
/// forwarding purposes.
#[derive(Debug, Clone)]
pub struct Decision {
    pub verdict: Verdict,
    pub effective: Verdict,
    pub score: u32,
    pub rule_hits: Vec<String>,
}

impl Decision {
    pub fn allow() -> Self {
        Self {
            verdict: Verdict::Allow,
            effective: Verdict::Allow,
            score: 0,
            rule_hits: Vec::new(),
        }
    }
}

/// Per-request context, exclusively owned by the handling task and
/// dropped when the response is flushed.
#[derive(Debug)]
pub struct RequestContext {
    pub request_id: Uuid,
    pub client_ip: IpAddr,
    /// Whether the transport peer fell inside a trusted CIDR; governs
    /// what happens to the inbound X-Forwarded-For on the way out.
    pub peer_trusted: bool,
    pub method: String,
    /// Path exactly as the client sent it; the upstream sees this form.
    pub path_raw: String,
    /// Percent-decoded once, NULs stripped, backslashes folded. Rules
    /// inspect this form so traversal sequences stay visible.
    pub path_decoded: String,
    /// Slash-collapsed, dot-resolved form used for routing and logging.
    /// Paths that would resolve above root are left unrewritten.
    pub path_norm: String,
    pub query_raw: String,
    pub query_norm: String,
    /// Canonical lower-cased subset the rule engine may reference.
    pub headers: HashMap<String, String>,
    pub start: Instant,
}

impl RequestContext {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }
}
