//! Per-client token-bucket rate limiting.
//!
//! One bucket per client IP (or per IP + path prefix when an override
//! applies), capacity `requests_per_minute`, refilled continuously at
//! capacity/60 tokens per second. Admission holds the shard guard for
//! the key across the refill and the compare-and-decrement, so two
//! racing requests from the same client can never both spend the last
//! token; distinct keys proceed in parallel on separate shards.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use tracing::debug;

use crate::config::RateLimitConfig;

/// How long a full, untouched bucket may linger before the reaper
/// removes it.
pub const BUCKET_IDLE_TTL: Duration = Duration::from_secs(300);

#[derive(Debug)]
struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(capacity: f64, now: Instant) -> Self {
        Self {
            tokens: capacity,
            last_refill: now,
        }
    }

    /// Refill for the elapsed time, then try to spend one token.
    fn admit(&mut self, capacity: f64, refill_per_sec: f64, now: Instant) -> bool {
        let elapsed = now.saturating_duration_since(self.last_refill);
        self.tokens = capacity.min(self.tokens + elapsed.as_secs_f64() * refill_per_sec);
        self.last_refill = now;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// Async-safe in-memory rate limiter. State is process-local and lost
/// on restart by design.
pub struct RateLimiter {
    default_capacity: f64,
    /// Path-prefix overrides, longest prefix first.
    overrides: Vec<(String, f64)>,
    buckets: DashMap<String, TokenBucket>,
}

impl RateLimiter {
    pub fn new(config: &RateLimitConfig) -> Self {
        let mut overrides: Vec<(String, f64)> = config
            .per_path
            .iter()
            .map(|(prefix, rpm)| (prefix.clone(), f64::from(*rpm)))
            .collect();
        overrides.sort_by(|a, b| b.0.len().cmp(&a.0.len()));

        Self {
            default_capacity: f64::from(config.requests_per_minute),
            overrides,
            buckets: DashMap::new(),
        }
    }

    /// Admission check for one request. Returns false when the client
    /// is out of tokens.
    pub fn admit(&self, client_ip: &str, path: &str) -> bool {
        let (key, capacity) = match self.override_for(path) {
            Some((prefix, capacity)) => (format!("{client_ip}:{prefix}"), capacity),
            None => (client_ip.to_string(), self.default_capacity),
        };

        let refill_per_sec = capacity / 60.0;
        let now = Instant::now();

        // The entry guard is the per-key lock: refill and decrement
        // happen under it.
        let mut bucket = self
            .buckets
            .entry(key)
            .or_insert_with(|| TokenBucket::new(capacity, now));
        bucket.admit(capacity, refill_per_sec, now)
    }

    fn override_for(&self, path: &str) -> Option<(&str, f64)> {
        self.overrides
            .iter()
            .find(|(prefix, _)| path.starts_with(prefix.as_str()))
            .map(|(prefix, capacity)| (prefix.as_str(), *capacity))
    }

    /// Remove buckets that have sat idle for at least `idle_ttl`. An
    /// idle bucket is fully refilled by definition, so dropping it and
    /// lazily recreating a full one later changes nothing a client can
    /// observe.
    pub fn reap_idle(&self, idle_ttl: Duration) {
        let now = Instant::now();
        let before = self.buckets.len();
        self.buckets
            .retain(|_, bucket| now.saturating_duration_since(bucket.last_refill) < idle_ttl);
        let removed = before - self.buckets.len();
        if removed > 0 {
            debug!(removed, remaining = self.buckets.len(), "reaped idle rate-limit buckets");
        }
    }

    /// Number of live buckets, for observability.
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    #[cfg(test)]
    fn backdate(&self, key: &str, by: Duration) {
        if let Some(mut bucket) = self.buckets.get_mut(key) {
            bucket.last_refill -= by;
        }
    }
}
