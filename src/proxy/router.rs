//! Upstream selection: host/path restriction plus weighted round-robin.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use tracing::{debug, info};

use crate::config::UpstreamConfig;

/// A configured upstream origin. Long-lived and shared; the pick
/// counter is the only mutable state.
#[derive(Debug)]
pub struct Upstream {
    pub name: String,
    pub base_url: String,
    pub weight: u32,
    /// Host names this upstream serves (lower-cased). Empty = no
    /// host constraint.
    hosts: HashSet<String>,
    path_prefixes: Vec<String>,
    picks: AtomicU64,
}

impl Upstream {
    fn from_config(config: &UpstreamConfig) -> Self {
        Self {
            name: config.name.clone(),
            base_url: config.url.trim_end_matches('/').to_string(),
            weight: config.weight,
            hosts: config
                .hosts
                .iter()
                .map(|h| h.to_ascii_lowercase())
                .collect(),
            path_prefixes: config.path_prefixes.clone(),
            picks: AtomicU64::new(0),
        }
    }

    fn matches_host(&self, host: Option<&str>) -> bool {
        if self.hosts.is_empty() {
            return true;
        }
        match host {
            Some(h) => self.hosts.contains(&h.to_ascii_lowercase()),
            None => false,
        }
    }

    /// Length of the longest configured prefix covering `path`, if any.
    fn longest_prefix_match(&self, path: &str) -> Option<usize> {
        self.path_prefixes
            .iter()
            .filter(|prefix| path.starts_with(prefix.as_str()))
            .map(String::len)
            .max()
    }
}

/// Routes requests onto the upstream pool. The pool is an immutable
/// snapshot swapped atomically on reload.
pub struct Router {
    upstreams: ArcSwap<Vec<Arc<Upstream>>>,
}

impl Router {
    pub fn new(configs: &[UpstreamConfig]) -> Self {
        let pool = Self::build_pool(configs);
        info!(upstreams = pool.len(), "router initialized");
        Self {
            upstreams: ArcSwap::from_pointee(pool),
        }
    }

    fn build_pool(configs: &[UpstreamConfig]) -> Vec<Arc<Upstream>> {
        configs
            .iter()
            .map(|c| Arc::new(Upstream::from_config(c)))
            .collect()
    }

    /// Select an upstream for the given host and normalized path.
    ///
    /// Candidates are restricted by host, then by longest path prefix
    /// (prefix-less upstreams match any path but lose to any concrete
    /// prefix match); the survivors are balanced by weighted
    /// round-robin. Returns None when the pool is empty for this
    /// request.
    pub fn route(&self, host: Option<&str>, path: &str) -> Option<Arc<Upstream>> {
        let host = host.map(strip_port);
        let pool = self.upstreams.load();

        let by_host: Vec<&Arc<Upstream>> = pool
            .iter()
            .filter(|u| u.matches_host(host.as_deref()))
            .collect();

        let best_prefix = by_host
            .iter()
            .filter_map(|u| u.longest_prefix_match(path))
            .max();

        let winners: Vec<&Arc<Upstream>> = match best_prefix {
            Some(best) => by_host
                .into_iter()
                .filter(|u| u.longest_prefix_match(path) == Some(best))
                .collect(),
            None => by_host
                .into_iter()
                .filter(|u| u.path_prefixes.is_empty())
                .collect(),
        };

        let chosen = Self::pick_weighted(&winners)?;
        debug!(upstream = %chosen.name, "routed request");
        Some(chosen)
    }

    /// Weighted round-robin: the next pick is the upstream with the
    /// largest `weight / (picks + 1)` ratio, configuration order
    /// breaking ties; the winner's counter is incremented afterwards.
    fn pick_weighted(candidates: &[&Arc<Upstream>]) -> Option<Arc<Upstream>> {
        let mut best: Option<(&Arc<Upstream>, f64)> = None;

        for &upstream in candidates {
            let picks = upstream.picks.load(Ordering::Relaxed);
            let ratio = f64::from(upstream.weight) / (picks as f64 + 1.0);
            match best {
                Some((_, best_ratio)) if ratio <= best_ratio => {}
                _ => best = Some((upstream, ratio)),
            }
        }

        let (chosen, _) = best?;
        chosen.picks.fetch_add(1, Ordering::Relaxed);
        Some(chosen.clone())
    }

    /// Swap in a new upstream pool atomically. In-flight requests keep
    /// the snapshot they captured; counters start fresh.
    pub fn update_upstreams(&self, configs: &[UpstreamConfig]) {
        let pool = Self::build_pool(configs);
        info!(upstreams = pool.len(), "upstream pool replaced");
        self.upstreams.store(Arc::new(pool));
    }
}

fn strip_port(host: &str) -> String {
    // "example.com:8080" -> "example.com"; leave IPv6 literals intact.
    match host.rsplit_once(':') {
        Some((name, port)) if !name.is_empty() && port.chars().all(|c| c.is_ascii_digit()) => {
            name.to_string()
        }
        _ => host.to_string(),
    }
}
