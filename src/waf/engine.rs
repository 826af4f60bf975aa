//! Rule-based scoring engine.
//!
//! Rules are compiled once at load time into typed targets and
//! pre-built regexes; evaluation projects each target out of the
//! request context without re-parsing anything. The verdict policy
//! (thresholds, monitor-mode downgrade) lives here too.

use std::net::IpAddr;
use std::sync::Arc;

use arc_swap::ArcSwap;
use ipnet::IpNet;
use regex::Regex;
use tracing::{debug, info};

use crate::config::{Config, RuleConfig, Thresholds, WafMode};
use crate::error::{Result, WafProxyError};

use super::{Decision, RequestContext, Verdict};

/// Synthetic rule id recorded when the blocklist gate fires.
pub const IP_BLOCKLIST_RULE_ID: &str = "IPBL";

/// Blocklisted peers short-circuit with an effectively infinite score.
pub const IP_BLOCKLIST_SCORE: u32 = u32::MAX;

/// What a rule inspects, resolved once at compile time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleTarget {
    Path,
    Query,
    Header(String),
    Method,
    UserAgent,
}

impl RuleTarget {
    pub fn parse(target: &str) -> Result<Self> {
        match target {
            "path" => Ok(RuleTarget::Path),
            "query" => Ok(RuleTarget::Query),
            "method" => Ok(RuleTarget::Method),
            "user_agent" => Ok(RuleTarget::UserAgent),
            other => {
                if let Some(name) = other.strip_prefix("header:") {
                    if name.is_empty() {
                        return Err(WafProxyError::Config(
                            "rule target 'header:' is missing a header name".to_string(),
                        ));
                    }
                    Ok(RuleTarget::Header(name.to_ascii_lowercase()))
                } else {
                    Err(WafProxyError::Config(format!(
                        "unknown rule target '{other}'"
                    )))
                }
            }
        }
    }

    /// Project the target string out of the request context. Rules see
    /// the decoded (traversal-preserving) path, the decoded query, and
    /// the canonical header subset.
    fn project<'a>(&self, ctx: &'a RequestContext) -> &'a str {
        match self {
            RuleTarget::Path => &ctx.path_decoded,
            RuleTarget::Query => &ctx.query_norm,
            RuleTarget::Header(name) => ctx.header(name).unwrap_or(""),
            RuleTarget::Method => &ctx.method,
            RuleTarget::UserAgent => ctx.header("user-agent").unwrap_or(""),
        }
    }
}

/// A rule after load-time compilation. Immutable for its lifetime.
#[derive(Debug)]
pub struct CompiledRule {
    pub id: String,
    pub description: String,
    pub target: RuleTarget,
    pub score: u32,
    pub enabled: bool,
    pattern: Regex,
}

/// Immutable snapshot of the active rule set, evaluated in load order.
#[derive(Debug, Default)]
pub struct RuleSet {
    rules: Vec<CompiledRule>,
}

impl RuleSet {
    /// Compile a rule list. Any invalid pattern, unknown target or
    /// duplicate id refuses the whole set.
    pub fn compile(configs: &[RuleConfig]) -> Result<Self> {
        let mut rules = Vec::with_capacity(configs.len());
        let mut seen_ids = std::collections::HashSet::new();

        for config in configs {
            if !seen_ids.insert(config.id.clone()) {
                return Err(WafProxyError::Config(format!(
                    "duplicate rule id '{}'",
                    config.id
                )));
            }

            let target = RuleTarget::parse(&config.target)?;
            let pattern = Regex::new(&config.pattern).map_err(|e| {
                WafProxyError::Config(format!(
                    "rule '{}' has an invalid pattern: {e}",
                    config.id
                ))
            })?;

            rules.push(CompiledRule {
                id: config.id.clone(),
                description: config.description.clone(),
                target,
                score: config.score,
                enabled: config.enabled,
                pattern,
            });
        }

        Ok(Self { rules })
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

/// Result of the IP policy gates consulted before any rule runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpGate {
    Allow,
    Block,
}

/// The WAF security engine: IP gates, compiled rules, verdict policy.
pub struct SecurityEngine {
    rules: ArcSwap<RuleSet>,
    thresholds: Thresholds,
    mode: WafMode,
    max_inspect_bytes: usize,
    allowlist: Vec<IpNet>,
    blocklist: Vec<IpNet>,
}

impl SecurityEngine {
    pub fn new(config: &Config) -> Result<Self> {
        let rule_set = RuleSet::compile(&config.rules)?;
        info!(
            rules = rule_set.len(),
            mode = ?config.waf_settings.mode,
            "security engine initialized"
        );

        Ok(Self {
            rules: ArcSwap::from_pointee(rule_set),
            thresholds: config.thresholds,
            mode: config.waf_settings.mode,
            max_inspect_bytes: config.waf_settings.max_inspect_bytes,
            allowlist: config.allowlist_nets()?,
            blocklist: config.blocklist_nets()?,
        })
    }

    /// Consult the allow-/block-lists. These are policy gates, not
    /// rules; the allowlist wins when both match.
    pub fn check_ip(&self, ip: IpAddr) -> Option<IpGate> {
        if self.allowlist.iter().any(|net| net.contains(&ip)) {
            return Some(IpGate::Allow);
        }
        if self.blocklist.iter().any(|net| net.contains(&ip)) {
            return Some(IpGate::Block);
        }
        None
    }

    /// Decision for a blocklisted peer: infinite score, synthetic id.
    pub fn blocklist_decision(&self) -> Decision {
        let (verdict, effective) = self.decide(IP_BLOCKLIST_SCORE);
        Decision {
            verdict,
            effective,
            score: IP_BLOCKLIST_SCORE,
            rule_hits: vec![IP_BLOCKLIST_RULE_ID.to_string()],
        }
    }

    /// Evaluate all rules against the context, in load order. Each rule
    /// contributes at most once. Deterministic: the same context and
    /// rule set always produce the same decision.
    pub fn evaluate(&self, ctx: &RequestContext) -> Decision {
        let rules = self.rules.load();
        let mut score: u32 = 0;
        let mut rule_hits = Vec::new();

        for rule in &rules.rules {
            if !rule.enabled {
                continue;
            }

            let text = super::normalize::truncate_inspect(
                rule.target.project(ctx),
                self.max_inspect_bytes,
            );

            if rule.pattern.is_match(text) {
                debug!(rule_id = %rule.id, description = %rule.description, "rule matched");
                score = score.saturating_add(rule.score);
                rule_hits.push(rule.id.clone());
            }
        }

        let (verdict, effective) = self.decide(score);
        Decision {
            verdict,
            effective,
            score,
            rule_hits,
        }
    }

    /// Map a total score onto (recorded, enforced) verdicts.
    fn decide(&self, score: u32) -> (Verdict, Verdict) {
        let verdict = if score >= self.thresholds.block {
            Verdict::Block
        } else if score >= self.thresholds.challenge {
            Verdict::Suspicious
        } else {
            Verdict::Allow
        };

        let effective = match (self.mode, verdict) {
            (WafMode::Monitor, Verdict::Block) => Verdict::Suspicious,
            (_, v) => v,
        };

        (verdict, effective)
    }

    /// Swap in a new rule set atomically. In-flight requests keep the
    /// snapshot they loaded at evaluation start.
    pub fn update_rules(&self, configs: &[RuleConfig]) -> Result<()> {
        let rule_set = RuleSet::compile(configs)?;
        info!(rules = rule_set.len(), "rule set replaced");
        self.rules.store(Arc::new(rule_set));
        Ok(())
    }
}
