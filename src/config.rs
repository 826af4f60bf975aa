use std::collections::BTreeMap;

use ipnet::IpNet;
use serde::{Deserialize, Serialize};

use crate::error::{Result, WafProxyError};

/// Immutable configuration snapshot for the whole pipeline.
///
/// Loading, reloading and file watching live outside the core; the core
/// only ever sees a fully validated snapshot.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    pub upstreams: Vec<UpstreamConfig>,
    #[serde(default)]
    pub rules: Vec<RuleConfig>,
    #[serde(default)]
    pub thresholds: Thresholds,
    #[serde(default)]
    pub rate_limits: RateLimitConfig,
    #[serde(default)]
    pub trusted_proxies: Vec<String>,
    #[serde(default)]
    pub ip_allowlist: Vec<String>,
    #[serde(default)]
    pub ip_blocklist: Vec<String>,
    #[serde(default)]
    pub proxy_settings: ProxySettings,
    #[serde(default)]
    pub waf_settings: WafSettings,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UpstreamConfig {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub hosts: Vec<String>,
    #[serde(default)]
    pub path_prefixes: Vec<String>,
    #[serde(default = "default_weight")]
    pub weight: u32,
}

fn default_weight() -> u32 {
    1
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RuleConfig {
    pub id: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_target")]
    pub target: String,
    pub pattern: String,
    #[serde(default)]
    pub score: u32,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_target() -> String {
    "path".to_string()
}

fn default_enabled() -> bool {
    true
}

/// Score cut-points. Verdict is ALLOW below `challenge`, SUSPICIOUS from
/// `challenge`, BLOCK from `block`.
#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
pub struct Thresholds {
    #[serde(default = "default_allow")]
    pub allow: u32,
    #[serde(default = "default_challenge")]
    pub challenge: u32,
    #[serde(default = "default_block")]
    pub block: u32,
}

fn default_allow() -> u32 {
    5
}

fn default_challenge() -> u32 {
    6
}

fn default_block() -> u32 {
    10
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            allow: default_allow(),
            challenge: default_challenge(),
            block: default_block(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_rpm")]
    pub requests_per_minute: u32,
    /// Path-prefix overrides, longest prefix wins.
    #[serde(default)]
    pub per_path: BTreeMap<String, u32>,
}

fn default_rpm() -> u32 {
    60
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_minute: default_rpm(),
            per_path: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProxySettings {
    #[serde(default = "default_timeout")]
    pub timeout_seconds: f64,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_seconds: f64,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default = "default_max_keepalive")]
    pub max_keepalive_connections: usize,
    #[serde(default = "default_keepalive_expiry")]
    pub keepalive_expiry_seconds: f64,
}

fn default_timeout() -> f64 {
    30.0
}

fn default_connect_timeout() -> f64 {
    10.0
}

fn default_max_connections() -> usize {
    100
}

fn default_max_keepalive() -> usize {
    20
}

fn default_keepalive_expiry() -> f64 {
    5.0
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            timeout_seconds: default_timeout(),
            connect_timeout_seconds: default_connect_timeout(),
            max_connections: default_max_connections(),
            max_keepalive_connections: default_max_keepalive(),
            keepalive_expiry_seconds: default_keepalive_expiry(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WafSettings {
    #[serde(default)]
    pub mode: WafMode,
    #[serde(default = "default_max_inspect_bytes")]
    pub max_inspect_bytes: usize,
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: u64,
}

fn default_max_inspect_bytes() -> usize {
    10_000
}

fn default_max_body_bytes() -> u64 {
    1_000_000
}

impl Default for WafSettings {
    fn default() -> Self {
        Self {
            mode: WafMode::Block,
            max_inspect_bytes: default_max_inspect_bytes(),
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum WafMode {
    #[default]
    Block,
    Monitor,
}

impl Config {
    /// Load and validate a configuration file.
    pub async fn load(path: &str) -> Result<Self> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| WafProxyError::Config(format!("failed to read {path}: {e}")))?;

        let config: Config = serde_yaml::from_str(&content)
            .map_err(|e| WafProxyError::Config(format!("failed to parse {path}: {e}")))?;

        config.validate()?;
        Ok(config)
    }

    /// Structural validation. Rule compilation (pattern, target syntax,
    /// duplicate ids) happens in the rule engine at startup; both paths
    /// are ConfigFatal.
    pub fn validate(&self) -> Result<()> {
        for upstream in &self.upstreams {
            if upstream.url.is_empty() {
                return Err(WafProxyError::Config(format!(
                    "upstream '{}' has an empty url",
                    upstream.name
                )));
            }
            if upstream.weight == 0 {
                return Err(WafProxyError::Config(format!(
                    "upstream '{}' weight must be positive",
                    upstream.name
                )));
            }
        }

        let t = &self.thresholds;
        if !(t.allow < t.challenge && t.challenge <= t.block) {
            return Err(WafProxyError::Config(format!(
                "thresholds must satisfy allow < challenge <= block (got {}/{}/{})",
                t.allow, t.challenge, t.block
            )));
        }

        if self.rate_limits.requests_per_minute == 0 {
            return Err(WafProxyError::Config(
                "rate_limits.requests_per_minute must be positive".to_string(),
            ));
        }
        for (prefix, rpm) in &self.rate_limits.per_path {
            if *rpm == 0 {
                return Err(WafProxyError::Config(format!(
                    "rate_limits.per_path['{prefix}'] must be positive"
                )));
            }
        }

        // CIDR lists must parse up front; a typo here is a trust bug.
        parse_ip_list(&self.trusted_proxies, "trusted_proxies")?;
        parse_ip_list(&self.ip_allowlist, "ip_allowlist")?;
        parse_ip_list(&self.ip_blocklist, "ip_blocklist")?;

        Ok(())
    }

    pub fn trusted_proxy_nets(&self) -> Result<Vec<IpNet>> {
        parse_ip_list(&self.trusted_proxies, "trusted_proxies")
    }

    pub fn allowlist_nets(&self) -> Result<Vec<IpNet>> {
        parse_ip_list(&self.ip_allowlist, "ip_allowlist")
    }

    pub fn blocklist_nets(&self) -> Result<Vec<IpNet>> {
        parse_ip_list(&self.ip_blocklist, "ip_blocklist")
    }
}

/// Parse a list of bare IPs or CIDR ranges. A bare IP becomes a host
/// network (`/32` or `/128`).
fn parse_ip_list(entries: &[String], field: &str) -> Result<Vec<IpNet>> {
    let mut nets = Vec::with_capacity(entries.len());
    for entry in entries {
        let net = if let Ok(ip) = entry.parse::<std::net::IpAddr>() {
            IpNet::from(ip)
        } else {
            entry.parse::<IpNet>().map_err(|e| {
                WafProxyError::Config(format!("invalid IP or CIDR in {field} '{entry}': {e}"))
            })?
        };
        nets.push(net);
    }
    Ok(nets)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_yaml() -> &'static str {
        r#"
upstreams:
  - name: app
    url: http://127.0.0.1:9000
rules:
  - id: PT001
    description: path traversal
    target: path
    pattern: '\.\./'
    score: 10
"#
    }

    #[test]
    fn parses_minimal_config_with_defaults() {
        let config: Config = serde_yaml::from_str(minimal_yaml()).unwrap();
        config.validate().unwrap();

        assert_eq!(config.upstreams.len(), 1);
        assert_eq!(config.upstreams[0].weight, 1);
        assert_eq!(config.thresholds.allow, 5);
        assert_eq!(config.thresholds.block, 10);
        assert_eq!(config.rate_limits.requests_per_minute, 60);
        assert_eq!(config.waf_settings.mode, WafMode::Block);
        assert_eq!(config.waf_settings.max_inspect_bytes, 10_000);
        assert!(config.rules[0].enabled);
    }

    #[test]
    fn rejects_invalid_cidr() {
        let mut config: Config = serde_yaml::from_str(minimal_yaml()).unwrap();
        config.trusted_proxies = vec!["10.0.0.0/33".to_string()];
        assert!(config.validate().is_err());
    }

    #[test]
    fn accepts_bare_ips_in_lists() {
        let mut config: Config = serde_yaml::from_str(minimal_yaml()).unwrap();
        config.ip_blocklist = vec!["203.0.113.9".to_string(), "10.0.0.0/8".to_string()];
        config.validate().unwrap();
        let nets = config.blocklist_nets().unwrap();
        assert_eq!(nets.len(), 2);
        assert!(nets[0].contains(&"203.0.113.9".parse::<std::net::IpAddr>().unwrap()));
    }

    #[test]
    fn rejects_unordered_thresholds() {
        let mut config: Config = serde_yaml::from_str(minimal_yaml()).unwrap();
        config.thresholds = Thresholds {
            allow: 6,
            challenge: 5,
            block: 10,
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_zero_weight() {
        let mut config: Config = serde_yaml::from_str(minimal_yaml()).unwrap();
        config.upstreams[0].weight = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn monitor_mode_parses() {
        let yaml = format!("{}waf_settings:\n  mode: monitor\n", minimal_yaml());
        let config: Config = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(config.waf_settings.mode, WafMode::Monitor);
    }
}
