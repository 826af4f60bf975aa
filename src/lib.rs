//! Reverse-proxy web application firewall.
//!
//! The crate is organized around the request pipeline: `waf` holds
//! normalization, the rule engine and the rate limiter; `proxy` holds
//! routing, the streaming forward client and the orchestrator;
//! `observability` feeds metrics and the structured access log.

pub mod config;
pub mod error;
pub mod observability;
pub mod proxy;
pub mod waf;

pub use config::Config;
pub use error::{Result, WafProxyError};
pub use proxy::ReverseProxy;
