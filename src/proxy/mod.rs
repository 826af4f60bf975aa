pub mod client;
pub mod engine;
pub mod headers;
pub mod router;

pub use client::{ForwardClient, ForwardError, ForwardErrorKind};
pub use engine::ReverseProxy;
pub use router::{Router, Upstream};
