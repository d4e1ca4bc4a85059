//! Node health probes
//!
//! A probe measures how long it takes to reach a node. Three strategies are
//! provided:
//! - ICMP echo against the remote host
//! - plain TCP dial of the remote host and port
//! - HTTP GET routed through the node's local proxy once its engine runs
//!
//! Any `Fn(&Node) -> Result<Duration>` closure also works as a probe.

mod http;
mod ping;
mod tcp;

pub use http::HttpProber;
pub use ping::{echo_request, PingProber, ECHO_PACKET_LEN};
pub use tcp::TcpProber;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;
use crate::node::Node;

/// Default timeout for ping and TCP probes
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Default timeout for the through-proxy HTTP probe
pub const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(10);

/// Default URL fetched through a node's proxy
pub const DEFAULT_CHECK_URL: &str = "https://www.google.com";

/// Trait for probe strategies
///
/// Returns the measured latency, or an error when the node is unreachable.
#[async_trait]
pub trait Prober: Send + Sync {
    async fn probe(&self, node: &Node) -> Result<Duration>;

    /// Strategy name used in logs
    fn name(&self) -> &str;
}

#[async_trait]
impl<F> Prober for F
where
    F: Fn(&Node) -> Result<Duration> + Send + Sync,
{
    async fn probe(&self, node: &Node) -> Result<Duration> {
        self(node)
    }

    fn name(&self) -> &str {
        "custom"
    }
}

/// Built-in probe strategies
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeStrategy {
    Ping,
    Tcp,
    Http,
}

impl ProbeStrategy {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "ping" | "icmp" => Some(Self::Ping),
            "tcp" | "dial" => Some(Self::Tcp),
            "http" | "proxy" | "google" => Some(Self::Http),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ping => "ping",
            Self::Tcp => "tcp",
            Self::Http => "http",
        }
    }
}

/// Probe tuning shared by the built-in strategies
#[derive(Debug, Clone)]
pub struct ProbeConfig {
    /// Timeout for ping and TCP probes
    pub timeout: Duration,
    /// Timeout for the HTTP probe
    pub http_timeout: Duration,
    /// URL fetched by the HTTP probe
    pub check_url: String,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_PROBE_TIMEOUT,
            http_timeout: DEFAULT_HTTP_TIMEOUT,
            check_url: DEFAULT_CHECK_URL.to_string(),
        }
    }
}

/// Create a prober for the given strategy
pub fn create_prober(strategy: ProbeStrategy, config: &ProbeConfig) -> Arc<dyn Prober> {
    match strategy {
        ProbeStrategy::Ping => Arc::new(PingProber::new(config.timeout)),
        ProbeStrategy::Tcp => Arc::new(TcpProber::new(config.timeout)),
        ProbeStrategy::Http => Arc::new(HttpProber::new(
            config.check_url.clone(),
            config.http_timeout,
        )),
    }
}
