//! xray-pool - Proxy Pool Orchestrator
//!
//! Turns vmess/vless/trojan links into a pool of running local proxies.
//!
//! ## Features
//!
//! - Subscription fetching (plain or base64 bodies) merged with direct links
//! - Link parsing into protocol-neutral descriptors
//! - Concurrent ICMP, TCP or through-proxy HTTP health probes
//! - One supervised xray/v2ray process per node with readiness detection
//! - Latency-ordered lease queue with RAII leases
//! - Cooperative shutdown on close, Ctrl+C or SIGTERM

pub mod config;
pub mod engine;
pub mod error;
pub mod link;
pub mod node;
pub mod pool;
pub mod probe;

#[cfg(test)]
mod testing;

pub use config::Config;
pub use error::{PoolError, Result};
pub use link::{parse_link, Descriptor, Protocol, ProtocolSettings};
pub use node::Node;
pub use pool::{close_on_signal, Lease, Pool, PoolBuilder, PoolState};
pub use probe::{create_prober, ProbeStrategy, Prober};
