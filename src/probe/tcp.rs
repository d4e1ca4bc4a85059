use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, instrument};

use super::Prober;
use crate::error::{PoolError, Result};
use crate::node::Node;

/// Succeeds when the remote port accepts a TCP connection
#[derive(Debug, Clone)]
pub struct TcpProber {
    timeout: Duration,
}

impl TcpProber {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl Prober for TcpProber {
    #[instrument(skip(self, node), fields(host = %node.host(), port = node.port()))]
    async fn probe(&self, node: &Node) -> Result<Duration> {
        let start = Instant::now();

        match timeout(self.timeout, TcpStream::connect((node.host(), node.port()))).await {
            Ok(Ok(_stream)) => {
                let elapsed = start.elapsed();
                debug!("TCP probe succeeded in {:?}", elapsed);
                Ok(elapsed)
            }
            Ok(Err(e)) => Err(PoolError::Probe(format!(
                "connect {}:{} failed: {}",
                node.host(),
                node.port(),
                e
            ))),
            Err(_) => Err(PoolError::ProbeTimeout(self.timeout)),
        }
    }

    fn name(&self) -> &str {
        "tcp"
    }
}
