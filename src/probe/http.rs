use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::{debug, instrument};

use super::Prober;
use crate::error::{PoolError, Result};
use crate::node::Node;

/// Fetches a URL through the node's local proxy
///
/// Only the tunnel is under test, so certificates are not verified and
/// connections are never reused. Any response counts as success.
#[derive(Debug, Clone)]
pub struct HttpProber {
    url: String,
    timeout: Duration,
}

impl HttpProber {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            url: url.into(),
            timeout,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Prober for HttpProber {
    #[instrument(skip(self, node), fields(url = %self.url))]
    async fn probe(&self, node: &Node) -> Result<Duration> {
        let proxy_url = node.proxy_url().ok_or(PoolError::NodeNotRunning)?;
        let start = Instant::now();

        let client = reqwest::Client::builder()
            .proxy(reqwest::Proxy::all(&proxy_url)?)
            .danger_accept_invalid_certs(true)
            .pool_max_idle_per_host(0)
            .timeout(self.timeout)
            .build()?;

        let response = client.get(&self.url).send().await.map_err(|e| {
            if e.is_timeout() {
                PoolError::ProbeTimeout(self.timeout)
            } else {
                PoolError::Http(e)
            }
        })?;

        let elapsed = start.elapsed();
        debug!(
            proxy = %proxy_url,
            status = %response.status(),
            "HTTP probe succeeded in {:?}",
            elapsed
        );
        Ok(elapsed)
    }

    fn name(&self) -> &str {
        "http"
    }
}
