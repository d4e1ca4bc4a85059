//! Pool node: one parsed link plus its supervised engine process

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, instrument};

use crate::engine::{EngineConfig, EngineProcess, InboundProtocol, Supervisor};
use crate::error::Result;
use crate::link::{parse_link, Descriptor, Protocol};
use crate::probe::Prober;

#[derive(Debug, Default)]
struct NodeState {
    listen_protocol: InboundProtocol,
    listen_port: Option<u16>,
    process: Option<EngineProcess>,
    latency: Option<Duration>,
}

/// Runtime unit wrapping a descriptor
///
/// A node is running only while it holds both a listen port and an engine
/// process. Nodes are shared as `Arc<Node>`; the pool owns them and the lease
/// queue only holds clones.
#[derive(Debug)]
pub struct Node {
    origin: String,
    descriptor: Descriptor,
    state: Mutex<NodeState>,
    running: Arc<AtomicBool>,
    failures: DashMap<String, u32>,
}

impl Node {
    /// Parse a raw link into a stopped node
    pub fn parse(origin: &str) -> Result<Self> {
        let origin = origin.trim();
        let descriptor = parse_link(origin)?;
        Ok(Self::from_descriptor(origin, descriptor))
    }

    pub fn from_descriptor(origin: impl Into<String>, descriptor: Descriptor) -> Self {
        Self {
            origin: origin.into(),
            descriptor,
            state: Mutex::new(NodeState::default()),
            running: Arc::new(AtomicBool::new(false)),
            failures: DashMap::new(),
        }
    }

    /// Raw link the node was parsed from
    pub fn origin(&self) -> &str {
        &self.origin
    }

    pub fn descriptor(&self) -> &Descriptor {
        &self.descriptor
    }

    pub fn protocol(&self) -> Protocol {
        self.descriptor.protocol()
    }

    pub fn remark(&self) -> &str {
        self.descriptor.remark()
    }

    /// Remote host
    pub fn host(&self) -> &str {
        &self.descriptor.host
    }

    /// Remote port
    pub fn port(&self) -> u16 {
        self.descriptor.port
    }

    pub fn listen_port(&self) -> Option<u16> {
        self.state.lock().listen_port
    }

    pub fn listen_protocol(&self) -> InboundProtocol {
        self.state.lock().listen_protocol
    }

    /// Latency measured by the last successful check
    pub fn latency(&self) -> Option<Duration> {
        self.state.lock().latency
    }

    pub(crate) fn set_latency(&self, latency: Option<Duration>) {
        self.state.lock().latency = latency;
    }

    #[cfg(test)]
    pub(crate) fn set_listen(&self, port: u16, protocol: InboundProtocol) {
        let mut state = self.state.lock();
        state.listen_port = Some(port);
        state.listen_protocol = protocol;
    }

    /// True between confirmed readiness and the engine exiting
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Local proxy URL, e.g. `socks5://127.0.0.1:50000`
    pub fn proxy_url(&self) -> Option<String> {
        let state = self.state.lock();
        state.listen_port.map(|port| {
            format!(
                "{}://127.0.0.1:{}",
                state.listen_protocol.proxy_scheme(),
                port
            )
        })
    }

    /// Probe the node and remember the latency on success
    pub async fn check(&self, prober: &dyn Prober) -> Result<Duration> {
        let latency = prober.probe(self).await?;
        self.set_latency(Some(latency));
        Ok(latency)
    }

    /// Count a failed request against `target`, returning the new total
    pub fn record_failure(&self, target: &str) -> u32 {
        let mut count = self.failures.entry(target.to_string()).or_insert(0);
        *count += 1;
        *count
    }

    pub fn failure_count(&self, target: &str) -> u32 {
        self.failures.get(target).map(|c| *c).unwrap_or(0)
    }

    pub fn clear_failures(&self) {
        self.failures.clear();
    }

    /// Write the engine config for `port` and launch the engine
    ///
    /// A running node is stopped first. On any failure the node is left
    /// stopped without a listen port.
    #[instrument(skip(self, supervisor), fields(origin = %self.origin))]
    pub async fn start(
        &self,
        port: u16,
        protocol: InboundProtocol,
        supervisor: &Supervisor,
    ) -> Result<()> {
        self.stop().await;

        {
            let mut state = self.state.lock();
            state.listen_port = Some(port);
            state.listen_protocol = protocol;
        }

        let result = self.launch(port, protocol, supervisor).await;

        let mut state = self.state.lock();
        match result {
            Ok(process) => {
                debug!(port, pid = process.pid(), "Node started");
                state.process = Some(process);
                Ok(())
            }
            Err(e) => {
                state.listen_port = None;
                Err(e)
            }
        }
    }

    async fn launch(
        &self,
        port: u16,
        protocol: InboundProtocol,
        supervisor: &Supervisor,
    ) -> Result<EngineProcess> {
        let config = EngineConfig::single(port, protocol, self.descriptor.outbound());

        tokio::fs::create_dir_all(supervisor.config_dir()).await?;
        let path = supervisor.config_path(port);
        tokio::fs::write(&path, config.to_json()?).await?;

        EngineProcess::spawn(
            &supervisor.command,
            &path,
            port,
            supervisor.detector.as_ref(),
            supervisor.ready_timeout,
            self.running.clone(),
        )
        .await
    }

    /// Kill the engine, if any, and reset port and latency
    ///
    /// Safe to call repeatedly and on nodes that never started.
    pub async fn stop(&self) {
        let process = {
            let mut state = self.state.lock();
            let process = state.process.take();
            if process.is_some() {
                state.listen_port = None;
                state.latency = None;
            }
            process
        };

        if let Some(process) = process {
            process.stop().await;
            self.running.store(false, Ordering::SeqCst);
            debug!(origin = %self.origin, "Node stopped");
        }
    }
}

impl std::fmt::Display for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.latency() {
            Some(latency) => write!(f, "latency: {:?}, {}", latency, self.origin),
            None => write!(f, "latency: -, {}", self.origin),
        }
    }
}
