//! Pool orchestrator
//!
//! A pool turns a set of links into running local proxies:
//! - Collecting: download subscriptions and merge them with direct links
//! - Parsing: drop every link that does not parse
//! - Checking: probe all candidates concurrently, keep survivors by latency
//! - Starting: give each survivor a port and an engine, verify the tunnel
//! - Open: lease nodes with `get`/`put`, `lease` or `with_node`
//! - Closed: every node ever created is stopped
//!
//! Failures are isolated to the link, node or subscription they came from and
//! are only reported through `tracing`.

mod queue;
mod shutdown;
mod subscription;

pub use queue::LeaseQueue;
pub use shutdown::close_on_signal;
pub use subscription::{fetch, merge_links, split_links, FETCH_TIMEOUT};

use std::future::Future;
use std::ops::Deref;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::engine::{EngineCommand, InboundProtocol, ReadinessDetector, Supervisor};
use crate::error::{PoolError, Result};
use crate::node::Node;
use crate::probe::{
    create_prober, HttpProber, PingProber, ProbeConfig, Prober, DEFAULT_CHECK_URL,
    DEFAULT_HTTP_TIMEOUT, DEFAULT_PROBE_TIMEOUT,
};

/// First local port handed out
pub const DEFAULT_START_PORT: u16 = 50000;

/// Default lease queue capacity
pub const DEFAULT_POOL_CAP: usize = 1000;

/// Lifecycle of a pool run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolState {
    Idle,
    Collecting,
    Parsing,
    Checking,
    Starting,
    Open,
    Closed,
}

impl PoolState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Collecting => "collecting",
            Self::Parsing => "parsing",
            Self::Checking => "checking",
            Self::Starting => "starting",
            Self::Open => "open",
            Self::Closed => "closed",
        }
    }
}

impl std::fmt::Display for PoolState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Builder for [`Pool`]
///
/// Defaults: ping probe for admission, HTTP probe through the local proxy
/// after start, mixed inbound, ports from 50000, capacity 1000.
pub struct PoolBuilder {
    subscriptions: Vec<String>,
    links: Vec<String>,
    supervisor: Supervisor,
    inbound: InboundProtocol,
    start_port: u16,
    pool_cap: usize,
    node_check: Arc<dyn Prober>,
    proxy_check: Option<Arc<dyn Prober>>,
}

impl Default for PoolBuilder {
    fn default() -> Self {
        Self {
            subscriptions: Vec::new(),
            links: Vec::new(),
            supervisor: Supervisor::default(),
            inbound: InboundProtocol::default(),
            start_port: DEFAULT_START_PORT,
            pool_cap: DEFAULT_POOL_CAP,
            node_check: Arc::new(PingProber::new(DEFAULT_PROBE_TIMEOUT)),
            proxy_check: Some(Arc::new(HttpProber::new(
                DEFAULT_CHECK_URL,
                DEFAULT_HTTP_TIMEOUT,
            ))),
        }
    }
}

impl PoolBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder populated from environment configuration
    pub fn from_config(config: &Config) -> Self {
        let probe_config = ProbeConfig {
            timeout: config.check.timeout,
            http_timeout: DEFAULT_HTTP_TIMEOUT,
            check_url: config.check.check_url.clone(),
        };

        let supervisor = Supervisor::new(config.engine.command.clone(), &config.engine.config_dir)
            .with_ready_timeout(config.engine.ready_timeout);

        Self::new()
            .subscribe_all(config.sources.subscriptions.iter().cloned())
            .nodes(config.sources.nodes.iter().cloned())
            .supervisor(supervisor)
            .inbound_protocol(config.engine.inbound)
            .start_port(config.engine.start_port)
            .pool_cap(config.pool_cap)
            .node_check(create_prober(config.check.node_check, &probe_config))
            .proxy_check(
                config
                    .check
                    .proxy_check
                    .map(|strategy| create_prober(strategy, &probe_config)),
            )
    }

    /// Add a subscription URL
    pub fn subscribe(mut self, url: impl Into<String>) -> Self {
        self.subscriptions.push(url.into());
        self
    }

    pub fn subscribe_all<I, S>(mut self, urls: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.subscriptions.extend(urls.into_iter().map(Into::into));
        self
    }

    /// Add a direct link
    pub fn node(mut self, link: impl Into<String>) -> Self {
        self.links.push(link.into());
        self
    }

    pub fn nodes<I, S>(mut self, links: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.links.extend(links.into_iter().map(Into::into));
        self
    }

    /// Replace launch settings wholesale
    pub fn supervisor(mut self, supervisor: Supervisor) -> Self {
        self.supervisor = supervisor;
        self
    }

    pub fn config_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.supervisor.config_dir = dir.into();
        self
    }

    pub fn command(mut self, command: EngineCommand) -> Self {
        self.supervisor.command = command;
        self
    }

    pub fn ready_timeout(mut self, timeout: Duration) -> Self {
        self.supervisor.ready_timeout = timeout;
        self
    }

    pub fn detector(mut self, detector: Arc<dyn ReadinessDetector>) -> Self {
        self.supervisor.detector = detector;
        self
    }

    pub fn inbound_protocol(mut self, protocol: InboundProtocol) -> Self {
        self.inbound = protocol;
        self
    }

    pub fn start_port(mut self, port: u16) -> Self {
        self.start_port = port;
        self
    }

    pub fn pool_cap(mut self, cap: usize) -> Self {
        self.pool_cap = cap;
        self
    }

    /// Probe deciding which links get an engine
    pub fn node_check(mut self, prober: Arc<dyn Prober>) -> Self {
        self.node_check = prober;
        self
    }

    /// Probe run through the local proxy after start; `None` skips it
    pub fn proxy_check(mut self, prober: Option<Arc<dyn Prober>>) -> Self {
        self.proxy_check = prober;
        self
    }

    pub fn build(self) -> Pool {
        let (state, _) = watch::channel(PoolState::Idle);
        Pool {
            inner: Arc::new(PoolInner {
                subscriptions: self.subscriptions,
                links: self.links,
                supervisor: self.supervisor,
                inbound: self.inbound,
                start_port: self.start_port,
                node_check: self.node_check,
                proxy_check: self.proxy_check,
                queue: LeaseQueue::new(self.pool_cap),
                nodes: Mutex::new(Vec::new()),
                valid: Mutex::new(Vec::new()),
                admitted: Mutex::new(Vec::new()),
                state,
                done: CancellationToken::new(),
            }),
        }
    }
}

struct PoolInner {
    subscriptions: Vec<String>,
    links: Vec<String>,
    supervisor: Supervisor,
    inbound: InboundProtocol,
    start_port: u16,
    node_check: Arc<dyn Prober>,
    proxy_check: Option<Arc<dyn Prober>>,
    queue: LeaseQueue,
    /// Every node ever parsed; stopped on close
    nodes: Mutex<Vec<Arc<Node>>>,
    /// Check survivors in latency order
    valid: Mutex<Vec<Arc<Node>>>,
    /// Nodes that made it into the queue, in latency order
    admitted: Mutex<Vec<Arc<Node>>>,
    state: watch::Sender<PoolState>,
    done: CancellationToken,
}

impl PoolInner {
    /// Start the engine, then verify the tunnel when a proxy check is set
    async fn launch(&self, node: &Node, port: u16) -> Result<()> {
        node.start(port, self.inbound, &self.supervisor).await?;
        if let Some(prober) = &self.proxy_check {
            let elapsed = prober.probe(node).await?;
            debug!(
                origin = %node.origin(),
                prober = prober.name(),
                "Proxy check passed in {:?}",
                elapsed
            );
        }
        Ok(())
    }
}

/// Pool of running proxy nodes
///
/// Cheap to clone; clones share the same queue and lifecycle.
#[derive(Clone)]
pub struct Pool {
    inner: Arc<PoolInner>,
}

impl Pool {
    pub fn builder() -> PoolBuilder {
        PoolBuilder::new()
    }

    /// Populate the pool, then wait until it is closed
    ///
    /// Only one run per pool; calling it again returns `InvalidState`. A run
    /// that fails before opening closes the pool.
    pub async fn run(&self) -> Result<()> {
        let mut claimed = false;
        self.inner.state.send_if_modified(|state| {
            if *state == PoolState::Idle {
                *state = PoolState::Collecting;
                claimed = true;
            }
            claimed
        });
        if !claimed {
            return Err(PoolError::InvalidState(format!(
                "run requires an idle pool, current state is {}",
                self.state()
            )));
        }

        if let Err(e) = self.populate().await {
            self.close().await;
            return Err(e);
        }
        self.inner.done.cancelled().await;
        Ok(())
    }

    async fn populate(&self) -> Result<()> {
        let links = self.collect().await?;

        if !self.advance(PoolState::Parsing) {
            return Ok(());
        }
        let nodes = self.parse(&links);

        if !self.advance(PoolState::Checking) {
            return Ok(());
        }
        let survivors = self.check(nodes).await;

        if !self.advance(PoolState::Starting) {
            return Ok(());
        }
        let ready = self.start(survivors).await;

        if self.is_closed() {
            join_all(ready.iter().map(|node| node.stop())).await;
            return Ok(());
        }
        self.admit(ready).await;

        if self.advance(PoolState::Open) {
            info!(nodes = self.len(), "Pool started");
        }
        Ok(())
    }

    /// Move to the next state unless the pool was closed meanwhile
    fn advance(&self, next: PoolState) -> bool {
        let mut open = false;
        self.inner.state.send_if_modified(|state| {
            if *state == PoolState::Closed {
                return false;
            }
            open = true;
            *state = next;
            true
        });
        if open {
            debug!(state = %next, "Pool state changed");
        }
        open
    }

    async fn collect(&self) -> Result<Vec<String>> {
        let inner = &self.inner;
        let mut lists = Vec::with_capacity(inner.subscriptions.len() + 1);

        if !inner.subscriptions.is_empty() {
            let client = reqwest::Client::builder().timeout(FETCH_TIMEOUT).build()?;
            let fetched = join_all(
                inner
                    .subscriptions
                    .iter()
                    .map(|url| subscription::fetch(&client, url)),
            )
            .await;

            for result in fetched {
                match result {
                    Ok(links) => lists.push(links),
                    Err(e) => warn!("Skipping subscription: {}", e),
                }
            }
        }
        lists.push(inner.links.clone());

        let links = merge_links(lists);
        debug!(count = links.len(), "Collected links");
        Ok(links)
    }

    fn parse(&self, links: &[String]) -> Vec<Arc<Node>> {
        let nodes: Vec<Arc<Node>> = links
            .iter()
            .filter_map(|link| match Node::parse(link) {
                Ok(node) => Some(Arc::new(node)),
                Err(e) => {
                    warn!(link = %link, "Dropping link: {}", e);
                    None
                }
            })
            .collect();

        self.inner.nodes.lock().extend(nodes.iter().cloned());
        debug!(count = nodes.len(), "Parsed links");
        nodes
    }

    /// Probe every node concurrently; survivors sorted by latency
    async fn check(&self, nodes: Vec<Arc<Node>>) -> Vec<Arc<Node>> {
        let mut tasks = JoinSet::new();
        for (index, node) in nodes.into_iter().enumerate() {
            let prober = self.inner.node_check.clone();
            tasks.spawn(async move {
                let result = node.check(prober.as_ref()).await;
                (index, node, result)
            });
        }

        let mut survivors = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, node, Ok(latency))) => survivors.push((latency, index, node)),
                Ok((_, node, Err(e))) => {
                    warn!(origin = %node.origin(), "Node check failed: {}", e)
                }
                Err(e) => warn!("Node check task failed: {}", e),
            }
        }

        // Index keeps equal latencies in input order
        survivors.sort_by_key(|(latency, index, _)| (*latency, *index));
        debug!(count = survivors.len(), "Checked nodes");
        let survivors: Vec<Arc<Node>> = survivors.into_iter().map(|(_, _, node)| node).collect();
        *self.inner.valid.lock() = survivors.clone();
        survivors
    }

    /// Start survivors concurrently; result keeps the input order
    async fn start(&self, survivors: Vec<Arc<Node>>) -> Vec<Arc<Node>> {
        let mut handles = Vec::with_capacity(survivors.len());
        for (offset, node) in survivors.into_iter().enumerate() {
            let port = u16::try_from(offset)
                .ok()
                .and_then(|offset| self.inner.start_port.checked_add(offset));
            let Some(port) = port else {
                warn!(origin = %node.origin(), "No local port left, dropping node");
                continue;
            };

            let inner = self.inner.clone();
            handles.push(tokio::spawn(async move {
                match inner.launch(&node, port).await {
                    Ok(()) => Some(node),
                    Err(e) => {
                        warn!(origin = %node.origin(), port, "Node failed to start: {}", e);
                        node.stop().await;
                        None
                    }
                }
            }));
        }

        let mut ready = Vec::with_capacity(handles.len());
        for handle in handles {
            match handle.await {
                Ok(Some(node)) => ready.push(node),
                Ok(None) => {}
                Err(e) => warn!("Node start task failed: {}", e),
            }
        }
        ready
    }

    async fn admit(&self, ready: Vec<Arc<Node>>) {
        let mut admitted = Vec::with_capacity(ready.len());
        for node in ready {
            match self.inner.queue.try_push(node.clone()) {
                Ok(()) => {
                    info!("{} -> {}", node.proxy_url().unwrap_or_default(), node.origin());
                    admitted.push(node);
                }
                Err(node) => {
                    warn!(origin = %node.origin(), "Pool is full, dropping node");
                    node.stop().await;
                }
            }
        }
        *self.inner.admitted.lock() = admitted;
    }

    /// Wait for a node and take it out of the queue
    ///
    /// The caller must hand it back with [`Pool::put`].
    pub async fn get(&self) -> Arc<Node> {
        self.inner.queue.pop().await
    }

    pub fn try_get(&self) -> Option<Arc<Node>> {
        self.inner.queue.try_pop()
    }

    /// Return a node, waiting while the queue is full
    pub async fn put(&self, node: Arc<Node>) {
        self.inner.queue.push(node).await
    }

    /// Take a node that goes back to the queue when the lease drops
    pub async fn lease(&self) -> Lease {
        Lease {
            node: self.get().await,
            pool: self.inner.clone(),
        }
    }

    /// Run `f` with a leased node
    ///
    /// The node is returned whatever `f` does, including when it panics.
    pub async fn with_node<F, Fut, R>(&self, f: F) -> R
    where
        F: FnOnce(Arc<Node>) -> Fut,
        Fut: Future<Output = R>,
    {
        let lease = self.lease().await;
        f(lease.node().clone()).await
    }

    /// Current queue depth
    pub fn len(&self) -> usize {
        self.inner.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.queue.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.inner.queue.capacity()
    }

    /// Resize the lease queue; only allowed before `run`
    pub fn set_capacity(&self, capacity: usize) -> Result<()> {
        if capacity == 0 {
            return Err(PoolError::InvalidConfig("pool capacity must be positive".into()));
        }
        let state = self.state();
        if state != PoolState::Idle {
            return Err(PoolError::InvalidState(format!(
                "capacity can only change while idle, current state is {}",
                state
            )));
        }
        self.inner.queue.set_capacity(capacity);
        Ok(())
    }

    pub fn state(&self) -> PoolState {
        *self.inner.state.borrow()
    }

    pub fn is_closed(&self) -> bool {
        self.state() == PoolState::Closed
    }

    /// Wait until the pool is open, or closed before it got there
    pub async fn started(&self) {
        let mut rx = self.inner.state.subscribe();
        let _ = rx
            .wait_for(|state| matches!(state, PoolState::Open | PoolState::Closed))
            .await;
    }

    /// Nodes that passed the check, in latency order
    ///
    /// Filled once checking ends. Nodes that later fail to start stay listed
    /// but are stopped, which clears their latency.
    pub fn valid(&self) -> Vec<Arc<Node>> {
        self.inner.valid.lock().clone()
    }

    /// Nodes admitted into the queue, in latency order
    pub fn admitted(&self) -> Vec<Arc<Node>> {
        self.inner.admitted.lock().clone()
    }

    /// Every node parsed during the run
    pub fn all_nodes(&self) -> Vec<Arc<Node>> {
        self.inner.nodes.lock().clone()
    }

    /// Token cancelled once the pool is closed
    pub fn shutdown_token(&self) -> CancellationToken {
        self.inner.done.clone()
    }

    /// Stop every node and fire the done signal
    ///
    /// Only the first call does anything. Queued nodes stay queued.
    pub async fn close(&self) {
        let mut first = false;
        self.inner.state.send_if_modified(|state| {
            if *state != PoolState::Closed {
                *state = PoolState::Closed;
                first = true;
            }
            first
        });
        if !first {
            return;
        }

        let nodes = self.all_nodes();
        join_all(nodes.iter().map(|node| node.stop())).await;
        self.inner.done.cancel();
        info!(nodes = nodes.len(), "Pool closed");
    }
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("state", &self.state())
            .field("len", &self.len())
            .field("capacity", &self.capacity())
            .finish()
    }
}

/// A node on loan from the pool
///
/// Dropping the lease puts the node back without waiting.
pub struct Lease {
    node: Arc<Node>,
    pool: Arc<PoolInner>,
}

impl Lease {
    pub fn node(&self) -> &Arc<Node> {
        &self.node
    }
}

impl Deref for Lease {
    type Target = Node;

    fn deref(&self) -> &Node {
        &self.node
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.pool.queue.push_returned(self.node.clone());
    }
}

impl std::fmt::Debug for Lease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Lease").field(&self.node.origin()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    /// Probe answering from a port -> milliseconds table; unknown ports fail
    fn latency_by_port(table: &[(u16, u64)]) -> Arc<dyn Prober> {
        let table: HashMap<u16, u64> = table.iter().copied().collect();
        Arc::new(move |node: &Node| -> Result<Duration> {
            table
                .get(&node.port())
                .map(|ms| Duration::from_millis(*ms))
                .ok_or_else(|| PoolError::Probe("unreachable".into()))
        })
    }

    #[test]
    fn test_pool_state_names() {
        assert_eq!(PoolState::Idle.to_string(), "idle");
        assert_eq!(PoolState::Open.as_str(), "open");
    }

    #[test]
    fn test_set_capacity_while_idle() {
        let pool = Pool::builder().pool_cap(4).build();
        assert_eq!(pool.capacity(), 4);
        tokio_test::assert_ok!(pool.set_capacity(8));
        assert_eq!(pool.capacity(), 8);
        assert!(matches!(pool.set_capacity(0), Err(PoolError::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn test_empty_pool_opens_and_closes() {
        let pool = Pool::builder().proxy_check(None).build();
        let runner = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.run().await })
        };

        tokio::time::timeout(Duration::from_secs(5), pool.started())
            .await
            .unwrap();
        assert_eq!(pool.state(), PoolState::Open);
        assert!(pool.is_empty());

        pool.close().await;
        tokio_test::assert_ok!(runner.await.unwrap());
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let pool = Pool::builder().build();
        let token = pool.shutdown_token();

        pool.close().await;
        pool.close().await;

        assert!(token.is_cancelled());
        assert!(pool.is_closed());
        // started() must not hang on a pool that never opened
        tokio::time::timeout(Duration::from_secs(1), pool.started())
            .await
            .unwrap();
        assert!(matches!(pool.run().await, Err(PoolError::InvalidState(_))));
    }

    #[cfg(unix)]
    mod engine {
        use super::*;
        use crate::testing::{fake_engine, FAKE_READY};

        const SLOW: &str = "trojan://slow@one.example:1001#slow";
        const FAST: &str = "trojan://fast@two.example:1002#fast";
        const DOWN: &str = "trojan://down@three.example:1003#down";

        async fn open(pool: &Pool) -> tokio::task::JoinHandle<Result<()>> {
            let runner = {
                let pool = pool.clone();
                tokio::spawn(async move { pool.run().await })
            };
            tokio::time::timeout(Duration::from_secs(10), pool.started())
                .await
                .unwrap();
            runner
        }

        #[tokio::test]
        async fn test_first_get_yields_fastest_node() {
            let dir = tempfile::tempdir().unwrap();
            let pool = Pool::builder()
                .nodes([SLOW, FAST])
                .supervisor(fake_engine(FAKE_READY, dir.path()))
                .start_port(52100)
                .node_check(latency_by_port(&[(1001, 10), (1002, 5)]))
                .proxy_check(None)
                .build();

            let runner = open(&pool).await;
            assert_eq!(pool.state(), PoolState::Open);
            assert_eq!(pool.len(), 2);

            let first = pool.get().await;
            assert_eq!(first.remark(), "fast");
            assert_eq!(first.listen_port(), Some(52100));
            assert_eq!(first.latency(), Some(Duration::from_millis(5)));
            pool.put(first).await;

            let latencies: Vec<_> = pool.valid().iter().map(|n| n.latency()).collect();
            assert!(latencies.windows(2).all(|w| w[0] <= w[1]));

            pool.close().await;
            tokio_test::assert_ok!(runner.await.unwrap());
            assert!(pool.all_nodes().iter().all(|n| !n.is_running()));
        }

        #[tokio::test]
        async fn test_valid_is_sorted_once_checking_ends() {
            let dir = tempfile::tempdir().unwrap();
            // Engines take a while to report ready, leaving the pool in Starting
            let script = "sleep 1; echo \"Reading config: $1\"; exec sleep 30";
            let pool = Pool::builder()
                .nodes([SLOW, DOWN, FAST])
                .supervisor(fake_engine(script, dir.path()))
                .start_port(53100)
                .node_check(latency_by_port(&[(1001, 10), (1002, 5)]))
                .proxy_check(None)
                .build();

            let _runner = {
                let pool = pool.clone();
                tokio::spawn(async move { pool.run().await })
            };

            tokio::time::timeout(Duration::from_secs(5), async {
                while pool.state() != PoolState::Starting {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
            })
            .await
            .unwrap();

            let latencies: Vec<_> = pool.valid().iter().map(|n| n.latency()).collect();
            assert_eq!(
                latencies,
                vec![Some(Duration::from_millis(5)), Some(Duration::from_millis(10))]
            );
            assert!(pool.admitted().is_empty());

            tokio::time::timeout(Duration::from_secs(10), pool.started())
                .await
                .unwrap();
            assert_eq!(pool.admitted().len(), 2);

            pool.close().await;
        }

        #[tokio::test]
        async fn test_failing_check_does_not_block_siblings() {
            let dir = tempfile::tempdir().unwrap();
            let pool = Pool::builder()
                .nodes([SLOW, DOWN, FAST, "bogus://nothing", "vless://no-port@h"])
                .supervisor(fake_engine(FAKE_READY, dir.path()))
                .start_port(52200)
                .node_check(latency_by_port(&[(1001, 10), (1002, 5)]))
                .proxy_check(None)
                .build();

            let _runner = open(&pool).await;

            assert_eq!(pool.all_nodes().len(), 3);
            assert_eq!(pool.len(), 2);
            let valid: Vec<_> = pool.valid().iter().map(|n| n.port()).collect();
            assert_eq!(valid, vec![1002, 1001]);
            assert_eq!(pool.admitted().len(), 2);

            pool.close().await;
        }

        #[tokio::test]
        async fn test_duplicate_links_start_once() {
            let dir = tempfile::tempdir().unwrap();
            let pool = Pool::builder()
                .nodes([FAST, FAST, " trojan://fast@two.example:1002#fast "])
                .supervisor(fake_engine(FAKE_READY, dir.path()))
                .start_port(52300)
                .node_check(latency_by_port(&[(1002, 5)]))
                .proxy_check(None)
                .build();

            let _runner = open(&pool).await;
            assert_eq!(pool.all_nodes().len(), 1);
            assert_eq!(pool.len(), 1);

            pool.close().await;
        }

        #[tokio::test]
        async fn test_start_failure_is_isolated() {
            let dir = tempfile::tempdir().unwrap();
            // Second port reports a bind conflict
            let script = "case \"$1\" in \
                *52401.json) echo 'listen tcp: bind: address already in use'; exec sleep 30;; \
                *) echo \"Reading config: $1\"; exec sleep 30;; \
                esac";
            let pool = Pool::builder()
                .nodes([SLOW, FAST])
                .supervisor(fake_engine(script, dir.path()))
                .start_port(52400)
                .node_check(latency_by_port(&[(1001, 10), (1002, 5)]))
                .proxy_check(None)
                .build();

            let _runner = open(&pool).await;

            assert_eq!(pool.len(), 1);
            let node = pool.get().await;
            assert_eq!(node.remark(), "fast");
            assert!(node.is_running());

            let slow = pool
                .all_nodes()
                .into_iter()
                .find(|n| n.remark() == "slow")
                .unwrap();
            assert!(!slow.is_running());
            assert_eq!(slow.listen_port(), None);

            pool.close().await;
        }

        #[tokio::test]
        async fn test_failed_proxy_check_stops_node() {
            let dir = tempfile::tempdir().unwrap();
            let pool = Pool::builder()
                .nodes([SLOW, FAST])
                .supervisor(fake_engine(FAKE_READY, dir.path()))
                .start_port(52500)
                .node_check(latency_by_port(&[(1001, 10), (1002, 5)]))
                .proxy_check(Some(latency_by_port(&[(1001, 50)])))
                .build();

            let _runner = open(&pool).await;

            assert_eq!(pool.len(), 1);
            let admitted = pool.admitted();
            assert_eq!(admitted.len(), 1);
            assert_eq!(admitted[0].remark(), "slow");
            // Admission latency is kept, not the proxy check's
            assert_eq!(admitted[0].latency(), Some(Duration::from_millis(10)));

            // Both survived the check; the failed start only leaves the queue view
            let valid: Vec<_> = pool.valid().iter().map(|n| n.remark().to_string()).collect();
            assert_eq!(valid, vec!["fast", "slow"]);

            let fast = pool
                .all_nodes()
                .into_iter()
                .find(|n| n.remark() == "fast")
                .unwrap();
            assert!(!fast.is_running());

            pool.close().await;
        }

        #[tokio::test]
        async fn test_with_node_returns_node_on_error() {
            let dir = tempfile::tempdir().unwrap();
            let pool = Pool::builder()
                .nodes([SLOW, FAST])
                .supervisor(fake_engine(FAKE_READY, dir.path()))
                .start_port(52600)
                .node_check(latency_by_port(&[(1001, 10), (1002, 5)]))
                .proxy_check(None)
                .build();

            let _runner = open(&pool).await;
            assert_eq!(pool.len(), 2);

            let result: Result<()> = pool
                .with_node(|node| async move {
                    assert!(node.is_running());
                    Err(PoolError::Probe("request failed".into()))
                })
                .await;
            assert!(result.is_err());
            assert_eq!(pool.len(), 2);

            let remark = pool.with_node(|node| async move { node.remark().to_string() }).await;
            assert_eq!(remark, "fast");
            assert_eq!(pool.len(), 2);

            pool.close().await;
        }

        #[tokio::test]
        async fn test_with_node_returns_node_on_panic() {
            let dir = tempfile::tempdir().unwrap();
            let pool = Pool::builder()
                .node(FAST)
                .supervisor(fake_engine(FAKE_READY, dir.path()))
                .start_port(52700)
                .node_check(latency_by_port(&[(1002, 5)]))
                .proxy_check(None)
                .build();

            let _runner = open(&pool).await;
            assert_eq!(pool.len(), 1);

            let worker = {
                let pool = pool.clone();
                tokio::spawn(async move {
                    pool.with_node(|_node| async move {
                        if true {
                            panic!("caller bug");
                        }
                    })
                    .await
                })
            };
            assert!(worker.await.unwrap_err().is_panic());
            assert_eq!(pool.len(), 1);

            pool.close().await;
        }

        #[tokio::test]
        async fn test_lease_returns_on_drop() {
            let dir = tempfile::tempdir().unwrap();
            let pool = Pool::builder()
                .node(FAST)
                .supervisor(fake_engine(FAKE_READY, dir.path()))
                .start_port(52800)
                .node_check(latency_by_port(&[(1002, 5)]))
                .proxy_check(None)
                .build();

            let _runner = open(&pool).await;

            let lease = pool.lease().await;
            assert_eq!(lease.remark(), "fast");
            assert!(pool.is_empty());
            assert!(pool.try_get().is_none());
            drop(lease);
            assert_eq!(pool.len(), 1);

            pool.close().await;
        }

        #[tokio::test]
        async fn test_set_capacity_after_run_fails() {
            let dir = tempfile::tempdir().unwrap();
            let pool = Pool::builder()
                .node(FAST)
                .supervisor(fake_engine(FAKE_READY, dir.path()))
                .start_port(52900)
                .node_check(latency_by_port(&[(1002, 5)]))
                .proxy_check(None)
                .build();

            let _runner = open(&pool).await;
            assert!(matches!(pool.set_capacity(10), Err(PoolError::InvalidState(_))));

            pool.close().await;
        }

        #[tokio::test]
        async fn test_pool_cap_drops_overflow() {
            let dir = tempfile::tempdir().unwrap();
            let pool = Pool::builder()
                .nodes([SLOW, FAST])
                .supervisor(fake_engine(FAKE_READY, dir.path()))
                .start_port(53000)
                .pool_cap(1)
                .node_check(latency_by_port(&[(1001, 10), (1002, 5)]))
                .proxy_check(None)
                .build();

            let _runner = open(&pool).await;
            assert_eq!(pool.len(), 1);
            assert_eq!(pool.valid().len(), 2);
            assert_eq!(pool.admitted().len(), 1);
            assert_eq!(pool.admitted()[0].remark(), "fast");
            assert_eq!(pool.all_nodes().iter().filter(|n| n.is_running()).count(), 1);

            pool.close().await;
        }
    }
}
