//! xray-pool - Entry Point
//!
//! Builds the pool from environment configuration and keeps it open until
//! Ctrl+C or SIGTERM.

use anyhow::Context;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use xray_pool::config::LogConfig;
use xray_pool::{close_on_signal, Config, PoolBuilder};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration
    let config = Config::from_env().context("failed to load configuration")?;

    // Initialize tracing
    init_tracing(&config.log);

    info!("Starting xray-pool");
    info!(
        subscriptions = config.sources.subscriptions.len(),
        nodes = config.sources.nodes.len(),
        command = %config.engine.command,
        inbound = %config.engine.inbound,
        node_check = config.check.node_check.as_str(),
        "Configuration loaded"
    );

    let pool = PoolBuilder::from_config(&config).build();
    let signal_task = close_on_signal(&pool);

    let runner = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.run().await })
    };

    pool.started().await;
    if !pool.is_closed() {
        info!(nodes = pool.len(), "Pool is ready");
        for _ in 0..pool.len() {
            pool.with_node(|node| async move {
                info!(
                    proxy = %node.proxy_url().unwrap_or_default(),
                    latency = ?node.latency(),
                    remark = node.remark(),
                    "Node available"
                );
            })
            .await;
        }
    }

    match runner.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            error!("Pool run failed: {}", e);
            pool.close().await;
        }
        Err(e) => {
            error!("Pool task failed: {}", e);
            pool.close().await;
        }
    }
    signal_task.abort();

    info!("xray-pool stopped");
    Ok(())
}

fn init_tracing(log: &LogConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("xray_pool={}", log.level).into());

    let registry = tracing_subscriber::registry().with(filter);
    if log.format.eq_ignore_ascii_case("json") {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer().pretty()).init();
    }
}
