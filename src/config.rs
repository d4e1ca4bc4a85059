use crate::engine::{
    EngineCommand, InboundProtocol, DEFAULT_CONFIG_DIR, DEFAULT_READY_TIMEOUT,
};
use crate::error::{PoolError, Result};
use crate::pool::{DEFAULT_POOL_CAP, DEFAULT_START_PORT};
use crate::probe::{ProbeStrategy, DEFAULT_CHECK_URL, DEFAULT_PROBE_TIMEOUT};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    /// Where links come from
    pub sources: SourceConfig,
    /// Engine process configuration
    pub engine: EngineSettings,
    /// Health check configuration
    pub check: CheckConfig,
    /// Lease queue capacity
    pub pool_cap: usize,
    /// Logging configuration
    pub log: LogConfig,
}

#[derive(Debug, Clone, Default)]
pub struct SourceConfig {
    /// Subscription URLs (comma-separated)
    pub subscriptions: Vec<String>,
    /// Direct links (comma-separated)
    pub nodes: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Directory for generated engine configs (default: ./config/)
    pub config_dir: PathBuf,
    /// First local listen port (default: 50000)
    pub start_port: u16,
    /// Engine command; the config path is appended last
    pub command: EngineCommand,
    /// Local inbound protocol (socks, http, mixed)
    pub inbound: InboundProtocol,
    /// How long to wait for the readiness sentinel
    pub ready_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct CheckConfig {
    /// Probe run against the remote endpoint before starting
    pub node_check: ProbeStrategy,
    /// Probe run through the local proxy after starting (None = skip)
    pub proxy_check: Option<ProbeStrategy>,
    /// Timeout for ping and TCP probes
    pub timeout: Duration,
    /// URL fetched by the HTTP probe
    pub check_url: String,
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Log level (debug, info, warn, error)
    pub level: String,
    /// Output format (json, pretty)
    pub format: String,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let inbound_raw = get_env_or("XRAY_POOL_INBOUND", "mixed");
        let node_check_raw = get_env_or("XRAY_POOL_NODE_CHECK", "ping");
        let proxy_check_raw = get_env_or("XRAY_POOL_PROXY_CHECK", "http");

        let command_raw = get_env_or("XRAY_POOL_COMMAND", "");
        let command = if command_raw.trim().is_empty() {
            EngineCommand::default()
        } else {
            EngineCommand::parse(&command_raw).ok_or_else(|| {
                PoolError::InvalidConfig("XRAY_POOL_COMMAND must not be empty".into())
            })?
        };

        Ok(Config {
            sources: SourceConfig {
                subscriptions: get_list("XRAY_POOL_SUBSCRIPTIONS"),
                nodes: get_list("XRAY_POOL_NODES"),
            },
            engine: EngineSettings {
                config_dir: PathBuf::from(get_env_or("XRAY_POOL_CONFIG_DIR", DEFAULT_CONFIG_DIR)),
                start_port: get_env_or("XRAY_POOL_START_PORT", &DEFAULT_START_PORT.to_string())
                    .parse()
                    .map_err(|_| {
                        PoolError::InvalidConfig(
                            "XRAY_POOL_START_PORT must be a valid port number".into(),
                        )
                    })?,
                command,
                inbound: InboundProtocol::from_str(&inbound_raw).ok_or_else(|| {
                    PoolError::InvalidConfig(format!(
                        "XRAY_POOL_INBOUND must be socks, http or mixed, got {}",
                        inbound_raw
                    ))
                })?,
                ready_timeout: get_secs("XRAY_POOL_READY_TIMEOUT", DEFAULT_READY_TIMEOUT)?,
            },
            check: CheckConfig {
                node_check: ProbeStrategy::from_str(&node_check_raw).ok_or_else(|| {
                    PoolError::InvalidConfig(format!(
                        "XRAY_POOL_NODE_CHECK must be ping, tcp or http, got {}",
                        node_check_raw
                    ))
                })?,
                proxy_check: match proxy_check_raw.to_lowercase().as_str() {
                    "" | "none" | "off" => None,
                    other => Some(ProbeStrategy::from_str(other).ok_or_else(|| {
                        PoolError::InvalidConfig(format!(
                            "XRAY_POOL_PROXY_CHECK must be ping, tcp, http or none, got {}",
                            other
                        ))
                    })?),
                },
                timeout: get_secs("XRAY_POOL_PROBE_TIMEOUT", DEFAULT_PROBE_TIMEOUT)?,
                check_url: get_env_or("XRAY_POOL_CHECK_URL", DEFAULT_CHECK_URL),
            },
            pool_cap: get_env_or("XRAY_POOL_CAP", &DEFAULT_POOL_CAP.to_string())
                .parse()
                .ok()
                .filter(|cap| *cap > 0)
                .ok_or_else(|| {
                    PoolError::InvalidConfig("XRAY_POOL_CAP must be a positive number".into())
                })?,
            log: LogConfig {
                level: get_env_or("LOG_LEVEL", "info"),
                format: get_env_or("LOG_FORMAT", "pretty"),
            },
        })
    }
}

/// Get environment variable with a default value
fn get_env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn get_list(key: &str) -> Vec<String> {
    get_env_or(key, "")
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn get_secs(key: &str, default: Duration) -> Result<Duration> {
    get_env_or(key, &default.as_secs().to_string())
        .parse()
        .map(Duration::from_secs)
        .map_err(|_| PoolError::InvalidConfig(format!("{} must be a number of seconds", key)))
}
