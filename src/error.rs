use std::time::Duration;

use thiserror::Error;

/// Unified error type for the pool
#[derive(Error, Debug)]
pub enum PoolError {
    // Link errors
    #[error("Invalid link: {0}")]
    Parse(String),

    #[error("Unsupported protocol, must be [vmess|vless|trojan]: {0}")]
    UnsupportedProtocol(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // Probe errors
    #[error("Probe failed: {0}")]
    Probe(String),

    #[error("Probe timed out after {0:?}")]
    ProbeTimeout(Duration),

    // Engine process errors
    #[error("Port {port} is already in use")]
    PortConflict { port: u16 },

    #[error("Engine on port {port} exited before it was ready")]
    ProcessExited { port: u16 },

    #[error("Engine on port {port} not ready after {timeout:?}")]
    ReadinessTimeout { port: u16, timeout: Duration },

    #[error("Engine process error: {0}")]
    Process(String),

    #[error("Node is not running")]
    NodeNotRunning,

    // Subscription errors
    #[error("Subscription fetch failed for {url}: {reason}")]
    Subscription { url: String, reason: String },

    // HTTP errors
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    // I/O errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Configuration errors
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid pool state: {0}")]
    InvalidState(String),
}

/// Result type alias for pool operations
pub type Result<T> = std::result::Result<T, PoolError>;

impl PoolError {
    /// Errors raised while turning a raw link into a descriptor
    pub fn is_parse_error(&self) -> bool {
        matches!(
            self,
            PoolError::Parse(_) | PoolError::UnsupportedProtocol(_) | PoolError::Json(_)
        )
    }

    /// Errors that exclude a single node from the pool without affecting its siblings
    pub fn is_node_failure(&self) -> bool {
        matches!(
            self,
            PoolError::Probe(_)
                | PoolError::ProbeTimeout(_)
                | PoolError::PortConflict { .. }
                | PoolError::ProcessExited { .. }
                | PoolError::ReadinessTimeout { .. }
                | PoolError::Process(_)
                | PoolError::NodeNotRunning
                | PoolError::Http(_)
        )
    }
}

// Convert from URL parse errors
impl From<url::ParseError> for PoolError {
    fn from(err: url::ParseError) -> Self {
        PoolError::Parse(err.to_string())
    }
}

// Convert from base64 errors
impl From<base64::DecodeError> for PoolError {
    fn from(err: base64::DecodeError) -> Self {
        PoolError::Parse(format!("invalid base64: {}", err))
    }
}
