//! Proxy engine integration
//!
//! This module provides everything needed to run an external xray/v2ray
//! engine as an opaque child process:
//! - JSON configuration generation for one inbound + one outbound
//! - Command templates for the engine binary
//! - Startup readiness detection on the engine's stdout
//! - Process handles with kill-and-reap semantics

mod config;
mod process;
mod readiness;

pub use config::{
    EngineConfig, GrpcSettings, Inbound, InboundProtocol, InboundSettings, LogSettings, Outbound,
    OutboundSettings, RealitySettings, Server, StreamSettings, TlsSettings, User, Vnext,
    WsSettings,
};
pub use process::{EngineCommand, EngineProcess, DEFAULT_XRAY_EXECUTABLE};
pub use readiness::{Readiness, ReadinessDetector, SentinelDetector};

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Default directory for generated config files
pub const DEFAULT_CONFIG_DIR: &str = "./config/";

/// Default time an engine gets to report readiness
pub const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(10);

/// How engines are launched and judged ready
#[derive(Clone)]
pub struct Supervisor {
    pub command: EngineCommand,
    pub config_dir: PathBuf,
    pub detector: Arc<dyn ReadinessDetector>,
    pub ready_timeout: Duration,
}

impl Supervisor {
    pub fn new(command: EngineCommand, config_dir: impl Into<PathBuf>) -> Self {
        Self {
            command,
            config_dir: config_dir.into(),
            detector: Arc::new(SentinelDetector::default()),
            ready_timeout: DEFAULT_READY_TIMEOUT,
        }
    }

    pub fn with_detector(mut self, detector: Arc<dyn ReadinessDetector>) -> Self {
        self.detector = detector;
        self
    }

    pub fn with_ready_timeout(mut self, ready_timeout: Duration) -> Self {
        self.ready_timeout = ready_timeout;
        self
    }

    /// `<config_dir>/<port>.json`; the port keys the file
    pub fn config_path(&self, port: u16) -> PathBuf {
        self.config_dir.join(format!("{}.json", port))
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new(EngineCommand::default(), DEFAULT_CONFIG_DIR)
    }
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("command", &self.command)
            .field("config_dir", &self.config_dir)
            .field("ready_timeout", &self.ready_timeout)
            .finish()
    }
}
