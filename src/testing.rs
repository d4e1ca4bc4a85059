//! Shared test fixtures
//!
//! The fake engines are `sh` scripts; the generated config path arrives as `$1`.

use std::path::Path;

use crate::engine::{EngineCommand, Supervisor};

pub const FAKE_READY: &str =
    "echo \"[Info] infra/conf/serial: Reading config: $1\"; exec sleep 30";

pub const FAKE_CONFLICT: &str =
    "echo 'Failed to start: listen tcp 0.0.0.0: bind: address already in use'; exec sleep 30";

pub const FAKE_EXIT: &str = "echo 'Xray 1.8.4'; exit 1";

pub const FAKE_SILENT: &str = "exec sleep 30";

/// Closes stdout but keeps running
pub const FAKE_CLOSED_STDOUT: &str = "exec 1>&-; exec sleep 5";

pub fn fake_engine(script: &str, config_dir: &Path) -> Supervisor {
    let command = EngineCommand::new(
        "sh",
        vec!["-c".to_string(), script.to_string(), "fake-engine".to_string()],
    );
    Supervisor::new(command, config_dir)
}
