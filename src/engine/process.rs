//! Engine child process
//!
//! Spawns the engine with a generated config file, waits for it to report
//! readiness on stdout and keeps a monitor task that owns the child until it
//! exits or is stopped.

use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader, Lines};
use tokio::process::{Child, ChildStdout, Command};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, trace, warn};

use super::readiness::{Readiness, ReadinessDetector};
use crate::error::{PoolError, Result};

/// Default engine binary location
#[cfg(windows)]
pub const DEFAULT_XRAY_EXECUTABLE: &str = "./bin/xray.exe";

#[cfg(not(windows))]
pub const DEFAULT_XRAY_EXECUTABLE: &str = "./bin/xray";

/// Command template; the config path is appended as the final argument
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl EngineCommand {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// `xray run -config <file>`
    pub fn xray(executable: impl Into<String>) -> Self {
        Self::new(executable, vec!["run".to_string(), "-config".to_string()])
    }

    /// `v2ray -config <file>`
    pub fn v2ray() -> Self {
        Self::new("v2ray", vec!["-config".to_string()])
    }

    /// Whitespace separated command line, e.g. `"xray run -config"`
    pub fn parse(s: &str) -> Option<Self> {
        let mut parts = s.split_whitespace().map(String::from);
        let program = parts.next()?;
        Some(Self::new(program, parts.collect()))
    }

    fn command(&self, config_path: &Path) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args).arg(config_path);
        cmd
    }
}

impl Default for EngineCommand {
    fn default() -> Self {
        Self::xray(DEFAULT_XRAY_EXECUTABLE)
    }
}

impl std::fmt::Display for EngineCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// Handle to a running engine process
pub struct EngineProcess {
    pid: Option<u32>,
    kill_tx: Option<oneshot::Sender<()>>,
    monitor: JoinHandle<()>,
}

impl EngineProcess {
    /// Spawn the engine and block until it reports readiness
    ///
    /// `running` is set once the engine is ready and cleared when it exits.
    pub async fn spawn(
        command: &EngineCommand,
        config_path: &Path,
        port: u16,
        detector: &dyn ReadinessDetector,
        ready_timeout: Duration,
        running: Arc<AtomicBool>,
    ) -> Result<Self> {
        let mut child = command
            .command(config_path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| PoolError::Process(format!("failed to spawn {}: {}", command, e)))?;

        let pid = child.id();
        debug!(port, pid, "Spawned engine: {} {:?}", command, config_path);

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| PoolError::Process("engine stdout was not captured".to_string()))?;
        let mut lines = BufReader::new(stdout).lines();

        // One deadline covers both the sentinel and reaping after stdout closes
        let deadline = Instant::now() + ready_timeout;
        let outcome = timeout_at(deadline, wait_ready(&mut lines, port, detector)).await;

        match outcome {
            Ok(Ok(Some(Readiness::Ready))) => {}
            Ok(Ok(Some(Readiness::PortConflict))) => {
                kill(&mut child, port).await;
                return Err(PoolError::PortConflict { port });
            }
            Ok(Ok(None)) => {
                // stdout closed, but the engine may still be alive
                match timeout_at(deadline, child.wait()).await {
                    Ok(Ok(status)) => debug!(port, %status, "Engine exited before ready"),
                    Ok(Err(e)) => warn!(port, "Failed to reap engine: {}", e),
                    Err(_) => {
                        kill(&mut child, port).await;
                        return Err(PoolError::ReadinessTimeout {
                            port,
                            timeout: ready_timeout,
                        });
                    }
                }
                return Err(PoolError::ProcessExited { port });
            }
            Ok(Err(e)) => {
                kill(&mut child, port).await;
                return Err(PoolError::Io(e));
            }
            Err(_) => {
                kill(&mut child, port).await;
                return Err(PoolError::ReadinessTimeout {
                    port,
                    timeout: ready_timeout,
                });
            }
        }

        running.store(true, Ordering::SeqCst);

        tokio::spawn(drain_output(lines, port));

        let (kill_tx, kill_rx) = oneshot::channel();
        let monitor = tokio::spawn(supervise(child, kill_rx, port, running));

        Ok(Self {
            pid,
            kill_tx: Some(kill_tx),
            monitor,
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Whether the child has not been observed to exit yet
    pub fn is_alive(&self) -> bool {
        !self.monitor.is_finished()
    }

    /// Kill the child and wait until it has been reaped
    pub async fn stop(mut self) {
        if let Some(tx) = self.kill_tx.take() {
            // Err means the monitor already saw the process exit
            let _ = tx.send(());
        }
        if let Err(e) = (&mut self.monitor).await {
            warn!("Engine monitor task failed: {}", e);
        }
    }
}

impl std::fmt::Debug for EngineProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineProcess")
            .field("pid", &self.pid)
            .field("alive", &self.is_alive())
            .finish()
    }
}

async fn wait_ready(
    lines: &mut Lines<BufReader<ChildStdout>>,
    port: u16,
    detector: &dyn ReadinessDetector,
) -> std::io::Result<Option<Readiness>> {
    while let Some(line) = lines.next_line().await? {
        trace!(port, "engine: {}", line);
        if let Some(readiness) = detector.classify(&line) {
            return Ok(Some(readiness));
        }
    }
    Ok(None)
}

/// Keep reading stdout so the engine never blocks on a full pipe
async fn drain_output(mut lines: Lines<BufReader<ChildStdout>>, port: u16) {
    while let Ok(Some(line)) = lines.next_line().await {
        trace!(port, "engine: {}", line);
    }
}

async fn supervise(
    mut child: Child,
    kill_rx: oneshot::Receiver<()>,
    port: u16,
    running: Arc<AtomicBool>,
) {
    let killed = tokio::select! {
        status = child.wait() => {
            match status {
                Ok(status) => warn!(port, %status, "Engine exited"),
                Err(e) => warn!(port, "Failed to wait for engine: {}", e),
            }
            false
        }
        // A dropped sender counts as a stop request as well
        _ = kill_rx => true,
    };

    if killed {
        kill(&mut child, port).await;
    }

    running.store(false, Ordering::SeqCst);
}

async fn kill(child: &mut Child, port: u16) {
    match child.kill().await {
        Ok(()) => debug!(port, "Engine killed"),
        Err(e) => warn!(port, "Failed to kill engine: {}", e),
    }
}
