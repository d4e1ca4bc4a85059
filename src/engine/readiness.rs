//! Startup readiness detection from engine output

/// Outcome recognised in a line of engine output
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// The engine loaded its configuration and is serving
    Ready,
    /// The inbound port is already bound by someone else
    PortConflict,
}

/// Classifies engine output lines during startup
///
/// Lines that say nothing about readiness return `None`.
pub trait ReadinessDetector: Send + Sync {
    fn classify(&self, line: &str) -> Option<Readiness>;
}

/// Substring matching on the engine's log wording
#[derive(Debug, Clone)]
pub struct SentinelDetector {
    ready: Vec<String>,
    conflict: Vec<String>,
}

impl SentinelDetector {
    pub fn new(ready: Vec<String>, conflict: Vec<String>) -> Self {
        Self { ready, conflict }
    }
}

impl Default for SentinelDetector {
    fn default() -> Self {
        Self {
            ready: vec!["Reading config:".to_string()],
            conflict: vec![
                "address already in use".to_string(),
                "Only one usage of each socket address".to_string(),
            ],
        }
    }
}

impl ReadinessDetector for SentinelDetector {
    fn classify(&self, line: &str) -> Option<Readiness> {
        // Conflicts are checked first: a failing engine may still echo its config path.
        if self.conflict.iter().any(|s| line.contains(s.as_str())) {
            return Some(Readiness::PortConflict);
        }
        if self.ready.iter().any(|s| line.contains(s.as_str())) {
            return Some(Readiness::Ready);
        }
        None
    }
}
