//! Out-of-memory exit classification.

use std::fmt;

use crate::ipc::process::ExitInfo;
use crate::types::OomConfig;

/// Decides whether a worker exit is attributable to memory exhaustion.
pub trait OomPredicate: Send + Sync + fmt::Debug {
    fn is_oom(&self, exit: &ExitInfo, stderr: &str) -> bool;
}

/// Reserved exit codes, plus stderr markers for exits without a usable code.
#[derive(Debug, Clone)]
pub struct ExitCodeOom {
    exit_codes: Vec<i32>,
    stderr_markers: Vec<String>,
}

impl ExitCodeOom {
    pub fn new(config: &OomConfig) -> Self {
        Self {
            exit_codes: config.exit_codes.clone(),
            stderr_markers: config
                .stderr_markers
                .iter()
                .map(|m| m.to_lowercase())
                .collect(),
        }
    }
}

impl Default for ExitCodeOom {
    fn default() -> Self {
        Self::new(&OomConfig::default())
    }
}

impl OomPredicate for ExitCodeOom {
    fn is_oom(&self, exit: &ExitInfo, stderr: &str) -> bool {
        match exit.code {
            Some(code) if self.exit_codes.contains(&code) => true,
            Some(code) if code >= 0 => false,
            _ => {
                let stderr = stderr.to_lowercase();
                self.stderr_markers.iter().any(|m| stderr.contains(m.as_str()))
            }
        }
    }
}
