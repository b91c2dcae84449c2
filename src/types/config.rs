//! Configuration structures.
//!
//! Configuration is loaded from a JSON file; every section falls back to its
//! defaults when omitted.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::{Error, Result};

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Observability configuration.
    #[serde(default)]
    pub observability: ObservabilityConfig,

    /// Worker supervision configuration.
    #[serde(default)]
    pub governor: GovernorConfig,
}

impl Config {
    pub fn from_json_str(raw: &str) -> Result<Self> {
        let config: Config = serde_json::from_str(raw)?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&raw)
    }

    /// Reject configurations that can never start a worker.
    pub fn validate(&self) -> Result<()> {
        if self.governor.worker.command.as_os_str().is_empty() {
            return Err(Error::validation("governor.worker.command must not be empty"));
        }
        if self.governor.transport.wait_ceiling.is_zero() {
            return Err(Error::validation("governor.transport.wait_ceiling must be > 0"));
        }
        if self.governor.transport.max_line_bytes == 0 {
            return Err(Error::validation("governor.transport.max_line_bytes must be > 0"));
        }
        Ok(())
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Tracing log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Enable JSON log formatting.
    pub json_logs: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
        }
    }
}

/// How to start the worker process. Immutable once an instance is spawned.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(default)]
pub struct ProcessDescriptor {
    /// Working directory; inherits the host's when unset.
    pub dir: Option<PathBuf>,

    /// Executable path.
    pub command: PathBuf,

    /// Argument vector, excluding the executable.
    pub args: Vec<String>,

    /// Variables added on top of the inherited environment.
    pub env: BTreeMap<String, String>,
}

impl ProcessDescriptor {
    pub fn new(command: impl Into<PathBuf>) -> Self {
        Self {
            command: command.into(),
            ..Self::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.dir = Some(dir.into());
        self
    }
}

/// Governor configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GovernorConfig {
    /// Treat worker death as fatal instead of respawning.
    pub standalone: bool,

    /// How many times one exchange may retry its payload on a replacement
    /// worker before giving up. A worker is still respawned after the last
    /// death so the next exchange starts clean.
    pub max_respawns_per_exchange: u32,

    /// Worker process to run.
    pub worker: ProcessDescriptor,

    /// Pipe transport tuning.
    pub transport: TransportConfig,
}

impl Default for GovernorConfig {
    fn default() -> Self {
        Self {
            standalone: false,
            max_respawns_per_exchange: 3,
            worker: ProcessDescriptor::default(),
            transport: TransportConfig::default(),
        }
    }
}

/// Pipe transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Hard ceiling on waiting for a worker to exit before it is force-killed.
    #[serde(with = "humantime_serde")]
    pub wait_ceiling: Duration,

    /// How long to keep draining stderr after the worker has exited. A
    /// grandchild holding the pipe open must not stall `wait`.
    #[serde(with = "humantime_serde")]
    pub stderr_drain: Duration,

    /// Longest accepted line from the worker, newline included.
    pub max_line_bytes: usize,

    /// Out-of-memory exit classification.
    pub oom: OomConfig,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            wait_ceiling: Duration::from_secs(60),
            stderr_drain: Duration::from_secs(2),
            max_line_bytes: 64 * 1024 * 1024,
            oom: OomConfig::default(),
        }
    }
}

/// Out-of-memory heuristics. Exit codes are platform conventions, so both
/// lists are configurable.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct OomConfig {
    /// Exit codes that always mean OOM.
    pub exit_codes: Vec<i32>,

    /// Case-insensitive stderr markers, consulted only when the exit code is
    /// unknown (killed by a signal) or negative.
    pub stderr_markers: Vec<String>,
}

impl Default for OomConfig {
    fn default() -> Self {
        Self {
            exit_codes: vec![137],
            stderr_markers: vec!["out of memory".to_string()],
        }
    }
}
