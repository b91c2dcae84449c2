//! Process boundary contract.
//!
//! A [`ProcessBoundary`] is one running worker: it can be sent a payload,
//! produce a response, be killed and be waited on. Replacing a dead worker
//! means spawning a fresh value and swapping the reference, never
//! reinitialising an existing one.

use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use std::process::ExitStatus;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::sync::CallContext;
use crate::types::Result;

/// Anything that can start a worker.
#[async_trait]
pub trait Spawn: Send + Sync + fmt::Debug {
    /// Start a new, independently running worker.
    async fn spawn(&self) -> Result<Arc<dyn ProcessBoundary>>;
}

/// A running worker.
///
/// Implementations do not serialize concurrent `send`/`receive` calls
/// against each other in any protocol-meaningful way; callers hold an
/// exclusive lock for the whole round trip. `kill` alone may be called
/// from anywhere at any time.
#[async_trait]
pub trait ProcessBoundary: Spawn {
    /// Write one payload. Fails on I/O error or when `ctx` ends.
    async fn send(&self, ctx: &CallContext, payload: &[u8]) -> Result<()>;

    /// Block until the terminal result frame (its payload is returned) or
    /// until the stream fails.
    async fn receive(
        &self,
        ctx: &CallContext,
        listener: Option<&dyn DataListener>,
    ) -> Result<Bytes>;

    /// Human-readable identity for logs.
    fn describe(&self) -> String;

    /// Request immediate termination. Non-blocking and idempotent.
    fn kill(&self);

    /// Block until the worker has exited and report how.
    async fn wait(&self) -> Result<ExitReport>;
}

/// Receives plain worker output lines, newline stripped, in arrival order.
pub trait DataListener: Send + Sync {
    fn on_data(&self, line: &[u8]);
}

impl DataListener for mpsc::UnboundedSender<Bytes> {
    fn on_data(&self, line: &[u8]) {
        // Receiver gone means nobody is listening any more.
        let _ = self.send(Bytes::copy_from_slice(line));
    }
}

/// Answers host-callback control frames sent by the worker mid-exchange.
#[async_trait]
pub trait CommandDispatcher: Send + Sync + fmt::Debug {
    /// `Ok(Some(value))` is written back to the worker as
    /// `{"command": command, "payload": value}`.
    async fn dispatch(&self, command: &str, payload: &[u8]) -> Result<Option<serde_json::Value>>;
}

/// How a worker process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitInfo {
    /// Exit code; `None` when terminated by a signal.
    pub code: Option<i32>,
    /// Terminating signal on Unix.
    pub signal: Option<i32>,
}

impl ExitInfo {
    pub fn from_status(status: ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;

        Self {
            code: status.code(),
            signal,
        }
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl fmt::Display for ExitInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {code}"),
            (None, Some(signal)) => write!(f, "signal {signal}"),
            (None, None) => write!(f, "unknown exit"),
        }
    }
}

/// Result of waiting on a worker that did not run out of memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitReport {
    pub exit: ExitInfo,
    /// Everything the worker wrote to stderr.
    pub stderr: String,
    /// The exit was requested through `kill`.
    pub killed: bool,
}
