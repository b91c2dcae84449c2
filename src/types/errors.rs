//! Application error types.
//!
//! All errors use `thiserror` for automatic Error trait derivation. The
//! variants are the kinds a caller of `Governor::exchange` can branch on:
//! closed, out-of-memory, cancellation, or everything else.

use thiserror::Error;

/// Application result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error enum for the worker IPC layer.
#[derive(Error, Debug)]
pub enum Error {
    /// Could not create the pipes or start the OS process.
    #[error("spawn {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// Replacing a dead worker failed. Never retried within one exchange.
    #[error("respawn: {0}")]
    Respawn(Box<Error>),

    /// The worker's stdin/stdout is gone (EOF, already closed, killed).
    #[error("stream closed: {0}")]
    StreamClosed(String),

    /// The worker exit was attributed to memory exhaustion.
    #[error("worker out of memory (exit code {code:?}): {stderr}")]
    OutOfMemory { code: Option<i32>, stderr: String },

    /// `Governor::close` has been called.
    #[error("governor closed")]
    GovernorClosed,

    /// The worker died while the governor runs in standalone mode.
    #[error("{reason}: {stderr}")]
    ProcessExited { reason: String, stderr: String },

    /// The caller's token fired.
    #[error("operation cancelled: {0}")]
    Cancelled(String),

    /// The caller's deadline elapsed.
    #[error("timeout: {0}")]
    Timeout(String),

    /// The worker violated the line protocol.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A host-callback handler failed.
    #[error("dispatch error: {0}")]
    Dispatch(String),

    /// Invalid configuration or arguments.
    #[error("validation error: {0}")]
    Validation(String),

    /// Internal errors.
    #[error("internal error: {0}")]
    Internal(String),

    /// Serialization/deserialization errors.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O errors.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Stable upper-case code for wire-level error reporting.
    pub fn to_ipc_error_code(&self) -> &'static str {
        match self {
            Error::Spawn { .. } | Error::Respawn(_) => "UNAVAILABLE",
            Error::StreamClosed(_) => "UNAVAILABLE",
            Error::OutOfMemory { .. } => "OUT_OF_MEMORY",
            Error::GovernorClosed => "CLOSED",
            Error::ProcessExited { .. } => "ABORTED",
            Error::Cancelled(_) => "CANCELLED",
            Error::Timeout(_) => "DEADLINE_EXCEEDED",
            Error::Protocol(_) => "DATA_LOSS",
            Error::Dispatch(_) => "INTERNAL",
            Error::Validation(_) => "INVALID_ARGUMENT",
            Error::Internal(_) => "INTERNAL",
            Error::Serialization(_) => "INTERNAL",
            Error::Io(_) => "INTERNAL",
        }
    }

    /// True for an OOM exit, including one surfaced through a failed respawn.
    pub fn is_out_of_memory(&self) -> bool {
        match self {
            Error::OutOfMemory { .. } => true,
            Error::Respawn(inner) => inner.is_out_of_memory(),
            _ => false,
        }
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, Error::GovernorClosed)
    }

    /// True when the caller's own token or deadline ended the call.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Error::Cancelled(_) | Error::Timeout(_))
    }
}

// Convenience constructors
impl Error {
    pub fn stream_closed(msg: impl Into<String>) -> Self {
        Self::StreamClosed(msg.into())
    }

    pub fn respawn(err: Error) -> Self {
        Self::Respawn(Box::new(err))
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    pub fn dispatch(msg: impl Into<String>) -> Self {
        Self::Dispatch(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    pub fn cancelled(msg: impl Into<String>) -> Self {
        Self::Cancelled(msg.into())
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }
}
