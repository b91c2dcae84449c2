//! Per-call cancellation token with an optional deadline.

use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::types::Error;

/// Cancellation-and-deadline token carried by every exchange.
///
/// Cloning shares the same token; `child()` derives one that is cancelled
/// with its parent but can also be cancelled on its own.
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl CallContext {
    /// A context that is never done until `cancel` is called.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_token(token: CancellationToken) -> Self {
        Self {
            token,
            deadline: None,
        }
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self::new().deadline_at(Instant::now() + timeout)
    }

    pub fn with_deadline(deadline: Instant) -> Self {
        Self::new().deadline_at(deadline)
    }

    /// Tighten the deadline; an earlier existing deadline wins.
    pub fn deadline_at(mut self, deadline: Instant) -> Self {
        self.deadline = Some(match self.deadline {
            Some(current) if current < deadline => current,
            _ => deadline,
        });
        self
    }

    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            deadline: self.deadline,
        }
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// The error this context ends with, if it has already ended.
    pub fn err(&self) -> Option<Error> {
        if self.token.is_cancelled() {
            return Some(Error::cancelled("context cancelled"));
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => {
                Some(Error::timeout("context deadline exceeded"))
            }
            _ => None,
        }
    }

    pub fn is_done(&self) -> bool {
        self.err().is_some()
    }

    /// Resolves once the token fires or the deadline passes.
    ///
    /// Cancel-safe; pending forever for a context with neither.
    pub async fn done(&self) -> Error {
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    _ = self.token.cancelled() => Error::cancelled("context cancelled"),
                    _ = tokio::time::sleep_until(deadline) => {
                        Error::timeout("context deadline exceeded")
                    }
                }
            }
            None => {
                self.token.cancelled().await;
                Error::cancelled("context cancelled")
            }
        }
    }
}
