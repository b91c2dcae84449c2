//! Single-holder lock whose acquisition can be abandoned.
//!
//! Backed by a one-permit semaphore raced against the caller's
//! [`CallContext`]. A waiter whose context ends never acquires.

use tokio::sync::{Semaphore, SemaphorePermit};

use crate::sync::CallContext;
use crate::types::{Error, Result};

/// Exclusive lock with cancellable acquisition.
#[derive(Debug)]
pub struct CancellableMutex {
    permit: Semaphore,
}

/// Proof of holding a [`CancellableMutex`]. Dropping it releases the lock.
#[derive(Debug)]
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct MutexGuard<'a> {
    _permit: SemaphorePermit<'a>,
}

impl MutexGuard<'_> {
    /// Release explicitly. Same as dropping the guard.
    pub fn release(self) {}
}

impl CancellableMutex {
    pub fn new() -> Self {
        Self {
            permit: Semaphore::new(1),
        }
    }

    /// Wait for the lock, giving up when `ctx` ends or the lock is closed.
    ///
    /// A context that has already ended fails even if the lock is free.
    pub async fn acquire(&self, ctx: &CallContext) -> Result<MutexGuard<'_>> {
        if let Some(err) = ctx.err() {
            return Err(err);
        }
        tokio::select! {
            biased;
            err = ctx.done() => Err(err),
            permit = self.permit.acquire() => match permit {
                Ok(permit) => Ok(MutexGuard { _permit: permit }),
                Err(_) => Err(Error::GovernorClosed),
            },
        }
    }

    /// Non-blocking acquisition; `None` when held or closed.
    #[cfg(test)]
    fn try_acquire(&self) -> Option<MutexGuard<'_>> {
        self.permit
            .try_acquire()
            .ok()
            .map(|permit| MutexGuard { _permit: permit })
    }

    /// Fail every current and future waiter. The current holder keeps its
    /// guard until it drops it.
    pub fn close(&self) {
        self.permit.close();
    }

    pub fn is_closed(&self) -> bool {
        self.permit.is_closed()
    }

    #[cfg(test)]
    fn is_locked(&self) -> bool {
        self.permit.available_permits() == 0
    }
}

impl Default for CancellableMutex {
    fn default() -> Self {
        Self::new()
    }
}
