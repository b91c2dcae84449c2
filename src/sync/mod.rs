//! Concurrency primitives for single-flight worker access.

mod context;
mod mutex;

pub use context::CallContext;
pub use mutex::{CancellableMutex, MutexGuard};
