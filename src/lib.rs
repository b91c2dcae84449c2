//! # Jitsu IPC - supervised worker processes over stdio
//!
//! Runs an external worker (e.g. a sandboxed script runtime) and exchanges
//! request/response payloads with it over its stdin/stdout:
//! - Line-framed wire protocol with `J$` control frames and host callbacks
//! - Single-flight access to the shared pipe with cancellable waits
//! - Transparent respawn of crashed workers, or fail-fast standalone mode
//! - Out-of-memory exit detection
//!
//! ## Architecture
//!
//! ```text
//!   caller ─► Governor ──lock──► ProcessBoundary (PipeProcess)
//!              │  respawn          │ stdin  ─► worker
//!              │  classify         │ stdout ◄─ data lines / J$ frames
//!              ▼                   │ stderr ─► buffer (read on wait)
//!         CancellableMutex         ▼
//!                            CommandDispatcher (host callbacks)
//! ```

// Enforce strict safety at compile time
#![deny(unsafe_code)]
#![warn(missing_debug_implementations)]
#![warn(rust_2018_idioms)]

pub mod governor;
pub mod ipc;
pub mod sync;
pub mod types;

// Internal utilities
pub mod observability;

pub use governor::Governor;
pub use sync::CallContext;
pub use types::{Config, Error, Result};
