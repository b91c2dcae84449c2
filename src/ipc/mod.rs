//! Line-framed stdio IPC with a worker process.
//!
//! `frame` is the wire codec, `process` the boundary contract, and
//! `transport` the pipe-backed implementation of it.

pub mod classify;
pub mod dispatch;
pub mod frame;
pub mod oom;
pub mod process;
pub mod transport;

pub use dispatch::DispatchTable;
pub use process::{CommandDispatcher, DataListener, ExitInfo, ExitReport, ProcessBoundary, Spawn};
pub use transport::{PipeProcess, PipeTransport};
