//! Core types for the worker IPC layer.
//!
//! - **IDs**: `InstanceId` for each spawned worker
//! - **Errors**: Application error types with thiserror derives
//! - **Config**: Worker descriptor, governor and transport settings

mod config;
mod errors;
mod ids;

pub use config::{
    Config, GovernorConfig, ObservabilityConfig, OomConfig, ProcessDescriptor, TransportConfig,
};
pub use errors::{Error, Result};
pub use ids::InstanceId;
