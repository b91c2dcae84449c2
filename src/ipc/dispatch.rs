//! Name-keyed host-callback dispatcher.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::ipc::process::CommandDispatcher;
use crate::types::{Error, Result};

/// Synchronous handler for one command name.
pub type CommandHandler = Arc<dyn Fn(&[u8]) -> Result<Option<Value>> + Send + Sync>;

/// Routes host-callback commands to registered handlers.
///
/// Unknown commands are logged and answered with nothing, so the worker
/// keeps running.
#[derive(Clone, Default)]
pub struct DispatchTable {
    handlers: HashMap<String, CommandHandler>,
}

impl DispatchTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `command`. Each command has at most one handler.
    pub fn register<F>(&mut self, command: impl Into<String>, handler: F) -> Result<()>
    where
        F: Fn(&[u8]) -> Result<Option<Value>> + Send + Sync + 'static,
    {
        let command = command.into();
        if self.handlers.contains_key(&command) {
            return Err(Error::validation(format!(
                "Command handler already registered: {}",
                command
            )));
        }
        tracing::debug!("Registered command handler: {}", command);
        self.handlers.insert(command, Arc::new(handler));
        Ok(())
    }

    pub fn unregister(&mut self, command: &str) -> bool {
        self.handlers.remove(command).is_some()
    }

    pub fn contains(&self, command: &str) -> bool {
        self.handlers.contains_key(command)
    }
}

impl fmt::Debug for DispatchTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut commands: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        commands.sort_unstable();
        f.debug_struct("DispatchTable")
            .field("commands", &commands)
            .finish()
    }
}

#[async_trait]
impl CommandDispatcher for DispatchTable {
    async fn dispatch(&self, command: &str, payload: &[u8]) -> Result<Option<Value>> {
        match self.handlers.get(command) {
            Some(handler) => handler(payload),
            None => {
                tracing::debug!("No handler registered for command: {}", command);
                Ok(None)
            }
        }
    }
}
