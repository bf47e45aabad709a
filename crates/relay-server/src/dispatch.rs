//! Command registry and dispatch.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use relay_core::ids::SessionId;

/// Wire identifiers for inbound commands.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CommandType {
    StartRun,
    CancelRun,
    RunStatus,
}

impl CommandType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StartRun => "run.start",
            Self::CancelRun => "run.cancel",
            Self::RunStatus => "run.status",
        }
    }
}

impl std::fmt::Display for CommandType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for CommandType {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "run.start" => Ok(Self::StartRun),
            "run.cancel" => Ok(Self::CancelRun),
            "run.status" => Ok(Self::RunStatus),
            other => Err(format!("unknown command type: {other}")),
        }
    }
}

/// Session scope a handler operates in. Built once per connection.
#[derive(Clone, Debug)]
pub struct SessionContext {
    pub session_id: SessionId,
}

impl SessionContext {
    pub fn new(session_id: SessionId) -> Self {
        Self { session_id }
    }
}

/// Trait implemented by every command handler.
///
/// Handlers never return errors to the dispatcher: user-visible failures
/// are published as Error events so they travel the same pipeline, gate,
/// and fan-out as ordinary events.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    fn command_type(&self) -> CommandType;

    async fn handle(&self, content: Value, session: &SessionContext);
}

/// Registry mapping command types to handlers. Dispatch is a pure lookup;
/// an unknown identifier resolves to "no handler" and the caller decides
/// whether that is an error.
pub struct CommandRegistry {
    handlers: HashMap<CommandType, Arc<dyn CommandHandler>>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    pub fn register(&mut self, handler: Arc<dyn CommandHandler>) {
        let _ = self.handlers.insert(handler.command_type(), handler);
    }

    pub fn get(&self, command_type: CommandType) -> Option<Arc<dyn CommandHandler>> {
        self.handlers.get(&command_type).cloned()
    }

    pub fn has(&self, command_type: CommandType) -> bool {
        self.handlers.contains_key(&command_type)
    }

    /// Registered command identifiers (sorted).
    pub fn command_types(&self) -> Vec<&'static str> {
        let mut names: Vec<&'static str> =
            self.handlers.keys().map(CommandType::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Dispatch a command. Returns false when no handler is registered
    /// for the type.
    pub async fn dispatch(
        &self,
        command_type: CommandType,
        content: Value,
        session: &SessionContext,
    ) -> bool {
        match self.get(command_type) {
            Some(handler) => {
                handler.handle(content, session).await;
                true
            }
            None => false,
        }
    }
}

impl Default for CommandRegistry {
    fn default() -> Self {
        Self::new()
    }
}
