//! Inbound message dispatch.
//!
//! Handlers are keyed by [`ClientMessageKind`] rather than by free-form
//! strings, and the table is validated while it is built: the built-in kinds
//! cannot be overridden and each kind has at most one handler.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use protocol::{ClientMessage, ClientMessageKind};
use thiserror::Error;

/// Errors raised while registering handlers.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DispatchError {
    /// The kind is answered by the connection manager itself.
    #[error("message type '{0}' is handled by the connection manager")]
    Builtin(ClientMessageKind),

    /// A handler is already registered for the kind.
    #[error("handler already registered for message type '{0}'")]
    Duplicate(ClientMessageKind),
}

/// Errors a handler reports back to the sending client.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum HandlerError {
    /// The referenced resource does not exist.
    #[error("{0}")]
    NotFound(String),

    /// The message was well-formed but its contents were rejected.
    #[error("invalid request: {0}")]
    Invalid(String),

    /// The handler could not complete the request.
    #[error("{0}")]
    Failed(String),
}

/// Callback for one inbound message kind.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Handles a message received on connection `conn_id`.
    async fn handle(&self, conn_id: &str, message: ClientMessage) -> Result<(), HandlerError>;
}

/// Frozen table of message handlers.
#[derive(Default, Clone)]
pub struct Dispatcher {
    handlers: HashMap<ClientMessageKind, Arc<dyn MessageHandler>>,
}

impl Dispatcher {
    /// Creates an empty dispatcher.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` for `kind`.
    pub fn register(
        &mut self,
        kind: ClientMessageKind,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<(), DispatchError> {
        if kind.is_builtin() {
            return Err(DispatchError::Builtin(kind));
        }
        if self.handlers.contains_key(&kind) {
            return Err(DispatchError::Duplicate(kind));
        }
        self.handlers.insert(kind, handler);
        Ok(())
    }

    /// Looks up the handler for `kind`.
    pub fn get(&self, kind: ClientMessageKind) -> Option<Arc<dyn MessageHandler>> {
        self.handlers.get(&kind).cloned()
    }

    /// Returns the registered kinds.
    pub fn kinds(&self) -> Vec<ClientMessageKind> {
        self.handlers.keys().copied().collect()
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("kinds", &self.kinds())
            .finish()
    }
}
