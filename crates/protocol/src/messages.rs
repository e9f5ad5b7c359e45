//! WebSocket message definitions.
//!
//! Every frame in either direction is a JSON object of the form
//! `{"type": "...", "data": {...}}`. Inbound frames decode into
//! [`ClientMessage`]; outbound frames are [`ServerEvent`]s.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ProtocolError, Result};

/// Outbound event type names.
pub mod event_types {
    /// Unicast sent once when a connection is accepted.
    pub const CONNECTED: &str = "connected";
    /// Acknowledges a subscribe request.
    pub const SUBSCRIBED: &str = "subscribed";
    /// Acknowledges an unsubscribe request.
    pub const UNSUBSCRIBED: &str = "unsubscribed";
    /// Answer to a ping.
    pub const PONG: &str = "pong";
    /// A request from this client failed.
    pub const ERROR: &str = "error";

    /// Raw PTY output.
    pub const TERMINAL_OUTPUT: &str = "terminal:output";
    /// Output of a one-shot command run with execute.
    pub const TERMINAL_EXECUTE: &str = "terminal:execute";
    /// The terminal's reader hit an I/O error.
    pub const TERMINAL_ERROR: &str = "terminal:error";
    /// The terminal's shell process exited.
    pub const TERMINAL_EXITED: &str = "terminal:exited";
    /// Global notice: a terminal was created.
    pub const TERMINAL_CREATED: &str = "terminal:created";
    /// Global notice: a terminal was deleted.
    pub const TERMINAL_DELETED: &str = "terminal:deleted";

    /// A watched file changed.
    pub const FILE_CHANGED: &str = "file:changed";
    /// Global notice: a watcher was created.
    pub const WATCHER_CREATED: &str = "watcher:created";
    /// Global notice: a watcher was deleted.
    pub const WATCHER_DELETED: &str = "watcher:deleted";

    /// An infrastructure signal.
    pub const SIGNAL: &str = "signal";
}

// ============================================================================
// Inbound messages
// ============================================================================

/// A message sent by a client over the WebSocket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ClientMessage {
    /// Join a channel.
    #[serde(rename = "subscribe")]
    Subscribe(Subscribe),
    /// Leave a channel.
    #[serde(rename = "unsubscribe")]
    Unsubscribe(Unsubscribe),
    /// Keepalive. `data` may be absent, `null` or any object.
    #[serde(rename = "ping")]
    Ping(Option<Ping>),
    /// Keystrokes for a terminal.
    #[serde(rename = "terminal:input")]
    TerminalInput(TerminalInput),
    /// Window size change for a terminal.
    #[serde(rename = "terminal:resize")]
    TerminalResize(TerminalResize),
}

/// Discriminant of [`ClientMessage`], used as the dispatch key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClientMessageKind {
    Subscribe,
    Unsubscribe,
    Ping,
    TerminalInput,
    TerminalResize,
}

impl ClientMessageKind {
    /// All known kinds.
    pub const ALL: [ClientMessageKind; 5] = [
        ClientMessageKind::Subscribe,
        ClientMessageKind::Unsubscribe,
        ClientMessageKind::Ping,
        ClientMessageKind::TerminalInput,
        ClientMessageKind::TerminalResize,
    ];

    /// Returns the wire name of the message type.
    pub fn as_str(&self) -> &'static str {
        match self {
            ClientMessageKind::Subscribe => "subscribe",
            ClientMessageKind::Unsubscribe => "unsubscribe",
            ClientMessageKind::Ping => "ping",
            ClientMessageKind::TerminalInput => "terminal:input",
            ClientMessageKind::TerminalResize => "terminal:resize",
        }
    }

    /// Looks a kind up by its wire name.
    pub fn from_wire(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == name)
    }

    /// Whether the connection manager answers this kind itself.
    pub fn is_builtin(&self) -> bool {
        matches!(
            self,
            ClientMessageKind::Subscribe | ClientMessageKind::Unsubscribe | ClientMessageKind::Ping
        )
    }
}

impl std::fmt::Display for ClientMessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl ClientMessage {
    /// Returns the message's discriminant.
    pub fn kind(&self) -> ClientMessageKind {
        match self {
            ClientMessage::Subscribe(_) => ClientMessageKind::Subscribe,
            ClientMessage::Unsubscribe(_) => ClientMessageKind::Unsubscribe,
            ClientMessage::Ping(_) => ClientMessageKind::Ping,
            ClientMessage::TerminalInput(_) => ClientMessageKind::TerminalInput,
            ClientMessage::TerminalResize(_) => ClientMessageKind::TerminalResize,
        }
    }

    /// Decodes a text frame.
    ///
    /// Unknown `type` values are reported as
    /// [`ProtocolError::UnknownMessageType`] so callers can tell them apart
    /// from malformed payloads.
    pub fn decode(text: &str) -> Result<Self> {
        let value: serde_json::Value = serde_json::from_str(text)?;
        let message_type = value
            .get("type")
            .and_then(|t| t.as_str())
            .ok_or_else(|| ProtocolError::Deserialization("missing field `type`".to_string()))?;

        if ClientMessageKind::from_wire(message_type).is_none() {
            return Err(ProtocolError::UnknownMessageType(message_type.to_string()));
        }

        Ok(serde_json::from_value(value)?)
    }

    /// Decodes a binary frame carrying UTF-8 JSON.
    pub fn decode_bytes(bytes: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(bytes).map_err(|_| ProtocolError::InvalidUtf8)?;
        Self::decode(text)
    }

    /// Encodes the message as a JSON text frame.
    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Subscribe to a channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscribe {
    pub channel: String,
}

/// Unsubscribe from a channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Unsubscribe {
    pub channel: String,
}

/// Keepalive payload. Any fields a client sends are ignored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ping {}

/// Input bytes for a terminal, as text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalInput {
    pub terminal_id: String,
    pub input: String,
}

/// Resize a terminal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalResize {
    pub terminal_id: String,
    pub rows: u16,
    pub cols: u16,
}

// ============================================================================
// Outbound events
// ============================================================================

/// An event pushed to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerEvent {
    /// Event type, one of [`event_types`].
    #[serde(rename = "type")]
    pub event_type: String,
    /// Channel the event was published on; absent for unicasts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    /// Event payload.
    pub data: serde_json::Value,
}

impl ServerEvent {
    /// Creates an event with no channel tag.
    pub fn new(event_type: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            event_type: event_type.into(),
            channel: None,
            data,
        }
    }

    /// Creates an event from any serializable payload.
    pub fn from_payload<T: Serialize>(event_type: impl Into<String>, payload: &T) -> Result<Self> {
        Ok(Self::new(event_type, serde_json::to_value(payload)?))
    }

    /// Tags the event with the channel it is published on.
    pub fn on_channel(mut self, channel: impl Into<String>) -> Self {
        let channel = channel.into();
        self.channel = if channel.is_empty() { None } else { Some(channel) };
        self
    }

    /// Encodes the event as a JSON text frame.
    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decodes an event, as a client would.
    pub fn decode(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }
}

/// Payload of `connected`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Connected {
    pub connection_id: String,
}

/// Payload of `subscribed` and `unsubscribed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionAck {
    pub channel: String,
}

/// Payload of `error`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorEvent {
    pub message: String,
}

/// Payload of `terminal:output`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalOutput {
    pub terminal_id: String,
    pub data: String,
}

/// Payload of `terminal:execute`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecuteOutput {
    pub terminal_id: String,
    pub command: String,
    pub output: String,
    pub exit_code: i32,
    pub duration_ms: u64,
}

/// Payload of `terminal:error`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalErrorEvent {
    pub terminal_id: String,
    pub error: String,
}

/// Payload of `terminal:exited`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalExited {
    pub terminal_id: String,
    pub exit_code: Option<i32>,
}

/// Payload of `terminal:deleted` and `watcher:deleted`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceDeleted {
    pub id: String,
}

/// Classification of a filesystem change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileChangeKind {
    Created,
    Modified,
    Deleted,
    Renamed,
}

impl FileChangeKind {
    /// Whether content capture applies to this kind.
    pub fn carries_content(&self) -> bool {
        matches!(self, FileChangeKind::Created | FileChangeKind::Modified)
    }
}

/// Payload of `file:changed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChange {
    pub watcher_id: String,
    pub path: String,
    #[serde(rename = "type")]
    pub kind: FileChangeKind,
    pub is_dir: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    pub timestamp: DateTime<Utc>,
}
