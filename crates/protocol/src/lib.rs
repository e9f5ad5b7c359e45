//! # Sandboxd Protocol Library
//!
//! Wire types shared by the sandboxd control plane and its clients.
//!
//! ## Overview
//!
//! Clients talk to the control plane over two surfaces:
//!
//! - **HTTP**: resource lifecycle (terminals, file watchers, signals). Request
//!   and response bodies live in [`api`].
//! - **WebSocket**: a single multiplexed publish/subscribe connection. Clients
//!   send [`ClientMessage`]s and receive [`ServerEvent`]s tagged with the
//!   logical [`channel`] they were published on.
//!
//! ```text
//! ┌──────────────┐  subscribe "terminal:<id>"   ┌──────────────────┐
//! │   client A   │ ───────────────────────────▶ │                  │
//! └──────────────┘ ◀─────────────────────────── │    connection    │ ◀── terminal reader
//! ┌──────────────┐       terminal:output        │     manager      │ ◀── watcher reader
//! │   client B   │ ◀─────────────────────────── │                  │ ◀── signal actor
//! └──────────────┘                              └──────────────────┘
//! ```
//!
//! ## Example Usage
//!
//! ```rust
//! use protocol::{ClientMessage, ServerEvent};
//! use protocol::messages::event_types;
//!
//! let msg = ClientMessage::decode(r#"{"type":"subscribe","data":{"channel":"signals"}}"#).unwrap();
//! assert!(matches!(msg, ClientMessage::Subscribe(_)));
//!
//! let event = ServerEvent::new(event_types::PONG, serde_json::json!({}));
//! assert!(event.encode().unwrap().contains("\"pong\""));
//! ```
//!
//! ## Modules
//!
//! - [`messages`]: inbound client messages and outbound server events
//! - [`channel`]: logical channel names
//! - [`signal`]: infrastructure signal payloads
//! - [`api`]: HTTP request and response bodies
//! - [`error`]: Error types

pub mod api;
pub mod channel;
pub mod error;
pub mod messages;
pub mod signal;

pub use channel::{terminal_channel, watcher_channel, Channel, SIGNALS_CHANNEL};
pub use error::{ProtocolError, Result};
pub use messages::{ClientMessage, ClientMessageKind, ServerEvent};
pub use signal::{PortAction, Signal, SignalData, SignalType};
