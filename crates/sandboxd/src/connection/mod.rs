//! WebSocket fan-out transport.
//!
//! - [`ConnectionManager`]: live clients, channel subscriptions, broadcast
//! - [`ClientHandle`]: bounded per-client outbound queue
//! - [`Dispatcher`]: inbound message routing by [`protocol::ClientMessageKind`]

mod client;
mod dispatch;
mod manager;

pub use client::{ClientHandle, ClientStats, SendOutcome};
pub use dispatch::{DispatchError, Dispatcher, HandlerError, MessageHandler};
pub use manager::{
    BroadcastReport, ConnId, ConnectionError, ConnectionManager, ConnectionManagerBuilder,
    DEFAULT_CLIENT_QUEUE,
};
