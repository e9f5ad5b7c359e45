//! Connection manager.
//!
//! Owns every live WebSocket client, the channel subscription table, and the
//! inbound dispatch table. Publishers call [`ConnectionManager::broadcast`]
//! from any task; iteration happens under a read lock and only membership
//! changes take the write lock.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use protocol::messages::{event_types, Connected, ErrorEvent, SubscriptionAck};
use protocol::{ClientMessage, ClientMessageKind, ProtocolError, ServerEvent};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

use super::client::{ClientHandle, ClientStats, SendOutcome};
use super::dispatch::{DispatchError, Dispatcher, MessageHandler};

/// Connection identifier.
pub type ConnId = String;

/// Default outbound queue length per client.
pub const DEFAULT_CLIENT_QUEUE: usize = 256;

/// How long a closing connection's writer gets to flush queued frames.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Errors from subscription management.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConnectionError {
    /// No connection with this ID is registered.
    #[error("connection not found: {0}")]
    UnknownConnection(ConnId),

    /// Channel names must be non-empty.
    #[error("channel name must not be empty")]
    EmptyChannel,
}

/// Outcome of a broadcast.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Clients the event was queued for.
    pub delivered: usize,
    /// Clients whose queue was full.
    pub dropped: usize,
    /// Dead clients removed during the broadcast.
    pub pruned: usize,
}

#[derive(Default)]
struct Registry {
    clients: HashMap<ConnId, ClientHandle>,
    channels: HashMap<String, HashSet<ConnId>>,
    subscriptions: HashMap<ConnId, HashSet<String>>,
}

impl Registry {
    fn remove_client(&mut self, conn_id: &str) -> Option<ClientHandle> {
        let handle = self.clients.remove(conn_id)?;
        if let Some(channels) = self.subscriptions.remove(conn_id) {
            for channel in channels {
                if let Some(members) = self.channels.get_mut(&channel) {
                    members.remove(conn_id);
                    if members.is_empty() {
                        self.channels.remove(&channel);
                    }
                }
            }
        }
        Some(handle)
    }
}

/// Builder validating the dispatch table before any traffic flows.
#[derive(Debug)]
pub struct ConnectionManagerBuilder {
    dispatcher: Dispatcher,
    client_queue: usize,
}

impl Default for ConnectionManagerBuilder {
    fn default() -> Self {
        Self {
            dispatcher: Dispatcher::new(),
            client_queue: DEFAULT_CLIENT_QUEUE,
        }
    }
}

impl ConnectionManagerBuilder {
    /// Sets the per-client outbound queue length.
    pub fn client_queue(mut self, capacity: usize) -> Self {
        self.client_queue = capacity.max(1);
        self
    }

    /// Registers the handler for an inbound message kind.
    pub fn handler(
        mut self,
        kind: ClientMessageKind,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<Self, DispatchError> {
        self.dispatcher.register(kind, handler)?;
        Ok(self)
    }

    /// Freezes the dispatch table and creates the manager.
    pub fn build(self) -> Arc<ConnectionManager> {
        Arc::new(ConnectionManager {
            registry: RwLock::new(Registry::default()),
            dispatcher: self.dispatcher,
            client_queue: self.client_queue,
        })
    }
}

/// Fan-out transport for WebSocket clients.
pub struct ConnectionManager {
    registry: RwLock<Registry>,
    dispatcher: Dispatcher,
    client_queue: usize,
}

impl ConnectionManager {
    /// Starts building a manager.
    pub fn builder() -> ConnectionManagerBuilder {
        ConnectionManagerBuilder::default()
    }

    /// Registers a new client and sends it the `connected` greeting.
    ///
    /// Returns the connection ID and the receiver its socket writer drains.
    pub async fn connect(&self) -> (ConnId, mpsc::Receiver<String>) {
        let conn_id = Uuid::new_v4().to_string();
        let (handle, rx) = ClientHandle::with_capacity(conn_id.clone(), self.client_queue);

        self.registry
            .write()
            .await
            .clients
            .insert(conn_id.clone(), handle);

        tracing::info!(conn_id = %conn_id, "Client connected");

        self.broadcast_to_client(
            &conn_id,
            event_types::CONNECTED,
            &Connected {
                connection_id: conn_id.clone(),
            },
        )
        .await;

        (conn_id, rx)
    }

    /// Removes a client and all of its subscriptions.
    pub async fn disconnect(&self, conn_id: &str) -> Option<ClientStats> {
        let handle = self.registry.write().await.remove_client(conn_id)?;
        let stats = handle.stats();
        tracing::info!(
            conn_id = %conn_id,
            sent = stats.messages_sent,
            dropped = stats.messages_dropped,
            "Client disconnected"
        );
        Some(stats)
    }

    /// Adds `channel` to a connection's subscriptions.
    ///
    /// The channel does not need a publisher yet.
    pub async fn subscribe(&self, conn_id: &str, channel: &str) -> Result<(), ConnectionError> {
        if channel.is_empty() {
            return Err(ConnectionError::EmptyChannel);
        }

        let mut registry = self.registry.write().await;
        if !registry.clients.contains_key(conn_id) {
            return Err(ConnectionError::UnknownConnection(conn_id.to_string()));
        }

        registry
            .channels
            .entry(channel.to_string())
            .or_default()
            .insert(conn_id.to_string());
        registry
            .subscriptions
            .entry(conn_id.to_string())
            .or_default()
            .insert(channel.to_string());

        tracing::debug!(conn_id = %conn_id, channel = %channel, "Subscribed");
        Ok(())
    }

    /// Removes `channel` from a connection's subscriptions.
    ///
    /// Returns whether the connection was subscribed.
    pub async fn unsubscribe(&self, conn_id: &str, channel: &str) -> bool {
        let mut registry = self.registry.write().await;

        let removed = match registry.channels.get_mut(channel) {
            Some(members) => {
                let removed = members.remove(conn_id);
                if members.is_empty() {
                    registry.channels.remove(channel);
                }
                removed
            }
            None => false,
        };

        if let Some(channels) = registry.subscriptions.get_mut(conn_id) {
            channels.remove(channel);
        }

        if removed {
            tracing::debug!(conn_id = %conn_id, channel = %channel, "Unsubscribed");
        }
        removed
    }

    /// Returns the connections subscribed to `channel`.
    pub async fn subscribers(&self, channel: &str) -> Vec<ConnId> {
        self.registry
            .read()
            .await
            .channels
            .get(channel)
            .map(|members| members.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Returns the channels a connection is subscribed to.
    pub async fn subscriptions(&self, conn_id: &str) -> Vec<String> {
        self.registry
            .read()
            .await
            .subscriptions
            .get(conn_id)
            .map(|channels| channels.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Returns the number of live connections.
    pub async fn connection_count(&self) -> usize {
        self.registry.read().await.clients.len()
    }

    /// Returns queue statistics for a connection.
    pub async fn client_stats(&self, conn_id: &str) -> Option<ClientStats> {
        self.registry
            .read()
            .await
            .clients
            .get(conn_id)
            .map(|handle| handle.stats())
    }

    /// Publishes an event to every subscriber of `channel`.
    ///
    /// An empty channel name publishes to every connection. Dead clients
    /// found along the way are pruned after the fan-out; they never abort
    /// delivery to the others.
    pub async fn broadcast<T: Serialize>(
        &self,
        channel: &str,
        event_type: &str,
        payload: &T,
    ) -> BroadcastReport {
        let frame = match encode_event(event_type, Some(channel), payload) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::error!(channel = %channel, event_type, error = %e, "Failed to encode event");
                return BroadcastReport::default();
            }
        };

        let mut report = BroadcastReport::default();
        let mut dead = Vec::new();
        {
            let registry = self.registry.read().await;
            let targets: Vec<&ClientHandle> = if channel.is_empty() {
                registry.clients.values().collect()
            } else {
                match registry.channels.get(channel) {
                    Some(members) => members
                        .iter()
                        .filter_map(|id| registry.clients.get(id))
                        .collect(),
                    None => {
                        tracing::trace!(channel = %channel, event_type, "No subscribers");
                        return report;
                    }
                }
            };

            for handle in targets {
                match handle.try_send(frame.clone()) {
                    SendOutcome::Sent => report.delivered += 1,
                    SendOutcome::Dropped => report.dropped += 1,
                    SendOutcome::Closed => dead.push(handle.id().to_string()),
                }
            }
        }

        if !dead.is_empty() {
            report.pruned = self.prune(&dead).await;
        }

        report
    }

    /// Sends an event to one connection, bypassing subscriptions.
    ///
    /// Returns whether the event was queued.
    pub async fn broadcast_to_client<T: Serialize>(
        &self,
        conn_id: &str,
        event_type: &str,
        payload: &T,
    ) -> bool {
        let frame = match encode_event(event_type, None, payload) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::error!(conn_id = %conn_id, event_type, error = %e, "Failed to encode event");
                return false;
            }
        };

        let outcome = {
            let registry = self.registry.read().await;
            match registry.clients.get(conn_id) {
                Some(handle) => handle.try_send(frame),
                None => return false,
            }
        };

        if outcome == SendOutcome::Closed {
            self.prune(&[conn_id.to_string()]).await;
        }
        outcome == SendOutcome::Sent
    }

    async fn prune(&self, dead: &[ConnId]) -> usize {
        let mut registry = self.registry.write().await;
        let mut pruned = 0;
        for conn_id in dead {
            if registry.remove_client(conn_id).is_some() {
                tracing::debug!(conn_id = %conn_id, "Pruned dead client");
                pruned += 1;
            }
        }
        pruned
    }

    /// Processes one inbound text frame from `conn_id`.
    ///
    /// Failures are logged and answered with an `error` event; they never
    /// end the connection.
    pub async fn handle_frame(&self, conn_id: &str, text: &str) {
        self.handle_decoded(conn_id, ClientMessage::decode(text))
            .await;
    }

    /// Processes one inbound binary frame carrying UTF-8 JSON.
    pub async fn handle_binary_frame(&self, conn_id: &str, bytes: &[u8]) {
        self.handle_decoded(conn_id, ClientMessage::decode_bytes(bytes))
            .await;
    }

    async fn handle_decoded(&self, conn_id: &str, decoded: Result<ClientMessage, ProtocolError>) {
        let message = match decoded {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(conn_id = %conn_id, error = %e, "Dropping malformed frame");
                self.send_error(conn_id, e.to_string()).await;
                return;
            }
        };

        match message {
            ClientMessage::Subscribe(sub) => match self.subscribe(conn_id, &sub.channel).await {
                Ok(()) => {
                    self.broadcast_to_client(
                        conn_id,
                        event_types::SUBSCRIBED,
                        &SubscriptionAck {
                            channel: sub.channel,
                        },
                    )
                    .await;
                }
                Err(e) => self.send_error(conn_id, e.to_string()).await,
            },
            ClientMessage::Unsubscribe(unsub) => {
                self.unsubscribe(conn_id, &unsub.channel).await;
                self.broadcast_to_client(
                    conn_id,
                    event_types::UNSUBSCRIBED,
                    &SubscriptionAck {
                        channel: unsub.channel,
                    },
                )
                .await;
            }
            ClientMessage::Ping(_) => {
                self.broadcast_to_client(conn_id, event_types::PONG, &serde_json::json!({}))
                    .await;
            }
            message => {
                let kind = message.kind();
                let Some(handler) = self.dispatcher.get(kind) else {
                    tracing::warn!(conn_id = %conn_id, kind = %kind, "No handler registered");
                    self.send_error(conn_id, format!("no handler for message type '{kind}'"))
                        .await;
                    return;
                };

                if let Err(e) = handler.handle(conn_id, message).await {
                    tracing::debug!(conn_id = %conn_id, kind = %kind, error = %e, "Handler failed");
                    self.send_error(conn_id, e.to_string()).await;
                }
            }
        }
    }

    async fn send_error(&self, conn_id: &str, message: String) {
        self.broadcast_to_client(conn_id, event_types::ERROR, &ErrorEvent { message })
            .await;
    }

    /// Serves one WebSocket until the peer goes away.
    ///
    /// Frames are read and dispatched on this task; a separate writer task
    /// drains the client's outbound queue into the socket.
    pub async fn handle_connection(self: Arc<Self>, socket: WebSocket) {
        let (conn_id, mut rx) = self.connect().await;
        let (mut sink, mut stream) = socket.split();

        let mut writer = tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                if sink.send(Message::Text(frame.into())).await.is_err() {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let mut writer_done = false;
        loop {
            tokio::select! {
                incoming = stream.next() => match incoming {
                    Some(Ok(Message::Text(text))) => self.handle_frame(&conn_id, text.as_str()).await,
                    Some(Ok(Message::Binary(bytes))) => self.handle_binary_frame(&conn_id, &bytes).await,
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::debug!(conn_id = %conn_id, error = %e, "WebSocket read error");
                        break;
                    }
                },
                _ = &mut writer => {
                    writer_done = true;
                    break;
                }
            }
        }

        self.disconnect(&conn_id).await;

        if !writer_done {
            let _ = tokio::time::timeout(WRITER_DRAIN_TIMEOUT, writer).await;
        }
    }
}

fn encode_event<T: Serialize>(
    event_type: &str,
    channel: Option<&str>,
    payload: &T,
) -> Result<String, ProtocolError> {
    let mut event = ServerEvent::from_payload(event_type, payload)?;
    if let Some(channel) = channel {
        event = event.on_channel(channel);
    }
    event.encode()
}
