//! Per-connection outbound queue.
//!
//! Each connected client gets a bounded queue of encoded frames drained by
//! its socket writer task. When the queue is full the frame is dropped for
//! that client only, so one slow socket never stalls a broadcast.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use tokio::sync::mpsc;

/// Statistics about a client's outbound queue.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientStats {
    /// Frames queued successfully.
    pub messages_sent: u64,
    /// Frames dropped because the queue was full.
    pub messages_dropped: u64,
    /// Whether the last send attempt found the queue full.
    pub is_backpressured: bool,
}

/// Result of offering a frame to a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Frame queued.
    Sent,
    /// Queue full, frame dropped.
    Dropped,
    /// The writer side is gone; the client should be pruned.
    Closed,
}

/// Handle to a connected client's outbound queue.
#[derive(Debug)]
pub struct ClientHandle {
    id: String,
    tx: mpsc::Sender<String>,
    sent: AtomicU64,
    dropped: AtomicU64,
    backpressured: AtomicBool,
}

impl ClientHandle {
    /// Creates a handle with a queue of `capacity` frames.
    ///
    /// Returns the handle and the receiver the socket writer drains.
    pub fn with_capacity(id: impl Into<String>, capacity: usize) -> (Self, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let handle = Self {
            id: id.into(),
            tx,
            sent: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            backpressured: AtomicBool::new(false),
        };
        (handle, rx)
    }

    /// Returns the connection ID.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Returns a snapshot of the statistics.
    pub fn stats(&self) -> ClientStats {
        ClientStats {
            messages_sent: self.sent.load(Ordering::Relaxed),
            messages_dropped: self.dropped.load(Ordering::Relaxed),
            is_backpressured: self.backpressured.load(Ordering::Relaxed),
        }
    }

    /// Returns whether the writer side has gone away.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Offers a frame without blocking.
    pub fn try_send(&self, frame: String) -> SendOutcome {
        match self.tx.try_send(frame) {
            Ok(()) => {
                self.sent.fetch_add(1, Ordering::Relaxed);
                if self.backpressured.swap(false, Ordering::Relaxed) {
                    tracing::debug!(conn_id = %self.id, "Client recovered from backpressure");
                }
                SendOutcome::Sent
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if !self.backpressured.swap(true, Ordering::Relaxed) {
                    tracing::warn!(
                        conn_id = %self.id,
                        dropped,
                        "Client is backpressured, dropping events"
                    );
                }
                SendOutcome::Dropped
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::debug!(conn_id = %self.id, "Client queue closed");
                SendOutcome::Closed
            }
        }
    }
}
