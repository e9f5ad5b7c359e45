//! Signal service.
//!
//! A single process-wide buffered stream of infrastructure signals with an
//! explicit start/stop lifecycle. Emitters never block: a full buffer drops
//! the signal and reports [`SignalError::BufferFull`]. The receiving end is
//! handed to exactly one consumer per start via [`SignalService::take_signals`].

use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use protocol::api::SignalStatus;
use protocol::{PortAction, Signal};
use thiserror::Error;
use tokio::sync::mpsc;

/// Default capacity of the signal buffer.
pub const DEFAULT_SIGNAL_BUFFER: usize = 100;

/// Errors returned by the signal service.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SignalError {
    /// `start` was called while the service was active.
    #[error("signal service is already active")]
    AlreadyActive,

    /// The service is stopped.
    #[error("signal service is not active")]
    NotActive,

    /// The buffer is full and the signal was dropped.
    #[error("signal buffer is full, signal dropped")]
    BufferFull,

    /// The signal's fields were rejected.
    #[error("invalid signal: {0}")]
    Validation(String),
}

enum State {
    Stopped,
    Active {
        tx: mpsc::Sender<Signal>,
        rx: Option<mpsc::Receiver<Signal>>,
    },
}

/// Process-wide signal stream.
pub struct SignalService {
    state: RwLock<State>,
    buffer: usize,
}

impl Default for SignalService {
    fn default() -> Self {
        Self::new(DEFAULT_SIGNAL_BUFFER)
    }
}

impl SignalService {
    /// Creates a stopped service whose buffer holds `buffer` signals.
    pub fn new(buffer: usize) -> Self {
        Self {
            state: RwLock::new(State::Stopped),
            buffer: buffer.max(1),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, State> {
        self.state.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, State> {
        self.state.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Opens a fresh signal buffer.
    pub fn start(&self) -> Result<(), SignalError> {
        let mut state = self.write();
        if matches!(*state, State::Active { .. }) {
            return Err(SignalError::AlreadyActive);
        }

        let (tx, rx) = mpsc::channel(self.buffer);
        *state = State::Active { tx, rx: Some(rx) };
        tracing::info!(buffer = self.buffer, "Signal service started");
        Ok(())
    }

    /// Closes the buffer.
    ///
    /// A consumer still holding the receiver sees the remaining signals
    /// followed by the end of the stream.
    pub fn stop(&self) -> Result<(), SignalError> {
        let mut state = self.write();
        if matches!(*state, State::Stopped) {
            return Err(SignalError::NotActive);
        }
        *state = State::Stopped;
        tracing::info!("Signal service stopped");
        Ok(())
    }

    /// Returns whether the service is active.
    pub fn status(&self) -> SignalStatus {
        match *self.read() {
            State::Active { .. } => SignalStatus::Active,
            State::Stopped => SignalStatus::Stopped,
        }
    }

    /// Returns true while the service is active.
    pub fn is_active(&self) -> bool {
        self.status() == SignalStatus::Active
    }

    /// Hands out the receiving end of the current buffer.
    ///
    /// Only the first call after each `start` gets `Some`.
    pub fn take_signals(&self) -> Option<mpsc::Receiver<Signal>> {
        match &mut *self.write() {
            State::Active { rx, .. } => rx.take(),
            State::Stopped => None,
        }
    }

    /// Emits a port open/close signal.
    pub fn emit_port_signal(
        &self,
        port: u16,
        action: PortAction,
        url: &str,
    ) -> Result<(), SignalError> {
        if port == 0 {
            return Err(SignalError::Validation("port must be non-zero".to_string()));
        }
        self.emit(Signal::port(port, action, url))
    }

    /// Emits an error signal.
    pub fn emit_error_signal(&self, message: &str) -> Result<(), SignalError> {
        if message.trim().is_empty() {
            return Err(SignalError::Validation("message must not be empty".to_string()));
        }
        self.emit(Signal::error(message))
    }

    /// Emits a server-ready signal.
    pub fn emit_server_ready_signal(&self, port: u16, url: &str) -> Result<(), SignalError> {
        if port == 0 {
            return Err(SignalError::Validation("port must be non-zero".to_string()));
        }
        self.emit(Signal::server_ready(port, url))
    }

    fn emit(&self, signal: Signal) -> Result<(), SignalError> {
        let state = self.read();
        let State::Active { tx, .. } = &*state else {
            return Err(SignalError::NotActive);
        };

        match tx.try_send(signal) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(signal)) => {
                tracing::warn!(kind = ?signal.kind, "Signal buffer full, dropping signal");
                Err(SignalError::BufferFull)
            }
            // Only reachable if the consumer dropped its receiver early.
            Err(mpsc::error::TrySendError::Closed(_)) => Err(SignalError::NotActive),
        }
    }
}
