//! Infrastructure signals.
//!
//! Signals are ephemeral notifications about the sandbox (a port opened, a
//! dev server became ready, something failed). They are never persisted and
//! never replayed to late subscribers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kind of signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignalType {
    Port,
    Error,
    ServerReady,
}

/// Whether a port was opened or closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PortAction {
    Open,
    Close,
}

/// Payload of a port signal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortSignal {
    pub port: u16,
    #[serde(rename = "type")]
    pub action: PortAction,
    pub url: String,
}

/// Payload of a server-ready signal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerReadySignal {
    pub port: u16,
    pub url: String,
}

/// Payload of an error signal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorSignal {
    pub message: String,
}

/// Signal payload variants.
///
/// Serialized without a tag; the enclosing [`Signal::kind`] says which one it is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SignalData {
    Port(PortSignal),
    ServerReady(ServerReadySignal),
    Error(ErrorSignal),
}

/// A single infrastructure signal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signal {
    #[serde(rename = "type")]
    pub kind: SignalType,
    pub timestamp: DateTime<Utc>,
    pub data: SignalData,
}

impl Signal {
    /// Builds a port signal stamped with the current time.
    pub fn port(port: u16, action: PortAction, url: impl Into<String>) -> Self {
        Self {
            kind: SignalType::Port,
            timestamp: Utc::now(),
            data: SignalData::Port(PortSignal {
                port,
                action,
                url: url.into(),
            }),
        }
    }

    /// Builds a server-ready signal stamped with the current time.
    pub fn server_ready(port: u16, url: impl Into<String>) -> Self {
        Self {
            kind: SignalType::ServerReady,
            timestamp: Utc::now(),
            data: SignalData::ServerReady(ServerReadySignal {
                port,
                url: url.into(),
            }),
        }
    }

    /// Builds an error signal stamped with the current time.
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            kind: SignalType::Error,
            timestamp: Utc::now(),
            data: SignalData::Error(ErrorSignal {
                message: message.into(),
            }),
        }
    }
}
