//! Logical pub/sub channel names.
//!
//! A channel is only a string key. Nothing needs to exist before a client
//! subscribes to it or a publisher sends on it.

use std::fmt;
use std::str::FromStr;

use crate::error::ProtocolError;

/// Channel carrying infrastructure signals.
pub const SIGNALS_CHANNEL: &str = "signals";

const TERMINAL_PREFIX: &str = "terminal:";
const WATCHER_PREFIX: &str = "watcher:";

/// Returns the channel name for a terminal's output stream.
pub fn terminal_channel(id: &str) -> String {
    format!("{TERMINAL_PREFIX}{id}")
}

/// Returns the channel name for a file watcher's event stream.
pub fn watcher_channel(id: &str) -> String {
    format!("{WATCHER_PREFIX}{id}")
}

/// A parsed, well-known channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Channel {
    /// Broadcast-to-all (the empty channel name).
    All,
    /// Output of one terminal.
    Terminal(String),
    /// Events of one file watcher.
    Watcher(String),
    /// The shared signal stream.
    Signals,
}

impl Channel {
    /// Returns the wire name of the channel.
    pub fn name(&self) -> String {
        match self {
            Channel::All => String::new(),
            Channel::Terminal(id) => terminal_channel(id),
            Channel::Watcher(id) => watcher_channel(id),
            Channel::Signals => SIGNALS_CHANNEL.to_string(),
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

impl FromStr for Channel {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Ok(Channel::All);
        }
        if s == SIGNALS_CHANNEL {
            return Ok(Channel::Signals);
        }
        if let Some(id) = s.strip_prefix(TERMINAL_PREFIX) {
            if !id.is_empty() {
                return Ok(Channel::Terminal(id.to_string()));
            }
        }
        if let Some(id) = s.strip_prefix(WATCHER_PREFIX) {
            if !id.is_empty() {
                return Ok(Channel::Watcher(id.to_string()));
            }
        }
        Err(ProtocolError::InvalidChannel(s.to_string()))
    }
}
