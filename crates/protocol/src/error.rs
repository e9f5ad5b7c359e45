//! Error types for the protocol crate.

use thiserror::Error;

/// Protocol error type covering encoding and decoding failures.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Failed to serialize data.
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// Failed to deserialize data.
    #[error("deserialization failed: {0}")]
    Deserialization(String),

    /// The frame named a message type the server does not understand.
    #[error("unknown message type: {0}")]
    UnknownMessageType(String),

    /// The frame was not valid UTF-8 text.
    #[error("frame is not valid UTF-8")]
    InvalidUtf8,

    /// A channel name could not be parsed.
    #[error("invalid channel: {0}")]
    InvalidChannel(String),
}

/// Result type alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_data() || err.is_eof() || err.is_syntax() {
            ProtocolError::Deserialization(err.to_string())
        } else {
            ProtocolError::Serialization(err.to_string())
        }
    }
}
