//! PTY terminal sessions.
//!
//! This module provides:
//! - [`Terminal`]: a single shell attached to a pseudo-terminal
//! - [`TerminalService`]: the registry of live terminals and one-shot execution
//! - [`Utf8Decoder`]: incremental decoding of PTY output

mod output;
mod pty;
mod service;

use thiserror::Error;

pub use output::Utf8Decoder;
pub use pty::{Terminal, TerminalInfo};
pub use service::{ExecuteResult, TerminalService};

/// Errors that can occur during terminal operations.
#[derive(Error, Debug)]
pub enum TerminalError {
    /// The terminal does not exist or has exited.
    #[error("terminal not found: {0}")]
    NotFound(String),

    /// The configured terminal limit is reached.
    #[error("terminal limit reached ({0})")]
    LimitReached(usize),

    /// Rows and columns must be non-zero.
    #[error("invalid terminal size {cols}x{rows}")]
    InvalidSize { cols: u16, rows: u16 },

    /// The working directory does not exist.
    #[error("working directory does not exist: {0}")]
    InvalidCwd(String),

    /// Execute was called with an empty command.
    #[error("command must not be empty")]
    InvalidCommand,

    /// Failed to spawn the PTY or the shell.
    #[error("failed to spawn terminal: {0}")]
    SpawnFailed(String),

    /// Failed to write to the PTY.
    #[error("failed to write to terminal: {0}")]
    WriteFailed(String),

    /// Failed to read from the PTY.
    #[error("failed to read from terminal: {0}")]
    ReadFailed(String),

    /// Failed to resize the PTY.
    #[error("failed to resize terminal: {0}")]
    ResizeFailed(String),

    /// The one-shot command could not be run.
    #[error("failed to execute command: {0}")]
    ExecuteFailed(String),
}
