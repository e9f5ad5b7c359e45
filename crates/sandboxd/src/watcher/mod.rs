//! Filesystem watchers.
//!
//! - [`WatcherService`]: creates and deletes recursive watches
//! - [`IgnoreMatcher`]: ignore-pattern matching

mod ignore;
mod service;

use thiserror::Error;

pub use ignore::IgnoreMatcher;
pub use service::{classify, WatcherInfo, WatcherService};

/// Errors that can occur during watcher operations.
#[derive(Error, Debug)]
pub enum WatcherError {
    /// No watcher with this ID.
    #[error("watcher not found: {0}")]
    NotFound(String),

    /// The path to watch does not exist.
    #[error("path does not exist: {0}")]
    PathNotFound(String),

    /// The path to watch is not a directory.
    #[error("path is not a directory: {0}")]
    NotADirectory(String),

    /// An ignore pattern is not a valid glob.
    #[error("invalid ignore pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    /// The configured watcher limit is reached.
    #[error("watcher limit reached ({0})")]
    LimitReached(usize),

    /// The native watcher failed.
    #[error("native watcher error: {0}")]
    Notify(#[from] notify::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
