//! HTTP request and response bodies.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::signal::PortAction;

// ============================================================================
// Terminals
// ============================================================================

/// Lifecycle state of a terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TerminalStatus {
    Active,
    Exited,
}

/// `POST /terminals`. Every field is optional; an empty body is valid.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CreateTerminalRequest {
    pub shell: Option<String>,
    pub cols: Option<u16>,
    pub rows: Option<u16>,
    pub cwd: Option<String>,
}

/// A terminal as seen over HTTP.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalResponse {
    pub id: String,
    pub status: TerminalStatus,
    pub channel: String,
    pub shell: String,
    pub pid: Option<u32>,
    pub cols: u16,
    pub rows: u16,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// `POST /terminals/{id}/execute`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecuteRequest {
    pub command: String,
}

/// Result of a one-shot command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecuteResponse {
    pub command: String,
    pub output: String,
    pub exit_code: i32,
    pub duration_ms: u64,
}

/// `POST /terminals/{id}/input`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputRequest {
    pub input: String,
}

/// `POST /terminals/{id}/resize`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResizeRequest {
    pub rows: u16,
    pub cols: u16,
}

// ============================================================================
// Watchers
// ============================================================================

/// Lifecycle state of a file watcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WatcherStatus {
    Active,
    Stopped,
}

/// `POST /watchers`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateWatcherRequest {
    pub path: String,
    #[serde(default, rename = "includeContent", alias = "include_content")]
    pub include_content: bool,
    #[serde(default)]
    pub ignored: Vec<String>,
}

/// A file watcher as seen over HTTP.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatcherResponse {
    pub id: String,
    pub path: String,
    #[serde(rename = "includeContent")]
    pub include_content: bool,
    pub ignored: Vec<String>,
    pub status: WatcherStatus,
    pub channel: String,
    pub created_at: DateTime<Utc>,
}

// ============================================================================
// Signals
// ============================================================================

/// Whether the signal service is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalStatus {
    Active,
    Stopped,
}

/// `GET /signals/status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalStatusResponse {
    pub status: SignalStatus,
}

/// `POST /signals/port`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortSignalRequest {
    pub port: u16,
    #[serde(rename = "type")]
    pub action: PortAction,
    pub url: String,
}

/// `POST /signals/error`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorSignalRequest {
    pub message: String,
}

/// `POST /signals/server-ready`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerReadySignalRequest {
    pub port: u16,
    pub url: String,
}

// ============================================================================
// Misc
// ============================================================================

/// `GET /health`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub terminals: usize,
    pub watchers: usize,
    pub connections: usize,
    pub signals: SignalStatus,
}

/// Body of every failed request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}
