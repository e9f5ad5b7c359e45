//! # Sandboxd Library
//!
//! Real-time session core for remote sandboxes: interactive PTY terminals,
//! filesystem watchers and infrastructure signals, all delivered to clients
//! over one multiplexed WebSocket publish/subscribe transport.
//!
//! ## Overview
//!
//! - **Terminal Service**: spawn shells on pseudo-terminals, write input,
//!   resize, run one-shot commands
//! - **Watcher Service**: recursive directory watches with ignore globs and
//!   optional content capture
//! - **Signal Service**: a process-wide stream of port, server-ready and
//!   error signals with a start/stop lifecycle
//! - **Connection Manager**: client registry, channel subscriptions,
//!   broadcast fan-out and inbound message dispatch
//! - **Task Registry**: the reader bridges that move resource events onto
//!   the transport, keyed by channel name
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     Daemon Orchestrator                         │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                                                                  │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────────────┐  │
//! │  │   Terminal   │  │   Watcher    │  │       Signal         │  │
//! │  │   Service    │  │   Service    │  │       Service        │  │
//! │  └──────┬───────┘  └──────┬───────┘  └──────────┬───────────┘  │
//! │         │                 │                     │              │
//! │  ┌──────▼─────────────────▼─────────────────────▼───────────┐  │
//! │  │          Task Registry (reader bridges, by channel)       │  │
//! │  └───────────────────────────┬───────────────────────────────┘  │
//! │                              │ broadcast                       │
//! │  ┌───────────────────────────▼───────────────────────────────┐  │
//! │  │                  Connection Manager                       │  │
//! │  └───────────────────────────▲───────────────────────────────┘  │
//! │                              │                                  │
//! │  ┌───────────────────────────┴───────────────────────────────┐  │
//! │  │             HTTP routes  +  GET /ws (axum)                │  │
//! │  └───────────────────────────────────────────────────────────┘  │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use sandboxd::{Config, DaemonOrchestrator};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load_default()?;
//!
//!     let mut orchestrator = DaemonOrchestrator::new(config)?;
//!     orchestrator.start().await?;
//!
//!     // Serving on orchestrator.local_addr() until stopped.
//!
//!     orchestrator.stop().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading and defaults
//! - [`connection`]: WebSocket clients, subscriptions and dispatch
//! - [`terminal`]: PTY terminals
//! - [`watcher`]: Filesystem watchers
//! - [`signals`]: Signal stream
//! - [`registry`]: Keyed background tasks
//! - [`api`]: HTTP and WebSocket routes
//! - [`orchestrator`]: Startup and shutdown

pub mod api;
pub mod config;
pub mod connection;
pub mod orchestrator;
pub mod registry;
pub mod signals;
pub mod terminal;
pub mod watcher;

// Re-export protocol for convenience
pub use protocol;

pub use api::{router, ApiError, AppState, StateError};
pub use config::Config;
pub use connection::{
    BroadcastReport, ClientStats, ConnectionManager, HandlerError, MessageHandler,
};
pub use orchestrator::{DaemonOrchestrator, OrchestratorEvent, OrchestratorState};
pub use registry::{RegistryError, TaskRegistry};
pub use signals::{SignalError, SignalService};
pub use terminal::{TerminalError, TerminalInfo, TerminalService};
pub use watcher::{WatcherError, WatcherInfo, WatcherService};
