//! HTTP and WebSocket surface.
//!
//! Every route is a thin adapter from a request onto one of the services in
//! [`AppState`]. Background bridges (terminal readers, watcher forwarders,
//! the signal actor) are registered in the shared [`TaskRegistry`] under
//! the name of the channel they publish on.

mod error;
mod extract;
mod signals;
mod terminals;
mod watchers;
mod ws;

use std::sync::Arc;

use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use protocol::api::HealthResponse;
use protocol::ClientMessageKind;
use thiserror::Error;
use tower_http::trace::TraceLayer;

use crate::config::{Config, ConfigError};
use crate::connection::{ConnectionManager, DispatchError};
use crate::registry::TaskRegistry;
use crate::signals::SignalService;
use crate::terminal::TerminalService;
use crate::watcher::WatcherService;

pub use error::ApiError;
pub use extract::{JsonBody, OptionalJsonBody};
pub use terminals::TerminalControlHandler;

/// Errors raised while building [`AppState`].
#[derive(Error, Debug)]
pub enum StateError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("failed to register message handlers: {0}")]
    Dispatch(#[from] DispatchError),
}

/// Services shared by every handler.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub terminals: Arc<TerminalService>,
    pub watchers: Arc<WatcherService>,
    pub signals: Arc<SignalService>,
    pub connections: Arc<ConnectionManager>,
    pub tasks: Arc<TaskRegistry>,
}

impl AppState {
    /// Validates `config`, builds every service from it and wires terminal
    /// control frames into the connection manager.
    pub fn new(config: Config) -> Result<Self, StateError> {
        config.validate()?;

        let terminals = Arc::new(TerminalService::new(config.terminal.clone()));
        let watchers = Arc::new(WatcherService::new(config.watcher.clone()));
        let signals = Arc::new(SignalService::new(config.signals.buffer));

        let control = Arc::new(TerminalControlHandler::new(Arc::clone(&terminals)));
        let connections = ConnectionManager::builder()
            .client_queue(config.connection.client_queue)
            .handler(ClientMessageKind::TerminalInput, control.clone())?
            .handler(ClientMessageKind::TerminalResize, control)?
            .build();

        Ok(Self {
            config: Arc::new(config),
            terminals,
            watchers,
            signals,
            connections,
            tasks: Arc::new(TaskRegistry::new()),
        })
    }
}

/// Builds the full route table.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ws", get(ws::upgrade))
        .route("/terminals", post(terminals::create).get(terminals::list))
        .route(
            "/terminals/{id}",
            get(terminals::get).delete(terminals::delete),
        )
        .route("/terminals/{id}/execute", post(terminals::execute))
        .route("/terminals/{id}/input", post(terminals::input))
        .route("/terminals/{id}/resize", post(terminals::resize))
        .route("/watchers", post(watchers::create).get(watchers::list))
        .route("/watchers/{id}", get(watchers::get).delete(watchers::delete))
        .route("/signals/start", post(signals::start))
        .route("/signals/stop", post(signals::stop))
        .route("/signals/status", get(signals::status))
        .route("/signals/port", post(signals::port))
        .route("/signals/error", post(signals::error))
        .route("/signals/server-ready", post(signals::server_ready))
        .fallback(not_found)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        terminals: state.terminals.count(),
        watchers: state.watchers.count(),
        connections: state.connections.connection_count().await,
        signals: state.signals.status(),
    })
}

async fn not_found() -> ApiError {
    ApiError::NotFound("route not found".to_string())
}
