//! Daemon orchestrator for wiring together all components.
//!
//! The `DaemonOrchestrator` owns the shared [`AppState`], binds the HTTP
//! listener, serves the API until told to stop, and then tears every
//! service down in order: stop accepting requests, stop the signal stream,
//! cancel background bridges, close terminals, close watchers.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::api::{self, AppState};
use crate::config::Config;

/// How long `stop` waits for the HTTP server to drain.
const SERVER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Daemon orchestrator state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrchestratorState {
    /// Initial state, not started.
    Stopped,
    /// Binding the listener.
    Starting,
    /// Serving requests.
    Running,
    /// Shutting down gracefully.
    ShuttingDown,
}

/// Events emitted by the orchestrator.
#[derive(Debug, Clone)]
pub enum OrchestratorEvent {
    /// Orchestrator state changed.
    StateChanged(OrchestratorState),
    /// The listener is bound.
    Listening { addr: SocketAddr },
    /// Error occurred.
    Error { message: String },
}

/// Daemon orchestrator that manages all subsystems.
pub struct DaemonOrchestrator {
    state: Arc<RwLock<OrchestratorState>>,
    app: AppState,
    local_addr: Option<SocketAddr>,
    server: Option<JoinHandle<()>>,
    shutdown_token: CancellationToken,
    event_tx: broadcast::Sender<OrchestratorEvent>,
}

impl DaemonOrchestrator {
    /// Creates a new daemon orchestrator.
    pub fn new(config: Config) -> Result<Self> {
        let app = AppState::new(config).context("Failed to build application state")?;
        let (event_tx, _) = broadcast::channel(64);

        Ok(Self {
            state: Arc::new(RwLock::new(OrchestratorState::Stopped)),
            app,
            local_addr: None,
            server: None,
            shutdown_token: CancellationToken::new(),
            event_tx,
        })
    }

    /// Returns the current state.
    pub async fn state(&self) -> OrchestratorState {
        *self.state.read().await
    }

    /// Returns a receiver for orchestrator events.
    pub fn subscribe(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.event_tx.subscribe()
    }

    /// Returns the bound address once started.
    ///
    /// Useful when the configured port is 0.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Returns the shared service state.
    pub fn app_state(&self) -> &AppState {
        &self.app
    }

    /// Binds the listener and starts serving.
    pub async fn start(&mut self) -> Result<()> {
        {
            let mut state = self.state.write().await;
            if *state != OrchestratorState::Stopped {
                anyhow::bail!("Orchestrator is already running");
            }
            *state = OrchestratorState::Starting;
        }
        self.emit_event(OrchestratorEvent::StateChanged(OrchestratorState::Starting));

        info!("Starting daemon orchestrator...");

        let listener = match self.bind().await {
            Ok(listener) => listener,
            Err(e) => {
                *self.state.write().await = OrchestratorState::Stopped;
                self.emit_event(OrchestratorEvent::Error {
                    message: e.to_string(),
                });
                return Err(e);
            }
        };
        let addr = listener.local_addr().context("Failed to read bound address")?;
        self.local_addr = Some(addr);
        self.emit_event(OrchestratorEvent::Listening { addr });

        let router = api::router(self.app.clone());
        let token = self.shutdown_token.clone();
        let event_tx = self.event_tx.clone();
        self.server = Some(tokio::spawn(async move {
            let result = axum::serve(listener, router)
                .with_graceful_shutdown(async move { token.cancelled().await })
                .await;
            if let Err(e) = result {
                warn!("HTTP server exited with error: {}", e);
                let _ = event_tx.send(OrchestratorEvent::Error {
                    message: e.to_string(),
                });
            }
        }));

        *self.state.write().await = OrchestratorState::Running;
        self.emit_event(OrchestratorEvent::StateChanged(OrchestratorState::Running));

        info!(%addr, "Daemon orchestrator started successfully");
        Ok(())
    }

    async fn bind(&self) -> Result<TcpListener> {
        let addr = self.app.config.listen_addr()?;
        TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind {}", addr))
    }

    /// Stops the daemon orchestrator gracefully.
    pub async fn stop(&mut self) -> Result<()> {
        {
            let mut state = self.state.write().await;
            if *state == OrchestratorState::Stopped {
                return Ok(());
            }
            if *state == OrchestratorState::ShuttingDown {
                anyhow::bail!("Orchestrator is already shutting down");
            }
            *state = OrchestratorState::ShuttingDown;
        }
        self.emit_event(OrchestratorEvent::StateChanged(
            OrchestratorState::ShuttingDown,
        ));

        info!("Stopping daemon orchestrator...");

        self.shutdown_token.cancel();
        if let Some(mut server) = self.server.take() {
            if tokio::time::timeout(SERVER_DRAIN_TIMEOUT, &mut server)
                .await
                .is_err()
            {
                warn!("HTTP server did not drain in time, aborting");
                server.abort();
            }
        }

        if self.app.signals.stop().is_ok() {
            debug!("Stopped signal service");
        }
        self.app.tasks.shutdown().await;
        self.app.terminals.shutdown().await;
        self.app.watchers.shutdown().await;

        self.local_addr = None;
        *self.state.write().await = OrchestratorState::Stopped;
        self.emit_event(OrchestratorEvent::StateChanged(OrchestratorState::Stopped));

        info!("Daemon orchestrator stopped");
        Ok(())
    }

    fn emit_event(&self, event: OrchestratorEvent) {
        let _ = self.event_tx.send(event);
    }

    /// Returns the shutdown token for external tasks to observe shutdown.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }
}
