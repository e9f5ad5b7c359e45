//! Signal routes and the signal broadcast actor.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use protocol::api::{
    ErrorSignalRequest, PortSignalRequest, ServerReadySignalRequest, SignalStatusResponse,
};
use protocol::messages::event_types;
use protocol::{Signal, SIGNALS_CHANNEL};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::extract::JsonBody;
use super::{ApiError, AppState};
use crate::connection::ConnectionManager;

/// POST /signals/start
pub async fn start(State(state): State<AppState>) -> Result<Json<SignalStatusResponse>, ApiError> {
    state.signals.start()?;

    let Some(signals) = state.signals.take_signals() else {
        let _ = state.signals.stop();
        return Err(ApiError::Internal("signal stream already taken".to_string()));
    };

    let connections = Arc::clone(&state.connections);
    let spawned = state.tasks.spawn(SIGNALS_CHANNEL, move |token| {
        run_actor(signals, connections, token)
    });
    if let Err(e) = spawned {
        let _ = state.signals.stop();
        return Err(e.into());
    }

    Ok(Json(SignalStatusResponse {
        status: state.signals.status(),
    }))
}

/// POST /signals/stop
pub async fn stop(State(state): State<AppState>) -> Result<Json<SignalStatusResponse>, ApiError> {
    state.signals.stop()?;
    state.tasks.cancel(SIGNALS_CHANNEL).await;

    Ok(Json(SignalStatusResponse {
        status: state.signals.status(),
    }))
}

/// GET /signals/status
pub async fn status(State(state): State<AppState>) -> Json<SignalStatusResponse> {
    Json(SignalStatusResponse {
        status: state.signals.status(),
    })
}

/// POST /signals/port
pub async fn port(
    State(state): State<AppState>,
    JsonBody(req): JsonBody<PortSignalRequest>,
) -> Result<StatusCode, ApiError> {
    state
        .signals
        .emit_port_signal(req.port, req.action, &req.url)?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /signals/error
pub async fn error(
    State(state): State<AppState>,
    JsonBody(req): JsonBody<ErrorSignalRequest>,
) -> Result<StatusCode, ApiError> {
    state.signals.emit_error_signal(&req.message)?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /signals/server-ready
pub async fn server_ready(
    State(state): State<AppState>,
    JsonBody(req): JsonBody<ServerReadySignalRequest>,
) -> Result<StatusCode, ApiError> {
    state
        .signals
        .emit_server_ready_signal(req.port, &req.url)?;
    Ok(StatusCode::NO_CONTENT)
}

/// Republishes every signal on the `signals` channel until the stream ends
/// or the token fires. On cancellation the already-buffered signals are
/// still delivered.
async fn run_actor(
    mut signals: mpsc::Receiver<Signal>,
    connections: Arc<ConnectionManager>,
    token: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            signal = signals.recv() => match signal {
                Some(signal) => publish(&connections, &signal).await,
                None => break,
            },
            _ = token.cancelled() => {
                while let Ok(signal) = signals.try_recv() {
                    publish(&connections, &signal).await;
                }
                break;
            }
        }
    }
    tracing::debug!("Signal actor stopped");
}

async fn publish(connections: &ConnectionManager, signal: &Signal) {
    let report = connections
        .broadcast(SIGNALS_CHANNEL, event_types::SIGNAL, signal)
        .await;
    tracing::trace!(
        kind = ?signal.kind,
        delivered = report.delivered,
        "Published signal"
    );
}
