//! File watcher routes and the watcher event bridge.

use std::path::Path;
use std::sync::Arc;

use axum::extract::{Path as UrlPath, State};
use axum::http::StatusCode;
use axum::Json;
use protocol::api::{CreateWatcherRequest, WatcherResponse};
use protocol::messages::{event_types, FileChange, ResourceDeleted};
use protocol::watcher_channel;
use tokio::sync::mpsc;

use super::extract::JsonBody;
use super::{ApiError, AppState};
use crate::connection::ConnectionManager;
use crate::watcher::WatcherInfo;

fn response(info: WatcherInfo) -> WatcherResponse {
    WatcherResponse {
        channel: watcher_channel(&info.id),
        id: info.id,
        path: info.path.display().to_string(),
        include_content: info.include_content,
        ignored: info.ignored,
        status: info.status,
        created_at: info.created_at,
    }
}

/// POST /watchers
pub async fn create(
    State(state): State<AppState>,
    JsonBody(req): JsonBody<CreateWatcherRequest>,
) -> Result<(StatusCode, Json<WatcherResponse>), ApiError> {
    if req.path.trim().is_empty() {
        return Err(ApiError::Validation("path is required".to_string()));
    }

    let (info, events) = state
        .watchers
        .create(Path::new(&req.path), req.include_content, req.ignored)
        .await?;

    let channel = watcher_channel(&info.id);
    let connections = Arc::clone(&state.connections);
    let bridge_channel = channel.clone();
    let spawned = state.tasks.spawn(channel, move |token| async move {
        tokio::select! {
            _ = token.cancelled() => {}
            _ = forward_changes(events, connections, bridge_channel) => {}
        }
    });
    if let Err(e) = spawned {
        state.watchers.delete(&info.id).await?;
        return Err(e.into());
    }

    let body = response(info);
    state
        .connections
        .broadcast("", event_types::WATCHER_CREATED, &body)
        .await;

    Ok((StatusCode::CREATED, Json(body)))
}

async fn forward_changes(
    mut events: mpsc::Receiver<FileChange>,
    connections: Arc<ConnectionManager>,
    channel: String,
) {
    while let Some(change) = events.recv().await {
        connections
            .broadcast(&channel, event_types::FILE_CHANGED, &change)
            .await;
    }
    tracing::debug!(channel = %channel, "Watcher event stream closed");
}

/// GET /watchers
pub async fn list(State(state): State<AppState>) -> Json<Vec<WatcherResponse>> {
    Json(state.watchers.list().into_iter().map(response).collect())
}

/// GET /watchers/{id}
pub async fn get(
    State(state): State<AppState>,
    UrlPath(id): UrlPath<String>,
) -> Result<Json<WatcherResponse>, ApiError> {
    Ok(Json(response(state.watchers.get(&id)?)))
}

/// DELETE /watchers/{id}
pub async fn delete(
    State(state): State<AppState>,
    UrlPath(id): UrlPath<String>,
) -> Result<StatusCode, ApiError> {
    state.watchers.get(&id)?;

    state.tasks.cancel(&watcher_channel(&id)).await;
    state.watchers.delete(&id).await?;

    state
        .connections
        .broadcast(
            "",
            event_types::WATCHER_DELETED,
            &ResourceDeleted { id: id.clone() },
        )
        .await;

    Ok(StatusCode::NO_CONTENT)
}
