//! Terminal routes, the terminal reader bridge, and the WebSocket handler
//! for terminal input and resize.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::{Path as UrlPath, State};
use axum::http::StatusCode;
use axum::Json;
use protocol::api::{
    CreateTerminalRequest, ExecuteRequest, ExecuteResponse, InputRequest, ResizeRequest,
    TerminalResponse,
};
use protocol::messages::{
    event_types, ExecuteOutput, ResourceDeleted, TerminalErrorEvent, TerminalExited,
    TerminalOutput,
};
use protocol::{terminal_channel, ClientMessage};
use tokio_util::sync::CancellationToken;

use super::extract::{JsonBody, OptionalJsonBody};
use super::{ApiError, AppState};
use crate::connection::{ConnectionManager, HandlerError, MessageHandler};
use crate::terminal::{TerminalError, TerminalInfo, TerminalService, Utf8Decoder};

/// Bytes requested per PTY read.
const READ_CHUNK: usize = 4096;

/// How long a failed read waits to see whether the shell exited.
const EXIT_WAIT: Duration = Duration::from_millis(500);

fn response(info: TerminalInfo) -> TerminalResponse {
    TerminalResponse {
        channel: terminal_channel(&info.id),
        id: info.id,
        status: info.status,
        shell: info.shell,
        pid: info.pid,
        cols: info.cols,
        rows: info.rows,
        created_at: info.created_at,
        updated_at: info.updated_at,
    }
}

/// POST /terminals
pub async fn create(
    State(state): State<AppState>,
    OptionalJsonBody(req): OptionalJsonBody<CreateTerminalRequest>,
) -> Result<(StatusCode, Json<TerminalResponse>), ApiError> {
    let info = state.terminals.create(
        req.shell.as_deref(),
        req.cols,
        req.rows,
        req.cwd.as_deref().map(Path::new),
    )?;

    if let Err(e) = spawn_reader(&state, &info.id) {
        state.terminals.delete(&info.id).await?;
        return Err(e.into());
    }

    let body = response(info);
    state
        .connections
        .broadcast("", event_types::TERMINAL_CREATED, &body)
        .await;

    Ok((StatusCode::CREATED, Json(body)))
}

/// GET /terminals
pub async fn list(State(state): State<AppState>) -> Json<Vec<TerminalResponse>> {
    Json(state.terminals.list().into_iter().map(response).collect())
}

/// GET /terminals/{id}
pub async fn get(
    State(state): State<AppState>,
    UrlPath(id): UrlPath<String>,
) -> Result<Json<TerminalResponse>, ApiError> {
    Ok(Json(response(state.terminals.get(&id)?)))
}

/// POST /terminals/{id}/execute
///
/// The result is returned and also published on the terminal's channel as
/// `terminal:execute`, separate from raw PTY output.
pub async fn execute(
    State(state): State<AppState>,
    UrlPath(id): UrlPath<String>,
    JsonBody(req): JsonBody<ExecuteRequest>,
) -> Result<Json<ExecuteResponse>, ApiError> {
    let result = state.terminals.execute(&id, &req.command).await?;

    state
        .connections
        .broadcast(
            &terminal_channel(&id),
            event_types::TERMINAL_EXECUTE,
            &ExecuteOutput {
                terminal_id: id.clone(),
                command: result.command.clone(),
                output: result.output.clone(),
                exit_code: result.exit_code,
                duration_ms: result.duration_ms,
            },
        )
        .await;

    Ok(Json(ExecuteResponse {
        command: result.command,
        output: result.output,
        exit_code: result.exit_code,
        duration_ms: result.duration_ms,
    }))
}

/// POST /terminals/{id}/input
pub async fn input(
    State(state): State<AppState>,
    UrlPath(id): UrlPath<String>,
    JsonBody(req): JsonBody<InputRequest>,
) -> Result<StatusCode, ApiError> {
    state.terminals.write(&id, req.input.as_bytes()).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /terminals/{id}/resize
pub async fn resize(
    State(state): State<AppState>,
    UrlPath(id): UrlPath<String>,
    JsonBody(req): JsonBody<ResizeRequest>,
) -> Result<StatusCode, ApiError> {
    state.terminals.resize(&id, req.rows, req.cols).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// DELETE /terminals/{id}
///
/// Stops the reader first, then closes the PTY.
pub async fn delete(
    State(state): State<AppState>,
    UrlPath(id): UrlPath<String>,
) -> Result<StatusCode, ApiError> {
    state.terminals.get(&id)?;

    state.tasks.cancel(&terminal_channel(&id)).await;
    state.terminals.delete(&id).await?;

    state
        .connections
        .broadcast(
            "",
            event_types::TERMINAL_DELETED,
            &ResourceDeleted { id: id.clone() },
        )
        .await;

    Ok(StatusCode::NO_CONTENT)
}

/// Registers the reader task that republishes a terminal's PTY output.
pub fn spawn_reader(state: &AppState, id: &str) -> Result<(), crate::registry::RegistryError> {
    let channel = terminal_channel(id);
    let reader = TerminalReader {
        id: id.to_string(),
        channel: channel.clone(),
        source: Arc::clone(&state.terminals) as Arc<dyn OutputSource>,
        connections: Arc::clone(&state.connections),
    };
    state
        .tasks
        .spawn(channel, move |token| async move { reader.run(token).await })
}

/// The terminal operations a [`TerminalReader`] depends on.
#[async_trait]
trait OutputSource: Send + Sync {
    async fn read(&self, id: &str, max: usize) -> Result<Vec<u8>, TerminalError>;
    async fn wait_exit(&self, id: &str, timeout: Duration) -> Result<Option<i32>, TerminalError>;
    async fn mark_exited(&self, id: &str) -> Result<Option<i32>, TerminalError>;
}

#[async_trait]
impl OutputSource for TerminalService {
    async fn read(&self, id: &str, max: usize) -> Result<Vec<u8>, TerminalError> {
        TerminalService::read(self, id, max).await
    }

    async fn wait_exit(&self, id: &str, timeout: Duration) -> Result<Option<i32>, TerminalError> {
        TerminalService::wait_exit(self, id, timeout).await
    }

    async fn mark_exited(&self, id: &str) -> Result<Option<i32>, TerminalError> {
        TerminalService::mark_exited(self, id).await
    }
}

struct TerminalReader {
    id: String,
    channel: String,
    source: Arc<dyn OutputSource>,
    connections: Arc<ConnectionManager>,
}

impl TerminalReader {
    async fn run(self, token: CancellationToken) {
        let mut decoder = Utf8Decoder::new();

        loop {
            let read = tokio::select! {
                biased;
                _ = token.cancelled() => break,
                read = self.source.read(&self.id, READ_CHUNK) => read,
            };

            match read {
                Ok(bytes) if bytes.is_empty() => {
                    self.publish_output(decoder.finish()).await;
                    self.publish_exit().await;
                    break;
                }
                Ok(bytes) => self.publish_output(decoder.decode(&bytes)).await,
                Err(e) => {
                    if token.is_cancelled() {
                        break;
                    }
                    self.publish_output(decoder.finish()).await;

                    // The shell may have died between the read and now.
                    match self.source.wait_exit(&self.id, EXIT_WAIT).await {
                        Ok(Some(_)) => self.publish_exit().await,
                        Ok(None) => {
                            tracing::error!(terminal_id = %self.id, error = %e, "Terminal read failed");
                            self.connections
                                .broadcast(
                                    &self.channel,
                                    event_types::TERMINAL_ERROR,
                                    &TerminalErrorEvent {
                                        terminal_id: self.id.clone(),
                                        error: e.to_string(),
                                    },
                                )
                                .await;
                        }
                        Err(_) => {}
                    }
                    break;
                }
            }
        }

        tracing::debug!(terminal_id = %self.id, "Terminal reader stopped");
    }

    async fn publish_output(&self, data: String) {
        if data.is_empty() {
            return;
        }
        self.connections
            .broadcast(
                &self.channel,
                event_types::TERMINAL_OUTPUT,
                &TerminalOutput {
                    terminal_id: self.id.clone(),
                    data,
                },
            )
            .await;
    }

    async fn publish_exit(&self) {
        let exit_code = self.source.mark_exited(&self.id).await.ok().flatten();
        self.connections
            .broadcast(
                &self.channel,
                event_types::TERMINAL_EXITED,
                &TerminalExited {
                    terminal_id: self.id.clone(),
                    exit_code,
                },
            )
            .await;
    }
}

/// Routes `terminal:input` and `terminal:resize` frames into the terminal service.
pub struct TerminalControlHandler {
    terminals: Arc<TerminalService>,
}

impl TerminalControlHandler {
    pub fn new(terminals: Arc<TerminalService>) -> Self {
        Self { terminals }
    }
}

#[async_trait]
impl MessageHandler for TerminalControlHandler {
    async fn handle(&self, conn_id: &str, message: ClientMessage) -> Result<(), HandlerError> {
        match message {
            ClientMessage::TerminalInput(input) => {
                self.terminals
                    .write(&input.terminal_id, input.input.as_bytes())
                    .await?;
            }
            ClientMessage::TerminalResize(resize) => {
                self.terminals
                    .resize(&resize.terminal_id, resize.rows, resize.cols)
                    .await?;
                tracing::debug!(
                    conn_id = %conn_id,
                    terminal_id = %resize.terminal_id,
                    "Resized terminal from client"
                );
            }
            other => {
                return Err(HandlerError::Invalid(format!(
                    "unexpected message type '{}'",
                    other.kind()
                )))
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use protocol::api::TerminalStatus;
    use protocol::ServerEvent;
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    fn test_state() -> AppState {
        let mut config = Config::default();
        config.terminal.default_shell = "/bin/sh".to_string();
        AppState::new(config).unwrap()
    }

    fn drain(rx: &mut mpsc::Receiver<String>) -> Vec<ServerEvent> {
        let mut events = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            events.push(ServerEvent::decode(&frame).unwrap());
        }
        events
    }

    /// Reads fail while the shell underneath stays alive.
    struct FailingReads {
        terminals: Arc<TerminalService>,
    }

    #[async_trait]
    impl OutputSource for FailingReads {
        async fn read(&self, _id: &str, _max: usize) -> Result<Vec<u8>, TerminalError> {
            Err(TerminalError::ReadFailed("Input/output error (os error 5)".to_string()))
        }

        async fn wait_exit(&self, id: &str, timeout: Duration) -> Result<Option<i32>, TerminalError> {
            self.terminals.wait_exit(id, timeout).await
        }

        async fn mark_exited(&self, id: &str) -> Result<Option<i32>, TerminalError> {
            self.terminals.mark_exited(id).await
        }
    }

    #[tokio::test]
    async fn test_read_failure_publishes_terminal_error() {
        let state = test_state();
        let info = state.terminals.create(None, None, None, None).unwrap();
        let channel = terminal_channel(&info.id);

        let (conn, mut rx) = state.connections.connect().await;
        state.connections.subscribe(&conn, &channel).await.unwrap();
        drain(&mut rx);

        let reader = TerminalReader {
            id: info.id.clone(),
            channel: channel.clone(),
            source: Arc::new(FailingReads {
                terminals: Arc::clone(&state.terminals),
            }),
            connections: Arc::clone(&state.connections),
        };
        timeout(Duration::from_secs(5), reader.run(CancellationToken::new()))
            .await
            .expect("reader kept running after a read error");

        let events = drain(&mut rx);
        let error = events
            .iter()
            .find(|e| e.event_type == event_types::TERMINAL_ERROR)
            .expect("no terminal:error event");
        assert_eq!(error.channel.as_deref(), Some(channel.as_str()));
        assert_eq!(error.data["terminal_id"], info.id.as_str());
        assert!(error.data["error"]
            .as_str()
            .unwrap()
            .contains("os error 5"));
        assert!(events
            .iter()
            .all(|e| e.event_type != event_types::TERMINAL_EXITED));

        // The shell itself is untouched.
        assert_eq!(
            state.terminals.get(&info.id).unwrap().status,
            TerminalStatus::Active
        );
        state.terminals.delete(&info.id).await.unwrap();
    }

    #[tokio::test]
    async fn test_delete_with_background_job_stops_reader() {
        let state = test_state();
        let info = state.terminals.create(None, None, None, None).unwrap();
        let channel = terminal_channel(&info.id);
        spawn_reader(&state, &info.id).unwrap();

        state
            .terminals
            .write(&info.id, b"sleep 30 &\n")
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        let status = timeout(
            Duration::from_secs(5),
            delete(State(state.clone()), UrlPath(info.id.clone())),
        )
        .await
        .expect("delete hung on a background job")
        .unwrap();

        assert_eq!(status, StatusCode::NO_CONTENT);
        assert!(!state.tasks.contains(&channel));
        assert_eq!(state.terminals.count(), 0);
    }
}
