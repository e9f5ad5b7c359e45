use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use protocol::api::ErrorResponse;
use thiserror::Error;

use crate::connection::HandlerError;
use crate::registry::RegistryError;
use crate::signals::SignalError;
use crate::terminal::TerminalError;
use crate::watcher::WatcherError;

/// Error returned by every HTTP handler.
///
/// Rendered as `{"error": "...", "code": "..."}`.
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    Capacity(String),

    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            ApiError::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
            ApiError::Validation(_) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR"),
            ApiError::Conflict(_) => (StatusCode::CONFLICT, "CONFLICT"),
            ApiError::Capacity(_) => (StatusCode::SERVICE_UNAVAILABLE, "CAPACITY_EXCEEDED"),
            ApiError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();
        if status.is_server_error() {
            tracing::error!(code, error = %self, "Request failed");
        } else {
            tracing::debug!(code, error = %self, "Request rejected");
        }

        let body = ErrorResponse {
            error: self.to_string(),
            code: code.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

impl From<TerminalError> for ApiError {
    fn from(err: TerminalError) -> Self {
        let message = err.to_string();
        match err {
            TerminalError::NotFound(_) => ApiError::NotFound(message),
            TerminalError::LimitReached(_) => ApiError::Conflict(message),
            TerminalError::InvalidSize { .. }
            | TerminalError::InvalidCwd(_)
            | TerminalError::InvalidCommand => ApiError::Validation(message),
            TerminalError::SpawnFailed(_)
            | TerminalError::WriteFailed(_)
            | TerminalError::ReadFailed(_)
            | TerminalError::ResizeFailed(_)
            | TerminalError::ExecuteFailed(_) => ApiError::Internal(message),
        }
    }
}

impl From<WatcherError> for ApiError {
    fn from(err: WatcherError) -> Self {
        let message = err.to_string();
        match err {
            WatcherError::NotFound(_) => ApiError::NotFound(message),
            WatcherError::PathNotFound(_)
            | WatcherError::NotADirectory(_)
            | WatcherError::InvalidPattern { .. } => ApiError::Validation(message),
            WatcherError::LimitReached(_) => ApiError::Conflict(message),
            WatcherError::Notify(_) | WatcherError::Io(_) => ApiError::Internal(message),
        }
    }
}

impl From<SignalError> for ApiError {
    fn from(err: SignalError) -> Self {
        let message = err.to_string();
        match err {
            SignalError::AlreadyActive | SignalError::NotActive => ApiError::Conflict(message),
            SignalError::BufferFull => ApiError::Capacity(message),
            SignalError::Validation(_) => ApiError::Validation(message),
        }
    }
}

impl From<RegistryError> for ApiError {
    fn from(err: RegistryError) -> Self {
        ApiError::Conflict(err.to_string())
    }
}

impl From<TerminalError> for HandlerError {
    fn from(err: TerminalError) -> Self {
        let message = err.to_string();
        match err {
            TerminalError::NotFound(_) => HandlerError::NotFound(message),
            TerminalError::InvalidSize { .. } => HandlerError::Invalid(message),
            _ => HandlerError::Failed(message),
        }
    }
}
