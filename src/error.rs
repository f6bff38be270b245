use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("I/O error: {0}")]
    StdIoError(#[from] std::io::Error),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Configuration error: {0}")]
    ConfigError(#[from] anyhow::Error),

    #[error("Command execution error: {0}")]
    CommandExecutionError(String),

    #[error("Process exited with code {exit_code}")]
    ProcessFailure { exit_code: i32 },

    #[error("Process crashed: {0}")]
    ProcessCrash(String),

    #[error("Operation timed out: {0}")]
    TimeoutError(String),

    #[error("Process registry error: {0}")]
    RegistryError(String),

    #[error("Session not found for key: {0}")]
    SessionNotFound(String),

    #[error("Pseudo-terminal error: {0}")]
    PtyError(String),

    #[error("Artifact not found: {0}")]
    ArtifactNotFound(String),

    #[error("Serde JSON error: {0}")]
    SerdeJsonError(#[from] serde_json::Error),
}

impl AppError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::InvalidInput(_) | AppError::SerdeJsonError(_) => StatusCode::BAD_REQUEST,
            AppError::SessionNotFound(_) | AppError::ArtifactNotFound(_) => StatusCode::NOT_FOUND,
            AppError::TimeoutError(_) => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!("AppError converted to HTTP {}: {:?}", status.as_u16(), self);
        } else {
            tracing::debug!("AppError converted to HTTP {}: {}", status.as_u16(), self);
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}
