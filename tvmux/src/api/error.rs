// HTTP error handling

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use tvmux_orchestrator::OrchestratorError;

pub type AppResult<T> = Result<T, AppError>;

/// Application error with HTTP status code
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
}

impl AppError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    pub fn internal_server_error(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.status, self.message)
    }
}

impl std::error::Error for AppError {}

/// Error response JSON structure
#[derive(Debug, Serialize, Deserialize)]
struct ErrorResponse {
    error: String,
    status: u16,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status;
        let body = Json(ErrorResponse {
            error: self.message,
            status: status.as_u16(),
        });

        (status, body).into_response()
    }
}

impl From<OrchestratorError> for AppError {
    fn from(err: OrchestratorError) -> Self {
        match err {
            OrchestratorError::NotFound(msg) => Self::not_found(msg),
            OrchestratorError::InvalidStreamKey(msg) => Self::bad_request(format!("Invalid stream key: {msg}")),
            OrchestratorError::ChainExhausted { key } => {
                Self::new(StatusCode::SERVICE_UNAVAILABLE, format!("No source available for {key}"))
            }
            e @ OrchestratorError::QuotaExceeded { .. } => Self::new(StatusCode::TOO_MANY_REQUESTS, e.to_string()),
            e @ (OrchestratorError::SourceNotResponding { .. } | OrchestratorError::LaunchFailure { .. }) => {
                Self::new(StatusCode::BAD_GATEWAY, e.to_string())
            }
            e @ OrchestratorError::JoinTimeout(_) => Self::new(StatusCode::GATEWAY_TIMEOUT, e.to_string()),
            OrchestratorError::Cancelled => Self::new(StatusCode::SERVICE_UNAVAILABLE, "Request cancelled"),
            OrchestratorError::ResourceSetup(msg) => {
                tracing::error!("Resource setup error: {}", msg);
                Self::internal_server_error("Failed to prepare stream output")
            }
            OrchestratorError::Store(msg) => {
                tracing::error!("Store error: {}", msg);
                Self::new(StatusCode::SERVICE_UNAVAILABLE, "Service temporarily unavailable")
            }
            OrchestratorError::Serialization(e) => {
                tracing::error!("Serialization error: {}", e);
                Self::internal_server_error("Data processing error")
            }
            OrchestratorError::Io(e) => {
                tracing::error!("IO error: {}", e);
                Self::internal_server_error("Internal server error")
            }
        }
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        tracing::error!("Anyhow error: {}", err);
        Self::internal_server_error("Internal server error")
    }
}
