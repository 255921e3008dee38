// HTTP error handling

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Result type for HTTP handlers
pub type AppResult<T> = Result<T, AppError>;

/// Why hosting a session failed.
#[derive(Error, Debug)]
pub enum HostError {
    #[error("Not connected to Wi-Fi")]
    NoWifi,
    #[error("No free port in the configured range")]
    PortsExhausted,
    #[error("Video file missing or unreadable")]
    FileMissing,
    #[error(transparent)]
    Internal(#[from] cinesync_core::Error),
}

/// Why joining a session failed. A master rejection is surfaced as
/// `UnknownPin`; the wire deliberately does not say whether the PIN or
/// the session was the problem.
#[derive(Error, Debug)]
pub enum JoinError {
    #[error("PIN not accepted")]
    UnknownPin,
    #[error("Session closed")]
    SessionClosed,
    #[error("Network failure: {0}")]
    Network(String),
}

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

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(StatusCode::CONFLICT, message)
    }

    pub fn gone(message: impl Into<String>) -> Self {
        Self::new(StatusCode::GONE, message)
    }

    pub fn payload_too_large(message: impl Into<String>) -> Self {
        Self::new(StatusCode::PAYLOAD_TOO_LARGE, message)
    }

    pub fn precondition_failed(message: impl Into<String>) -> Self {
        Self::new(StatusCode::PRECONDITION_FAILED, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
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

/// Map core errors to the HTTP/TUS status table.
impl From<cinesync_core::Error> for AppError {
    fn from(err: cinesync_core::Error) -> Self {
        use cinesync_core::Error;

        match err {
            Error::NotFound(msg) => Self::not_found(msg),
            Error::AlreadyExists(msg) => Self::conflict(msg),
            Error::InvalidInput(msg) => Self::bad_request(msg),
            Error::Gone(msg) => Self::gone(msg),
            Error::OffsetConflict { expected, got } => Self::conflict(format!(
                "Upload-Offset {got} does not match current offset {expected}"
            )),
            Error::StorageExhausted(msg) => Self::payload_too_large(msg),
            Error::Unauthorized(msg) => Self::unauthorized(msg),
            Error::Io(e) => {
                tracing::error!("I/O error: {}", e);
                Self::internal("Storage error")
            }
            Error::Database(e) => {
                tracing::error!("Database error: {}", e);
                Self::internal("Database error")
            }
            Error::Serialization(e) => {
                tracing::error!("Serialization error: {}", e);
                Self::internal("Data processing error")
            }
            Error::Internal(msg) => {
                tracing::error!("Internal error: {}", msg);
                Self::internal("Internal server error")
            }
        }
    }
}
