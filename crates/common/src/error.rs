//! Error types shared across the monitoring backend.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

/// Result type alias using the crate's [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("{kind} {id} not found")]
    NotFound { kind: String, id: String },

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("upstream failure: {0}")]
    Upstream(String),

    #[error("vpn error: {0}")]
    Vpn(String),

    #[error("routeros error: {0}")]
    RouterOs(String),

    #[error("credential rotation error: {0}")]
    Rotation(String),

    #[error("alert dispatch error: {0}")]
    Alert(String),

    #[error("operation timed out after {seconds}s")]
    Timeout { seconds: u64 },

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    fn status_code(&self) -> StatusCode {
        match self {
            Error::InvalidConfig(_) | Error::Serialization(_) => StatusCode::BAD_REQUEST,
            Error::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Error::NotFound { .. } => StatusCode::NOT_FOUND,
            Error::Conflict(_) => StatusCode::CONFLICT,
            Error::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            Error::Upstream(_) | Error::Vpn(_) | Error::RouterOs(_) => StatusCode::BAD_GATEWAY,
            Error::Io(_)
            | Error::Database(_)
            | Error::Rotation(_)
            | Error::Alert(_)
            | Error::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: &'static str,
    detail: String,
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = ErrorBody {
            error: status.canonical_reason().unwrap_or("error"),
            detail: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}
