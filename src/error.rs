//! Error taxonomy shared by the lifecycle core and the HTTP layer.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use std::time::Duration;
use thiserror::Error;
use tracing::error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Request parameters out of range or malformed.
    #[error("invalid request: {0}")]
    Validation(String),

    #[error("unauthorized")]
    Unauthorized,

    #[error("container {0} not found")]
    NotFound(String),

    /// No free host port turned up within the probe budget.
    #[error("no free port found after {attempts} probes (need {requested})")]
    AllocationExhausted { requested: usize, attempts: usize },

    #[error("runtime {op} failed: {message}")]
    Runtime { op: &'static str, message: String },

    #[error("runtime {op} timed out after {timeout:?}")]
    RuntimeTimeout { op: &'static str, timeout: Duration },

    #[error("store: {0}")]
    Store(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn runtime(op: &'static str, message: impl ToString) -> Self {
        Error::Runtime {
            op,
            message: message.to_string(),
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::Validation(_) => StatusCode::BAD_REQUEST,
            Error::Unauthorized => StatusCode::UNAUTHORIZED,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::AllocationExhausted { .. }
            | Error::Runtime { .. }
            | Error::RuntimeTimeout { .. }
            | Error::Store(_)
            | Error::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Error::Store(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Store(format!("encode: {}", e))
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            error!(error = %self, "Request failed");
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}
