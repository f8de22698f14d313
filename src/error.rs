//! Error types shared across the session, executor and HTTP layers.

use std::io;
use std::path::PathBuf;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

use crate::session::ConnectionId;

/// Failures from the session registry and sandbox provisioning.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("invalid session id: {0:?}")]
    InvalidSessionId(String),

    #[error("connection {0} already owns a session")]
    AlreadyBound(ConnectionId),

    #[error("{}: No such file or directory", .0.display())]
    NotFound(PathBuf),

    #[error("{}: Not a directory", .0.display())]
    NotADirectory(PathBuf),

    #[error("sandbox io: {0}")]
    Io(#[from] io::Error),
}

/// Failures from the process executor that leave no usable output.
#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    #[error("spawn failed: {0}")]
    Spawn(#[source] io::Error),

    #[error("waiting on child: {0}")]
    Io(#[from] io::Error),
}

/// REST error, rendered as `{"error": "..."}` with a status code.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    pub fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({ "error": self.message });
        (self.status, Json(body)).into_response()
    }
}
