use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Response for an error
#[derive(Serialize, Deserialize, ToSchema)]
pub struct ErrorResponse {
    pub code: u16,
    pub status: String,
    pub error: String,
}

impl ErrorResponse {
    pub fn new(status: StatusCode, error: impl Into<String>) -> Self {
        Self {
            code: status.as_u16(),
            status: status.to_string(),
            error: error.into(),
        }
    }
}

/// Application error taxonomy.
///
/// There is deliberately no merge-conflict variant: concurrent edits always
/// merge, so the engine never produces an error for them.
#[derive(Debug)]
pub enum AppError {
    /// Missing or invalid credential; rejected before any room is touched.
    Auth(String),
    /// Authenticated but neither owner nor collaborator.
    Permission(String),
    /// Unknown document id.
    NotFound(String),
    /// Storage I/O failure; logged and retried, never surfaced to an
    /// editing session.
    Persistence(String),
    /// Malformed or out-of-protocol message; drops only the offending
    /// connection.
    Protocol(String),
}

impl AppError {
    pub fn status(&self) -> StatusCode {
        match self {
            AppError::Auth(_) => StatusCode::UNAUTHORIZED,
            AppError::Permission(_) => StatusCode::FORBIDDEN,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Persistence(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Protocol(_) => StatusCode::BAD_REQUEST,
        }
    }

    pub fn reason(&self) -> &str {
        match self {
            AppError::Auth(m)
            | AppError::Permission(m)
            | AppError::NotFound(m)
            | AppError::Persistence(m)
            | AppError::Protocol(m) => m,
        }
    }
}

impl std::fmt::Display for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AppError::Auth(m) => write!(f, "Authentication failed: {}", m),
            AppError::Permission(m) => write!(f, "Access denied: {}", m),
            AppError::NotFound(m) => write!(f, "Not found: {}", m),
            AppError::Persistence(m) => write!(f, "Persistence error: {}", m),
            AppError::Protocol(m) => write!(f, "Protocol error: {}", m),
        }
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        (status, Json(ErrorResponse::new(status, self.reason()))).into_response()
    }
}
