//! HTTP error type.
//!
//! Every handler returns `ApiResult`; failures render as
//! `{"error": {"code", "message"}}` with a matching status.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// API error type
#[derive(Debug, Error)]
pub enum ApiError {
    /// Missing or empty upload, disallowed extension (400)
    #[error("Invalid request: {0}")]
    Validation(String),

    /// No stored file by that name (404)
    #[error("Not found: {0}")]
    NotFound(String),

    /// Stored file exists but is not a readable MIDI file (422)
    #[error("Could not parse {filename}: {message}")]
    Parse { filename: String, message: String },

    /// No conversion job has reached a terminal state yet (404)
    #[error("No conversion has finished yet")]
    NoHistory,

    /// Internal server error (500)
    #[error("Internal server error: {0}")]
    Internal(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) | ApiError::NoHistory => StatusCode::NOT_FOUND,
            ApiError::Parse { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::Internal(_) | ApiError::Io(_) | ApiError::Other(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            ApiError::Validation(_) => "VALIDATION_ERROR",
            ApiError::NotFound(_) => "NOT_FOUND",
            ApiError::Parse { .. } => "PARSE_ERROR",
            ApiError::NoHistory => "NO_HISTORY",
            ApiError::Internal(_) => "INTERNAL_ERROR",
            ApiError::Io(_) => "IO_ERROR",
            ApiError::Other(_) => "INTERNAL_ERROR",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
        } else {
            tracing::debug!(error = %self, "Request rejected");
        }

        let body = Json(json!({
            "error": {
                "code": self.code(),
                "message": self.to_string(),
            }
        }));

        (status, body).into_response()
    }
}

/// Result type for API handlers
pub type ApiResult<T> = Result<T, ApiError>;
