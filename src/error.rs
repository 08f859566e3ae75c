use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;
use tracing::{error, warn};

use crate::media::MediaError;
use crate::source::SourceError;

/// Failures a request can end with before its response has been started.
/// Once a body is streaming these are only logged and the body is aborted.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("{0}")]
    InvalidRequest(String),
    #[error(transparent)]
    SourceUnavailable(#[from] SourceError),
    #[error(transparent)]
    ProcessFailure(#[from] MediaError),
    #[error("download deadline exceeded")]
    TimedOut,
    #[error("request cancelled")]
    Cancelled,
    #[error("internal error: {0}")]
    Internal(String),
}

impl AppError {
    pub fn status(&self) -> StatusCode {
        match self {
            AppError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            AppError::SourceUnavailable(_)
            | AppError::ProcessFailure(_)
            | AppError::TimedOut
            | AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    /// Message shown to the client. Diagnostics stay in the log.
    fn public_message(&self) -> String {
        match self {
            AppError::InvalidRequest(msg) => msg.clone(),
            AppError::SourceUnavailable(e) => e.public_message().to_string(),
            AppError::ProcessFailure(_) => "Media processing failed".to_string(),
            AppError::TimedOut => "Download took too long and was cancelled".to_string(),
            AppError::Cancelled => "Server is shutting down, try again".to_string(),
            AppError::Internal(_) => "Internal server error".to_string(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!("Request failed: {self}");
        } else {
            warn!("Rejected request: {self}");
        }
        (status, Json(serde_json::json!({ "error": self.public_message() }))).into_response()
    }
}
