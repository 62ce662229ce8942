use http::StatusCode;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExperimentError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("experiment not found: {0}")]
    NotFound(String),

    #[error("invalid status transition: {0}")]
    InvalidStatus(String),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, ExperimentError>;

impl From<std::io::Error> for ExperimentError {
    fn from(e: std::io::Error) -> Self {
        ExperimentError::Internal(format!("io: {}", e))
    }
}

impl From<serde_json::Error> for ExperimentError {
    fn from(e: serde_json::Error) -> Self {
        ExperimentError::Internal(format!("json: {}", e))
    }
}

impl ExperimentError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ExperimentError::Validation(_) => StatusCode::BAD_REQUEST,
            ExperimentError::NotFound(_) => StatusCode::NOT_FOUND,
            ExperimentError::InvalidStatus(_) => StatusCode::CONFLICT,
            ExperimentError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_code(&self) -> &'static str {
        match self {
            ExperimentError::Validation(_) => "validation_error",
            ExperimentError::NotFound(_) => "experiment_not_found",
            ExperimentError::InvalidStatus(_) => "invalid_status",
            ExperimentError::Internal(_) => "internal_error",
        }
    }
}

// Axum IntoResponse implementation (feature-gated)
#[cfg(feature = "axum-support")]
use axum::response::{IntoResponse, Json, Response};
#[cfg(feature = "axum-support")]
use serde::Serialize;

#[cfg(feature = "axum-support")]
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
    pub request_id: String,
}

#[cfg(feature = "axum-support")]
impl IntoResponse for ExperimentError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let request_id = format!("req_cp_{}", uuid::Uuid::new_v4());
        // Storage details stay in the log, callers get a generic message.
        let message = match &self {
            ExperimentError::Internal(detail) => {
                tracing::error!(request_id = %request_id, "internal error: {}", detail);
                "internal error".to_string()
            }
            other => other.to_string(),
        };
        let body = ErrorResponse {
            error: self.error_code().to_string(),
            message,
            request_id,
        };
        (status, Json(body)).into_response()
    }
}
