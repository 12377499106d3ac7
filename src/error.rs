//! Error taxonomy shared by the router and the HTTP layer

use crate::task::{CODE_ERROR, RequestId};
use crate::transport::WorkerId;
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;

/// Per-request failures. None of these take down a worker or the router.
#[derive(Debug, Error)]
pub enum ServeError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("model '{model}' is not served, enabled models: {enabled}")]
    UnknownModel { model: String, enabled: String },

    #[error("worker {worker} is busy ({capacity} tasks already queued)")]
    Busy { worker: WorkerId, capacity: usize },

    #[error("backend failure: {0}")]
    BackendFailure(String),

    #[error("request cancelled by shutdown")]
    Cancelled,

    #[error("unknown request id {0}")]
    UnknownRequest(RequestId),

    #[error("no live worker for model '{0}'")]
    WorkerUnavailable(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

pub type ServeResult<T> = Result<T, ServeError>;

impl ServeError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ServeError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ServeError::UnknownModel { .. } | ServeError::UnknownRequest(_) => {
                StatusCode::NOT_FOUND
            }
            ServeError::Busy { .. }
            | ServeError::Cancelled
            | ServeError::WorkerUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ServeError::BackendFailure(_) | ServeError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Short label used for metrics
    pub fn kind(&self) -> &'static str {
        match self {
            ServeError::InvalidRequest(_) => "invalid_request",
            ServeError::UnknownModel { .. } => "unknown_model",
            ServeError::Busy { .. } => "busy",
            ServeError::BackendFailure(_) => "backend_failure",
            ServeError::Cancelled => "cancelled",
            ServeError::UnknownRequest(_) => "unknown_request",
            ServeError::WorkerUnavailable(_) => "worker_unavailable",
            ServeError::Internal(_) => "internal",
        }
    }
}

impl IntoResponse for ServeError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let msg = match &self {
            ServeError::Internal(err) => {
                tracing::error!(error = %err, "Internal error");
                "Internal server error".to_string()
            }
            other => other.to_string(),
        };

        let body = Json(ErrorResponse {
            code: CODE_ERROR,
            msg,
            timestamp: chrono::Utc::now(),
        });

        (status, body).into_response()
    }
}

#[derive(Serialize)]
pub struct ErrorResponse {
    pub code: i32,
    pub msg: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}
