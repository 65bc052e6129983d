//! HTTP-specific data structures and the error envelope.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use utoipa::ToSchema;

use crate::config::RuntimeConfig;
use crate::pipeline::StepPipeline;
use crate::telemetry::TelemetryStore;
use crate::types::EngineError;

/// Shared application state for all handlers.
#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<StepPipeline>,
    pub telemetry: Arc<TelemetryStore>,
    pub config: Arc<RuntimeConfig>,
    pub start_time: Instant,
}

/// Inner error detail.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ErrorDetail {
    pub code: String,
    pub message: String,
}

/// Error envelope: `{"detail": {"code", "message"}}`.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ErrorBody {
    pub detail: ErrorDetail,
}

impl ErrorBody {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            detail: ErrorDetail {
                code: code.to_string(),
                message: message.into(),
            },
        }
    }
}

/// Health check response.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct HealthResponse {
    pub status: String,
    pub uptime_seconds: u64,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub version: String,
}

/// The single place domain error kinds map to HTTP status codes.
pub fn status_for(error: &EngineError) -> StatusCode {
    match error {
        EngineError::BadRequest(_) | EngineError::MissingIdempotencyKey => StatusCode::BAD_REQUEST,
        EngineError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
        EngineError::Forbidden(_) => StatusCode::FORBIDDEN,
        EngineError::NotFound(_) => StatusCode::NOT_FOUND,
        EngineError::RequestInProgress
        | EngineError::IdempotencyPayloadMismatch
        | EngineError::SessionStepConflict { .. }
        | EngineError::RuntimeConflict(_)
        | EngineError::StreamAborted => StatusCode::CONFLICT,
        EngineError::InvalidChoice(_) | EngineError::ChoiceLocked(_) => {
            StatusCode::UNPROCESSABLE_ENTITY
        }
        EngineError::LlmUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        EngineError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Engine errors rendered as HTTP responses.
pub struct ApiError(pub EngineError);

impl From<EngineError> for ApiError {
    fn from(error: EngineError) -> Self {
        Self(error)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %self.0, "unhandled engine error");
        }
        let body = ErrorBody::new(self.0.code(), self.0.to_string());
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ConflictStage;

    #[test]
    fn status_mapping_matches_contract() {
        assert_eq!(
            status_for(&EngineError::MissingIdempotencyKey),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_for(&EngineError::Forbidden("x".into())),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            status_for(&EngineError::NotFound("x".into())),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status_for(&EngineError::IdempotencyPayloadMismatch),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_for(&EngineError::RequestInProgress),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_for(&EngineError::SessionStepConflict {
                stage: ConflictStage::SessionUpdate
            }),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_for(&EngineError::ChoiceLocked("x".into())),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            status_for(&EngineError::InvalidChoice("x".into())),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            status_for(&EngineError::LlmUnavailable("x".into())),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            status_for(&EngineError::Internal("x".into())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn envelope_shape() {
        let body = ErrorBody::new("NOT_FOUND", "session not found");
        let value = serde_json::to_value(&body).unwrap();
        assert_eq!(value["detail"]["code"], "NOT_FOUND");
        assert_eq!(value["detail"]["message"], "session not found");
    }
}
