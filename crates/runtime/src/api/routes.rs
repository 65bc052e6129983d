//! Route handlers for the session runtime API.

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::Json;
use std::time::Instant;

use super::middleware::{require_author_token, resolve_actor};
use super::types::{ApiError, AppState, ErrorBody, HealthResponse};
use crate::pipeline::{
    SessionCreateRequest, SessionCreateResponse, SessionStateResponse, StepHooks, StepRequest,
    StepResponse,
};
use crate::telemetry::TelemetrySnapshot;
use crate::types::{EngineError, EngineResult, SessionId, UserId};

pub(crate) fn idempotency_key(headers: &HeaderMap) -> EngineResult<String> {
    let key = headers
        .get("x-idempotency-key")
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .unwrap_or("");
    if key.is_empty() {
        Err(EngineError::MissingIdempotencyKey)
    } else {
        Ok(key.to_string())
    }
}

/// Create a session.
#[utoipa::path(
    post,
    path = "/api/v1/sessions",
    request_body = SessionCreateRequest,
    responses(
        (status = 201, description = "Session created", body = SessionCreateResponse),
        (status = 400, description = "Invalid request", body = ErrorBody),
        (status = 403, description = "Ownership mismatch", body = ErrorBody),
        (status = 404, description = "Story not found", body = ErrorBody)
    ),
    tag = "sessions"
)]
pub async fn create_session(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<SessionCreateRequest>,
) -> Result<(StatusCode, Json<SessionCreateResponse>), ApiError> {
    let actor = resolve_actor(&state, &headers).await?;
    let requested_user = match (payload.user_id.as_deref(), actor.as_ref()) {
        (Some(requested), Some(actor_id)) => {
            if requested != actor_id.0 {
                return Err(EngineError::Forbidden("session user mismatch".to_string()).into());
            }
            Some(actor_id.clone())
        }
        (Some(requested), None) => Some(UserId::from(requested)),
        (None, Some(actor_id)) => Some(actor_id.clone()),
        (None, None) => None,
    };

    if payload.story_id.trim().is_empty() {
        return Err(EngineError::BadRequest("story_id cannot be empty".to_string()).into());
    }

    let response = state
        .pipeline
        .create_session(&payload.story_id, payload.version, requested_user.as_ref())
        .await?;
    Ok((StatusCode::CREATED, Json(response)))
}

/// Read a session's current state.
#[utoipa::path(
    get,
    path = "/api/v1/sessions/{session_id}",
    params(("session_id" = String, Path, description = "Session id")),
    responses(
        (status = 200, description = "Session state", body = SessionStateResponse),
        (status = 403, description = "Ownership mismatch", body = ErrorBody),
        (status = 404, description = "Session not found", body = ErrorBody)
    ),
    tag = "sessions"
)]
pub async fn get_session(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(session_id): Path<String>,
) -> Result<Json<SessionStateResponse>, ApiError> {
    let actor = resolve_actor(&state, &headers).await?;
    let response = state
        .pipeline
        .get_session_state(&SessionId::from(session_id), actor.as_ref())
        .await?;
    Ok(Json(response))
}

/// Execute one step synchronously.
#[utoipa::path(
    post,
    path = "/api/v1/sessions/{session_id}/step",
    params(
        ("session_id" = String, Path, description = "Session id"),
        ("X-Idempotency-Key" = String, Header, description = "Client idempotency key")
    ),
    request_body = StepRequest,
    responses(
        (status = 200, description = "Step executed", body = StepResponse),
        (status = 400, description = "Invalid request", body = ErrorBody),
        (status = 409, description = "Concurrency conflict", body = ErrorBody),
        (status = 422, description = "Invalid or locked choice", body = ErrorBody),
        (status = 503, description = "Model unavailable", body = ErrorBody)
    ),
    tag = "steps"
)]
pub async fn step(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(session_id): Path<String>,
    Json(payload): Json<StepRequest>,
) -> Result<Json<StepResponse>, ApiError> {
    let started = Instant::now();
    let session_id = SessionId::from(session_id);

    let key = match idempotency_key(&headers) {
        Ok(key) => key,
        Err(err) => {
            state.telemetry.record_step_failure(err.code());
            return Err(err.into());
        }
    };
    let actor = resolve_actor(&state, &headers).await?;

    match state
        .pipeline
        .run_step(&session_id, &payload, &key, actor.as_ref(), &StepHooks::default())
        .await
    {
        Ok((response, replayed)) => {
            if !replayed {
                state.telemetry.record_step_success(
                    started.elapsed().as_secs_f64() * 1000.0,
                    response.fallback_used,
                    response.ending_id.as_deref(),
                );
            }
            Ok(Json(response))
        }
        Err(err) => {
            state.telemetry.record_step_failure(err.code());
            Err(err.into())
        }
    }
}

/// Health check.
#[utoipa::path(
    get,
    path = "/api/v1/health",
    responses((status = 200, description = "Service healthy", body = HealthResponse)),
    tag = "system"
)]
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        uptime_seconds: state.start_time.elapsed().as_secs(),
        timestamp: chrono::Utc::now(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Telemetry snapshot for the debug surface.
#[utoipa::path(
    get,
    path = "/api/v1/debug/telemetry",
    responses(
        (status = 200, description = "Telemetry snapshot", body = TelemetrySnapshot),
        (status = 401, description = "Author token required", body = ErrorBody)
    ),
    tag = "system"
)]
pub async fn debug_telemetry(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<TelemetrySnapshot>, ApiError> {
    require_author_token(&state, &headers)?;
    Ok(Json(state.telemetry.snapshot()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn idempotency_key_extraction() {
        let mut headers = HeaderMap::new();
        assert!(matches!(
            idempotency_key(&headers),
            Err(EngineError::MissingIdempotencyKey)
        ));

        headers.insert("x-idempotency-key", HeaderValue::from_static("  "));
        assert!(idempotency_key(&headers).is_err());

        headers.insert("x-idempotency-key", HeaderValue::from_static("k1"));
        assert_eq!(idempotency_key(&headers).unwrap(), "k1");
    }
}
