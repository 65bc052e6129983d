//! HTTP middleware and actor identity resolution.

use axum::extract::Request;
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::Next;
use axum::response::Response;
use serde::Deserialize;
use subtle::ConstantTimeEq;

use super::types::AppState;
use crate::hashing::token_actor_ref;
use crate::types::{EngineError, EngineResult, UserId};

/// Claims accepted from a Bearer JWT.
#[derive(Debug, Deserialize)]
struct JwtClaims {
    sub: String,
    #[allow(dead_code)]
    exp: usize,
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    bool::from(a.as_bytes().ct_eq(b.as_bytes()))
}

fn header_value<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

/// Resolve the acting user for a request.
///
/// Precedence: Bearer JWT (when a secret is configured) over the player
/// token; the player token, when configured, gates access entirely. With
/// neither configured the request is anonymous and the default user applies.
pub async fn resolve_actor(
    state: &AppState,
    headers: &HeaderMap,
) -> EngineResult<Option<UserId>> {
    if let Some(secret) = state.config.jwt_secret.as_deref() {
        if let Some(auth) = header_value(headers, "authorization") {
            let Some(token) = auth.strip_prefix("Bearer ") else {
                return Err(EngineError::Unauthorized(
                    "authorization header must be a bearer token".to_string(),
                ));
            };
            let decoded = jsonwebtoken::decode::<JwtClaims>(
                token,
                &jsonwebtoken::DecodingKey::from_secret(secret.as_bytes()),
                &jsonwebtoken::Validation::default(),
            )
            .map_err(|err| EngineError::Unauthorized(format!("invalid bearer token: {err}")))?;
            let actor = state
                .pipeline
                .actor_for_ref(&format!("jwt:{}", decoded.claims.sub))
                .await?;
            return Ok(Some(actor));
        }
    }

    let supplied = header_value(headers, "x-player-token");
    match (state.config.player_api_token.as_deref(), supplied) {
        (Some(expected), Some(token)) => {
            if !constant_time_eq(expected, token) {
                tracing::warn!("player token rejected");
                return Err(EngineError::Unauthorized("invalid player token".to_string()));
            }
            let actor = state
                .pipeline
                .actor_for_ref(&token_actor_ref("player", token))
                .await?;
            Ok(Some(actor))
        }
        (Some(_), None) => Err(EngineError::Unauthorized(
            "X-Player-Token header is required".to_string(),
        )),
        (None, Some(token)) => {
            // Tokens still establish identity even when access is ungated.
            let actor = state
                .pipeline
                .actor_for_ref(&token_actor_ref("player", token))
                .await?;
            Ok(Some(actor))
        }
        (None, None) => Ok(None),
    }
}

/// Require the author token on debug surfaces when one is configured.
pub fn require_author_token(state: &AppState, headers: &HeaderMap) -> EngineResult<()> {
    let Some(expected) = state.config.author_api_token.as_deref() else {
        return Ok(());
    };
    match header_value(headers, "x-author-token") {
        Some(token) if constant_time_eq(expected, token) => Ok(()),
        Some(_) => Err(EngineError::Unauthorized("invalid author token".to_string())),
        None => Err(EngineError::Unauthorized(
            "X-Author-Token header is required".to_string(),
        )),
    }
}

/// Security headers applied to every response.
pub async fn security_headers_middleware(
    request: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    use axum::http::HeaderValue;

    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    headers.insert(
        "x-content-type-options",
        HeaderValue::from_static("nosniff"),
    );
    headers.insert("x-frame-options", HeaderValue::from_static("DENY"));
    headers.insert(
        "content-security-policy",
        HeaderValue::from_static("default-src 'self'; frame-ancestors 'none'"),
    );
    Ok(response)
}
