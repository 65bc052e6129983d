//! Per-(session, key) idempotency controller.
//!
//! Each transition is a single atomic store statement, so two racing
//! requests with the same key always resolve to one `Started` and one
//! `REQUEST_IN_PROGRESS`, never two executions.

use serde_json::Value;

use crate::store::{IdempotencyStatus, RuntimeStore};
use crate::time::utc_now_naive;
use crate::types::{EngineError, EngineResult, SessionId};

/// Result of the prepare phase.
#[derive(Debug, Clone)]
pub enum PrepareOutcome {
    /// This request owns the key and must execute the step.
    Started,
    /// A prior identical request succeeded; return its stored response.
    Replay(Value),
}

/// Look up or claim the `(session, key)` record.
pub async fn prepare(
    store: &dyn RuntimeStore,
    session_id: &SessionId,
    key: &str,
    request_hash: &str,
) -> EngineResult<PrepareOutcome> {
    let now = utc_now_naive();
    if store
        .try_begin_idempotency(session_id, key, request_hash, now)
        .await?
    {
        return Ok(PrepareOutcome::Started);
    }

    let row = store
        .get_idempotency(session_id, key)
        .await?
        .ok_or_else(|| EngineError::Internal("idempotency row disappeared".to_string()))?;

    if row.request_hash != request_hash {
        return Err(EngineError::IdempotencyPayloadMismatch);
    }

    match row.status {
        IdempotencyStatus::Succeeded => {
            let response = row.response_json.ok_or_else(|| {
                EngineError::Internal("succeeded idempotency row has no response".to_string())
            })?;
            Ok(PrepareOutcome::Replay(response))
        }
        IdempotencyStatus::InProgress => Err(EngineError::RequestInProgress),
        IdempotencyStatus::Failed => {
            if store.retry_failed_idempotency(session_id, key, now).await? {
                Ok(PrepareOutcome::Started)
            } else {
                // Lost the reset race to another retry.
                Err(EngineError::RequestInProgress)
            }
        }
    }
}

/// Persist a successful step's response for replay.
pub async fn finalize_success(
    store: &dyn RuntimeStore,
    session_id: &SessionId,
    key: &str,
    request_hash: &str,
    response: &Value,
) -> EngineResult<()> {
    store
        .finish_idempotency(
            session_id,
            key,
            request_hash,
            IdempotencyStatus::Succeeded,
            Some(response),
            None,
            utc_now_naive(),
        )
        .await?;
    Ok(())
}

/// Record a failed step so a same-key retry may run again.
pub async fn finalize_failure(
    store: &dyn RuntimeStore,
    session_id: &SessionId,
    key: &str,
    request_hash: &str,
    error: &EngineError,
) {
    let outcome = store
        .finish_idempotency(
            session_id,
            key,
            request_hash,
            IdempotencyStatus::Failed,
            None,
            Some(error.idempotency_code()),
            utc_now_naive(),
        )
        .await;
    if let Err(store_err) = outcome {
        tracing::error!(
            session_id = %session_id,
            error = %store_err,
            "failed to finalize idempotency row"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{SessionRow, SqliteStore};
    use crate::types::{SessionStatus, UserId};
    use serde_json::json;

    async fn store_with_session() -> (SqliteStore, SessionId) {
        let store = SqliteStore::open_in_memory().unwrap();
        let user_id = store.ensure_user("tester").await.unwrap();
        let now = utc_now_naive();
        let session_id = SessionId::generate();
        store
            .insert_session(&SessionRow {
                id: session_id.clone(),
                user_id: UserId(user_id.0),
                story_id: "s".to_string(),
                story_version: 1,
                status: SessionStatus::Active,
                story_node_id: "n_hub".to_string(),
                state_json: json!({}),
                version: 0,
                created_at: now,
                updated_at: now,
            })
            .await
            .unwrap();
        (store, session_id)
    }

    #[tokio::test]
    async fn first_prepare_starts() {
        let (store, session_id) = store_with_session().await;
        let outcome = prepare(&store, &session_id, "k1", "h1").await.unwrap();
        assert!(matches!(outcome, PrepareOutcome::Started));
    }

    #[tokio::test]
    async fn concurrent_same_key_sees_in_progress() {
        let (store, session_id) = store_with_session().await;
        prepare(&store, &session_id, "k1", "h1").await.unwrap();
        let err = prepare(&store, &session_id, "k1", "h1").await.unwrap_err();
        assert!(matches!(err, EngineError::RequestInProgress));
    }

    #[tokio::test]
    async fn hash_mismatch_is_detected_in_any_state() {
        let (store, session_id) = store_with_session().await;
        prepare(&store, &session_id, "k1", "h1").await.unwrap();
        let err = prepare(&store, &session_id, "k1", "other-hash").await.unwrap_err();
        assert!(matches!(err, EngineError::IdempotencyPayloadMismatch));
    }

    #[tokio::test]
    async fn succeeded_row_replays() {
        let (store, session_id) = store_with_session().await;
        prepare(&store, &session_id, "k1", "h1").await.unwrap();
        let response = json!({"narrative_text": "done", "run_ended": false});
        finalize_success(&store, &session_id, "k1", "h1", &response)
            .await
            .unwrap();

        match prepare(&store, &session_id, "k1", "h1").await.unwrap() {
            PrepareOutcome::Replay(stored) => assert_eq!(stored, response),
            other => panic!("expected replay, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn failed_row_restarts() {
        let (store, session_id) = store_with_session().await;
        prepare(&store, &session_id, "k1", "h1").await.unwrap();
        finalize_failure(
            &store,
            &session_id,
            "k1",
            "h1",
            &EngineError::LlmUnavailable("down".to_string()),
        )
        .await;

        let row = store.get_idempotency(&session_id, "k1").await.unwrap().unwrap();
        assert_eq!(row.error_code.as_deref(), Some("LLM_UNAVAILABLE"));

        let outcome = prepare(&store, &session_id, "k1", "h1").await.unwrap();
        assert!(matches!(outcome, PrepareOutcome::Started));
    }
}
