//! Persistent runtime store backed by SQLite.
//!
//! The connection is checked out only for short operations; every statement
//! that participates in a concurrency guarantee (idempotency transitions,
//! the CAS session update, the action-log insert) is a single atomic SQL
//! statement so races resolve in the database, not in application code.

use async_trait::async_trait;
use chrono::NaiveDateTime;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use thiserror::Error;

use crate::time::{format_timestamp, parse_timestamp};
use crate::types::{SessionId, SessionStatus, UserId};

/// Errors produced by the store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("action log step index conflict")]
    StepIndexConflict,
    #[error("session version conflict")]
    VersionConflict,
}

impl From<StoreError> for crate::types::EngineError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::StepIndexConflict => crate::types::EngineError::SessionStepConflict {
                stage: crate::types::ConflictStage::ActionLogUnique,
            },
            StoreError::VersionConflict => crate::types::EngineError::SessionStepConflict {
                stage: crate::types::ConflictStage::SessionUpdate,
            },
            other => crate::types::EngineError::Internal(other.to_string()),
        }
    }
}

/// One session row.
#[derive(Debug, Clone)]
pub struct SessionRow {
    pub id: SessionId,
    pub user_id: UserId,
    pub story_id: String,
    pub story_version: u32,
    pub status: SessionStatus,
    pub story_node_id: String,
    pub state_json: Value,
    pub version: i64,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

/// One append-only action log row.
#[derive(Debug, Clone)]
pub struct ActionLogRow {
    pub session_id: SessionId,
    pub step_index: u32,
    pub request_payload: Value,
    pub selection_result: Value,
    pub state_before: Value,
    pub state_delta: Value,
    pub state_after: Value,
    pub llm_trace: Value,
    pub classification: Value,
    pub created_at: NaiveDateTime,
}

/// Idempotency record status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdempotencyStatus {
    InProgress,
    Succeeded,
    Failed,
}

impl IdempotencyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IdempotencyStatus::InProgress => "in_progress",
            IdempotencyStatus::Succeeded => "succeeded",
            IdempotencyStatus::Failed => "failed",
        }
    }

    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "in_progress" => Some(IdempotencyStatus::InProgress),
            "succeeded" => Some(IdempotencyStatus::Succeeded),
            "failed" => Some(IdempotencyStatus::Failed),
            _ => None,
        }
    }
}

/// One idempotency row.
#[derive(Debug, Clone)]
pub struct IdempotencyRow {
    pub session_id: SessionId,
    pub idempotency_key: String,
    pub status: IdempotencyStatus,
    pub request_hash: String,
    pub response_json: Option<Value>,
    pub error_code: Option<String>,
    pub updated_at: NaiveDateTime,
}

/// Fields updated by the CAS session commit.
#[derive(Debug, Clone)]
pub struct SessionCommit {
    pub status: SessionStatus,
    pub story_node_id: String,
    pub state_json: Value,
    pub updated_at: NaiveDateTime,
}

/// Abstract runtime store.
#[async_trait]
pub trait RuntimeStore: Send + Sync {
    /// Get-or-create a user by external reference; returns its id.
    async fn ensure_user(&self, external_ref: &str) -> Result<UserId, StoreError>;

    /// Whether a user row exists.
    async fn user_exists(&self, id: &UserId) -> Result<bool, StoreError>;

    async fn insert_session(&self, row: &SessionRow) -> Result<(), StoreError>;

    async fn get_session(&self, id: &SessionId) -> Result<Option<SessionRow>, StoreError>;

    /// Optimistic commit: returns true when exactly one row matched
    /// `(id, status='active', version=expected_version)`.
    async fn cas_update_session(
        &self,
        id: &SessionId,
        expected_version: i64,
        commit: &SessionCommit,
    ) -> Result<bool, StoreError>;

    /// Append an action log row; `(session_id, step_index)` uniqueness
    /// violations surface as [`StoreError::StepIndexConflict`].
    async fn insert_action_log(&self, row: &ActionLogRow) -> Result<(), StoreError>;

    /// The step commit: CAS session update plus action-log append in one
    /// transaction. A version mismatch yields [`StoreError::VersionConflict`],
    /// a duplicate step index [`StoreError::StepIndexConflict`]; either way
    /// nothing is written.
    async fn commit_step(
        &self,
        id: &SessionId,
        expected_version: i64,
        commit: &SessionCommit,
        log: &ActionLogRow,
    ) -> Result<(), StoreError>;

    /// All action logs for a session, ascending by step index.
    async fn list_action_logs(&self, session_id: &SessionId)
        -> Result<Vec<ActionLogRow>, StoreError>;

    /// Atomically create an `in_progress` idempotency row; false when a row
    /// for this `(session, key)` already exists.
    async fn try_begin_idempotency(
        &self,
        session_id: &SessionId,
        key: &str,
        request_hash: &str,
        now: NaiveDateTime,
    ) -> Result<bool, StoreError>;

    async fn get_idempotency(
        &self,
        session_id: &SessionId,
        key: &str,
    ) -> Result<Option<IdempotencyRow>, StoreError>;

    /// Atomically move a `failed` row back to `in_progress`, clearing the
    /// stored response; false when the row was not in `failed` state.
    async fn retry_failed_idempotency(
        &self,
        session_id: &SessionId,
        key: &str,
        now: NaiveDateTime,
    ) -> Result<bool, StoreError>;

    /// Finalize an idempotency row (upsert).
    async fn finish_idempotency(
        &self,
        session_id: &SessionId,
        key: &str,
        request_hash: &str,
        status: IdempotencyStatus,
        response_json: Option<&Value>,
        error_code: Option<&str>,
        now: NaiveDateTime,
    ) -> Result<(), StoreError>;
}

/// SQLite-backed store.
pub struct SqliteStore {
    conn: tokio::sync::Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) the store at the given path.
    pub fn open(path: &str) -> Result<Self, StoreError> {
        let conn = Connection::open(path).map_err(sqlite_err)?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(sqlite_err)?;
        conn.pragma_update(None, "foreign_keys", "ON")
            .map_err(sqlite_err)?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: tokio::sync::Mutex::new(conn),
        })
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().map_err(sqlite_err)?;
        conn.pragma_update(None, "foreign_keys", "ON")
            .map_err(sqlite_err)?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: tokio::sync::Mutex::new(conn),
        })
    }

    fn init_schema(conn: &Connection) -> Result<(), StoreError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS schema_version (
                version INTEGER PRIMARY KEY
            );

            INSERT OR IGNORE INTO schema_version (version) VALUES (1);

            CREATE TABLE IF NOT EXISTS users (
                id            TEXT PRIMARY KEY,
                external_ref  TEXT NOT NULL UNIQUE,
                created_at    TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS sessions (
                id             TEXT PRIMARY KEY,
                user_id        TEXT NOT NULL,
                story_id       TEXT NOT NULL,
                story_version  INTEGER NOT NULL,
                status         TEXT NOT NULL DEFAULT 'active',
                story_node_id  TEXT NOT NULL,
                state_json     TEXT NOT NULL,
                version        INTEGER NOT NULL DEFAULT 0,
                created_at     TEXT NOT NULL,
                updated_at     TEXT NOT NULL,
                FOREIGN KEY (user_id) REFERENCES users(id)
            );

            CREATE TABLE IF NOT EXISTS action_logs (
                id                     INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id             TEXT NOT NULL,
                step_index             INTEGER NOT NULL,
                request_payload_json   TEXT NOT NULL,
                selection_result_json  TEXT NOT NULL,
                state_before           TEXT NOT NULL,
                state_delta            TEXT NOT NULL,
                state_after            TEXT NOT NULL,
                llm_trace_json         TEXT NOT NULL,
                classification_json    TEXT NOT NULL,
                created_at             TEXT NOT NULL,
                FOREIGN KEY (session_id) REFERENCES sessions(id) ON DELETE CASCADE
            );

            CREATE UNIQUE INDEX IF NOT EXISTS uq_action_logs_session_step
                ON action_logs(session_id, step_index);

            CREATE TABLE IF NOT EXISTS step_idempotency (
                session_id       TEXT NOT NULL,
                idempotency_key  TEXT NOT NULL,
                status           TEXT NOT NULL,
                request_hash     TEXT NOT NULL,
                response_json    TEXT,
                error_code       TEXT,
                updated_at       TEXT NOT NULL,
                PRIMARY KEY (session_id, idempotency_key),
                FOREIGN KEY (session_id) REFERENCES sessions(id) ON DELETE CASCADE
            );",
        )
        .map_err(sqlite_err)?;
        Ok(())
    }
}

fn sqlite_err(err: rusqlite::Error) -> StoreError {
    StoreError::Sqlite(err.to_string())
}

fn json_text(value: &Value) -> Result<String, StoreError> {
    serde_json::to_string(value).map_err(|err| StoreError::Serialization(err.to_string()))
}

fn parse_json(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or(Value::Null)
}

fn row_to_session(row: &rusqlite::Row<'_>) -> rusqlite::Result<SessionRow> {
    let status_raw: String = row.get(4)?;
    let state_raw: String = row.get(6)?;
    let created_raw: String = row.get(8)?;
    let updated_raw: String = row.get(9)?;
    Ok(SessionRow {
        id: SessionId(row.get(0)?),
        user_id: UserId(row.get(1)?),
        story_id: row.get(2)?,
        story_version: row.get::<_, i64>(3)? as u32,
        status: SessionStatus::parse(&status_raw).unwrap_or(SessionStatus::Ended),
        story_node_id: row.get(5)?,
        state_json: parse_json(&state_raw),
        version: row.get(7)?,
        created_at: parse_timestamp(&created_raw),
        updated_at: parse_timestamp(&updated_raw),
    })
}

const SESSION_COLUMNS: &str =
    "id, user_id, story_id, story_version, status, story_node_id, state_json, version, created_at, updated_at";

fn exec_cas_update(
    conn: &Connection,
    id: &SessionId,
    expected_version: i64,
    commit: &SessionCommit,
) -> Result<bool, StoreError> {
    let rows = conn
        .execute(
            "UPDATE sessions
             SET status = ?1, story_node_id = ?2, state_json = ?3,
                 updated_at = ?4, version = version + 1
             WHERE id = ?5 AND status = 'active' AND version = ?6",
            params![
                commit.status.as_str(),
                commit.story_node_id,
                json_text(&commit.state_json)?,
                format_timestamp(commit.updated_at),
                id.0,
                expected_version,
            ],
        )
        .map_err(sqlite_err)?;
    Ok(rows == 1)
}

fn exec_insert_action_log(conn: &Connection, row: &ActionLogRow) -> Result<(), StoreError> {
    let result = conn.execute(
        "INSERT INTO action_logs
            (session_id, step_index, request_payload_json, selection_result_json,
             state_before, state_delta, state_after, llm_trace_json,
             classification_json, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            row.session_id.0,
            row.step_index as i64,
            json_text(&row.request_payload)?,
            json_text(&row.selection_result)?,
            json_text(&row.state_before)?,
            json_text(&row.state_delta)?,
            json_text(&row.state_after)?,
            json_text(&row.llm_trace)?,
            json_text(&row.classification)?,
            format_timestamp(row.created_at),
        ],
    );
    match result {
        Ok(_) => Ok(()),
        Err(rusqlite::Error::SqliteFailure(failure, message))
            if failure.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            let text = message.unwrap_or_default();
            if text.contains("action_logs.session_id") || text.contains("uq_action_logs") {
                Err(StoreError::StepIndexConflict)
            } else {
                Err(StoreError::Sqlite(text))
            }
        }
        Err(other) => Err(sqlite_err(other)),
    }
}

fn row_to_action_log(row: &rusqlite::Row<'_>) -> rusqlite::Result<ActionLogRow> {
    let request_raw: String = row.get(2)?;
    let selection_raw: String = row.get(3)?;
    let before_raw: String = row.get(4)?;
    let delta_raw: String = row.get(5)?;
    let after_raw: String = row.get(6)?;
    let trace_raw: String = row.get(7)?;
    let classification_raw: String = row.get(8)?;
    let created_raw: String = row.get(9)?;
    Ok(ActionLogRow {
        session_id: SessionId(row.get(0)?),
        step_index: row.get::<_, i64>(1)? as u32,
        request_payload: parse_json(&request_raw),
        selection_result: parse_json(&selection_raw),
        state_before: parse_json(&before_raw),
        state_delta: parse_json(&delta_raw),
        state_after: parse_json(&after_raw),
        llm_trace: parse_json(&trace_raw),
        classification: parse_json(&classification_raw),
        created_at: parse_timestamp(&created_raw),
    })
}

#[async_trait]
impl RuntimeStore for SqliteStore {
    async fn ensure_user(&self, external_ref: &str) -> Result<UserId, StoreError> {
        let conn = self.conn.lock().await;
        let existing: Option<String> = conn
            .query_row(
                "SELECT id FROM users WHERE external_ref = ?1",
                params![external_ref],
                |row| row.get(0),
            )
            .optional()
            .map_err(sqlite_err)?;
        if let Some(id) = existing {
            return Ok(UserId(id));
        }

        let id = UserId::generate();
        // INSERT OR IGNORE resolves the race with a concurrent creator.
        conn.execute(
            "INSERT OR IGNORE INTO users (id, external_ref, created_at) VALUES (?1, ?2, ?3)",
            params![
                id.0,
                external_ref,
                format_timestamp(crate::time::utc_now_naive())
            ],
        )
        .map_err(sqlite_err)?;
        let winner: String = conn
            .query_row(
                "SELECT id FROM users WHERE external_ref = ?1",
                params![external_ref],
                |row| row.get(0),
            )
            .map_err(sqlite_err)?;
        Ok(UserId(winner))
    }

    async fn user_exists(&self, id: &UserId) -> Result<bool, StoreError> {
        let conn = self.conn.lock().await;
        let found: Option<String> = conn
            .query_row(
                "SELECT id FROM users WHERE id = ?1",
                params![id.0],
                |row| row.get(0),
            )
            .optional()
            .map_err(sqlite_err)?;
        Ok(found.is_some())
    }

    async fn insert_session(&self, row: &SessionRow) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO sessions
                (id, user_id, story_id, story_version, status, story_node_id,
                 state_json, version, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                row.id.0,
                row.user_id.0,
                row.story_id,
                row.story_version as i64,
                row.status.as_str(),
                row.story_node_id,
                json_text(&row.state_json)?,
                row.version,
                format_timestamp(row.created_at),
                format_timestamp(row.updated_at),
            ],
        )
        .map_err(sqlite_err)?;
        Ok(())
    }

    async fn get_session(&self, id: &SessionId) -> Result<Option<SessionRow>, StoreError> {
        let conn = self.conn.lock().await;
        conn.query_row(
            &format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE id = ?1"),
            params![id.0],
            row_to_session,
        )
        .optional()
        .map_err(sqlite_err)
    }

    async fn cas_update_session(
        &self,
        id: &SessionId,
        expected_version: i64,
        commit: &SessionCommit,
    ) -> Result<bool, StoreError> {
        let conn = self.conn.lock().await;
        exec_cas_update(&conn, id, expected_version, commit)
    }

    async fn insert_action_log(&self, row: &ActionLogRow) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        exec_insert_action_log(&conn, row)
    }

    async fn commit_step(
        &self,
        id: &SessionId,
        expected_version: i64,
        commit: &SessionCommit,
        log: &ActionLogRow,
    ) -> Result<(), StoreError> {
        let mut conn = self.conn.lock().await;
        let txn = conn.transaction().map_err(sqlite_err)?;
        if !exec_cas_update(&txn, id, expected_version, commit)? {
            return Err(StoreError::VersionConflict);
        }
        exec_insert_action_log(&txn, log)?;
        txn.commit().map_err(sqlite_err)?;
        Ok(())
    }

    async fn list_action_logs(
        &self,
        session_id: &SessionId,
    ) -> Result<Vec<ActionLogRow>, StoreError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare(
                "SELECT session_id, step_index, request_payload_json, selection_result_json,
                        state_before, state_delta, state_after, llm_trace_json,
                        classification_json, created_at
                 FROM action_logs WHERE session_id = ?1 ORDER BY step_index ASC",
            )
            .map_err(sqlite_err)?;
        let rows = stmt
            .query_map(params![session_id.0], row_to_action_log)
            .map_err(sqlite_err)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row.map_err(sqlite_err)?);
        }
        Ok(out)
    }

    async fn try_begin_idempotency(
        &self,
        session_id: &SessionId,
        key: &str,
        request_hash: &str,
        now: NaiveDateTime,
    ) -> Result<bool, StoreError> {
        let conn = self.conn.lock().await;
        let rows = conn
            .execute(
                "INSERT INTO step_idempotency
                    (session_id, idempotency_key, status, request_hash, updated_at)
                 VALUES (?1, ?2, 'in_progress', ?3, ?4)
                 ON CONFLICT (session_id, idempotency_key) DO NOTHING",
                params![session_id.0, key, request_hash, format_timestamp(now)],
            )
            .map_err(sqlite_err)?;
        Ok(rows == 1)
    }

    async fn get_idempotency(
        &self,
        session_id: &SessionId,
        key: &str,
    ) -> Result<Option<IdempotencyRow>, StoreError> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT session_id, idempotency_key, status, request_hash,
                    response_json, error_code, updated_at
             FROM step_idempotency WHERE session_id = ?1 AND idempotency_key = ?2",
            params![session_id.0, key],
            |row| {
                let status_raw: String = row.get(2)?;
                let response_raw: Option<String> = row.get(4)?;
                let updated_raw: String = row.get(6)?;
                Ok(IdempotencyRow {
                    session_id: SessionId(row.get(0)?),
                    idempotency_key: row.get(1)?,
                    status: IdempotencyStatus::parse(&status_raw)
                        .unwrap_or(IdempotencyStatus::Failed),
                    request_hash: row.get(3)?,
                    response_json: response_raw.as_deref().map(parse_json),
                    error_code: row.get(5)?,
                    updated_at: parse_timestamp(&updated_raw),
                })
            },
        )
        .optional()
        .map_err(sqlite_err)
    }

    async fn retry_failed_idempotency(
        &self,
        session_id: &SessionId,
        key: &str,
        now: NaiveDateTime,
    ) -> Result<bool, StoreError> {
        let conn = self.conn.lock().await;
        let rows = conn
            .execute(
                "UPDATE step_idempotency
                 SET status = 'in_progress', response_json = NULL, error_code = NULL,
                     updated_at = ?1
                 WHERE session_id = ?2 AND idempotency_key = ?3 AND status = 'failed'",
                params![format_timestamp(now), session_id.0, key],
            )
            .map_err(sqlite_err)?;
        Ok(rows == 1)
    }

    async fn finish_idempotency(
        &self,
        session_id: &SessionId,
        key: &str,
        request_hash: &str,
        status: IdempotencyStatus,
        response_json: Option<&Value>,
        error_code: Option<&str>,
        now: NaiveDateTime,
    ) -> Result<(), StoreError> {
        let response_text = response_json.map(json_text).transpose()?;
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO step_idempotency
                (session_id, idempotency_key, status, request_hash,
                 response_json, error_code, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT (session_id, idempotency_key) DO UPDATE SET
                status = excluded.status,
                response_json = excluded.response_json,
                error_code = excluded.error_code,
                updated_at = excluded.updated_at",
            params![
                session_id.0,
                key,
                status.as_str(),
                request_hash,
                response_text,
                error_code,
                format_timestamp(now),
            ],
        )
        .map_err(sqlite_err)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::utc_now_naive;
    use serde_json::json;

    async fn store_with_session() -> (SqliteStore, SessionRow) {
        let store = SqliteStore::open_in_memory().unwrap();
        let user_id = store.ensure_user("tester").await.unwrap();
        let now = utc_now_naive();
        let row = SessionRow {
            id: SessionId::generate(),
            user_id,
            story_id: "campus_week_v1".to_string(),
            story_version: 1,
            status: SessionStatus::Active,
            story_node_id: "n_hub".to_string(),
            state_json: json!({"energy": 80}),
            version: 0,
            created_at: now,
            updated_at: now,
        };
        store.insert_session(&row).await.unwrap();
        (store, row)
    }

    fn log_row(session_id: &SessionId, step_index: u32) -> ActionLogRow {
        ActionLogRow {
            session_id: session_id.clone(),
            step_index,
            request_payload: json!({"choice_id": "c_study"}),
            selection_result: json!({"executed_choice_id": "c_study"}),
            state_before: json!({}),
            state_delta: json!({}),
            state_after: json!({}),
            llm_trace: json!({}),
            classification: json!({}),
            created_at: utc_now_naive(),
        }
    }

    #[tokio::test]
    async fn ensure_user_is_idempotent() {
        let store = SqliteStore::open_in_memory().unwrap();
        let a = store.ensure_user("ref-1").await.unwrap();
        let b = store.ensure_user("ref-1").await.unwrap();
        assert_eq!(a, b);
        let c = store.ensure_user("ref-2").await.unwrap();
        assert_ne!(a, c);
    }

    #[tokio::test]
    async fn session_roundtrip() {
        let (store, row) = store_with_session().await;
        let loaded = store.get_session(&row.id).await.unwrap().unwrap();
        assert_eq!(loaded.story_id, "campus_week_v1");
        assert_eq!(loaded.version, 0);
        assert_eq!(loaded.status, SessionStatus::Active);
        assert_eq!(loaded.state_json["energy"], 80);
        assert!(store
            .get_session(&SessionId::from("missing"))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn cas_update_succeeds_once_per_version() {
        let (store, row) = store_with_session().await;
        let commit = SessionCommit {
            status: SessionStatus::Active,
            story_node_id: "n_library".to_string(),
            state_json: json!({"energy": 74}),
            updated_at: utc_now_naive(),
        };
        assert!(store.cas_update_session(&row.id, 0, &commit).await.unwrap());
        // Same expected version again loses.
        assert!(!store.cas_update_session(&row.id, 0, &commit).await.unwrap());

        let loaded = store.get_session(&row.id).await.unwrap().unwrap();
        assert_eq!(loaded.version, 1);
        assert_eq!(loaded.story_node_id, "n_library");
    }

    #[tokio::test]
    async fn cas_update_refuses_ended_sessions() {
        let (store, row) = store_with_session().await;
        let end = SessionCommit {
            status: SessionStatus::Ended,
            story_node_id: "n_hub".to_string(),
            state_json: json!({}),
            updated_at: utc_now_naive(),
        };
        assert!(store.cas_update_session(&row.id, 0, &end).await.unwrap());
        let next = SessionCommit {
            status: SessionStatus::Active,
            story_node_id: "n_hub".to_string(),
            state_json: json!({}),
            updated_at: utc_now_naive(),
        };
        assert!(!store.cas_update_session(&row.id, 1, &next).await.unwrap());
    }

    #[tokio::test]
    async fn action_log_unique_per_step() {
        let (store, row) = store_with_session().await;
        store.insert_action_log(&log_row(&row.id, 1)).await.unwrap();
        let err = store.insert_action_log(&log_row(&row.id, 1)).await.unwrap_err();
        assert!(matches!(err, StoreError::StepIndexConflict));

        store.insert_action_log(&log_row(&row.id, 2)).await.unwrap();
        let logs = store.list_action_logs(&row.id).await.unwrap();
        assert_eq!(logs.len(), 2);
        assert_eq!(logs[0].step_index, 1);
        assert_eq!(logs[1].step_index, 2);
    }

    #[tokio::test]
    async fn commit_step_is_atomic() {
        let (store, row) = store_with_session().await;
        let commit = SessionCommit {
            status: SessionStatus::Active,
            story_node_id: "n_library".to_string(),
            state_json: json!({"energy": 74}),
            updated_at: utc_now_naive(),
        };
        store
            .commit_step(&row.id, 0, &commit, &log_row(&row.id, 1))
            .await
            .unwrap();

        // Stale version: nothing written, not even the log.
        let err = store
            .commit_step(&row.id, 0, &commit, &log_row(&row.id, 2))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::VersionConflict));
        assert_eq!(store.list_action_logs(&row.id).await.unwrap().len(), 1);

        // Duplicate step index: session row is rolled back too.
        let err = store
            .commit_step(&row.id, 1, &commit, &log_row(&row.id, 1))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::StepIndexConflict));
        let session = store.get_session(&row.id).await.unwrap().unwrap();
        assert_eq!(session.version, 1);
    }

    #[tokio::test]
    async fn user_exists_checks() {
        let store = SqliteStore::open_in_memory().unwrap();
        let id = store.ensure_user("someone").await.unwrap();
        assert!(store.user_exists(&id).await.unwrap());
        assert!(!store.user_exists(&UserId::from("missing")).await.unwrap());
    }

    #[tokio::test]
    async fn idempotency_lifecycle() {
        let (store, row) = store_with_session().await;
        let now = utc_now_naive();

        assert!(store
            .try_begin_idempotency(&row.id, "k1", "hash-a", now)
            .await
            .unwrap());
        // Second begin with the same key loses.
        assert!(!store
            .try_begin_idempotency(&row.id, "k1", "hash-a", now)
            .await
            .unwrap());

        let pending = store.get_idempotency(&row.id, "k1").await.unwrap().unwrap();
        assert_eq!(pending.status, IdempotencyStatus::InProgress);
        assert_eq!(pending.request_hash, "hash-a");

        let response = json!({"narrative_text": "done"});
        store
            .finish_idempotency(
                &row.id,
                "k1",
                "hash-a",
                IdempotencyStatus::Succeeded,
                Some(&response),
                None,
                now,
            )
            .await
            .unwrap();
        let succeeded = store.get_idempotency(&row.id, "k1").await.unwrap().unwrap();
        assert_eq!(succeeded.status, IdempotencyStatus::Succeeded);
        assert_eq!(succeeded.response_json.unwrap()["narrative_text"], "done");

        // A succeeded row cannot be reset through the failed path.
        assert!(!store
            .retry_failed_idempotency(&row.id, "k1", now)
            .await
            .unwrap());

        store
            .finish_idempotency(
                &row.id,
                "k2",
                "hash-b",
                IdempotencyStatus::Failed,
                None,
                Some("LLM_UNAVAILABLE"),
                now,
            )
            .await
            .unwrap();
        assert!(store
            .retry_failed_idempotency(&row.id, "k2", now)
            .await
            .unwrap());
        let reset = store.get_idempotency(&row.id, "k2").await.unwrap().unwrap();
        assert_eq!(reset.status, IdempotencyStatus::InProgress);
        assert!(reset.error_code.is_none());
        assert!(reset.response_json.is_none());
    }
}
