//! Domain error kinds for the step runtime.
//!
//! Every failure that can cross the engine boundary is one of these kinds;
//! the HTTP layer is the single place that maps kinds to status codes, and
//! the idempotency controller persists the stable `code()` string.

use thiserror::Error;

/// Stage at which an optimistic-commit conflict was detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictStage {
    SessionUpdate,
    ActionLogUnique,
}

impl ConflictStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictStage::SessionUpdate => "session_update",
            ConflictStage::ActionLogUnique => "action_log_unique",
        }
    }
}

impl std::fmt::Display for ConflictStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Main engine error type.
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    #[error("{0}")]
    BadRequest(String),

    #[error("X-Idempotency-Key header is required")]
    MissingIdempotencyKey,

    #[error("{0}")]
    InvalidChoice(String),

    #[error("{0}")]
    ChoiceLocked(String),

    #[error("{0}")]
    Forbidden(String),

    #[error("{0}")]
    Unauthorized(String),

    #[error("{0}")]
    NotFound(String),

    #[error("request already in progress")]
    RequestInProgress,

    #[error("idempotency key reused with different payload")]
    IdempotencyPayloadMismatch,

    #[error("session step conflict at {stage}")]
    SessionStepConflict { stage: ConflictStage },

    #[error("{0}")]
    RuntimeConflict(String),

    #[error("{0}")]
    LlmUnavailable(String),

    #[error("stream closed by client")]
    StreamAborted,

    #[error("{0}")]
    Internal(String),
}

impl EngineError {
    /// Stable error code identifier, used in the HTTP envelope and in the
    /// idempotency `error_code` column.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::BadRequest(_) => "BAD_REQUEST",
            EngineError::MissingIdempotencyKey => "MISSING_IDEMPOTENCY_KEY",
            EngineError::InvalidChoice(_) => "INVALID_CHOICE",
            EngineError::ChoiceLocked(_) => "CHOICE_LOCKED",
            EngineError::Forbidden(_) => "FORBIDDEN",
            EngineError::Unauthorized(_) => "UNAUTHORIZED",
            EngineError::NotFound(_) => "NOT_FOUND",
            EngineError::RequestInProgress => "REQUEST_IN_PROGRESS",
            EngineError::IdempotencyPayloadMismatch => "IDEMPOTENCY_PAYLOAD_MISMATCH",
            EngineError::SessionStepConflict { .. } => "SESSION_STEP_CONFLICT",
            EngineError::RuntimeConflict(_) => "RUNTIME_CONFLICT",
            EngineError::LlmUnavailable(_) => "LLM_UNAVAILABLE",
            EngineError::StreamAborted => "STREAM_ABORTED",
            EngineError::Internal(_) => "STEP_FAILED",
        }
    }

    /// Code recorded in a failed idempotency row. Only a handful of kinds
    /// survive verbatim; everything else collapses to `STEP_FAILED`.
    pub fn idempotency_code(&self) -> &'static str {
        match self {
            EngineError::LlmUnavailable(_) => "LLM_UNAVAILABLE",
            EngineError::SessionStepConflict { .. } => "SESSION_STEP_CONFLICT",
            EngineError::StreamAborted => "STREAM_ABORTED",
            _ => "STEP_FAILED",
        }
    }
}

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(
            EngineError::MissingIdempotencyKey.code(),
            "MISSING_IDEMPOTENCY_KEY"
        );
        assert_eq!(
            EngineError::SessionStepConflict {
                stage: ConflictStage::SessionUpdate
            }
            .code(),
            "SESSION_STEP_CONFLICT"
        );
        assert_eq!(EngineError::StreamAborted.code(), "STREAM_ABORTED");
    }

    #[test]
    fn idempotency_code_collapses_unclassified() {
        assert_eq!(
            EngineError::InvalidChoice("bad".into()).idempotency_code(),
            "STEP_FAILED"
        );
        assert_eq!(
            EngineError::LlmUnavailable("down".into()).idempotency_code(),
            "LLM_UNAVAILABLE"
        );
    }

    #[test]
    fn conflict_stage_labels() {
        assert_eq!(ConflictStage::SessionUpdate.as_str(), "session_update");
        assert_eq!(ConflictStage::ActionLogUnique.as_str(), "action_log_unique");
        let err = EngineError::SessionStepConflict {
            stage: ConflictStage::ActionLogUnique,
        };
        assert_eq!(err.to_string(), "session step conflict at action_log_unique");
    }
}
