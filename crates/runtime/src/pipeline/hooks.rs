//! Phase/delta sinks and the abort signal the pipeline polls.
//!
//! Sinks are side channels for the streaming surface; a failing sink must
//! never break a step, so emission swallows nothing and returns nothing.

use serde_json::Value;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::types::{EngineError, EngineResult};

pub use crate::llm::boundary::DeltaSink;

/// Sink invoked at phase transitions.
pub type PhaseSink = Arc<dyn Fn(&str, Option<&Value>) + Send + Sync>;

/// Hook bundle handed to the pipeline by the HTTP surface.
#[derive(Clone, Default)]
pub struct StepHooks {
    pub on_phase: Option<PhaseSink>,
    pub on_delta: Option<DeltaSink>,
    pub cancel: CancellationToken,
}

impl StepHooks {
    /// Hooks with an externally controlled abort token.
    pub fn with_cancel(cancel: CancellationToken) -> Self {
        Self {
            on_phase: None,
            on_delta: None,
            cancel,
        }
    }

    pub fn aborted(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn check_abort(&self) -> EngineResult<()> {
        if self.aborted() {
            Err(EngineError::StreamAborted)
        } else {
            Ok(())
        }
    }

    pub fn emit_phase(&self, phase: &str, payload: Option<Value>) {
        if let Some(sink) = &self.on_phase {
            sink(phase, payload.as_ref());
        }
    }

    pub fn emit_delta(&self, text: &str) {
        if text.is_empty() {
            return;
        }
        if let Some(sink) = &self.on_delta {
            sink(text);
        }
    }
}
