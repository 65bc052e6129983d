//! Wire-facing request/response shapes for session and step operations.
//!
//! Enum-like fields travel as plain strings; the pipeline translates domain
//! values at this boundary so the wire contract stays stable.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use utoipa::ToSchema;

use crate::types::{EngineError, EngineResult};

/// Why a choice is locked, as shown to clients.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ChoiceLockReasonOut {
    pub code: String,
    pub message: String,
}

/// One selectable choice with availability annotation.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ChoiceOut {
    pub id: String,
    pub text: String,
    pub available: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locked_reason: Option<ChoiceLockReasonOut>,
}

/// The node a session currently sits on.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct CurrentNodeOut {
    pub id: String,
    pub title: String,
    pub scene_brief: String,
    pub choices: Vec<ChoiceOut>,
}

/// Body of `POST /sessions`.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct SessionCreateRequest {
    pub story_id: String,
    #[serde(default)]
    pub version: Option<u32>,
    #[serde(default)]
    pub user_id: Option<String>,
}

/// Response of `POST /sessions`.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct SessionCreateResponse {
    pub session_id: String,
    pub story_id: String,
    pub story_version: u32,
    pub story_node_id: String,
    #[schema(value_type = Object)]
    pub state_json: Value,
    pub current_node: CurrentNodeOut,
    pub status: String,
}

/// Response of `GET /sessions/{id}`.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct SessionStateResponse {
    pub session_id: String,
    pub story_id: String,
    pub story_version: u32,
    pub story_node_id: String,
    pub status: String,
    #[schema(value_type = Object)]
    pub state_json: Value,
    pub current_node: CurrentNodeOut,
    pub created_at: chrono::NaiveDateTime,
    pub updated_at: chrono::NaiveDateTime,
}

/// Body of the step endpoints: exactly one of the two fields.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, Default)]
pub struct StepRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub choice_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub player_input: Option<String>,
}

impl StepRequest {
    /// Enforce the exactly-one-field contract.
    pub fn validate(&self) -> EngineResult<()> {
        let choice = self.choice_id.as_deref().unwrap_or("").trim();
        let input = self.player_input.as_deref().unwrap_or("").trim();
        if choice.is_empty() && input.is_empty() {
            return Err(EngineError::BadRequest(
                "choice_id and player_input cannot both be empty".to_string(),
            ));
        }
        if !choice.is_empty() && !input.is_empty() {
            return Err(EngineError::BadRequest(
                "choice_id and player_input cannot both be provided".to_string(),
            ));
        }
        Ok(())
    }

    /// Canonicalizable payload (None fields excluded), used for the
    /// idempotency fingerprint.
    pub fn to_payload_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or_else(|_| Value::Object(Default::default()))
    }
}

/// Response of the step endpoints.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct StepResponse {
    pub session_status: String,
    pub story_node_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempted_choice_id: Option<String>,
    pub executed_choice_id: String,
    pub fallback_used: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_reason: Option<String>,
    pub selection_mode: String,
    pub selection_source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mapping_confidence: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intensity_tier: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mainline_nudge: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nudge_tier: Option<String>,
    pub narrative_text: String,
    pub choices: Vec<ChoiceOut>,
    #[schema(value_type = Vec<Object>)]
    pub range_effects_applied: Vec<Value>,
    #[schema(value_type = Object)]
    pub state_excerpt: Value,
    pub run_ended: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ending_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ending_outcome: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ending_camp: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schema(value_type = Option<Object>)]
    pub ending_report: Option<Value>,
    pub current_node: CurrentNodeOut,
}
