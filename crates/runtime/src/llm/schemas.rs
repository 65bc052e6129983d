//! Structured-output schemas and their typed Rust shapes.
//!
//! Schema names are part of the persisted log contract and must not change:
//! `story_selection_mapping_v3`, `story_ending_bundle_v1`,
//! `story_narrative_v1`.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::OnceLock;

use crate::story::pack::FallbackReason;

pub const SELECTION_MAPPING_V3_SCHEMA_NAME: &str = "story_selection_mapping_v3";
pub const ENDING_BUNDLE_SCHEMA_NAME: &str = "story_ending_bundle_v1";
pub const NARRATIVE_SCHEMA_NAME: &str = "story_narrative_v1";

/// Selection target class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetType {
    Choice,
    Fallback,
}

/// Decision codes the selection model may return.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DecisionCode {
    #[serde(rename = "SELECT_CHOICE")]
    SelectChoice,
    #[serde(rename = "FALLBACK_NO_MATCH")]
    FallbackNoMatch,
    #[serde(rename = "FALLBACK_LOW_CONF")]
    FallbackLowConf,
    #[serde(rename = "FALLBACK_OFF_TOPIC")]
    FallbackOffTopic,
    #[serde(rename = "FALLBACK_INPUT_POLICY")]
    FallbackInputPolicy,
}

impl DecisionCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            DecisionCode::SelectChoice => "SELECT_CHOICE",
            DecisionCode::FallbackNoMatch => "FALLBACK_NO_MATCH",
            DecisionCode::FallbackLowConf => "FALLBACK_LOW_CONF",
            DecisionCode::FallbackOffTopic => "FALLBACK_OFF_TOPIC",
            DecisionCode::FallbackInputPolicy => "FALLBACK_INPUT_POLICY",
        }
    }

    /// The fallback reason implied by a fallback decision code.
    pub fn implied_reason(&self) -> Option<FallbackReason> {
        match self {
            DecisionCode::SelectChoice => None,
            DecisionCode::FallbackNoMatch => Some(FallbackReason::NoMatch),
            DecisionCode::FallbackLowConf => Some(FallbackReason::LowConf),
            DecisionCode::FallbackOffTopic => Some(FallbackReason::OffTopic),
            DecisionCode::FallbackInputPolicy => Some(FallbackReason::InputPolicy),
        }
    }

    pub fn for_reason(reason: FallbackReason) -> Self {
        match reason {
            FallbackReason::NoMatch => DecisionCode::FallbackNoMatch,
            FallbackReason::LowConf => DecisionCode::FallbackLowConf,
            FallbackReason::OffTopic => DecisionCode::FallbackOffTopic,
            FallbackReason::InputPolicy => DecisionCode::FallbackInputPolicy,
        }
    }
}

/// One ranked mapping candidate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectionCandidate {
    pub target_type: TargetType,
    pub target_id: String,
    pub confidence: f64,
}

/// Validated v3 selection-mapping output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectionMappingV3 {
    pub schema_version: String,
    pub decision_code: DecisionCode,
    pub target_type: TargetType,
    pub target_id: String,
    pub confidence: f64,
    pub intensity_tier: i32,
    #[serde(default)]
    pub fallback_reason_code: Option<FallbackReason>,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub top_candidates: Vec<SelectionCandidate>,
}

/// Plain narration output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NarrativeOutput {
    pub narrative_text: String,
}

/// One highlight line of the ending report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndingHighlight {
    pub title: String,
    pub detail: String,
}

/// Aggregate run statistics inside the ending report.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EndingStats {
    pub total_steps: u32,
    pub fallback_count: u32,
    pub fallback_rate: f64,
    pub explicit_count: u32,
    pub rule_count: u32,
    pub llm_count: u32,
    pub fallback_source_count: u32,
    pub energy_delta: f64,
    pub money_delta: f64,
    pub knowledge_delta: f64,
    pub affection_delta: f64,
}

/// The generated end-of-run report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndingReport {
    pub title: String,
    pub one_liner: String,
    pub life_summary: String,
    pub highlights: Vec<EndingHighlight>,
    pub stats: EndingStats,
    pub persona_tags: Vec<String>,
}

/// Narration plus report, produced atomically when a run ends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndingBundleOutput {
    pub narrative_text: String,
    pub ending_report: EndingReport,
}

/// JSON Schema for v3 selection mapping.
pub fn selection_mapping_v3_schema() -> &'static Value {
    static SCHEMA: OnceLock<Value> = OnceLock::new();
    SCHEMA.get_or_init(|| {
        let candidate = json!({
            "type": "object",
            "additionalProperties": false,
            "required": ["target_type", "target_id", "confidence"],
            "properties": {
                "target_type": {"enum": ["choice", "fallback"]},
                "target_id": {"type": "string", "minLength": 1},
                "confidence": {"type": "number", "minimum": 0, "maximum": 1},
            },
        });
        json!({
            "type": "object",
            "additionalProperties": false,
            "required": [
                "schema_version",
                "decision_code",
                "target_type",
                "target_id",
                "confidence",
                "intensity_tier",
                "fallback_reason_code",
                "top_candidates",
            ],
            "properties": {
                "schema_version": {"enum": ["3.0"]},
                "decision_code": {
                    "enum": [
                        "SELECT_CHOICE",
                        "FALLBACK_NO_MATCH",
                        "FALLBACK_LOW_CONF",
                        "FALLBACK_OFF_TOPIC",
                        "FALLBACK_INPUT_POLICY",
                    ]
                },
                "target_type": {"enum": ["choice", "fallback"]},
                "target_id": {"type": "string", "minLength": 1},
                "confidence": {"type": "number", "minimum": 0, "maximum": 1},
                "intensity_tier": {"type": "integer", "enum": [-2, -1, 0, 1, 2]},
                "fallback_reason_code": {
                    "enum": ["NO_MATCH", "LOW_CONF", "OFF_TOPIC", "INPUT_POLICY", null]
                },
                "reason": {"type": ["string", "null"]},
                "top_candidates": {
                    "type": "array",
                    "maxItems": 3,
                    "items": candidate,
                },
            },
        })
    })
}

/// JSON Schema for the ending report.
fn ending_report_schema() -> Value {
    json!({
        "type": "object",
        "additionalProperties": false,
        "required": ["title", "one_liner", "life_summary", "highlights", "stats", "persona_tags"],
        "properties": {
            "title": {"type": "string", "minLength": 1},
            "one_liner": {"type": "string", "minLength": 1},
            "life_summary": {"type": "string", "minLength": 1},
            "highlights": {
                "type": "array",
                "minItems": 1,
                "maxItems": 5,
                "items": {
                    "type": "object",
                    "additionalProperties": false,
                    "required": ["title", "detail"],
                    "properties": {
                        "title": {"type": "string", "minLength": 1},
                        "detail": {"type": "string", "minLength": 1},
                    },
                },
            },
            "stats": {
                "type": "object",
                "additionalProperties": false,
                "required": [
                    "total_steps",
                    "fallback_count",
                    "fallback_rate",
                    "explicit_count",
                    "rule_count",
                    "llm_count",
                    "fallback_source_count",
                    "energy_delta",
                    "money_delta",
                    "knowledge_delta",
                    "affection_delta",
                ],
                "properties": {
                    "total_steps": {"type": "integer", "minimum": 0},
                    "fallback_count": {"type": "integer", "minimum": 0},
                    "fallback_rate": {"type": "number", "minimum": 0, "maximum": 1},
                    "explicit_count": {"type": "integer", "minimum": 0},
                    "rule_count": {"type": "integer", "minimum": 0},
                    "llm_count": {"type": "integer", "minimum": 0},
                    "fallback_source_count": {"type": "integer", "minimum": 0},
                    "energy_delta": {"type": "number"},
                    "money_delta": {"type": "number"},
                    "knowledge_delta": {"type": "number"},
                    "affection_delta": {"type": "number"},
                },
            },
            "persona_tags": {
                "type": "array",
                "minItems": 1,
                "maxItems": 6,
                "items": {"type": "string", "minLength": 1},
            },
        },
    })
}

/// JSON Schema for the ending bundle.
pub fn ending_bundle_schema() -> &'static Value {
    static SCHEMA: OnceLock<Value> = OnceLock::new();
    SCHEMA.get_or_init(|| {
        json!({
            "type": "object",
            "additionalProperties": false,
            "required": ["narrative_text", "ending_report"],
            "properties": {
                "narrative_text": {"type": "string", "minLength": 1},
                "ending_report": ending_report_schema(),
            },
        })
    })
}

/// JSON Schema for plain narration.
pub fn narrative_schema() -> &'static Value {
    static SCHEMA: OnceLock<Value> = OnceLock::new();
    SCHEMA.get_or_init(|| {
        json!({
            "type": "object",
            "additionalProperties": false,
            "required": ["narrative_text"],
            "properties": {
                "narrative_text": {"type": "string"},
            },
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::grammar::validate_structured_output;

    #[test]
    fn valid_selection_payload_passes_schema_and_deserializes() {
        let raw = r#"{
            "schema_version": "3.0",
            "decision_code": "SELECT_CHOICE",
            "target_type": "choice",
            "target_id": "c_study",
            "confidence": 0.91,
            "intensity_tier": 1,
            "fallback_reason_code": null,
            "reason": "clear match",
            "top_candidates": [
                {"target_type": "choice", "target_id": "c_study", "confidence": 0.91}
            ]
        }"#;
        let value = validate_structured_output(raw, selection_mapping_v3_schema()).unwrap();
        let mapping: SelectionMappingV3 = serde_json::from_value(value).unwrap();
        assert_eq!(mapping.decision_code, DecisionCode::SelectChoice);
        assert_eq!(mapping.intensity_tier, 1);
        assert!(mapping.fallback_reason_code.is_none());
    }

    #[test]
    fn selection_schema_rejects_bad_tier() {
        let raw = r#"{
            "schema_version": "3.0",
            "decision_code": "SELECT_CHOICE",
            "target_type": "choice",
            "target_id": "c_study",
            "confidence": 0.91,
            "intensity_tier": 7,
            "fallback_reason_code": null,
            "top_candidates": []
        }"#;
        assert!(validate_structured_output(raw, selection_mapping_v3_schema()).is_err());
    }

    #[test]
    fn selection_schema_rejects_unknown_decision() {
        let raw = r#"{
            "schema_version": "3.0",
            "decision_code": "DO_SOMETHING",
            "target_type": "choice",
            "target_id": "c_study",
            "confidence": 0.5,
            "intensity_tier": 0,
            "fallback_reason_code": null,
            "top_candidates": []
        }"#;
        assert!(validate_structured_output(raw, selection_mapping_v3_schema()).is_err());
    }

    #[test]
    fn decision_code_reason_mapping_is_total() {
        for reason in [
            FallbackReason::NoMatch,
            FallbackReason::LowConf,
            FallbackReason::OffTopic,
            FallbackReason::InputPolicy,
        ] {
            let code = DecisionCode::for_reason(reason);
            assert_eq!(code.implied_reason(), Some(reason));
        }
        assert!(DecisionCode::SelectChoice.implied_reason().is_none());
    }

    #[test]
    fn ending_bundle_schema_requires_report() {
        let raw = r#"{"narrative_text": "The end."}"#;
        assert!(validate_structured_output(raw, ending_bundle_schema()).is_err());
    }
}
