//! Runtime resolution of a v3 selection-mapping output.
//!
//! The model proposes; the runtime disposes. Policy-flagged input always
//! forces the INPUT_POLICY fallback, choice targets pass through the
//! confidence gate, and fallback targets must agree with their declared
//! reason codes.

use std::collections::HashSet;

use crate::llm::schemas::{DecisionCode, SelectionCandidate, SelectionMappingV3, TargetType};
use crate::story::pack::FallbackReason;
use crate::story::resolver::ResolvedPack;

pub const OVERRIDE_INPUT_POLICY: &str = "INPUT_POLICY_FLAG";
pub const OVERRIDE_GATE_LOW_CONF: &str = "CONFIDENCE_GATE_LOW_CONF";
pub const OVERRIDE_GATE_NO_MATCH: &str = "CONFIDENCE_GATE_NO_MATCH";

/// Resolution failure; the `code` feeds the retry-error history.
#[derive(Debug, Clone)]
pub struct DecisionError {
    pub code: &'static str,
    pub message: String,
}

impl DecisionError {
    fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for DecisionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

/// A mapping output accepted by the runtime.
#[derive(Debug, Clone)]
pub struct ResolvedDecision {
    /// `None` means fallback; `Some` is the accepted choice id.
    pub executed_choice_id: Option<String>,
    pub attempted_choice_id: Option<String>,
    pub preferred_fallback_id: Option<String>,
    pub fallback_reason: Option<FallbackReason>,
    pub mapping_confidence: f64,
    pub top_candidates: Vec<SelectionCandidate>,
    pub raw_intensity_tier: i32,
    pub selection_decision_code: DecisionCode,
    pub decision_overridden_by_runtime: bool,
    pub runtime_override_reason: Option<&'static str>,
}

fn decision_matches_target_type(code: DecisionCode, target_type: TargetType) -> bool {
    match code {
        DecisionCode::SelectChoice => target_type == TargetType::Choice,
        _ => target_type == TargetType::Fallback,
    }
}

/// Resolve a validated mapping against the runtime's allowed targets.
pub fn resolve_decision_v3(
    mapping: &SelectionMappingV3,
    available_choice_ids: &HashSet<String>,
    resolved: &ResolvedPack,
    input_policy_flag: bool,
    confidence_high: f64,
    confidence_low: f64,
) -> Result<ResolvedDecision, DecisionError> {
    let raw_intensity_tier = mapping.intensity_tier.clamp(-2, 2);
    let mapping_confidence = mapping.confidence;
    let top_candidates = mapping.top_candidates.iter().take(3).cloned().collect();

    if input_policy_flag {
        let preferred = if mapping.target_type == TargetType::Fallback
            && resolved.fallback(&mapping.target_id).is_some()
        {
            Some(mapping.target_id.clone())
        } else {
            None
        };
        return Ok(ResolvedDecision {
            executed_choice_id: None,
            attempted_choice_id: (mapping.target_type == TargetType::Choice)
                .then(|| mapping.target_id.clone()),
            preferred_fallback_id: preferred,
            fallback_reason: Some(FallbackReason::InputPolicy),
            mapping_confidence,
            top_candidates,
            raw_intensity_tier,
            selection_decision_code: DecisionCode::FallbackInputPolicy,
            decision_overridden_by_runtime: true,
            runtime_override_reason: Some(OVERRIDE_INPUT_POLICY),
        });
    }

    if !decision_matches_target_type(mapping.decision_code, mapping.target_type) {
        return Err(DecisionError::new(
            "SCHEMA_INCONSISTENT",
            "decision_code does not match target_type",
        ));
    }

    if mapping.target_type == TargetType::Choice {
        if !available_choice_ids.contains(&mapping.target_id) {
            return Err(DecisionError::new(
                "TARGET_NOT_ALLOWED",
                "selection target choice is not available",
            ));
        }

        if mapping_confidence >= confidence_high {
            return Ok(ResolvedDecision {
                executed_choice_id: Some(mapping.target_id.clone()),
                attempted_choice_id: Some(mapping.target_id.clone()),
                preferred_fallback_id: None,
                fallback_reason: None,
                mapping_confidence,
                top_candidates,
                raw_intensity_tier,
                selection_decision_code: mapping.decision_code,
                decision_overridden_by_runtime: false,
                runtime_override_reason: None,
            });
        }

        let (downgraded, override_reason) = if mapping_confidence >= confidence_low {
            (FallbackReason::LowConf, OVERRIDE_GATE_LOW_CONF)
        } else {
            (FallbackReason::NoMatch, OVERRIDE_GATE_NO_MATCH)
        };
        return Ok(ResolvedDecision {
            executed_choice_id: None,
            attempted_choice_id: Some(mapping.target_id.clone()),
            preferred_fallback_id: None,
            fallback_reason: Some(downgraded),
            mapping_confidence,
            top_candidates,
            raw_intensity_tier,
            selection_decision_code: DecisionCode::for_reason(downgraded),
            decision_overridden_by_runtime: true,
            runtime_override_reason: Some(override_reason),
        });
    }

    // Fallback target.
    let Some(fallback) = resolved.fallback(&mapping.target_id) else {
        return Err(DecisionError::new(
            "TARGET_NOT_ALLOWED",
            "selection target fallback is not valid",
        ));
    };

    let decision_reason = mapping.decision_code.implied_reason();
    let mapped_reason = mapping.fallback_reason_code;
    if let (Some(from_decision), Some(from_mapping)) = (decision_reason, mapped_reason) {
        if from_decision != from_mapping {
            return Err(DecisionError::new(
                "FALLBACK_REASON_INVALID",
                "fallback reason_code conflicts with decision_code",
            ));
        }
    }

    let resolved_reason = decision_reason
        .or(mapped_reason)
        .or(fallback.reason_code)
        .ok_or_else(|| {
            DecisionError::new("FALLBACK_REASON_INVALID", "fallback_reason_code missing")
        })?;

    if let Some(declared) = fallback.reason_code {
        if declared != resolved_reason {
            return Err(DecisionError::new(
                "FALLBACK_REASON_INVALID",
                "target fallback reason_code mismatch",
            ));
        }
    }

    Ok(ResolvedDecision {
        executed_choice_id: None,
        attempted_choice_id: None,
        preferred_fallback_id: Some(mapping.target_id.clone()),
        fallback_reason: Some(resolved_reason),
        mapping_confidence,
        top_candidates,
        raw_intensity_tier,
        selection_decision_code: mapping.decision_code,
        decision_overridden_by_runtime: false,
        runtime_override_reason: None,
    })
}
