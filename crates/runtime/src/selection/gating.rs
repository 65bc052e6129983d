//! NPC-tier gate evaluation for visible choices.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::kernel::state::StoryState;
use crate::story::pack::{Choice, SceneNode, TierLabel};
use crate::story::resolver::ResolvedPack;

/// Why a choice is currently locked.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockedReason {
    pub code: String,
    pub message: String,
}

/// Gate evaluation result for one choice.
#[derive(Debug, Clone)]
pub struct GateEvaluation {
    pub available: bool,
    pub locked_reason: Option<LockedReason>,
    pub failed_rules: Vec<Value>,
}

/// A choice annotated with its gate evaluation.
#[derive(Debug, Clone)]
pub struct EvaluatedChoice<'a> {
    pub choice: &'a Choice,
    pub available: bool,
    pub locked_reason: Option<LockedReason>,
    pub failed_rules: Vec<Value>,
}

/// Evaluate one choice's gate rules against the current NPC state.
pub fn evaluate_choice_gate(
    choice: &Choice,
    state: &StoryState,
    resolved: &ResolvedPack,
) -> GateEvaluation {
    if choice.gate_rules.is_empty() {
        return GateEvaluation {
            available: true,
            locked_reason: None,
            failed_rules: Vec::new(),
        };
    }

    let mut failures: Vec<Value> = Vec::new();
    for rule in &choice.gate_rules {
        let npc_id = rule.npc_id.trim();
        if npc_id.is_empty() {
            failures.push(json!({
                "code": "NPC_GATE_INVALID_RULE",
                "message": "Invalid npc gate rule.",
                "npc_id": "",
            }));
            continue;
        }
        let npc_name = resolved
            .npc_def(npc_id)
            .map(|def| def.name.clone())
            .unwrap_or_else(|| npc_id.to_string());
        let Some(npc) = state.npc_state.get(npc_id) else {
            failures.push(json!({
                "code": "NPC_GATE_NPC_MISSING",
                "message": format!("{npc_name} is not available in current runtime state."),
                "npc_id": npc_id,
            }));
            continue;
        };

        if let Some(required) = rule.min_affection_tier {
            if npc.affection_tier.index() < required.index() {
                failures.push(tier_failure(
                    &npc_name,
                    npc_id,
                    "affection",
                    required,
                    npc.affection_tier,
                ));
            }
        }
        if let Some(required) = rule.min_trust_tier {
            if npc.trust_tier.index() < required.index() {
                failures.push(tier_failure(&npc_name, npc_id, "trust", required, npc.trust_tier));
            }
        }
    }

    if failures.is_empty() {
        return GateEvaluation {
            available: true,
            locked_reason: None,
            failed_rules: Vec::new(),
        };
    }

    let first = &failures[0];
    let locked_reason = LockedReason {
        code: first
            .get("code")
            .and_then(Value::as_str)
            .unwrap_or("NPC_GATE_TIER")
            .to_string(),
        message: first
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string(),
    };
    GateEvaluation {
        available: false,
        locked_reason: Some(locked_reason),
        failed_rules: failures,
    }
}

fn tier_failure(
    npc_name: &str,
    npc_id: &str,
    axis: &str,
    required: TierLabel,
    current: TierLabel,
) -> Value {
    json!({
        "code": "NPC_GATE_TIER",
        "message": format!("Need {npc_name} {axis} tier >= {required}."),
        "npc_id": npc_id,
        "axis": axis,
        "required": required.as_str(),
        "current": current.as_str(),
    })
}

/// Evaluate every choice on a node.
pub fn evaluate_node_choices<'a>(
    node: &'a SceneNode,
    state: &StoryState,
    resolved: &ResolvedPack,
) -> Vec<EvaluatedChoice<'a>> {
    node.choices
        .iter()
        .map(|choice| {
            let evaluation = evaluate_choice_gate(choice, state, resolved);
            EvaluatedChoice {
                choice,
                available: evaluation.available,
                locked_reason: evaluation.locked_reason,
                failed_rules: evaluation.failed_rules,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::state::{build_npc_state_from_defs, default_state};
    use crate::story::catalog::campus_week_pack;
    use std::sync::Arc;

    fn setup() -> (ResolvedPack, StoryState) {
        let pack = Arc::new(campus_week_pack());
        let resolved = ResolvedPack::resolve(pack);
        let mut state = default_state();
        state.npc_state = build_npc_state_from_defs(&resolved.pack.npc_defs);
        (resolved, state)
    }

    #[test]
    fn ungated_choice_is_available() {
        let (resolved, state) = setup();
        let node = resolved.node("n_hub").unwrap();
        let study = node.choices.iter().find(|c| c.choice_id == "c_study").unwrap();
        let evaluation = evaluate_choice_gate(study, &state, &resolved);
        assert!(evaluation.available);
        assert!(evaluation.locked_reason.is_none());
    }

    #[test]
    fn gated_choice_locks_below_tier() {
        let (resolved, state) = setup();
        let node = resolved.node("n_hub").unwrap();
        let confide = node.choices.iter().find(|c| c.choice_id == "c_confide").unwrap();
        // Initial affection 10 => Neutral, below the required Warm.
        let evaluation = evaluate_choice_gate(confide, &state, &resolved);
        assert!(!evaluation.available);
        let reason = evaluation.locked_reason.unwrap();
        assert_eq!(reason.code, "NPC_GATE_TIER");
        assert!(reason.message.contains("Mika"));
    }

    #[test]
    fn gated_choice_opens_at_tier() {
        let (resolved, mut state) = setup();
        if let Some(entry) = state.npc_state.get_mut("npc_mika") {
            entry.affection = 30;
            entry.rederive_tiers();
        }
        let node = resolved.node("n_hub").unwrap();
        let confide = node.choices.iter().find(|c| c.choice_id == "c_confide").unwrap();
        let evaluation = evaluate_choice_gate(confide, &state, &resolved);
        assert!(evaluation.available);
    }

    #[test]
    fn missing_npc_state_locks_choice() {
        let (resolved, mut state) = setup();
        state.npc_state.clear();
        let node = resolved.node("n_hub").unwrap();
        let confide = node.choices.iter().find(|c| c.choice_id == "c_confide").unwrap();
        let evaluation = evaluate_choice_gate(confide, &state, &resolved);
        assert!(!evaluation.available);
        assert_eq!(
            evaluation.locked_reason.unwrap().code,
            "NPC_GATE_NPC_MISSING"
        );
    }

    #[test]
    fn evaluate_node_choices_covers_all() {
        let (resolved, state) = setup();
        let node = resolved.node("n_hub").unwrap();
        let evaluated = evaluate_node_choices(node, &state, &resolved);
        assert_eq!(evaluated.len(), node.choices.len());
        let available: Vec<_> = evaluated.iter().filter(|e| e.available).collect();
        assert_eq!(available.len(), 3);
    }
}
