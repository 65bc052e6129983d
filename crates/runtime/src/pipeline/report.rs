//! Ending report brief: aggregate statistics plus recent action beats,
//! compiled from the session's action log for the ending-bundle prompt.

use serde_json::{json, Map, Value};

use crate::kernel::effects::StateDelta;
use crate::kernel::state::{default_state, StoryState};
use crate::store::ActionLogRow;

const RECENT_WINDOW: usize = 12;

/// Compact per-beat stat delta.
fn compact_state_delta(delta: &Value) -> Value {
    let get = |key: &str| delta.get(key).and_then(Value::as_f64).unwrap_or(0.0);
    json!({
        "energy": get("energy"),
        "money": get("money"),
        "knowledge": get("knowledge"),
        "affection": get("affection"),
    })
}

fn round3(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}

/// Build `{session_stats, recent_action_beats}` from the persisted log plus
/// the in-flight (not yet committed) step.
#[allow(clippy::too_many_arguments)]
pub fn build_ending_report_brief(
    logs: &[ActionLogRow],
    state_after: &StoryState,
    current_step_index: u32,
    current_executed_choice_id: &str,
    current_fallback_reason: Option<&str>,
    current_selection_source: &str,
    current_state_delta: &StateDelta,
) -> Map<String, Value> {
    let mut source_counts = [("explicit", 0u32), ("rule", 0u32), ("llm", 0u32), ("fallback", 0u32)];
    let mut bump = |source: &str| {
        let slot = source_counts
            .iter_mut()
            .find(|(name, _)| *name == source)
            .map(|(_, count)| count);
        match slot {
            Some(count) => *count += 1,
            None => {
                if let Some((_, count)) = source_counts.iter_mut().find(|(name, _)| *name == "fallback") {
                    *count += 1;
                }
            }
        }
    };
    for row in logs {
        let source = row
            .selection_result
            .get("selection_source")
            .and_then(Value::as_str)
            .unwrap_or("fallback");
        bump(source);
    }
    bump(current_selection_source);
    let count_of = |name: &str| -> u32 {
        source_counts
            .iter()
            .find(|(source, _)| *source == name)
            .map(|(_, count)| *count)
            .unwrap_or(0)
    };

    let baseline = default_state();
    let total_steps = state_after.run_state.step_index;
    let fallback_count = state_after.run_state.fallback_count;
    let fallback_rate = if total_steps == 0 {
        0.0
    } else {
        (fallback_count as f64 / total_steps as f64).clamp(0.0, 1.0)
    };

    let session_stats = json!({
        "total_steps": total_steps,
        "fallback_count": fallback_count,
        "fallback_rate": (fallback_rate * 10_000.0).round() / 10_000.0,
        "explicit_count": count_of("explicit"),
        "rule_count": count_of("rule"),
        "llm_count": count_of("llm"),
        "fallback_source_count": count_of("fallback"),
        "energy_delta": round3((state_after.energy - baseline.energy) as f64),
        "money_delta": round3((state_after.money - baseline.money) as f64),
        "knowledge_delta": round3((state_after.knowledge - baseline.knowledge) as f64),
        "affection_delta": round3((state_after.affection - baseline.affection) as f64),
    });

    let mut beats: Vec<Value> = Vec::new();
    let prior_window = RECENT_WINDOW.saturating_sub(1);
    let skip = logs.len().saturating_sub(prior_window);
    for row in logs.iter().skip(skip) {
        let selection = &row.selection_result;
        beats.push(json!({
            "step_index": row.step_index,
            "executed_choice_id": selection
                .get("executed_choice_id")
                .and_then(Value::as_str)
                .unwrap_or(""),
            "fallback_reason": selection.get("fallback_reason").cloned().unwrap_or(Value::Null),
            "selection_source": selection
                .get("selection_source")
                .and_then(Value::as_str)
                .unwrap_or("fallback"),
            "state_delta": compact_state_delta(&row.state_delta),
        }));
    }
    beats.push(json!({
        "step_index": current_step_index,
        "executed_choice_id": current_executed_choice_id,
        "fallback_reason": current_fallback_reason,
        "selection_source": current_selection_source,
        "state_delta": compact_state_delta(&current_state_delta.to_value()),
    }));
    if beats.len() > RECENT_WINDOW {
        let excess = beats.len() - RECENT_WINDOW;
        beats.drain(..excess);
    }

    let mut brief = Map::new();
    brief.insert("session_stats".to_string(), session_stats);
    brief.insert("recent_action_beats".to_string(), Value::Array(beats));
    brief
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::utc_now_naive;
    use crate::types::SessionId;

    fn log(step_index: u32, source: &str) -> ActionLogRow {
        ActionLogRow {
            session_id: SessionId::from("s"),
            step_index,
            request_payload: json!({}),
            selection_result: json!({
                "selection_source": source,
                "executed_choice_id": format!("c_{step_index}"),
                "fallback_reason": Value::Null,
            }),
            state_before: json!({}),
            state_delta: json!({"energy": -4}),
            state_after: json!({}),
            llm_trace: json!({}),
            classification: json!({}),
            created_at: utc_now_naive(),
        }
    }

    #[test]
    fn brief_counts_sources_and_steps() {
        let logs = vec![log(1, "explicit"), log(2, "llm"), log(3, "fallback")];
        let mut state = default_state();
        state.run_state.step_index = 4;
        state.run_state.fallback_count = 2;
        state.knowledge = 30;

        let brief = build_ending_report_brief(
            &logs,
            &state,
            4,
            "fallback:fb_off_topic",
            Some("OFF_TOPIC"),
            "fallback",
            &StateDelta::default(),
        );
        let stats = &brief["session_stats"];
        assert_eq!(stats["total_steps"], 4);
        assert_eq!(stats["fallback_count"], 2);
        assert_eq!(stats["fallback_rate"], 0.5);
        assert_eq!(stats["explicit_count"], 1);
        assert_eq!(stats["llm_count"], 1);
        assert_eq!(stats["fallback_source_count"], 2);
        assert_eq!(stats["knowledge_delta"], 30.0);

        let beats = brief["recent_action_beats"].as_array().unwrap();
        assert_eq!(beats.len(), 4);
        assert_eq!(beats[3]["executed_choice_id"], "fallback:fb_off_topic");
        assert_eq!(beats[3]["fallback_reason"], "OFF_TOPIC");
    }

    #[test]
    fn brief_window_is_bounded() {
        let logs: Vec<ActionLogRow> = (1..=20).map(|i| log(i, "explicit")).collect();
        let mut state = default_state();
        state.run_state.step_index = 21;

        let brief = build_ending_report_brief(
            &logs,
            &state,
            21,
            "c_final",
            None,
            "explicit",
            &StateDelta::default(),
        );
        let beats = brief["recent_action_beats"].as_array().unwrap();
        assert_eq!(beats.len(), RECENT_WINDOW);
        assert_eq!(beats.last().unwrap()["step_index"], 21);
    }

    #[test]
    fn unknown_source_counts_as_fallback() {
        let logs = vec![log(1, "mystery")];
        let state = default_state();
        let brief = build_ending_report_brief(
            &logs,
            &state,
            2,
            "c_x",
            None,
            "explicit",
            &StateDelta::default(),
        );
        assert_eq!(brief["session_stats"]["fallback_source_count"], 1);
    }
}
