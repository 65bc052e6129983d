//! Ending resolution: trigger scan plus run-bound timeout.

use serde::{Deserialize, Serialize};

use crate::kernel::state::StoryState;
use crate::story::pack::{EndingCamp, EndingDef, EndingOutcome, EndingTrigger, RunConfig};

/// Ending id synthesized when a run exhausts its day or step budget.
pub const TIMEOUT_ENDING_ID: &str = "__timeout__";

/// Outcome of ending resolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndingResolution {
    pub ending_id: String,
    pub outcome: EndingOutcome,
    pub camp: EndingCamp,
    /// True when the ending was synthesized from run bounds rather than a
    /// configured definition.
    pub synthesized_timeout: bool,
}

fn trigger_matches(
    trigger: &EndingTrigger,
    next_node_id: &str,
    state: &StoryState,
    completed_quests: &[String],
) -> bool {
    if let Some(node_id) = &trigger.node_id_is {
        if node_id != next_node_id {
            return false;
        }
    }
    if let Some(day) = trigger.day_at_least {
        if state.day < day {
            return false;
        }
    }
    if let Some(day) = trigger.day_at_most {
        if state.day > day {
            return false;
        }
    }
    if let Some(energy) = trigger.energy_at_most {
        if state.energy > energy {
            return false;
        }
    }
    if let Some(money) = trigger.money_at_least {
        if state.money < money {
            return false;
        }
    }
    if let Some(knowledge) = trigger.knowledge_at_least {
        if state.knowledge < knowledge {
            return false;
        }
    }
    if let Some(affection) = trigger.affection_at_least {
        if state.affection < affection {
            return false;
        }
    }
    trigger
        .completed_quests_include
        .iter()
        .all(|quest| completed_quests.iter().any(|done| done == quest))
}

/// Resolve whether the run ends at this state.
///
/// Idempotent: a state that already carries an ending id returns it
/// unchanged. Otherwise endings are scanned in their `(priority, ending_id)`
/// order and the first non-empty trigger that matches wins; failing that,
/// exceeding `max_days` or `max_steps` synthesizes a timeout ending with the
/// pack's default timeout outcome.
pub fn resolve_run_ending(
    state: &StoryState,
    endings_sorted: &[EndingDef],
    next_node_id: &str,
    run_config: &RunConfig,
) -> Option<EndingResolution> {
    if let Some(existing) = &state.run_state.ending_id {
        return Some(EndingResolution {
            ending_id: existing.clone(),
            outcome: state.run_state.ending_outcome.unwrap_or(EndingOutcome::Neutral),
            camp: state.run_state.ending_camp.unwrap_or(EndingCamp::World),
            synthesized_timeout: existing == TIMEOUT_ENDING_ID,
        });
    }

    let completed = state.completed_quests();
    for ending in endings_sorted {
        if ending.trigger.is_empty() {
            continue;
        }
        if trigger_matches(&ending.trigger, next_node_id, state, &completed) {
            return Some(EndingResolution {
                ending_id: ending.ending_id.clone(),
                outcome: ending.outcome,
                camp: ending.camp,
                synthesized_timeout: false,
            });
        }
    }

    if state.day > run_config.max_days || state.run_state.step_index >= run_config.max_steps {
        return Some(EndingResolution {
            ending_id: TIMEOUT_ENDING_ID.to_string(),
            outcome: run_config.default_timeout_outcome,
            camp: EndingCamp::World,
            synthesized_timeout: true,
        });
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::state::default_state;
    use crate::story::pack::EndingTrigger;

    fn ending(id: &str, priority: i64, trigger: EndingTrigger) -> EndingDef {
        EndingDef {
            ending_id: id.to_string(),
            title: id.to_string(),
            outcome: EndingOutcome::Success,
            camp: EndingCamp::Player,
            epilogue: String::new(),
            priority,
            trigger,
            prompt_profile_id: None,
        }
    }

    #[test]
    fn already_ended_state_is_idempotent() {
        let mut state = default_state();
        state.run_state.ending_id = Some("ending_forced_fail".to_string());
        state.run_state.ending_outcome = Some(EndingOutcome::Fail);
        state.run_state.ending_camp = Some(EndingCamp::World);
        let resolution = resolve_run_ending(&state, &[], "n_hub", &RunConfig::default()).unwrap();
        assert_eq!(resolution.ending_id, "ending_forced_fail");
        assert_eq!(resolution.outcome, EndingOutcome::Fail);
    }

    #[test]
    fn first_matching_trigger_in_priority_order_wins() {
        let mut state = default_state();
        state.knowledge = 80;
        let endings = vec![
            ending(
                "ending_low_priority",
                5,
                EndingTrigger {
                    knowledge_at_least: Some(50),
                    ..EndingTrigger::default()
                },
            ),
            ending(
                "ending_high_priority",
                50,
                EndingTrigger {
                    knowledge_at_least: Some(10),
                    ..EndingTrigger::default()
                },
            ),
        ];
        let resolution =
            resolve_run_ending(&state, &endings, "n_hub", &RunConfig::default()).unwrap();
        assert_eq!(resolution.ending_id, "ending_low_priority");
    }

    #[test]
    fn empty_triggers_never_fire() {
        let state = default_state();
        let endings = vec![ending("ending_default", 1, EndingTrigger::default())];
        assert!(resolve_run_ending(&state, &endings, "n_hub", &RunConfig::default()).is_none());
    }

    #[test]
    fn node_and_quest_conditions() {
        let mut state = default_state();
        state.quest_state = serde_json::json!({"completed": ["q_intro"]});
        let trigger = EndingTrigger {
            node_id_is: Some("n_finale".to_string()),
            completed_quests_include: vec!["q_intro".to_string()],
            ..EndingTrigger::default()
        };
        let endings = vec![ending("ending_finale", 1, trigger)];
        assert!(resolve_run_ending(&state, &endings, "n_hub", &RunConfig::default()).is_none());
        let resolution =
            resolve_run_ending(&state, &endings, "n_finale", &RunConfig::default()).unwrap();
        assert_eq!(resolution.ending_id, "ending_finale");
    }

    #[test]
    fn timeout_on_day_budget() {
        let mut state = default_state();
        state.day = 8;
        let resolution = resolve_run_ending(&state, &[], "n_hub", &RunConfig::default()).unwrap();
        assert_eq!(resolution.ending_id, TIMEOUT_ENDING_ID);
        assert!(resolution.synthesized_timeout);
        assert_eq!(resolution.outcome, EndingOutcome::Neutral);
    }

    #[test]
    fn timeout_on_step_budget() {
        let mut state = default_state();
        state.run_state.step_index = 24;
        let resolution = resolve_run_ending(&state, &[], "n_hub", &RunConfig::default()).unwrap();
        assert!(resolution.synthesized_timeout);
    }

    #[test]
    fn no_ending_inside_bounds() {
        let state = default_state();
        assert!(resolve_run_ending(&state, &[], "n_hub", &RunConfig::default()).is_none());
    }
}
