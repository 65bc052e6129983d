//! Built-in fallback and ending definitions.
//!
//! Every pack that opts in (the default) starts from these and may override
//! any entry by id.

use crate::story::pack::{
    EndingCamp, EndingDef, EndingOutcome, EndingTrigger, FallbackReason, GlobalFallback,
    RangeEffect, RangeTarget,
};

fn player_effect(metric: &str, center: i64, intensity: i64) -> RangeEffect {
    RangeEffect {
        target_type: RangeTarget::Player,
        metric: metric.to_string(),
        center,
        intensity,
        target_id: None,
    }
}

/// One default fallback per reason code.
pub fn default_fallbacks() -> Vec<GlobalFallback> {
    vec![
        GlobalFallback {
            fallback_id: "fb_no_match".to_string(),
            reason_code: Some(FallbackReason::NoMatch),
            text: "Your action lands, but the world redirects you toward a clearer path."
                .to_string(),
            mainline_nudge: Some(
                "Try focusing on the most concrete objective in this scene to stay on the main lead."
                    .to_string(),
            ),
            prompt_profile_id: Some("fallback_default_v1".to_string()),
            range_effects: vec![player_effect("energy", 0, 1)],
            target_node_id: None,
            ending_id: None,
            reactive_npc_ids: Vec::new(),
        },
        GlobalFallback {
            fallback_id: "fb_low_conf".to_string(),
            reason_code: Some(FallbackReason::LowConf),
            text: "The moment responds cautiously, and momentum is preserved through a safer move."
                .to_string(),
            mainline_nudge: Some(
                "Use one of the visible scene goals to regain stronger control of the route."
                    .to_string(),
            ),
            prompt_profile_id: Some("fallback_default_v1".to_string()),
            range_effects: vec![player_effect("knowledge", 0, 1)],
            target_node_id: None,
            ending_id: None,
            reactive_npc_ids: Vec::new(),
        },
        GlobalFallback {
            fallback_id: "fb_input_policy".to_string(),
            reason_code: Some(FallbackReason::InputPolicy),
            text: "The world ignores the unsafe framing and keeps the scene moving.".to_string(),
            mainline_nudge: Some(
                "Describe an in-world action tied to the current scene objective.".to_string(),
            ),
            prompt_profile_id: Some("fallback_default_v1".to_string()),
            range_effects: vec![player_effect("energy", -1, 1)],
            target_node_id: None,
            ending_id: None,
            reactive_npc_ids: Vec::new(),
        },
        GlobalFallback {
            fallback_id: "fb_off_topic".to_string(),
            reason_code: Some(FallbackReason::OffTopic),
            text: "Your idea is acknowledged, but events steer back to the active thread."
                .to_string(),
            mainline_nudge: Some(
                "Pick an action connected to the current conflict to return to the mainline."
                    .to_string(),
            ),
            prompt_profile_id: Some("fallback_default_v1".to_string()),
            range_effects: vec![player_effect("affection", 0, 1)],
            target_node_id: None,
            ending_id: None,
            reactive_npc_ids: Vec::new(),
        },
    ]
}

/// Default ending set; endings without triggers fire only by explicit
/// reference (forced fallback or a choice's `ending_id`).
pub fn default_endings() -> Vec<EndingDef> {
    vec![
        EndingDef {
            ending_id: "ending_forced_fail".to_string(),
            title: "Drifted Off Course".to_string(),
            outcome: EndingOutcome::Fail,
            camp: EndingCamp::World,
            epilogue:
                "You lost the thread of the mission, and the opportunity closed before you could recover."
                    .to_string(),
            priority: 100,
            trigger: EndingTrigger::default(),
            prompt_profile_id: Some("ending_default_v2".to_string()),
        },
        EndingDef {
            ending_id: "ending_neutral_default".to_string(),
            title: "Quiet Exit".to_string(),
            outcome: EndingOutcome::Neutral,
            camp: EndingCamp::World,
            epilogue: "You made it through, but left with unfinished questions and modest gains."
                .to_string(),
            priority: 100,
            trigger: EndingTrigger::default(),
            prompt_profile_id: Some("ending_default_v2".to_string()),
        },
        EndingDef {
            ending_id: "ending_success_default".to_string(),
            title: "Mainline Secured".to_string(),
            outcome: EndingOutcome::Success,
            camp: EndingCamp::World,
            epilogue: "You held to the key thread and turned your choices into a decisive win."
                .to_string(),
            priority: 100,
            trigger: EndingTrigger::default(),
            prompt_profile_id: Some("ending_default_v2".to_string()),
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_fallbacks_cover_every_reason() {
        let fallbacks = default_fallbacks();
        assert_eq!(fallbacks.len(), 4);
        let reasons: Vec<_> = fallbacks.iter().filter_map(|f| f.reason_code).collect();
        assert!(reasons.contains(&FallbackReason::NoMatch));
        assert!(reasons.contains(&FallbackReason::LowConf));
        assert!(reasons.contains(&FallbackReason::InputPolicy));
        assert!(reasons.contains(&FallbackReason::OffTopic));
    }

    #[test]
    fn default_endings_have_no_auto_trigger() {
        for ending in default_endings() {
            assert!(ending.trigger.is_empty(), "{} must not auto-fire", ending.ending_id);
        }
    }
}
