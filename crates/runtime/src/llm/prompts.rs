//! Named prompt profiles.
//!
//! Profiles are rendered from a flat slot map; string slots interpolate
//! verbatim, everything else as compact JSON. `ending_default_v1` is a
//! legacy alias upgraded to v2.

use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PromptError {
    #[error("unknown prompt profile: {0}")]
    UnknownProfile(String),
}

/// Resolve legacy profile ids.
pub fn canonical_profile_id(profile_id: &str) -> &str {
    match profile_id {
        "ending_default_v1" => "ending_default_v2",
        other => other,
    }
}

/// Render a profile into `(system_prompt, user_prompt)`.
pub fn render_prompt(
    profile_id: &str,
    slots: &Map<String, Value>,
) -> Result<(String, String), PromptError> {
    let (system, user) = match canonical_profile_id(profile_id) {
        "selection_mapping_v3" => (
            "You map a player's free-form input onto exactly one allowed target: a visible \
             choice or an available fallback. Respect the confidence policy and never invent \
             target ids. Return STRICT JSON matching the provided schema."
                .to_string(),
            format!(
                "Scene: {scene}\nPlayer input: {input}\nInput policy flag: {policy}\n\
                 Visible choices: {choices}\nAvailable fallbacks: {fallbacks}\n\
                 Confidence policy: {confidence}\nRetry context: {retry}",
                scene = slot_text(slots, "scene_brief"),
                input = slot_text(slots, "player_input"),
                policy = slot_text(slots, "input_policy_flag"),
                choices = slot_text(slots, "visible_choices_json"),
                fallbacks = slot_text(slots, "available_fallbacks_json"),
                confidence = slot_text(slots, "confidence_policy_json"),
                retry = slot_text(slots, "retry_context_json"),
            ),
        ),
        "fallback_default_v1" => (
            format!(
                "You are the narrator of an interactive story. The player's input could not be \
                 executed as written; the world gently redirects them. Write concise \
                 second-person {} narration, tone {}. Plain text only, no JSON, no markdown.",
                slot_text(slots, "language"),
                slot_text(slots, "tone"),
            ),
            format!(
                "Scene before: {from}\nScene after: {to}\nRedirect reason: {reason}\n\
                 Nudge ({tier}): {nudge}\nState movement: {delta}\n\
                 Player said: {input}\nNpc reaction: {hint}",
                from = slot_text(slots, "scene_from"),
                to = slot_text(slots, "scene_to"),
                reason = slot_text(slots, "fallback_reason"),
                tier = slot_text(slots, "nudge_tier"),
                nudge = slot_text(slots, "mainline_nudge"),
                delta = slot_text(slots, "state_delta_brief"),
                input = slot_text(slots, "player_input_excerpt"),
                hint = slot_text(slots, "reaction_hint"),
            ),
        ),
        "ending_default_v2" => (
            format!(
                "You close out an interactive story run. Produce the final narration and a \
                 structured life report in {}. Tone: {}. Return STRICT JSON matching the \
                 provided schema.",
                slot_text(slots, "language"),
                slot_text(slots, "tone"),
            ),
            format!(
                "Ending id: {id}\nOutcome: {outcome}\nEpilogue seed: {epilogue}\n\
                 Session stats: {stats}\nRecent action beats: {beats}",
                id = slot_text(slots, "ending_id"),
                outcome = slot_text(slots, "ending_outcome"),
                epilogue = slot_text(slots, "epilogue"),
                stats = slot_text(slots, "session_stats_json"),
                beats = slot_text(slots, "recent_action_beats_json"),
            ),
        ),
        "narration_default_v1" => (
            format!(
                "You are an interactive-fiction narration assistant. Write concise second-person \
                 {} narrative text only. No JSON, no markdown.",
                slot_text(slots, "language"),
            ),
            format!(
                "Narration task with clear cause and effect. Context: {}",
                slot_text(slots, "context_json"),
            ),
        ),
        other => return Err(PromptError::UnknownProfile(other.to_string())),
    };
    Ok((system, user))
}

fn slot_text(slots: &Map<String, Value>, key: &str) -> String {
    match slots.get(key) {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(text)) => text.clone(),
        Some(other) => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn slots(pairs: &[(&str, Value)]) -> Map<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn legacy_ending_profile_upgrades() {
        assert_eq!(canonical_profile_id("ending_default_v1"), "ending_default_v2");
        let rendered = render_prompt(
            "ending_default_v1",
            &slots(&[("ending_outcome", json!("fail")), ("language", json!("English"))]),
        );
        assert!(rendered.is_ok());
    }

    #[test]
    fn unknown_profile_is_an_error() {
        assert!(matches!(
            render_prompt("mystery_profile", &Map::new()),
            Err(PromptError::UnknownProfile(_))
        ));
    }

    #[test]
    fn selection_prompt_carries_slots() {
        let (_, user) = render_prompt(
            "selection_mapping_v3",
            &slots(&[
                ("player_input", json!("study hard")),
                ("input_policy_flag", json!(false)),
            ]),
        )
        .unwrap();
        assert!(user.contains("study hard"));
        assert!(user.contains("false"));
    }

    #[test]
    fn fallback_prompt_mentions_nudge() {
        let (_, user) = render_prompt(
            "fallback_default_v1",
            &slots(&[
                ("mainline_nudge", json!("Focus on the scene goal.")),
                ("nudge_tier", json!("firm")),
            ]),
        )
        .unwrap();
        assert!(user.contains("Focus on the scene goal."));
        assert!(user.contains("firm"));
    }
}
