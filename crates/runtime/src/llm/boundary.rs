//! The two-channel model boundary.
//!
//! `call_structured`-style schema calls and streaming narration share one
//! chat-completions endpoint. When no API key is configured both channels
//! produce deterministic local output so the whole engine is testable
//! without network.

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::config::RuntimeConfig;
use crate::llm::client::{
    call_chat_completions, call_chat_completions_stream_text, ChatChannel, LlmCallError,
};
use crate::llm::grammar::validate_structured_output;
use crate::llm::prompts::render_prompt;
use crate::llm::schemas::{
    ending_bundle_schema, selection_mapping_v3_schema, DecisionCode, EndingBundleOutput,
    EndingHighlight, EndingReport, EndingStats, NarrativeOutput, SelectionCandidate,
    SelectionMappingV3, TargetType, ENDING_BUNDLE_SCHEMA_NAME, SELECTION_MAPPING_V3_SCHEMA_NAME,
};
use crate::story::pack::FallbackReason;
use crate::types::{EngineError, EngineResult};

const CHAT_COMPLETIONS_PATH: &str = "/chat/completions";
const SELECTION_TIMEOUT: Duration = Duration::from_secs(8);
const NARRATION_TIMEOUT: Duration = Duration::from_secs(30);
const ENDING_TIMEOUT: Duration = Duration::from_secs(30);
const NARRATION_IGNORE_REASONING: bool = true;
const NARRATION_MAX_CHARS: usize = 1200;

/// Callback fed each narration fragment as it arrives.
pub type DeltaSink = Arc<dyn Fn(&str) + Send + Sync>;

/// Narration prompt: either raw messages or a named profile.
#[derive(Debug, Clone)]
pub enum NarrativePrompt {
    Messages { system: String, user: String },
    Profile {
        profile_id: String,
        slots: Map<String, Value>,
    },
}

/// Inputs to the selection-mapping call.
#[derive(Debug, Clone)]
pub struct SelectionMappingRequest {
    pub player_input: String,
    pub scene_brief: String,
    /// Compact `{choice_id, text, intent_tags}` objects, available only.
    pub visible_choices: Vec<Value>,
    /// Compact `{fallback_id, reason_code}` objects.
    pub available_fallbacks: Vec<Value>,
    pub input_policy_flag: bool,
    pub retry_context: Option<Value>,
    pub confidence_high: f64,
    pub confidence_low: f64,
}

/// The boundary surface the pipeline and resolver consume.
#[async_trait]
pub trait ModelBoundary: Send + Sync {
    /// Map free input onto a choice or fallback (schema channel, at most one
    /// transport attempt; the resolver owns the retry loop).
    async fn map_free_input_v3(
        &self,
        request: SelectionMappingRequest,
        cancel: &CancellationToken,
    ) -> EngineResult<SelectionMappingV3>;

    /// Streamed narration; retries only before the first byte.
    async fn narrative(
        &self,
        prompt: NarrativePrompt,
        on_delta: Option<DeltaSink>,
        cancel: &CancellationToken,
    ) -> EngineResult<NarrativeOutput>;

    /// Ending narration plus report (schema channel, up to 3 transport
    /// attempts).
    async fn ending_bundle(
        &self,
        profile_id: &str,
        slots: Map<String, Value>,
        cancel: &CancellationToken,
    ) -> EngineResult<EndingBundleOutput>;

    /// Label recorded in the action-log trace.
    fn provider_trace_label(&self) -> &'static str;
}

/// Production boundary; real or fake depending on configuration.
pub struct LlmBoundary {
    api_key: String,
    base_url: String,
    model: String,
    http: reqwest::Client,
}

impl LlmBoundary {
    pub fn from_config(config: &RuntimeConfig) -> Self {
        if !config.llm_real_mode() {
            tracing::info!("no LLM api key configured, boundary runs in fake mode");
        } else {
            tracing::info!(model = %config.llm_model, "LLM boundary initialized");
        }
        Self {
            api_key: config.llm_api_key.clone(),
            base_url: config.llm_base_url.clone(),
            model: config.llm_model.clone(),
            http: reqwest::Client::new(),
        }
    }

    fn is_real_mode(&self) -> bool {
        !self.api_key.trim().is_empty()
    }

    fn channel(&self, timeout: Duration) -> ChatChannel {
        ChatChannel {
            api_key: self.api_key.trim().to_string(),
            base_url: self.base_url.trim().to_string(),
            path: CHAT_COMPLETIONS_PATH.to_string(),
            model: self.model.trim().to_string(),
            timeout,
        }
    }

    async fn call_structured(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        schema_name: &str,
        schema: &Value,
        channel: &ChatChannel,
        max_transport_attempts: u32,
        cancel: &CancellationToken,
    ) -> EngineResult<Value> {
        let response_format = json!({
            "type": "json_schema",
            "json_schema": {
                "name": schema_name,
                "schema": schema,
                "strict": true,
            },
        });
        let messages = vec![
            json!({"role": "system", "content": system_prompt}),
            json!({"role": "user", "content": user_prompt}),
        ];
        let raw = call_chat_completions(
            &self.http,
            channel,
            &messages,
            &response_format,
            max_transport_attempts,
            cancel,
        )
        .await
        .map_err(map_call_error)?;
        validate_structured_output(&raw, schema)
            .map_err(|err| EngineError::LlmUnavailable(err.to_string()))
    }

    fn normalize_narrative_text(raw: &str) -> EngineResult<String> {
        let text = raw.trim();
        if text.is_empty() {
            return Err(EngineError::LlmUnavailable("empty narration text".to_string()));
        }
        Ok(text.chars().take(NARRATION_MAX_CHARS).collect())
    }
}

fn map_call_error(err: LlmCallError) -> EngineError {
    match err {
        LlmCallError::Cancelled => EngineError::StreamAborted,
        other => EngineError::LlmUnavailable(other.to_string()),
    }
}

#[async_trait]
impl ModelBoundary for LlmBoundary {
    async fn map_free_input_v3(
        &self,
        request: SelectionMappingRequest,
        cancel: &CancellationToken,
    ) -> EngineResult<SelectionMappingV3> {
        if !self.is_real_mode() {
            return Ok(fake_map_free_input_v3(&request));
        }

        let mut slots = Map::new();
        slots.insert("scene_brief".to_string(), Value::from(request.scene_brief.clone()));
        slots.insert("player_input".to_string(), Value::from(request.player_input.clone()));
        slots.insert(
            "input_policy_flag".to_string(),
            Value::from(request.input_policy_flag),
        );
        slots.insert(
            "visible_choices_json".to_string(),
            Value::from(compact_json(&Value::Array(request.visible_choices.clone()))),
        );
        slots.insert(
            "available_fallbacks_json".to_string(),
            Value::from(compact_json(&Value::Array(request.available_fallbacks.clone()))),
        );
        slots.insert(
            "confidence_policy_json".to_string(),
            Value::from(compact_json(&json!({
                "high": request.confidence_high,
                "low": request.confidence_low,
            }))),
        );
        slots.insert(
            "retry_context_json".to_string(),
            Value::from(compact_json(
                request.retry_context.as_ref().unwrap_or(&json!({})),
            )),
        );

        let (system_prompt, user_prompt) = render_prompt("selection_mapping_v3", &slots)
            .map_err(|err| EngineError::LlmUnavailable(err.to_string()))?;

        let channel = self.channel(SELECTION_TIMEOUT);
        let payload = self
            .call_structured(
                &system_prompt,
                &user_prompt,
                SELECTION_MAPPING_V3_SCHEMA_NAME,
                selection_mapping_v3_schema(),
                &channel,
                1,
                cancel,
            )
            .await?;
        serde_json::from_value(payload).map_err(|err| EngineError::LlmUnavailable(err.to_string()))
    }

    async fn narrative(
        &self,
        prompt: NarrativePrompt,
        on_delta: Option<DeltaSink>,
        cancel: &CancellationToken,
    ) -> EngineResult<NarrativeOutput> {
        let (system_prompt, user_prompt, profile_slots) = match &prompt {
            NarrativePrompt::Messages { system, user } => (system.clone(), user.clone(), None),
            NarrativePrompt::Profile { profile_id, slots } => {
                let (system, user) = render_prompt(profile_id, slots)
                    .map_err(|err| EngineError::LlmUnavailable(err.to_string()))?;
                (system, user, Some(slots))
            }
        };

        if !self.is_real_mode() {
            if cancel.is_cancelled() {
                return Err(EngineError::StreamAborted);
            }
            let text = fake_narrative_text(&user_prompt, profile_slots);
            if let Some(sink) = &on_delta {
                sink(&text);
            }
            return Ok(NarrativeOutput { narrative_text: text });
        }

        let channel = self.channel(NARRATION_TIMEOUT);
        let messages = vec![
            json!({"role": "system", "content": system_prompt}),
            json!({"role": "user", "content": user_prompt}),
        ];
        let raw = call_chat_completions_stream_text(
            &self.http,
            &channel,
            &messages,
            NARRATION_IGNORE_REASONING,
            |fragment| {
                if let Some(sink) = &on_delta {
                    sink(fragment);
                }
            },
            cancel,
        )
        .await
        .map_err(map_call_error)?;

        Ok(NarrativeOutput {
            narrative_text: Self::normalize_narrative_text(&raw)?,
        })
    }

    async fn ending_bundle(
        &self,
        profile_id: &str,
        slots: Map<String, Value>,
        cancel: &CancellationToken,
    ) -> EngineResult<EndingBundleOutput> {
        if !self.is_real_mode() {
            if cancel.is_cancelled() {
                return Err(EngineError::StreamAborted);
            }
            let payload = fake_ending_bundle(&slots);
            let validated = validate_structured_output(&payload.to_string(), ending_bundle_schema())
                .map_err(|err| EngineError::LlmUnavailable(err.to_string()))?;
            return serde_json::from_value(validated)
                .map_err(|err| EngineError::LlmUnavailable(err.to_string()));
        }

        let (system_prompt, user_prompt) = render_prompt(profile_id, &slots)
            .map_err(|err| EngineError::LlmUnavailable(err.to_string()))?;
        let channel = self.channel(ENDING_TIMEOUT);
        let payload = self
            .call_structured(
                &system_prompt,
                &user_prompt,
                ENDING_BUNDLE_SCHEMA_NAME,
                ending_bundle_schema(),
                &channel,
                3,
                cancel,
            )
            .await?;
        serde_json::from_value(payload).map_err(|err| EngineError::LlmUnavailable(err.to_string()))
    }

    fn provider_trace_label(&self) -> &'static str {
        if self.is_real_mode() {
            "real_auto"
        } else {
            "fake_auto"
        }
    }
}

fn compact_json(value: &Value) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| "{}".to_string())
}

fn collapse(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

// ---------------------------------------------------------------------------
// Fake mode
// ---------------------------------------------------------------------------

fn fake_map_free_input_v3(request: &SelectionMappingRequest) -> SelectionMappingV3 {
    let input_text = collapse(&request.player_input);
    let input_tokens: std::collections::HashSet<String> = input_text
        .replace([',', '.'], " ")
        .split_whitespace()
        .map(str::to_string)
        .collect();

    let mut scored: Vec<SelectionCandidate> = Vec::new();
    for item in &request.visible_choices {
        let choice_id = item
            .get("choice_id")
            .and_then(Value::as_str)
            .unwrap_or("")
            .trim()
            .to_string();
        if choice_id.is_empty() {
            continue;
        }
        let text = collapse(item.get("text").and_then(Value::as_str).unwrap_or(""));
        let mut intent_tokens: std::collections::HashSet<String> =
            std::collections::HashSet::new();
        if let Some(tags) = item.get("intent_tags").and_then(Value::as_array) {
            for tag in tags {
                for token in collapse(tag.as_str().unwrap_or("")).split_whitespace() {
                    intent_tokens.insert(token.to_string());
                }
            }
        }
        let mut overlap = input_tokens.intersection(&intent_tokens).count();
        if !text.is_empty() && input_text.contains(&text) {
            overlap += 2;
        }
        let confidence = (0.35 + overlap as f64 * 0.2).min(0.95);
        scored.push(SelectionCandidate {
            target_type: TargetType::Choice,
            target_id: choice_id,
            confidence,
        });
    }
    scored.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut intensity_tier = 0;
    if ["please", "carefully", "gently", "kindly"]
        .iter()
        .any(|token| input_text.contains(token))
    {
        intensity_tier = 1;
    }
    if ["hate", "stupid", "force", "attack"]
        .iter()
        .any(|token| input_text.contains(token))
    {
        intensity_tier = -1;
    }

    let fallback_for_reason = |reason: FallbackReason| -> String {
        for item in &request.available_fallbacks {
            if item.get("reason_code").and_then(Value::as_str) == Some(reason.as_str()) {
                if let Some(id) = item.get("fallback_id").and_then(Value::as_str) {
                    return id.to_string();
                }
            }
        }
        request
            .available_fallbacks
            .first()
            .and_then(|item| item.get("fallback_id").and_then(Value::as_str))
            .unwrap_or("fb_no_match")
            .to_string()
    };

    if request.input_policy_flag {
        let target = fallback_for_reason(FallbackReason::InputPolicy);
        return SelectionMappingV3 {
            schema_version: "3.0".to_string(),
            decision_code: DecisionCode::FallbackInputPolicy,
            target_type: TargetType::Fallback,
            target_id: target.clone(),
            confidence: 0.9,
            intensity_tier: -1,
            fallback_reason_code: Some(FallbackReason::InputPolicy),
            reason: Some("input_policy".to_string()),
            top_candidates: vec![SelectionCandidate {
                target_type: TargetType::Fallback,
                target_id: target,
                confidence: 0.9,
            }],
        };
    }

    if let Some(top) = scored.first() {
        if top.confidence >= 0.5 {
            return SelectionMappingV3 {
                schema_version: "3.0".to_string(),
                decision_code: DecisionCode::SelectChoice,
                target_type: TargetType::Choice,
                target_id: top.target_id.clone(),
                confidence: top.confidence,
                intensity_tier,
                fallback_reason_code: None,
                reason: Some("heuristic_choice_match".to_string()),
                top_candidates: scored.iter().take(3).cloned().collect(),
            };
        }
    }

    let fallback_reason = if input_tokens.is_empty() {
        FallbackReason::NoMatch
    } else if ["off_topic", "sing", "dance"]
        .iter()
        .any(|token| input_text.contains(token))
    {
        FallbackReason::OffTopic
    } else if ["maybe", "idk"].iter().any(|token| input_text.contains(token)) {
        FallbackReason::LowConf
    } else {
        FallbackReason::OffTopic
    };

    let target = fallback_for_reason(fallback_reason);
    let mut top_candidates: Vec<SelectionCandidate> = scored.iter().take(2).cloned().collect();
    top_candidates.push(SelectionCandidate {
        target_type: TargetType::Fallback,
        target_id: target.clone(),
        confidence: 0.4,
    });

    SelectionMappingV3 {
        schema_version: "3.0".to_string(),
        decision_code: DecisionCode::for_reason(fallback_reason),
        target_type: TargetType::Fallback,
        target_id: target,
        confidence: 0.4,
        intensity_tier,
        fallback_reason_code: Some(fallback_reason),
        reason: Some(fallback_reason.as_str().to_lowercase()),
        top_candidates: top_candidates.into_iter().take(3).collect(),
    }
}

fn fake_narrative_text(user_prompt: &str, slots: Option<&Map<String, Value>>) -> String {
    if let Some(slots) = slots {
        if slots.get("ending_id").map(is_present).unwrap_or(false) {
            let epilogue = collapse_preserving_case(
                slots.get("epilogue").and_then(Value::as_str).unwrap_or(""),
            );
            let outcome = slots
                .get("ending_outcome")
                .and_then(Value::as_str)
                .unwrap_or("fail");
            if epilogue.is_empty() {
                return format!("The run ends with a {outcome} outcome.");
            }
            return format!("The run ends with a {outcome} outcome. {epilogue}");
        }
        if slots.get("mainline_nudge").map(is_present).unwrap_or(false) {
            let nudge = collapse_preserving_case(
                slots
                    .get("mainline_nudge")
                    .and_then(Value::as_str)
                    .unwrap_or(""),
            );
            let tier = slots
                .get("nudge_tier")
                .and_then(Value::as_str)
                .unwrap_or("soft")
                .to_lowercase();
            return match tier.as_str() {
                "firm" => format!("The world firmly redirects your move. {nudge}"),
                "neutral" => {
                    format!("The world redirects your move with a clear course correction. {nudge}")
                }
                _ => format!("The world catches your move and keeps momentum. {nudge}"),
            };
        }
    }

    let mut compact = collapse_preserving_case(user_prompt);
    if compact.chars().count() > 100 {
        compact = compact.chars().take(100).collect();
    }
    format!("Your move lands and the world responds. {compact}")
}

fn is_present(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::String(text) => !text.trim().is_empty(),
        _ => true,
    }
}

fn collapse_preserving_case(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn fake_ending_bundle(slots: &Map<String, Value>) -> Value {
    let outcome = slots
        .get("ending_outcome")
        .and_then(Value::as_str)
        .map(collapse_preserving_case)
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "fail".to_string());
    let epilogue = slots
        .get("epilogue")
        .and_then(Value::as_str)
        .map(collapse_preserving_case)
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "The journey reached its final page.".to_string());
    let empty_map = Map::new();
    let stats = slots
        .get("session_stats")
        .and_then(Value::as_object)
        .unwrap_or(&empty_map);
    let empty_beats: Vec<Value> = Vec::new();
    let beats = slots
        .get("recent_action_beats")
        .and_then(Value::as_array)
        .unwrap_or(&empty_beats);

    let stat_u32 = |key: &str| -> u32 {
        stats
            .get(key)
            .and_then(Value::as_i64)
            .map(|v| v.max(0) as u32)
            .unwrap_or(0)
    };
    let stat_f64 = |key: &str, lower: Option<f64>, upper: Option<f64>| -> f64 {
        let mut out = stats.get(key).and_then(Value::as_f64).unwrap_or(0.0);
        if let Some(lower) = lower {
            out = out.max(lower);
        }
        if let Some(upper) = upper {
            out = out.min(upper);
        }
        out
    };

    let report_stats = EndingStats {
        total_steps: stat_u32("total_steps"),
        fallback_count: stat_u32("fallback_count"),
        fallback_rate: stat_f64("fallback_rate", Some(0.0), Some(1.0)),
        explicit_count: stat_u32("explicit_count"),
        rule_count: stat_u32("rule_count"),
        llm_count: stat_u32("llm_count"),
        fallback_source_count: stat_u32("fallback_source_count"),
        energy_delta: stat_f64("energy_delta", None, None),
        money_delta: stat_f64("money_delta", None, None),
        knowledge_delta: stat_f64("knowledge_delta", None, None),
        affection_delta: stat_f64("affection_delta", None, None),
    };

    let mut highlights: Vec<EndingHighlight> = Vec::new();
    for beat in beats.iter().rev().take(3).rev() {
        let Some(beat) = beat.as_object() else { continue };
        let step_index = beat.get("step_index").and_then(Value::as_i64).unwrap_or(0);
        let executed = beat
            .get("executed_choice_id")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .unwrap_or("unknown_action");
        let source = beat
            .get("selection_source")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .unwrap_or("fallback");
        let reason = beat
            .get("fallback_reason")
            .and_then(Value::as_str)
            .unwrap_or("")
            .trim();
        let mut detail = format!("Executed {executed}.");
        if !reason.is_empty() {
            detail.push_str(&format!(" Fallback reason: {reason}."));
        }
        highlights.push(EndingHighlight {
            title: format!("Step {step_index}: {source}"),
            detail,
        });
    }
    if highlights.is_empty() {
        highlights.push(EndingHighlight {
            title: "Journey Snapshot".to_string(),
            detail: "You kept the story moving and reached a valid ending state.".to_string(),
        });
    }

    let mut persona_tags: Vec<String> = Vec::new();
    if report_stats.fallback_rate >= 0.6 {
        persona_tags.push("drifter".to_string());
    }
    if report_stats.knowledge_delta > 0.0 {
        persona_tags.push("learner".to_string());
    }
    if report_stats.affection_delta > 0.0 {
        persona_tags.push("connector".to_string());
    }
    if report_stats.money_delta > 0.0 {
        persona_tags.push("resourceful".to_string());
    }
    if report_stats.energy_delta < 0.0 {
        persona_tags.push("tenacious".to_string());
    }
    if persona_tags.is_empty() {
        persona_tags.push("steady".to_string());
    }

    let title_outcome = {
        let mut chars = outcome.chars();
        match chars.next() {
            Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
            None => outcome.clone(),
        }
    };

    let report = EndingReport {
        title: format!("Life Report: {title_outcome} Route"),
        one_liner: format!("You finished this run with a {outcome} outcome."),
        life_summary: format!(
            "{epilogue} Total steps: {}, fallback rate: {:.2}.",
            report_stats.total_steps, report_stats.fallback_rate
        ),
        highlights: highlights.into_iter().take(5).collect(),
        stats: report_stats,
        persona_tags: persona_tags.into_iter().take(6).collect(),
    };

    json!({
        "narrative_text": format!("The run closes with a {outcome} ending. {epilogue}"),
        "ending_report": serde_json::to_value(&report).unwrap_or(Value::Null),
    })
}
