//! Step execution pipeline.
//!
//! One step = idempotency prepare (short) → selection + transition +
//! narration (long, no connection held) → CAS commit + action-log append
//! (short) → idempotency finalize (short). Failures during the long phase
//! never leave the session modified.

pub mod hooks;
pub mod idempotency;
pub mod report;
pub mod response;

use serde_json::{json, Map, Value};
use std::sync::Arc;

use crate::config::RuntimeConfig;
use crate::hashing::request_hash;
use crate::kernel::effects::{
    apply_range_effects, apply_transition, effective_intensity_tier, AppliedEffect, StateDelta,
};
use crate::kernel::endings::resolve_run_ending;
use crate::kernel::state::{
    build_npc_state_from_defs, default_state, normalize_state, NudgeTier, StoryState,
};
use crate::llm::boundary::{ModelBoundary, NarrativePrompt};
use crate::llm::schemas::{
    ENDING_BUNDLE_SCHEMA_NAME, NARRATIVE_SCHEMA_NAME, SELECTION_MAPPING_V3_SCHEMA_NAME,
};
use crate::selection::{
    evaluate_node_choices, resolve_explicit, resolve_free_input, SelectionOutcome,
};
use crate::story::catalog::{CatalogError, StoryCatalog};
use crate::story::pack::{EndingCamp, EndingOutcome, FallbackReason, RangeEffect, SceneNode};
use crate::story::resolver::ResolvedPack;
use crate::store::{ActionLogRow, RuntimeStore, SessionCommit, SessionRow};
use crate::time::utc_now_naive;
use crate::types::{EngineError, EngineResult, SessionId, SessionStatus, UserId};

pub use hooks::{DeltaSink, PhaseSink, StepHooks};
pub use idempotency::PrepareOutcome;
pub use response::{
    ChoiceLockReasonOut, ChoiceOut, CurrentNodeOut, SessionCreateRequest, SessionCreateResponse,
    SessionStateResponse, StepRequest, StepResponse,
};

/// The engine facade the HTTP surface drives.
pub struct StepPipeline {
    store: Arc<dyn RuntimeStore>,
    catalog: Arc<StoryCatalog>,
    boundary: Arc<dyn ModelBoundary>,
    config: Arc<RuntimeConfig>,
}

impl StepPipeline {
    pub fn new(
        store: Arc<dyn RuntimeStore>,
        catalog: Arc<StoryCatalog>,
        boundary: Arc<dyn ModelBoundary>,
        config: Arc<RuntimeConfig>,
    ) -> Self {
        Self {
            store,
            catalog,
            boundary,
            config,
        }
    }

    pub fn store(&self) -> &Arc<dyn RuntimeStore> {
        &self.store
    }

    /// Resolve the acting user: explicit id must exist; otherwise the
    /// configured default user is created on demand.
    pub async fn resolve_user(&self, user_id: Option<&UserId>) -> EngineResult<UserId> {
        match user_id {
            Some(id) => {
                if self.store.user_exists(id).await? {
                    Ok(id.clone())
                } else {
                    Err(EngineError::NotFound("user not found".to_string()))
                }
            }
            None => Ok(self
                .store
                .ensure_user(&self.config.default_user_external_ref)
                .await?),
        }
    }

    /// Get-or-create a user for a token-derived actor reference.
    pub async fn actor_for_ref(&self, external_ref: &str) -> EngineResult<UserId> {
        Ok(self.store.ensure_user(external_ref).await?)
    }

    pub async fn create_session(
        &self,
        story_id: &str,
        version: Option<u32>,
        user_id: Option<&UserId>,
    ) -> EngineResult<SessionCreateResponse> {
        let user = self.resolve_user(user_id).await?;
        let (resolved_version, pack) = self.load_pack(story_id, version)?;
        let resolved = ResolvedPack::resolve(pack);

        let start_node = resolved
            .node(&resolved.pack.start_node_id)
            .ok_or_else(|| EngineError::NotFound("story start node not found".to_string()))?;

        let mut state = default_state();
        state.npc_state = build_npc_state_from_defs(&resolved.pack.npc_defs);
        let state = normalize_state(&state);

        let now = utc_now_naive();
        let row = SessionRow {
            id: SessionId::generate(),
            user_id: user,
            story_id: story_id.to_string(),
            story_version: resolved_version,
            status: SessionStatus::Active,
            story_node_id: resolved.pack.start_node_id.clone(),
            state_json: state.to_value(),
            version: 0,
            created_at: now,
            updated_at: now,
        };
        self.store.insert_session(&row).await?;
        tracing::info!(session_id = %row.id, story_id, version = resolved_version, "session created");

        Ok(SessionCreateResponse {
            session_id: row.id.0,
            story_id: story_id.to_string(),
            story_version: resolved_version,
            story_node_id: resolved.pack.start_node_id.clone(),
            state_json: row.state_json,
            current_node: build_current_node(start_node, &state, &resolved),
            status: SessionStatus::Active.as_str().to_string(),
        })
    }

    pub async fn get_session_state(
        &self,
        session_id: &SessionId,
        actor_user_id: Option<&UserId>,
    ) -> EngineResult<SessionStateResponse> {
        let session = self.load_owned_session(session_id, actor_user_id).await?;
        let (_, pack) = self.load_pack(&session.story_id, Some(session.story_version))?;
        let resolved = ResolvedPack::resolve(pack);
        let node = resolved.node(&session.story_node_id).ok_or_else(|| {
            EngineError::NotFound("session current node not found in story pack".to_string())
        })?;
        let state = normalize_state(&StoryState::from_value(&session.state_json));

        Ok(SessionStateResponse {
            session_id: session.id.0,
            story_id: session.story_id,
            story_version: session.story_version,
            story_node_id: session.story_node_id,
            status: session.status.as_str().to_string(),
            state_json: session.state_json,
            current_node: build_current_node(node, &state, &resolved),
            created_at: session.created_at,
            updated_at: session.updated_at,
        })
    }

    /// Run one step under the idempotency contract; the boolean is true for
    /// a replayed response.
    pub async fn run_step(
        &self,
        session_id: &SessionId,
        request: &StepRequest,
        idempotency_key: &str,
        actor_user_id: Option<&UserId>,
        hooks: &StepHooks,
    ) -> EngineResult<(StepResponse, bool)> {
        let key = idempotency_key.trim();
        if key.is_empty() {
            return Err(EngineError::MissingIdempotencyKey);
        }
        request.validate()?;

        let payload = request.to_payload_value();
        let hash = request_hash(&payload);

        // Short txn A: ownership plus idempotency prepare.
        self.load_owned_session(session_id, actor_user_id).await?;
        match idempotency::prepare(self.store.as_ref(), session_id, key, &hash).await? {
            PrepareOutcome::Replay(stored) => {
                let response: StepResponse = serde_json::from_value(stored).map_err(|err| {
                    EngineError::Internal(format!("stored replay is not a step response: {err}"))
                })?;
                return Ok((response, true));
            }
            PrepareOutcome::Started => {}
        }

        let result = self
            .execute_step(session_id, request, &payload, hooks)
            .await;

        // Short txn C: idempotency finalize.
        match result {
            Ok(response) => {
                let response_value = serde_json::to_value(&response)
                    .map_err(|err| EngineError::Internal(err.to_string()))?;
                idempotency::finalize_success(
                    self.store.as_ref(),
                    session_id,
                    key,
                    &hash,
                    &response_value,
                )
                .await?;
                Ok((response, false))
            }
            Err(err) => {
                idempotency::finalize_failure(self.store.as_ref(), session_id, key, &hash, &err)
                    .await;
                Err(err)
            }
        }
    }

    async fn execute_step(
        &self,
        session_id: &SessionId,
        request: &StepRequest,
        payload: &Value,
        hooks: &StepHooks,
    ) -> EngineResult<StepResponse> {
        // Read-only snapshot of the session.
        let session = self
            .store
            .get_session(session_id)
            .await?
            .ok_or_else(|| EngineError::NotFound("session not found".to_string()))?;
        if session.status != SessionStatus::Active {
            return Err(EngineError::RuntimeConflict("session is not active".to_string()));
        }
        let expected_version = session.version;

        let (_, pack) = self.load_pack(&session.story_id, Some(session.story_version))?;
        let resolved = ResolvedPack::resolve(pack);
        let current_node = resolved
            .node(&session.story_node_id)
            .ok_or_else(|| EngineError::NotFound("current node missing from pack".to_string()))?
            .clone();

        let mut state_before = normalize_state(&StoryState::from_value(&session.state_json));
        if state_before.npc_state.is_empty() && !resolved.pack.npc_defs.is_empty() {
            state_before.npc_state = build_npc_state_from_defs(&resolved.pack.npc_defs);
        }

        hooks.check_abort()?;
        let explicit_choice_id = request
            .choice_id
            .as_deref()
            .map(str::trim)
            .filter(|c| !c.is_empty());
        let selection_mode_label = if explicit_choice_id.is_some() {
            "explicit_choice"
        } else {
            "free_input"
        };
        hooks.emit_phase(
            "selection_start",
            Some(json!({"selection_mode": selection_mode_label})),
        );

        // Selection.
        let (confidence_high, confidence_low) = self.config.confidence_thresholds();
        let outcome: SelectionOutcome = if let Some(choice_id) = explicit_choice_id {
            resolve_explicit(&resolved, &current_node, &state_before, choice_id)?
        } else {
            let raw_input = request.player_input.as_deref().unwrap_or("");
            resolve_free_input(
                self.boundary.as_ref(),
                &resolved,
                &current_node,
                &state_before,
                raw_input,
                confidence_high,
                confidence_low,
                self.config.input_max_chars,
                &hooks.cancel,
            )
            .await?
        };

        hooks.check_abort()?;
        hooks.emit_phase(
            "selection_done",
            Some(json!({
                "selection_mode": outcome.selection_mode.as_str(),
                "selection_source": outcome.selection_source.as_str(),
                "fallback_used": outcome.fallback_used,
                "fallback_reason": outcome.fallback_reason.map(|r| r.as_str()),
                "attempted_choice_id": &outcome.attempted_choice_id,
                "executed_choice_id": &outcome.executed_choice_id,
            })),
        );

        // State transition.
        let (effective_tier, fallback_base_penalty) = effective_intensity_tier(
            outcome.raw_intensity_tier,
            outcome.fallback_used,
            outcome.fallback_reason,
        );
        let (mut state_after, mut state_delta, mut effects_applied) = apply_transition(
            &state_before,
            &outcome.range_effects,
            effective_tier,
            outcome.fallback_used,
        );

        // NPC back-reactions, applied at tier 0.
        let (reaction_effects, reaction_hints) =
            collect_npc_reactions(&resolved, &state_after, &outcome);
        let reaction_hint = reaction_hints.first().cloned();
        if !reaction_effects.is_empty() {
            let (reacted_state, reaction_delta, reaction_applied) =
                apply_range_effects(&state_after, &reaction_effects, 0);
            state_after = normalize_state(&reacted_state);
            state_delta.merge(&reaction_delta);
            effects_applied.extend(reaction_applied);
        }

        let next_node = resolved
            .node(&outcome.next_node_id)
            .ok_or_else(|| EngineError::NotFound("next node missing from pack".to_string()))?
            .clone();

        // Run-state bookkeeping and ending resolution.
        state_after.run_state.selection_retry_count = outcome.selection_retry_count;
        state_after.run_state.selection_retry_errors = outcome.selection_retry_errors.clone();

        let nudge_tier = if outcome.fallback_used {
            let tier = resolve_nudge_tier(
                outcome.fallback_reason,
                state_after.run_state.consecutive_fallback_count,
            );
            state_after.run_state.nudge_tier = Some(tier);
            Some(tier)
        } else {
            state_after.run_state.nudge_tier = None;
            None
        };

        let mut run_ended = false;
        let mut ending_id: Option<String> = None;
        let mut ending_outcome: Option<EndingOutcome> = None;
        let mut ending_camp: Option<EndingCamp> = None;
        let mut forced_ending_triggered = false;

        if let Some(declared) = outcome
            .transition_ending_id
            .as_deref()
            .and_then(|id| resolved.ending(id))
        {
            run_ended = true;
            ending_id = Some(declared.ending_id.clone());
            ending_outcome = Some(declared.outcome);
            ending_camp = Some(declared.camp);
        }

        if !run_ended && outcome.fallback_used {
            let threshold = resolved
                .pack
                .fallback_policy
                .forced_fallback_threshold
                .unwrap_or(self.config.fallback_guard_default_max_consecutive);
            if let Some(forced_id) = resolved
                .pack
                .fallback_policy
                .forced_fallback_ending_id
                .as_deref()
            {
                if state_after.run_state.consecutive_fallback_count >= threshold {
                    if let Some(forced) = resolved.ending(forced_id) {
                        run_ended = true;
                        forced_ending_triggered = true;
                        ending_id = Some(forced.ending_id.clone());
                        ending_outcome = Some(forced.outcome);
                        ending_camp = Some(forced.camp);
                    }
                }
            }
        }

        if !run_ended {
            if let Some(resolution) = resolve_run_ending(
                &state_after,
                &resolved.effective_endings,
                &outcome.next_node_id,
                &resolved.pack.run_config,
            ) {
                run_ended = true;
                ending_id = Some(resolution.ending_id);
                ending_outcome = Some(resolution.outcome);
                ending_camp = Some(resolution.camp);
            }
        }

        state_after.run_state.run_ended = run_ended;
        state_after.run_state.ending_id = ending_id.clone();
        state_after.run_state.ending_outcome = ending_outcome;
        state_after.run_state.ending_camp = if run_ended { ending_camp } else { None };

        state_delta.run_state.insert(
            "selection_retry_count".to_string(),
            Value::from(outcome.selection_retry_count),
        );
        state_delta.run_state.insert(
            "selection_retry_errors".to_string(),
            Value::from(outcome.selection_retry_errors.clone()),
        );
        state_delta.run_state.insert(
            "run_ended".to_string(),
            Value::from(run_ended),
        );
        state_delta.run_state.insert(
            "ending_id".to_string(),
            ending_id.clone().map(Value::from).unwrap_or(Value::Null),
        );
        state_delta.run_state.insert(
            "ending_outcome".to_string(),
            ending_outcome
                .map(|o| Value::from(o.as_str()))
                .unwrap_or(Value::Null),
        );
        state_delta.run_state.insert(
            "ending_camp".to_string(),
            state_after
                .run_state
                .ending_camp
                .and_then(|c| serde_json::to_value(c).ok())
                .unwrap_or(Value::Null),
        );

        let mainline_nudge = if outcome.fallback_used {
            let configured = outcome
                .chosen_fallback_id
                .as_deref()
                .and_then(|id| resolved.fallback(id))
                .and_then(|fallback| fallback.mainline_nudge.clone());
            Some(configured.unwrap_or_else(|| auto_mainline_nudge(&next_node)))
        } else {
            None
        };

        // Narrative generation (the only long suspension besides selection).
        hooks.check_abort()?;
        let step_index = state_after.run_state.step_index;
        let bundle_ending = if run_ended {
            ending_id.as_deref().and_then(|id| resolved.ending(id))
        } else {
            None
        };

        let mut ending_report: Option<Value> = None;
        let narrative_text;
        let narration_mode;

        if let Some(ending) = bundle_ending {
            narration_mode = "ending_bundle";
            hooks.emit_phase(
                "narration_start",
                Some(json!({"run_ended": true, "mode": narration_mode})),
            );
            let brief = report::build_ending_report_brief(
                &self.store.list_action_logs(session_id).await?,
                &state_after,
                step_index,
                &outcome.executed_choice_id,
                outcome.fallback_reason.map(|r| r.as_str()),
                outcome.selection_source.as_str(),
                &state_delta,
            );
            hooks.check_abort()?;

            let profile_id = ending
                .prompt_profile_id
                .clone()
                .unwrap_or_else(|| "ending_default_v2".to_string());
            let mut slots = Map::new();
            slots.insert("ending_id".to_string(), Value::from(ending.ending_id.clone()));
            slots.insert(
                "ending_outcome".to_string(),
                Value::from(ending.outcome.as_str()),
            );
            slots.insert(
                "tone".to_string(),
                Value::from(ending_tone(ending.outcome)),
            );
            slots.insert("epilogue".to_string(), Value::from(ending.epilogue.clone()));
            slots.insert(
                "language".to_string(),
                Value::from(self.config.narration_language.clone()),
            );
            slots.insert(
                "session_stats_json".to_string(),
                Value::from(compact(&brief["session_stats"])),
            );
            slots.insert(
                "recent_action_beats_json".to_string(),
                Value::from(compact(&brief["recent_action_beats"])),
            );
            slots.insert("session_stats".to_string(), brief["session_stats"].clone());
            slots.insert(
                "recent_action_beats".to_string(),
                brief["recent_action_beats"].clone(),
            );

            let bundle = self
                .boundary
                .ending_bundle(&profile_id, slots, &hooks.cancel)
                .await?;
            let report_value = serde_json::to_value(&bundle.ending_report)
                .map_err(|err| EngineError::Internal(err.to_string()))?;
            state_after.run_state.ending_report = Some(report_value.clone());
            ending_report = Some(report_value);
            narrative_text = bundle.narrative_text;
            hooks.emit_phase(
                "narration_done",
                Some(json!({
                    "run_ended": true,
                    "mode": narration_mode,
                    "char_count": narrative_text.chars().count(),
                })),
            );
        } else if outcome.fallback_used {
            narration_mode = "fallback_narration";
            hooks.emit_phase(
                "narration_start",
                Some(json!({"run_ended": run_ended, "mode": narration_mode})),
            );
            let profile_id = outcome
                .chosen_fallback_id
                .as_deref()
                .and_then(|id| resolved.fallback(id))
                .and_then(|fallback| fallback.prompt_profile_id.clone())
                .unwrap_or_else(|| "fallback_default_v1".to_string());
            let mut slots = Map::new();
            slots.insert(
                "scene_from".to_string(),
                Value::from(current_node.scene_brief.clone()),
            );
            slots.insert(
                "scene_to".to_string(),
                Value::from(next_node.scene_brief.clone()),
            );
            slots.insert(
                "fallback_reason".to_string(),
                outcome
                    .fallback_reason
                    .map(|r| Value::from(r.as_str()))
                    .unwrap_or(Value::Null),
            );
            slots.insert(
                "mainline_nudge".to_string(),
                mainline_nudge.clone().map(Value::from).unwrap_or(Value::Null),
            );
            slots.insert(
                "nudge_tier".to_string(),
                nudge_tier
                    .map(|t| Value::from(t.as_str()))
                    .unwrap_or(Value::Null),
            );
            slots.insert(
                "state_delta_brief".to_string(),
                Value::from(compact(&state_delta.to_value())),
            );
            slots.insert(
                "player_input_excerpt".to_string(),
                Value::from(
                    request
                        .player_input
                        .as_deref()
                        .map(|raw| {
                            crate::selection::normalize_player_input(
                                raw,
                                self.config.input_max_chars,
                            )
                        })
                        .unwrap_or_default(),
                ),
            );
            slots.insert(
                "reaction_hint".to_string(),
                reaction_hint.clone().map(Value::from).unwrap_or(Value::Null),
            );
            slots.insert(
                "tone".to_string(),
                Value::from(if nudge_tier == Some(NudgeTier::Firm) {
                    "firm"
                } else {
                    "calm"
                }),
            );
            slots.insert(
                "language".to_string(),
                Value::from(self.config.narration_language.clone()),
            );

            let narrative = self
                .boundary
                .narrative(
                    NarrativePrompt::Profile {
                        profile_id,
                        slots,
                    },
                    hooks.on_delta.clone(),
                    &hooks.cancel,
                )
                .await?;
            hooks.check_abort()?;
            state_after.run_state.ending_report = None;
            narrative_text = narrative.narrative_text;
            hooks.emit_phase(
                "narration_done",
                Some(json!({
                    "run_ended": run_ended,
                    "mode": narration_mode,
                    "char_count": narrative_text.chars().count(),
                })),
            );
        } else {
            narration_mode = "normal_narration";
            hooks.emit_phase(
                "narration_start",
                Some(json!({"run_ended": run_ended, "mode": narration_mode})),
            );
            let context = json!({
                "story_id": &session.story_id,
                "from_node": &current_node.node_id,
                "to_node": &outcome.next_node_id,
                "fallback_used": outcome.fallback_used,
                "attempted_choice_id": &outcome.attempted_choice_id,
                "executed_choice_id": &outcome.executed_choice_id,
                "state_delta": state_delta.to_value(),
                "reaction_hint": &reaction_hint,
                "scene_from": &current_node.scene_brief,
                "scene_to": &next_node.scene_brief,
                "language": &self.config.narration_language,
            });
            let mut slots = Map::new();
            slots.insert(
                "language".to_string(),
                Value::from(self.config.narration_language.clone()),
            );
            slots.insert("context_json".to_string(), Value::from(compact(&context)));

            let narrative = self
                .boundary
                .narrative(
                    NarrativePrompt::Profile {
                        profile_id: "narration_default_v1".to_string(),
                        slots,
                    },
                    hooks.on_delta.clone(),
                    &hooks.cancel,
                )
                .await?;
            hooks.check_abort()?;
            state_after.run_state.ending_report = None;
            narrative_text = narrative.narrative_text;
            hooks.emit_phase(
                "narration_done",
                Some(json!({
                    "run_ended": run_ended,
                    "mode": narration_mode,
                    "char_count": narrative_text.chars().count(),
                })),
            );
        }

        hooks.check_abort()?;
        hooks.emit_phase("finalizing", None);

        // Response assembly against the post-step state.
        let session_status_after = if run_ended {
            SessionStatus::Ended
        } else {
            SessionStatus::Active
        };
        let next_node_choices = build_choices(&next_node, &state_after, &resolved);
        let state_excerpt = json!({
            "energy": state_after.energy,
            "money": state_after.money,
            "knowledge": state_after.knowledge,
            "affection": state_after.affection,
            "day": state_after.day,
            "slot": state_after.slot.as_str(),
            "run_state": serde_json::to_value(&state_after.run_state)
                .unwrap_or(Value::Null),
        });
        let effects_payload: Vec<Value> = effects_applied
            .iter()
            .map(|effect: &AppliedEffect| serde_json::to_value(effect).unwrap_or(Value::Null))
            .collect();

        let response = StepResponse {
            session_status: session_status_after.as_str().to_string(),
            story_node_id: outcome.next_node_id.clone(),
            attempted_choice_id: outcome.attempted_choice_id.clone(),
            executed_choice_id: outcome.executed_choice_id.clone(),
            fallback_used: outcome.fallback_used,
            fallback_reason: outcome.fallback_reason.map(|r| r.as_str().to_string()),
            selection_mode: outcome.selection_mode.as_str().to_string(),
            selection_source: outcome.selection_source.as_str().to_string(),
            mapping_confidence: outcome.mapping_confidence,
            intensity_tier: Some(effective_tier),
            mainline_nudge: mainline_nudge.clone(),
            nudge_tier: nudge_tier.map(|t| t.as_str().to_string()),
            narrative_text,
            choices: next_node_choices.clone(),
            range_effects_applied: effects_payload.clone(),
            state_excerpt,
            run_ended,
            ending_id: ending_id.clone(),
            ending_outcome: ending_outcome.map(|o| o.as_str().to_string()),
            ending_camp: ending_camp
                .filter(|_| run_ended)
                .and_then(|c| serde_json::to_value(c).ok())
                .and_then(|v| v.as_str().map(str::to_string)),
            ending_report: ending_report.clone(),
            current_node: CurrentNodeOut {
                id: next_node.node_id.clone(),
                title: next_node.title.clone(),
                scene_brief: next_node.scene_brief.clone(),
                choices: next_node_choices,
            },
        };

        // Short txn B: CAS commit plus action-log append.
        hooks.check_abort()?;
        let commit = SessionCommit {
            status: session_status_after,
            story_node_id: outcome.next_node_id.clone(),
            state_json: state_after.to_value(),
            updated_at: utc_now_naive(),
        };
        let log = self.build_action_log(
            session_id,
            payload,
            &outcome,
            effective_tier,
            fallback_base_penalty,
            &state_before,
            &state_delta,
            &state_after,
            run_ended,
            ending_id.as_deref(),
            ending_outcome,
            forced_ending_triggered,
            mainline_nudge.as_deref(),
            nudge_tier,
            ending_report.as_ref(),
            reaction_hint.as_deref(),
            &effects_payload,
            confidence_high,
            confidence_low,
            expected_version,
        );
        self.store
            .commit_step(session_id, expected_version, &commit, &log)
            .await?;

        tracing::info!(
            session_id = %session_id,
            step_index,
            executed_choice_id = %outcome.executed_choice_id,
            fallback_used = outcome.fallback_used,
            run_ended,
            "step committed"
        );

        Ok(response)
    }

    #[allow(clippy::too_many_arguments)]
    fn build_action_log(
        &self,
        session_id: &SessionId,
        payload: &Value,
        outcome: &SelectionOutcome,
        effective_tier: i32,
        fallback_base_penalty: i32,
        state_before: &StoryState,
        state_delta: &StateDelta,
        state_after: &StoryState,
        run_ended: bool,
        ending_id: Option<&str>,
        ending_outcome: Option<EndingOutcome>,
        forced_ending_triggered: bool,
        mainline_nudge: Option<&str>,
        nudge_tier: Option<NudgeTier>,
        ending_report: Option<&Value>,
        reaction_hint: Option<&str>,
        effects_payload: &[Value],
        confidence_high: f64,
        confidence_low: f64,
        expected_version: i64,
    ) -> ActionLogRow {
        let step_index = state_after.run_state.step_index;
        let llm_schemas: Vec<&str> = vec![
            SELECTION_MAPPING_V3_SCHEMA_NAME,
            if run_ended {
                ENDING_BUNDLE_SCHEMA_NAME
            } else {
                NARRATIVE_SCHEMA_NAME
            },
        ];
        let state_after_value = state_after.to_value();

        ActionLogRow {
            session_id: session_id.clone(),
            step_index,
            request_payload: payload.clone(),
            selection_result: json!({
                "attempted_choice_id": &outcome.attempted_choice_id,
                "executed_choice_id": &outcome.executed_choice_id,
                "fallback_used": outcome.fallback_used,
                "fallback_reason": outcome.fallback_reason.map(|r| r.as_str()),
                "selection_mode": outcome.selection_mode.as_str(),
                "selection_source": outcome.selection_source.as_str(),
                "mapping_confidence": outcome.mapping_confidence,
                "intensity_tier": effective_tier,
                "raw_intensity_tier": outcome.raw_intensity_tier,
                "effective_intensity_tier": effective_tier,
                "fallback_base_penalty": fallback_base_penalty,
                "mapping_schema": &outcome.mapping_schema,
                "selection_decision_code": outcome.selection_decision_code.as_str(),
                "fallback_reason_code": outcome.fallback_reason_code.map(|r| r.as_str()),
                "decision_overridden_by_runtime": outcome.decision_overridden_by_runtime,
                "runtime_override_reason": &outcome.runtime_override_reason,
                "selection_retry_count": outcome.selection_retry_count,
                "selection_retry_errors": &outcome.selection_retry_errors,
                "selection_final_attempt": outcome.selection_final_attempt,
                "run_ended": run_ended,
                "ending_id": ending_id,
                "ending_outcome": ending_outcome.map(|o| o.as_str()),
                "step_index": step_index,
            }),
            state_before: state_before.to_value(),
            state_delta: state_delta.to_value(),
            state_after: state_after_value.clone(),
            llm_trace: json!({
                "provider": self.boundary.provider_trace_label(),
                "schemas": llm_schemas,
                "selection_call_mode": "non_stream_schema",
                "narration_call_mode": "stream_text",
                "ending_call_mode": "non_stream_schema",
            }),
            classification: json!({
                "fallback_reason": outcome.fallback_reason.map(|r| r.as_str()),
                "selection_source": outcome.selection_source.as_str(),
                "mapping_confidence": outcome.mapping_confidence,
                "consecutive_fallback_count": state_after.run_state.consecutive_fallback_count,
                "forced_ending_triggered": forced_ending_triggered,
                "mainline_nudge_applied": mainline_nudge.is_some(),
                "nudge_tier": nudge_tier.map(|t| t.as_str()),
                "ending_report_generated": ending_report.is_some(),
                "ending_report_highlight_count": ending_report
                    .and_then(|report| report.get("highlights"))
                    .and_then(Value::as_array)
                    .map(Vec::len)
                    .unwrap_or(0),
                "ending_report_input_window": "global_stats_plus_recent_12",
                "top_candidates": &outcome.top_candidates,
                "range_formula": "center + tier * intensity",
                "range_targets_count": effects_payload.len(),
                "input_policy_flag": outcome.input_policy_flag,
                "free_input_llm_required": outcome.selection_mode
                    == crate::selection::SelectionMode::FreeInput,
                "llm_selection_schema": SELECTION_MAPPING_V3_SCHEMA_NAME,
                "confidence_high": confidence_high,
                "confidence_low": confidence_low,
                "selection_decision_code": outcome.selection_decision_code.as_str(),
                "fallback_reason_code": outcome.fallback_reason_code.map(|r| r.as_str()),
                "raw_intensity_tier": outcome.raw_intensity_tier,
                "effective_intensity_tier": effective_tier,
                "fallback_base_penalty": fallback_base_penalty,
                "decision_overridden_by_runtime": outcome.decision_overridden_by_runtime,
                "runtime_override_reason": &outcome.runtime_override_reason,
                "mapping_schema": &outcome.mapping_schema,
                "selection_retry_count": outcome.selection_retry_count,
                "selection_retry_errors": &outcome.selection_retry_errors,
                "selection_final_attempt": outcome.selection_final_attempt,
                "reaction_npc_ids": &outcome.reactive_npc_ids,
                "reaction_hint_applied": reaction_hint.is_some(),
                "session_version_expected": expected_version,
                "session_version_committed": expected_version + 1,
                "cas_conflict": false,
                "conflict_stage": Value::Null,
                "state_json_size_bytes": serde_json::to_string(&state_after_value)
                    .map(|s| s.len())
                    .unwrap_or(0),
            }),
            created_at: utc_now_naive(),
        }
    }

    async fn load_owned_session(
        &self,
        session_id: &SessionId,
        actor_user_id: Option<&UserId>,
    ) -> EngineResult<SessionRow> {
        let session = self
            .store
            .get_session(session_id)
            .await?
            .ok_or_else(|| EngineError::NotFound("session not found".to_string()))?;
        if let Some(actor) = actor_user_id {
            if actor != &session.user_id {
                return Err(EngineError::Forbidden(
                    "session ownership mismatch".to_string(),
                ));
            }
        }
        Ok(session)
    }

    fn load_pack(
        &self,
        story_id: &str,
        version: Option<u32>,
    ) -> EngineResult<(u32, Arc<crate::story::pack::StoryPack>)> {
        self.catalog.get(story_id, version).map_err(|err| match err {
            CatalogError::StoryNotFound(_) | CatalogError::VersionNotFound { .. } => {
                EngineError::NotFound(err.to_string())
            }
            CatalogError::Pack(inner) => EngineError::BadRequest(inner.to_string()),
        })
    }
}

/// `soft | neutral | firm` from the fallback reason and consecutive count.
fn resolve_nudge_tier(reason: Option<FallbackReason>, consecutive_fallback_count: u32) -> NudgeTier {
    if reason == Some(FallbackReason::InputPolicy) || consecutive_fallback_count >= 3 {
        NudgeTier::Firm
    } else if reason == Some(FallbackReason::LowConf) || consecutive_fallback_count == 2 {
        NudgeTier::Neutral
    } else {
        NudgeTier::Soft
    }
}

fn ending_tone(outcome: EndingOutcome) -> &'static str {
    match outcome {
        EndingOutcome::Success => "triumphant",
        EndingOutcome::Neutral => "reflective",
        EndingOutcome::Fail => "somber",
    }
}

/// Generated nudge when the chosen fallback does not configure one.
fn auto_mainline_nudge(next_node: &SceneNode) -> String {
    if let Some(top_choice) = next_node
        .choices
        .first()
        .map(|choice| choice.text.trim())
        .filter(|text| !text.is_empty())
    {
        return format!("To get back on track, focus on: {top_choice}.");
    }
    let scene = if next_node.title.trim().is_empty() {
        next_node.node_id.as_str()
    } else {
        next_node.title.trim()
    };
    format!("To get back on track, act on the clearest objective in {scene}.")
}

/// Reaction effects for each reactive NPC whose policy rule matches its
/// current relation tier and the step source.
fn collect_npc_reactions(
    resolved: &ResolvedPack,
    state_after: &StoryState,
    outcome: &SelectionOutcome,
) -> (Vec<RangeEffect>, Vec<String>) {
    let mut effects = Vec::new();
    let mut hints = Vec::new();
    for npc_id in &outcome.reactive_npc_ids {
        let Some(npc) = state_after.npc_state.get(npc_id) else {
            continue;
        };
        let Some(policy) = resolved.reaction_policy(npc_id) else {
            continue;
        };
        let matched = policy.rules.iter().find(|rule| {
            rule.tier == npc.relation_tier && rule.source.matches(outcome.fallback_used)
        });
        let Some(rule) = matched else { continue };
        effects.extend(rule.effects.iter().cloned());
        if let Some(hint) = rule
            .narrative_hint
            .as_deref()
            .map(str::trim)
            .filter(|h| !h.is_empty())
        {
            hints.push(hint.to_string());
        }
    }
    (effects, hints)
}

fn build_choices(
    node: &SceneNode,
    state: &StoryState,
    resolved: &ResolvedPack,
) -> Vec<ChoiceOut> {
    evaluate_node_choices(node, state, resolved)
        .into_iter()
        .map(|entry| ChoiceOut {
            id: entry.choice.choice_id.clone(),
            text: entry.choice.text.clone(),
            available: entry.available,
            locked_reason: entry.locked_reason.map(|reason| ChoiceLockReasonOut {
                code: reason.code,
                message: reason.message,
            }),
        })
        .collect()
}

fn build_current_node(
    node: &SceneNode,
    state: &StoryState,
    resolved: &ResolvedPack,
) -> CurrentNodeOut {
    CurrentNodeOut {
        id: node.node_id.clone(),
        title: node.title.clone(),
        scene_brief: node.scene_brief.clone(),
        choices: build_choices(node, state, resolved),
    }
}

fn compact(value: &Value) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| "{}".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nudge_tier_table() {
        assert_eq!(
            resolve_nudge_tier(Some(FallbackReason::OffTopic), 1),
            NudgeTier::Soft
        );
        assert_eq!(
            resolve_nudge_tier(Some(FallbackReason::OffTopic), 2),
            NudgeTier::Neutral
        );
        assert_eq!(
            resolve_nudge_tier(Some(FallbackReason::LowConf), 1),
            NudgeTier::Neutral
        );
        assert_eq!(
            resolve_nudge_tier(Some(FallbackReason::OffTopic), 3),
            NudgeTier::Firm
        );
        assert_eq!(
            resolve_nudge_tier(Some(FallbackReason::InputPolicy), 1),
            NudgeTier::Firm
        );
    }

    #[test]
    fn ending_tone_table() {
        assert_eq!(ending_tone(EndingOutcome::Success), "triumphant");
        assert_eq!(ending_tone(EndingOutcome::Neutral), "reflective");
        assert_eq!(ending_tone(EndingOutcome::Fail), "somber");
    }

    #[test]
    fn auto_nudge_prefers_top_choice() {
        let node = SceneNode {
            node_id: "n_hub".to_string(),
            title: "Hub".to_string(),
            scene_brief: String::new(),
            node_fallback_id: None,
            choices: vec![crate::story::pack::Choice {
                choice_id: "c_study".to_string(),
                text: "Study in the library".to_string(),
                intent_tags: Vec::new(),
                next_node_id: "n_library".to_string(),
                ending_id: None,
                range_effects: Vec::new(),
                gate_rules: Vec::new(),
                reactive_npc_ids: Vec::new(),
            }],
        };
        assert_eq!(
            auto_mainline_nudge(&node),
            "To get back on track, focus on: Study in the library."
        );

        let bare = SceneNode {
            node_id: "n_empty".to_string(),
            title: "Empty Plaza".to_string(),
            scene_brief: String::new(),
            node_fallback_id: None,
            choices: Vec::new(),
        };
        assert!(auto_mainline_nudge(&bare).contains("Empty Plaza"));
    }
}
