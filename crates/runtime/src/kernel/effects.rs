//! Range-effect application and step transitions.
//!
//! The applied delta of an effect is `center + tier × intensity`, with the
//! intensity tier clamped to [-2, 2].

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

use crate::kernel::state::{normalize_state, StoryState};
use crate::story::pack::{FallbackReason, RangeEffect, RangeTarget, TierLabel};

/// Intensity tier bounds.
pub const TIER_MIN: i32 = -2;
pub const TIER_MAX: i32 = 2;

/// Clamp a tier into the supported band.
pub fn clamp_tier(tier: i32) -> i32 {
    tier.clamp(TIER_MIN, TIER_MAX)
}

/// Effective tier after the fallback penalty: `INPUT_POLICY` costs two
/// tiers, every other reason one. Returns `(effective, base_penalty)`.
pub fn effective_intensity_tier(
    raw_tier: i32,
    fallback_used: bool,
    fallback_reason: Option<FallbackReason>,
) -> (i32, i32) {
    let raw = clamp_tier(raw_tier);
    if !fallback_used {
        return (raw, 0);
    }
    let penalty = fallback_reason
        .map(|reason| reason.intensity_penalty())
        .unwrap_or(-1);
    (clamp_tier(raw + penalty), penalty)
}

/// Echo of one applied effect: the declared values plus the resolved delta.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppliedEffect {
    pub target_type: RangeTarget,
    pub metric: String,
    pub center: i64,
    pub intensity: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_id: Option<String>,
    pub tier: i32,
    pub delta: i64,
}

/// Per-NPC delta entry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NpcDelta {
    #[serde(default)]
    pub affection: i64,
    #[serde(default)]
    pub trust: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub affection_tier: Option<TierLabel>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trust_tier: Option<TierLabel>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub relation_tier: Option<TierLabel>,
}

/// Accumulated state delta for one step.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StateDelta {
    pub stats: BTreeMap<String, i64>,
    pub npc: BTreeMap<String, NpcDelta>,
    pub run_state: Map<String, Value>,
}

impl StateDelta {
    pub fn is_empty(&self) -> bool {
        self.stats.is_empty() && self.npc.is_empty() && self.run_state.is_empty()
    }

    /// Fold another delta into this one: stat and axis deltas add, tier
    /// labels and run-state entries take the newer value.
    pub fn merge(&mut self, other: &StateDelta) {
        for (metric, delta) in &other.stats {
            *self.stats.entry(metric.clone()).or_insert(0) += delta;
        }
        for (npc_id, incoming) in &other.npc {
            let entry = self.npc.entry(npc_id.clone()).or_default();
            entry.affection += incoming.affection;
            entry.trust += incoming.trust;
            if incoming.affection_tier.is_some() {
                entry.affection_tier = incoming.affection_tier;
            }
            if incoming.trust_tier.is_some() {
                entry.trust_tier = incoming.trust_tier;
            }
            if incoming.relation_tier.is_some() {
                entry.relation_tier = incoming.relation_tier;
            }
        }
        for (key, value) in &other.run_state {
            self.run_state.insert(key.clone(), value.clone());
        }
    }

    /// Persisted shape: stat keys at the top level, then `npc` and
    /// `run_state` subtrees.
    pub fn to_value(&self) -> Value {
        let mut out = Map::new();
        for (metric, delta) in &self.stats {
            out.insert(metric.clone(), Value::from(*delta));
        }
        if !self.npc.is_empty() {
            let mut npc_map = Map::new();
            for (npc_id, delta) in &self.npc {
                npc_map.insert(
                    npc_id.clone(),
                    serde_json::to_value(delta).unwrap_or(Value::Null),
                );
            }
            out.insert("npc".to_string(), Value::Object(npc_map));
        }
        if !self.run_state.is_empty() {
            out.insert("run_state".to_string(), Value::Object(self.run_state.clone()));
        }
        Value::Object(out)
    }
}

/// Apply a batch of range effects at an intensity tier. Player metrics write
/// stats; NPC metrics write the targeted entry and re-derive its tiers.
/// Effects naming an NPC absent from the state are skipped.
pub fn apply_range_effects(
    state: &StoryState,
    effects: &[RangeEffect],
    tier: i32,
) -> (StoryState, StateDelta, Vec<AppliedEffect>) {
    let tier = clamp_tier(tier);
    let mut next = state.clone();
    let mut delta = StateDelta::default();
    let mut applied = Vec::with_capacity(effects.len());

    for effect in effects {
        let resolved = effect.center + i64::from(tier) * effect.intensity;
        match effect.target_type {
            RangeTarget::Player => {
                match effect.metric.as_str() {
                    "energy" => next.energy += resolved,
                    "money" => next.money += resolved,
                    "knowledge" => next.knowledge += resolved,
                    "affection" => next.affection += resolved,
                    _ => continue,
                }
                *delta.stats.entry(effect.metric.clone()).or_insert(0) += resolved;
            }
            RangeTarget::Npc => {
                let Some(target_id) = effect.target_id.as_deref() else {
                    continue;
                };
                let Some(entry) = next.npc_state.get_mut(target_id) else {
                    continue;
                };
                let npc_delta = delta.npc.entry(target_id.to_string()).or_default();
                match effect.metric.as_str() {
                    "affection" => {
                        entry.affection += resolved;
                        npc_delta.affection += resolved;
                    }
                    "trust" => {
                        entry.trust += resolved;
                        npc_delta.trust += resolved;
                    }
                    _ => continue,
                }
                entry.rederive_tiers();
                npc_delta.affection_tier = Some(entry.affection_tier);
                npc_delta.trust_tier = Some(entry.trust_tier);
                npc_delta.relation_tier = Some(entry.relation_tier);
            }
        }
        applied.push(AppliedEffect {
            target_type: effect.target_type,
            metric: effect.metric.clone(),
            center: effect.center,
            intensity: effect.intensity,
            target_id: effect.target_id.clone(),
            tier,
            delta: resolved,
        });
    }

    (next, delta, applied)
}

/// One committed step's worth of state movement: bump the step index,
/// maintain fallback counters, apply effects, normalize.
pub fn apply_transition(
    state: &StoryState,
    effects: &[RangeEffect],
    tier: i32,
    fallback_used: bool,
) -> (StoryState, StateDelta, Vec<AppliedEffect>) {
    let mut working = state.clone();
    working.run_state.step_index = working.run_state.step_index.saturating_add(1);
    if fallback_used {
        working.run_state.fallback_count = working.run_state.fallback_count.saturating_add(1);
        working.run_state.consecutive_fallback_count =
            working.run_state.consecutive_fallback_count.saturating_add(1);
    } else {
        working.run_state.consecutive_fallback_count = 0;
    }

    let (applied_state, delta, applied) = apply_range_effects(&working, effects, tier);
    (normalize_state(&applied_state), delta, applied)
}
