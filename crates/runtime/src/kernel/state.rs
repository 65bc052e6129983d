//! Session state representation and normalization.
//!
//! `state_json` persists with a stable key layout: `energy, money, knowledge,
//! affection, day, slot, inventory_state, external_status, npc_state,
//! quest_state, run_state`. Panels the kernel does not interpret
//! (`inventory_state`, `external_status`, `quest_state`) pass through
//! normalization shape-defaulted but otherwise untouched.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;

use crate::story::pack::{EndingCamp, EndingOutcome, NpcDef, TierLabel, DEFAULT_TIER_THRESHOLDS};

/// Stat ranges enforced by normalization.
pub const ENERGY_RANGE: (i64, i64) = (0, 100);
pub const MONEY_RANGE: (i64, i64) = (0, 999_999);
pub const KNOWLEDGE_RANGE: (i64, i64) = (0, 999);
pub const AFFECTION_RANGE: (i64, i64) = (-100, 100);
pub const NPC_AXIS_RANGE: (i64, i64) = (-100, 100);

/// Time-of-day slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TimeSlot {
    #[default]
    Morning,
    Afternoon,
    Night,
}

impl TimeSlot {
    pub fn as_str(&self) -> &'static str {
        match self {
            TimeSlot::Morning => "morning",
            TimeSlot::Afternoon => "afternoon",
            TimeSlot::Night => "night",
        }
    }
}

/// Fallback nudge strength carried in the response to guide UX copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NudgeTier {
    Soft,
    Neutral,
    Firm,
}

impl NudgeTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            NudgeTier::Soft => "soft",
            NudgeTier::Neutral => "neutral",
            NudgeTier::Firm => "firm",
        }
    }
}

/// Per-NPC relationship entry. Thresholds are copied from the pack's NPC
/// definition at session creation so tier derivation stays pure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NpcEntry {
    pub affection: i64,
    pub trust: i64,
    pub affection_tier: TierLabel,
    pub trust_tier: TierLabel,
    pub relation_tier: TierLabel,
    #[serde(default = "default_thresholds")]
    pub affection_thresholds: [i64; 4],
    #[serde(default = "default_thresholds")]
    pub trust_thresholds: [i64; 4],
}

fn default_thresholds() -> [i64; 4] {
    DEFAULT_TIER_THRESHOLDS
}

impl NpcEntry {
    pub fn new(affection: i64, trust: i64, affection_thresholds: [i64; 4], trust_thresholds: [i64; 4]) -> Self {
        let mut entry = Self {
            affection,
            trust,
            affection_tier: TierLabel::Hostile,
            trust_tier: TierLabel::Hostile,
            relation_tier: TierLabel::Hostile,
            affection_thresholds,
            trust_thresholds,
        };
        entry.rederive_tiers();
        entry
    }

    /// Clamp both axes and recompute the three tier labels.
    pub fn rederive_tiers(&mut self) {
        self.affection = self.affection.clamp(NPC_AXIS_RANGE.0, NPC_AXIS_RANGE.1);
        self.trust = self.trust.clamp(NPC_AXIS_RANGE.0, NPC_AXIS_RANGE.1);
        self.affection_tier = TierLabel::for_value(self.affection, &self.affection_thresholds);
        self.trust_tier = TierLabel::for_value(self.trust, &self.trust_thresholds);
        self.relation_tier = TierLabel::weaker(self.affection_tier, self.trust_tier);
    }
}

/// Run bookkeeping embedded in the state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct RunState {
    #[serde(default)]
    pub step_index: u32,
    #[serde(default)]
    pub fallback_count: u32,
    #[serde(default)]
    pub consecutive_fallback_count: u32,
    #[serde(default)]
    pub run_ended: bool,
    #[serde(default)]
    pub ending_id: Option<String>,
    #[serde(default)]
    pub ending_outcome: Option<EndingOutcome>,
    #[serde(default)]
    pub ending_camp: Option<EndingCamp>,
    #[serde(default)]
    pub ending_report: Option<Value>,
    #[serde(default)]
    pub nudge_tier: Option<NudgeTier>,
    #[serde(default)]
    pub selection_retry_count: u32,
    #[serde(default)]
    pub selection_retry_errors: Vec<String>,
}

/// The full mutable state a session owns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoryState {
    pub energy: i64,
    pub money: i64,
    pub knowledge: i64,
    pub affection: i64,
    pub day: i64,
    pub slot: TimeSlot,
    #[serde(default = "default_inventory_state")]
    pub inventory_state: Value,
    #[serde(default = "default_external_status")]
    pub external_status: Value,
    #[serde(default)]
    pub npc_state: BTreeMap<String, NpcEntry>,
    #[serde(default = "default_quest_state")]
    pub quest_state: Value,
    #[serde(default)]
    pub run_state: RunState,
}

fn default_inventory_state() -> Value {
    json!({
        "capacity": 40,
        "currency": {"gold": 50},
        "stack_items": {},
        "instance_items": {},
        "equipment_slots": {"weapon": null, "armor": null, "accessory": null},
    })
}

fn default_external_status() -> Value {
    json!({
        "player_effects": [],
        "world_flags": {},
        "faction_rep": {},
        "timers": {},
    })
}

fn default_quest_state() -> Value {
    json!({})
}

impl Default for StoryState {
    fn default() -> Self {
        default_state()
    }
}

impl StoryState {
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or_else(|_| json!({}))
    }

    /// Decode a stored `state_json`; unknown shapes fall back to defaults
    /// field-by-field via serde defaults.
    pub fn from_value(value: &Value) -> Self {
        serde_json::from_value(value.clone()).unwrap_or_default()
    }

    /// Completed quest ids recorded by the quest panel, if any.
    pub fn completed_quests(&self) -> Vec<String> {
        self.quest_state
            .get("completed")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Initial state for a fresh session, before NPC seeding.
pub fn default_state() -> StoryState {
    StoryState {
        energy: 80,
        money: 50,
        knowledge: 0,
        affection: 0,
        day: 1,
        slot: TimeSlot::Morning,
        inventory_state: default_inventory_state(),
        external_status: default_external_status(),
        npc_state: BTreeMap::new(),
        quest_state: default_quest_state(),
        run_state: RunState::default(),
    }
}

/// Seed per-NPC entries from pack definitions.
pub fn build_npc_state_from_defs(defs: &[NpcDef]) -> BTreeMap<String, NpcEntry> {
    defs.iter()
        .map(|def| {
            (
                def.npc_id.clone(),
                NpcEntry::new(
                    def.initial_affection,
                    def.initial_trust,
                    def.affection_thresholds,
                    def.trust_thresholds,
                ),
            )
        })
        .collect()
}

/// Clamp every stat into range, floor the calendar, and re-derive NPC tiers.
/// Idempotent: `normalize(normalize(s)) == normalize(s)`.
pub fn normalize_state(state: &StoryState) -> StoryState {
    let mut out = state.clone();
    out.energy = out.energy.clamp(ENERGY_RANGE.0, ENERGY_RANGE.1);
    out.money = out.money.clamp(MONEY_RANGE.0, MONEY_RANGE.1);
    out.knowledge = out.knowledge.clamp(KNOWLEDGE_RANGE.0, KNOWLEDGE_RANGE.1);
    out.affection = out.affection.clamp(AFFECTION_RANGE.0, AFFECTION_RANGE.1);
    if out.day < 1 {
        out.day = 1;
    }
    for entry in out.npc_state.values_mut() {
        entry.rederive_tiers();
    }
    if out.run_state.run_ended && out.run_state.ending_id.is_none() {
        // An ended run without an ending id is inconsistent; drop the flag.
        out.run_state.run_ended = false;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_clamps_stats() {
        let mut state = default_state();
        state.energy = 500;
        state.money = -3;
        state.knowledge = 10_000;
        state.affection = -400;
        state.day = 0;
        let normalized = normalize_state(&state);
        assert_eq!(normalized.energy, 100);
        assert_eq!(normalized.money, 0);
        assert_eq!(normalized.knowledge, 999);
        assert_eq!(normalized.affection, -100);
        assert_eq!(normalized.day, 1);
    }

    #[test]
    fn normalize_is_idempotent() {
        let mut state = default_state();
        state.energy = 240;
        state.npc_state.insert(
            "npc_mika".to_string(),
            NpcEntry::new(150, -150, DEFAULT_TIER_THRESHOLDS, DEFAULT_TIER_THRESHOLDS),
        );
        let once = normalize_state(&state);
        let twice = normalize_state(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn npc_entry_tiers_rederive_on_clamp() {
        let entry = NpcEntry::new(150, -150, DEFAULT_TIER_THRESHOLDS, DEFAULT_TIER_THRESHOLDS);
        assert_eq!(entry.affection, 100);
        assert_eq!(entry.trust, -100);
        assert_eq!(entry.affection_tier, TierLabel::Close);
        assert_eq!(entry.trust_tier, TierLabel::Hostile);
        assert_eq!(entry.relation_tier, TierLabel::Hostile);
    }

    #[test]
    fn ended_flag_without_ending_id_is_dropped() {
        let mut state = default_state();
        state.run_state.run_ended = true;
        let normalized = normalize_state(&state);
        assert!(!normalized.run_state.run_ended);
    }

    #[test]
    fn state_value_roundtrip_preserves_run_state() {
        let mut state = default_state();
        state.run_state.step_index = 7;
        state.run_state.fallback_count = 2;
        let value = state.to_value();
        let back = StoryState::from_value(&value);
        assert_eq!(back.run_state.step_index, 7);
        assert_eq!(back.run_state.fallback_count, 2);
    }

    #[test]
    fn malformed_state_value_falls_back_to_default() {
        let back = StoryState::from_value(&serde_json::json!("not an object"));
        assert_eq!(back.energy, 80);
        assert_eq!(back.day, 1);
    }

    #[test]
    fn completed_quests_read_from_panel() {
        let mut state = default_state();
        state.quest_state = serde_json::json!({"completed": ["q_intro", "q_midterm"]});
        assert_eq!(state.completed_quests(), vec!["q_intro", "q_midterm"]);
    }
}
