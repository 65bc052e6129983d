//! Story pack data model.
//!
//! A pack is validated once at registration and is read-only afterwards;
//! concurrent sessions share it behind an `Arc`.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use thiserror::Error;

/// Default tier thresholds applied when an NPC definition omits its own.
pub const DEFAULT_TIER_THRESHOLDS: [i64; 4] = [-60, -20, 20, 60];

/// Validation errors for story packs.
#[derive(Debug, Error)]
pub enum PackError {
    #[error("invalid story pack: {0}")]
    Invalid(String),
}

/// Reason a fallback path was taken instead of a visible choice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FallbackReason {
    #[serde(rename = "NO_MATCH")]
    NoMatch,
    #[serde(rename = "LOW_CONF")]
    LowConf,
    #[serde(rename = "INPUT_POLICY")]
    InputPolicy,
    #[serde(rename = "OFF_TOPIC")]
    OffTopic,
}

impl FallbackReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FallbackReason::NoMatch => "NO_MATCH",
            FallbackReason::LowConf => "LOW_CONF",
            FallbackReason::InputPolicy => "INPUT_POLICY",
            FallbackReason::OffTopic => "OFF_TOPIC",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "NO_MATCH" => Some(FallbackReason::NoMatch),
            "LOW_CONF" => Some(FallbackReason::LowConf),
            "INPUT_POLICY" => Some(FallbackReason::InputPolicy),
            "OFF_TOPIC" => Some(FallbackReason::OffTopic),
            _ => None,
        }
    }

    /// Intensity penalty applied when a step resolves through this reason.
    pub fn intensity_penalty(&self) -> i32 {
        match self {
            FallbackReason::InputPolicy => -2,
            _ => -1,
        }
    }
}

impl std::fmt::Display for FallbackReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Final outcome class of an ending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EndingOutcome {
    Success,
    Neutral,
    Fail,
}

impl EndingOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            EndingOutcome::Success => "success",
            EndingOutcome::Neutral => "neutral",
            EndingOutcome::Fail => "fail",
        }
    }
}

/// Which camp an ending credits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EndingCamp {
    Player,
    Enemy,
    World,
}

/// Relationship tier labels, ordered from weakest to strongest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum TierLabel {
    Hostile,
    Wary,
    Neutral,
    Warm,
    Close,
}

impl TierLabel {
    pub fn index(&self) -> usize {
        *self as usize
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TierLabel::Hostile => "Hostile",
            TierLabel::Wary => "Wary",
            TierLabel::Neutral => "Neutral",
            TierLabel::Warm => "Warm",
            TierLabel::Close => "Close",
        }
    }

    /// Tier for a value given four ascending thresholds.
    pub fn for_value(value: i64, thresholds: &[i64; 4]) -> Self {
        if value < thresholds[0] {
            TierLabel::Hostile
        } else if value < thresholds[1] {
            TierLabel::Wary
        } else if value < thresholds[2] {
            TierLabel::Neutral
        } else if value < thresholds[3] {
            TierLabel::Warm
        } else {
            TierLabel::Close
        }
    }

    /// The weaker of two tiers; used to derive the relation tier from the
    /// affection and trust axes.
    pub fn weaker(a: TierLabel, b: TierLabel) -> TierLabel {
        if a.index() <= b.index() {
            a
        } else {
            b
        }
    }
}

impl std::fmt::Display for TierLabel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Target class of a range effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RangeTarget {
    Player,
    Npc,
}

/// A single metric adjustment: the applied delta is `center + tier × intensity`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RangeEffect {
    pub target_type: RangeTarget,
    pub metric: String,
    #[serde(default)]
    pub center: i64,
    #[serde(default)]
    pub intensity: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_id: Option<String>,
}

const PLAYER_METRICS: [&str; 4] = ["energy", "money", "knowledge", "affection"];
const NPC_METRICS: [&str; 2] = ["affection", "trust"];

impl RangeEffect {
    fn validate(&self) -> Result<(), PackError> {
        match self.target_type {
            RangeTarget::Player => {
                if !PLAYER_METRICS.contains(&self.metric.as_str()) {
                    return Err(PackError::Invalid(format!(
                        "unsupported player metric: {}",
                        self.metric
                    )));
                }
            }
            RangeTarget::Npc => {
                if self.target_id.as_deref().unwrap_or("").is_empty() {
                    return Err(PackError::Invalid(
                        "range_effect npc target requires target_id".to_string(),
                    ));
                }
                if !NPC_METRICS.contains(&self.metric.as_str()) {
                    return Err(PackError::Invalid(format!(
                        "unsupported npc metric: {}",
                        self.metric
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Requirement that a specific NPC relationship axis be at least a tier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateRule {
    pub npc_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_affection_tier: Option<TierLabel>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_trust_tier: Option<TierLabel>,
}

/// A visible choice on a scene node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Choice {
    pub choice_id: String,
    pub text: String,
    #[serde(default)]
    pub intent_tags: Vec<String>,
    pub next_node_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ending_id: Option<String>,
    #[serde(default)]
    pub range_effects: Vec<RangeEffect>,
    #[serde(default)]
    pub gate_rules: Vec<GateRule>,
    #[serde(default)]
    pub reactive_npc_ids: Vec<String>,
}

/// A scene node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SceneNode {
    pub node_id: String,
    pub title: String,
    #[serde(default)]
    pub scene_brief: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_fallback_id: Option<String>,
    #[serde(default)]
    pub choices: Vec<Choice>,
}

/// A pack-wide recovery path taken when input cannot map to a choice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalFallback {
    pub fallback_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason_code: Option<FallbackReason>,
    #[serde(default)]
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mainline_nudge: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_profile_id: Option<String>,
    #[serde(default)]
    pub range_effects: Vec<RangeEffect>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_node_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ending_id: Option<String>,
    #[serde(default)]
    pub reactive_npc_ids: Vec<String>,
}

/// Declarative condition set for an ending; `None` fields do not constrain.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EndingTrigger {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id_is: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub day_at_least: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub day_at_most: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub energy_at_most: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub money_at_least: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub knowledge_at_least: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub affection_at_least: Option<i64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub completed_quests_include: Vec<String>,
}

impl EndingTrigger {
    /// A trigger with no constraints never fires on its own; such endings
    /// are reachable only by an explicit `ending_id` reference.
    pub fn is_empty(&self) -> bool {
        self.node_id_is.is_none()
            && self.day_at_least.is_none()
            && self.day_at_most.is_none()
            && self.energy_at_most.is_none()
            && self.money_at_least.is_none()
            && self.knowledge_at_least.is_none()
            && self.affection_at_least.is_none()
            && self.completed_quests_include.is_empty()
    }
}

fn default_priority() -> i64 {
    100
}

/// An ending definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndingDef {
    pub ending_id: String,
    pub title: String,
    pub outcome: EndingOutcome,
    pub camp: EndingCamp,
    #[serde(default)]
    pub epilogue: String,
    #[serde(default = "default_priority")]
    pub priority: i64,
    #[serde(default)]
    pub trigger: EndingTrigger,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_profile_id: Option<String>,
}

fn default_initial_axis() -> i64 {
    0
}

fn default_thresholds() -> [i64; 4] {
    DEFAULT_TIER_THRESHOLDS
}

/// An NPC definition: initial relationship values plus tier thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NpcDef {
    pub npc_id: String,
    pub name: String,
    #[serde(default = "default_initial_axis")]
    pub initial_affection: i64,
    #[serde(default = "default_initial_axis")]
    pub initial_trust: i64,
    #[serde(default = "default_thresholds")]
    pub affection_thresholds: [i64; 4],
    #[serde(default = "default_thresholds")]
    pub trust_thresholds: [i64; 4],
}

/// Which kind of step a reaction rule responds to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReactionSource {
    Choice,
    Fallback,
    Any,
}

impl ReactionSource {
    pub fn matches(&self, fallback_used: bool) -> bool {
        match self {
            ReactionSource::Any => true,
            ReactionSource::Choice => !fallback_used,
            ReactionSource::Fallback => fallback_used,
        }
    }
}

/// One reaction rule keyed on the NPC's current relation tier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NpcReactionRule {
    pub tier: TierLabel,
    #[serde(default = "default_reaction_source")]
    pub source: ReactionSource,
    #[serde(default)]
    pub effects: Vec<RangeEffect>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub narrative_hint: Option<String>,
}

fn default_reaction_source() -> ReactionSource {
    ReactionSource::Any
}

/// Reaction policy for one NPC.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NpcReactionPolicy {
    pub npc_id: String,
    #[serde(default)]
    pub rules: Vec<NpcReactionRule>,
}

fn default_true() -> bool {
    true
}

fn default_forced_fallback_ending() -> Option<String> {
    Some("ending_forced_fail".to_string())
}

/// Pack-level fallback behavior.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FallbackPolicy {
    #[serde(default = "default_true")]
    pub include_default_fallbacks: bool,
    #[serde(default)]
    pub fallback_overrides: Vec<GlobalFallback>,
    #[serde(default = "default_forced_fallback_ending")]
    pub forced_fallback_ending_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub forced_fallback_threshold: Option<u32>,
}

impl Default for FallbackPolicy {
    fn default() -> Self {
        Self {
            include_default_fallbacks: true,
            fallback_overrides: Vec::new(),
            forced_fallback_ending_id: default_forced_fallback_ending(),
            forced_fallback_threshold: None,
        }
    }
}

/// Pack-level ending behavior.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndingPolicy {
    #[serde(default = "default_true")]
    pub include_default_endings: bool,
    #[serde(default)]
    pub ending_overrides: Vec<EndingDef>,
}

impl Default for EndingPolicy {
    fn default() -> Self {
        Self {
            include_default_endings: true,
            ending_overrides: Vec::new(),
        }
    }
}

fn default_max_days() -> i64 {
    7
}

fn default_max_steps() -> u32 {
    24
}

fn default_timeout_outcome() -> EndingOutcome {
    EndingOutcome::Neutral
}

/// Run bounds for a pack.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    #[serde(default = "default_max_days")]
    pub max_days: i64,
    #[serde(default = "default_max_steps")]
    pub max_steps: u32,
    #[serde(default = "default_timeout_outcome")]
    pub default_timeout_outcome: EndingOutcome,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            max_days: default_max_days(),
            max_steps: default_max_steps(),
            default_timeout_outcome: default_timeout_outcome(),
        }
    }
}

/// A complete story pack.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoryPack {
    pub story_id: String,
    #[serde(default)]
    pub title: String,
    pub start_node_id: String,
    pub nodes: Vec<SceneNode>,
    #[serde(default)]
    pub global_fallbacks: Vec<GlobalFallback>,
    #[serde(default)]
    pub ending_defs: Vec<EndingDef>,
    #[serde(default)]
    pub npc_defs: Vec<NpcDef>,
    #[serde(default)]
    pub npc_reaction_policies: Vec<NpcReactionPolicy>,
    #[serde(default)]
    pub fallback_policy: FallbackPolicy,
    #[serde(default)]
    pub ending_policy: EndingPolicy,
    #[serde(default)]
    pub run_config: RunConfig,
}

impl StoryPack {
    /// Structural validation against the merged default+override asset sets.
    pub fn validate(&self) -> Result<(), PackError> {
        if self.story_id.trim().is_empty() {
            return Err(PackError::Invalid("story_id cannot be empty".to_string()));
        }
        if self.nodes.is_empty() {
            return Err(PackError::Invalid("pack must have at least one node".to_string()));
        }

        let node_ids: HashSet<&str> = self.nodes.iter().map(|n| n.node_id.as_str()).collect();
        if node_ids.len() != self.nodes.len() {
            return Err(PackError::Invalid("duplicate node_id in nodes".to_string()));
        }
        if !node_ids.contains(self.start_node_id.as_str()) {
            return Err(PackError::Invalid(format!(
                "start_node_id not found: {}",
                self.start_node_id
            )));
        }

        let npc_ids: HashSet<&str> = self.npc_defs.iter().map(|n| n.npc_id.as_str()).collect();
        if npc_ids.len() != self.npc_defs.len() {
            return Err(PackError::Invalid("duplicate npc_id in npc_defs".to_string()));
        }

        let (effective_fallbacks, effective_endings) =
            crate::story::resolver::effective_assets(self);
        if effective_fallbacks.is_empty() {
            return Err(PackError::Invalid(
                "effective fallback set cannot be empty".to_string(),
            ));
        }
        let fallback_ids: HashSet<&str> = effective_fallbacks
            .iter()
            .map(|f| f.fallback_id.as_str())
            .collect();
        let ending_ids: HashSet<&str> = effective_endings
            .iter()
            .map(|e| e.ending_id.as_str())
            .collect();

        for node in &self.nodes {
            if let Some(node_fallback_id) = &node.node_fallback_id {
                if !fallback_ids.contains(node_fallback_id.as_str()) {
                    return Err(PackError::Invalid(format!(
                        "node_fallback_id not found in effective fallbacks: {node_fallback_id}"
                    )));
                }
            }
            let mut seen_choice_ids = HashSet::new();
            for choice in &node.choices {
                if !seen_choice_ids.insert(choice.choice_id.as_str()) {
                    return Err(PackError::Invalid(format!(
                        "duplicate choice_id on node {}: {}",
                        node.node_id, choice.choice_id
                    )));
                }
                if !node_ids.contains(choice.next_node_id.as_str()) {
                    return Err(PackError::Invalid(format!(
                        "choice next_node_id not found: {}",
                        choice.next_node_id
                    )));
                }
                if let Some(ending_id) = &choice.ending_id {
                    if !ending_ids.contains(ending_id.as_str()) {
                        return Err(PackError::Invalid(format!(
                            "choice ending_id not found in effective endings: {ending_id}"
                        )));
                    }
                }
                for effect in &choice.range_effects {
                    effect.validate()?;
                    Self::check_npc_target(effect, &npc_ids)?;
                }
                for gate in &choice.gate_rules {
                    if gate.min_affection_tier.is_none() && gate.min_trust_tier.is_none() {
                        return Err(PackError::Invalid(
                            "gate_rule must define at least one minimum tier".to_string(),
                        ));
                    }
                    if !npc_ids.contains(gate.npc_id.as_str()) {
                        return Err(PackError::Invalid(format!(
                            "choice gate npc_id not found: {}",
                            gate.npc_id
                        )));
                    }
                }
                for npc_id in &choice.reactive_npc_ids {
                    if !npc_ids.contains(npc_id.as_str()) {
                        return Err(PackError::Invalid(format!(
                            "choice reactive_npc_id not found: {npc_id}"
                        )));
                    }
                }
            }
        }

        let mut reason_set = HashSet::new();
        for fallback in &effective_fallbacks {
            if let Some(target) = &fallback.target_node_id {
                if !node_ids.contains(target.as_str()) {
                    return Err(PackError::Invalid(format!(
                        "fallback target_node_id not found: {target}"
                    )));
                }
            }
            if let Some(reason) = fallback.reason_code {
                if !reason_set.insert(reason) {
                    return Err(PackError::Invalid(format!(
                        "duplicate fallback reason_code in effective fallbacks: {reason}"
                    )));
                }
            }
            if let Some(ending_id) = &fallback.ending_id {
                if !ending_ids.contains(ending_id.as_str()) {
                    return Err(PackError::Invalid(format!(
                        "fallback ending_id not found in effective endings: {ending_id}"
                    )));
                }
            }
            for effect in &fallback.range_effects {
                effect.validate()?;
                Self::check_npc_target(effect, &npc_ids)?;
            }
        }

        for policy in &self.npc_reaction_policies {
            if !npc_ids.contains(policy.npc_id.as_str()) {
                return Err(PackError::Invalid(format!(
                    "npc_reaction_policy npc_id not found: {}",
                    policy.npc_id
                )));
            }
            let mut rule_keys = HashSet::new();
            for rule in &policy.rules {
                if !rule_keys.insert((rule.tier, rule.source)) {
                    return Err(PackError::Invalid(format!(
                        "duplicate npc reaction rule key for npc_id={}",
                        policy.npc_id
                    )));
                }
                for effect in &rule.effects {
                    effect.validate()?;
                    Self::check_npc_target(effect, &npc_ids)?;
                }
            }
        }

        if let Some(forced) = &self.fallback_policy.forced_fallback_ending_id {
            if !ending_ids.contains(forced.as_str()) {
                return Err(PackError::Invalid(
                    "forced_fallback_ending_id must exist in effective ending set".to_string(),
                ));
            }
        }

        Ok(())
    }

    fn check_npc_target(effect: &RangeEffect, npc_ids: &HashSet<&str>) -> Result<(), PackError> {
        if effect.target_type == RangeTarget::Npc {
            let target = effect.target_id.as_deref().unwrap_or("");
            if !npc_ids.contains(target) {
                return Err(PackError::Invalid(format!(
                    "npc effect target_id not found: {target}"
                )));
            }
        }
        Ok(())
    }
}
