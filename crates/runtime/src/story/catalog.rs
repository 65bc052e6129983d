//! In-memory story catalog.
//!
//! Packs are registered whole, validated once, and served as shared
//! `Arc` snapshots. Publication of a new version invalidates nothing for
//! running sessions: a session pins its `story_version` at creation.

use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use thiserror::Error;

use crate::story::pack::{
    Choice, EndingCamp, EndingDef, EndingOutcome, EndingTrigger, GateRule, NpcDef,
    NpcReactionPolicy, NpcReactionRule, PackError, RangeEffect, RangeTarget, ReactionSource,
    SceneNode, StoryPack, TierLabel,
};

/// Catalog errors.
#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("story not found: {0}")]
    StoryNotFound(String),
    #[error("story version not found: {story_id} v{version}")]
    VersionNotFound { story_id: String, version: u32 },
    #[error(transparent)]
    Pack(#[from] PackError),
}

/// Versioned registry of immutable story packs.
pub struct StoryCatalog {
    packs: RwLock<HashMap<String, BTreeMap<u32, Arc<StoryPack>>>>,
}

impl Default for StoryCatalog {
    fn default() -> Self {
        Self::new()
    }
}

impl StoryCatalog {
    pub fn new() -> Self {
        Self {
            packs: RwLock::new(HashMap::new()),
        }
    }

    /// Catalog pre-seeded with the built-in demo story.
    pub fn with_builtin() -> Self {
        let catalog = Self::new();
        catalog
            .register(campus_week_pack())
            .unwrap_or_else(|err| panic!("builtin pack must validate: {err}"));
        catalog
    }

    /// Validate and register a pack as the next version of its story.
    pub fn register(&self, pack: StoryPack) -> Result<u32, CatalogError> {
        pack.validate()?;
        let mut packs = self.packs.write();
        let versions = packs.entry(pack.story_id.clone()).or_default();
        let version = versions.keys().next_back().copied().unwrap_or(0) + 1;
        versions.insert(version, Arc::new(pack));
        Ok(version)
    }

    /// Fetch a pack snapshot; `None` version means latest.
    pub fn get(
        &self,
        story_id: &str,
        version: Option<u32>,
    ) -> Result<(u32, Arc<StoryPack>), CatalogError> {
        let packs = self.packs.read();
        let versions = packs
            .get(story_id)
            .ok_or_else(|| CatalogError::StoryNotFound(story_id.to_string()))?;
        match version {
            Some(v) => versions
                .get(&v)
                .map(|pack| (v, Arc::clone(pack)))
                .ok_or_else(|| CatalogError::VersionNotFound {
                    story_id: story_id.to_string(),
                    version: v,
                }),
            None => versions
                .iter()
                .next_back()
                .map(|(v, pack)| (*v, Arc::clone(pack)))
                .ok_or_else(|| CatalogError::StoryNotFound(story_id.to_string())),
        }
    }

    /// Drop every version of a story (publication invalidation hook).
    pub fn invalidate(&self, story_id: &str) {
        self.packs.write().remove(story_id);
    }
}

fn player_effect(metric: &str, center: i64, intensity: i64) -> RangeEffect {
    RangeEffect {
        target_type: RangeTarget::Player,
        metric: metric.to_string(),
        center,
        intensity,
        target_id: None,
    }
}

fn npc_effect(npc_id: &str, metric: &str, center: i64, intensity: i64) -> RangeEffect {
    RangeEffect {
        target_type: RangeTarget::Npc,
        metric: metric.to_string(),
        center,
        intensity,
        target_id: Some(npc_id.to_string()),
    }
}

fn choice(id: &str, text: &str, tags: &[&str], next: &str) -> Choice {
    Choice {
        choice_id: id.to_string(),
        text: text.to_string(),
        intent_tags: tags.iter().map(|t| t.to_string()).collect(),
        next_node_id: next.to_string(),
        ending_id: None,
        range_effects: Vec::new(),
        gate_rules: Vec::new(),
        reactive_npc_ids: Vec::new(),
    }
}

/// The built-in demo story: one week on campus, a single NPC, a hub with
/// gated and ungated branches, and a knowledge-triggered success ending.
pub fn campus_week_pack() -> StoryPack {
    let mut c_study = choice(
        "c_study",
        "Study in the library",
        &["study", "read", "library", "learn"],
        "n_library",
    );
    c_study.range_effects = vec![
        player_effect("knowledge", 8, 2),
        player_effect("energy", -6, 2),
    ];

    let mut c_work = choice(
        "c_work",
        "Take a cafe shift",
        &["work", "job", "cafe", "money", "shift"],
        "n_cafe",
    );
    c_work.range_effects = vec![
        player_effect("money", 30, 10),
        player_effect("energy", -8, 2),
    ];

    let mut c_rest = choice(
        "c_rest",
        "Rest at the dorm",
        &["rest", "sleep", "nap", "dorm"],
        "n_dorm",
    );
    c_rest.range_effects = vec![player_effect("energy", 15, 5)];

    let mut c_confide = choice(
        "c_confide",
        "Confide in Mika on the rooftop",
        &["talk", "mika", "confide", "rooftop"],
        "n_rooftop",
    );
    c_confide.range_effects = vec![npc_effect("npc_mika", "affection", 6, 2)];
    c_confide.gate_rules = vec![GateRule {
        npc_id: "npc_mika".to_string(),
        min_affection_tier: Some(TierLabel::Warm),
        min_trust_tier: None,
    }];
    c_confide.reactive_npc_ids = vec!["npc_mika".to_string()];

    let mut c_deep_study = choice(
        "c_deep_study",
        "Push through the reading list",
        &["study", "focus", "reading"],
        "n_library",
    );
    c_deep_study.range_effects = vec![
        player_effect("knowledge", 10, 3),
        player_effect("energy", -10, 2),
    ];

    let mut c_call_it_a_week = choice(
        "c_call_it_a_week",
        "Call it a week and head home",
        &["leave", "quit", "home"],
        "n_hub",
    );
    c_call_it_a_week.ending_id = Some("ending_neutral_default".to_string());

    let nodes = vec![
        SceneNode {
            node_id: "n_hub".to_string(),
            title: "Campus Hub".to_string(),
            scene_brief: "Morning crowds drift between the library, the cafe, and the dorms."
                .to_string(),
            node_fallback_id: None,
            choices: vec![c_study, c_work, c_rest, c_confide],
        },
        SceneNode {
            node_id: "n_library".to_string(),
            title: "University Library".to_string(),
            scene_brief: "Stacks of borrowed time and fluorescent quiet.".to_string(),
            node_fallback_id: None,
            choices: vec![
                c_deep_study,
                choice("c_back_hub", "Head back to the hub", &["back", "hub", "leave"], "n_hub"),
            ],
        },
        SceneNode {
            node_id: "n_cafe".to_string(),
            title: "Corner Cafe".to_string(),
            scene_brief: "Steam, small talk, and a tip jar that is always half full.".to_string(),
            node_fallback_id: None,
            choices: vec![choice(
                "c_back_hub",
                "Hang up the apron and head back",
                &["back", "hub", "leave"],
                "n_hub",
            )],
        },
        SceneNode {
            node_id: "n_dorm".to_string(),
            title: "Dorm Room".to_string(),
            scene_brief: "A narrow bed, a humming fridge, and one week left on the calendar."
                .to_string(),
            node_fallback_id: None,
            choices: vec![
                choice("c_back_hub", "Get up and go out", &["back", "hub", "out"], "n_hub"),
                c_call_it_a_week,
            ],
        },
        SceneNode {
            node_id: "n_rooftop".to_string(),
            title: "Rooftop".to_string(),
            scene_brief: "Wind over the ledge; Mika waits with two cans of coffee.".to_string(),
            node_fallback_id: None,
            choices: vec![choice(
                "c_back_hub",
                "Climb back down together",
                &["back", "down", "hub"],
                "n_hub",
            )],
        },
    ];

    StoryPack {
        story_id: "campus_week_v1".to_string(),
        title: "Campus Week".to_string(),
        start_node_id: "n_hub".to_string(),
        nodes,
        global_fallbacks: Vec::new(),
        ending_defs: vec![EndingDef {
            ending_id: "ending_top_honors".to_string(),
            title: "Top Honors".to_string(),
            outcome: EndingOutcome::Success,
            camp: EndingCamp::Player,
            epilogue: "The reading paid off; the week closes with your name read aloud."
                .to_string(),
            priority: 10,
            trigger: EndingTrigger {
                knowledge_at_least: Some(60),
                ..EndingTrigger::default()
            },
            prompt_profile_id: Some("ending_default_v2".to_string()),
        }],
        npc_defs: vec![NpcDef {
            npc_id: "npc_mika".to_string(),
            name: "Mika".to_string(),
            initial_affection: 10,
            initial_trust: 0,
            affection_thresholds: crate::story::pack::DEFAULT_TIER_THRESHOLDS,
            trust_thresholds: crate::story::pack::DEFAULT_TIER_THRESHOLDS,
        }],
        npc_reaction_policies: vec![NpcReactionPolicy {
            npc_id: "npc_mika".to_string(),
            rules: vec![
                NpcReactionRule {
                    tier: TierLabel::Neutral,
                    source: ReactionSource::Fallback,
                    effects: vec![npc_effect("npc_mika", "trust", -1, 0)],
                    narrative_hint: Some("Mika watches you drift and says nothing.".to_string()),
                },
                NpcReactionRule {
                    tier: TierLabel::Warm,
                    source: ReactionSource::Choice,
                    effects: vec![npc_effect("npc_mika", "trust", 2, 0)],
                    narrative_hint: Some("Mika leans in, clearly pleased.".to_string()),
                },
            ],
        }],
        fallback_policy: Default::default(),
        ending_policy: Default::default(),
        run_config: Default::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_pack_validates() {
        assert!(campus_week_pack().validate().is_ok());
    }

    #[test]
    fn register_and_get_versions() {
        let catalog = StoryCatalog::new();
        let v1 = catalog.register(campus_week_pack()).unwrap();
        let v2 = catalog.register(campus_week_pack()).unwrap();
        assert_eq!((v1, v2), (1, 2));

        let (latest, _) = catalog.get("campus_week_v1", None).unwrap();
        assert_eq!(latest, 2);
        let (pinned, _) = catalog.get("campus_week_v1", Some(1)).unwrap();
        assert_eq!(pinned, 1);
        assert!(matches!(
            catalog.get("campus_week_v1", Some(9)),
            Err(CatalogError::VersionNotFound { .. })
        ));
        assert!(matches!(
            catalog.get("missing", None),
            Err(CatalogError::StoryNotFound(_))
        ));
    }

    #[test]
    fn invalidate_removes_story() {
        let catalog = StoryCatalog::with_builtin();
        assert!(catalog.get("campus_week_v1", None).is_ok());
        catalog.invalidate("campus_week_v1");
        assert!(catalog.get("campus_week_v1", None).is_err());
    }

    #[test]
    fn invalid_pack_is_rejected() {
        let mut pack = campus_week_pack();
        pack.start_node_id = "n_missing".to_string();
        let catalog = StoryCatalog::new();
        assert!(catalog.register(pack).is_err());
    }
}
