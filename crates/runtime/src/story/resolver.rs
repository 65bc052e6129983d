//! Effective-asset resolution and per-request pack indices.
//!
//! `ResolvedPack` is the read-only view the pipeline works against: defaults
//! merged with overrides, endings ordered for trigger evaluation, and id
//! indices for O(1) lookup.

use std::collections::HashMap;
use std::sync::Arc;

use crate::story::defaults::{default_endings, default_fallbacks};
use crate::story::pack::{
    EndingDef, GlobalFallback, NpcDef, NpcReactionPolicy, SceneNode, StoryPack,
};

/// Merge built-in defaults with pack overrides, by id. Override order:
/// defaults → `global_fallbacks` → `fallback_policy.fallback_overrides`
/// (endings analogously). Later entries replace earlier ones with the same id.
pub fn effective_assets(pack: &StoryPack) -> (Vec<GlobalFallback>, Vec<EndingDef>) {
    let mut fallbacks: Vec<GlobalFallback> = Vec::new();
    let mut fallback_pos: HashMap<String, usize> = HashMap::new();
    let mut push_fallback = |item: GlobalFallback, out: &mut Vec<GlobalFallback>| {
        if let Some(&pos) = fallback_pos.get(&item.fallback_id) {
            out[pos] = item;
        } else {
            fallback_pos.insert(item.fallback_id.clone(), out.len());
            out.push(item);
        }
    };
    if pack.fallback_policy.include_default_fallbacks {
        for item in default_fallbacks() {
            push_fallback(item, &mut fallbacks);
        }
    }
    for item in &pack.global_fallbacks {
        push_fallback(item.clone(), &mut fallbacks);
    }
    for item in &pack.fallback_policy.fallback_overrides {
        push_fallback(item.clone(), &mut fallbacks);
    }

    let mut endings: Vec<EndingDef> = Vec::new();
    let mut ending_pos: HashMap<String, usize> = HashMap::new();
    let mut push_ending = |item: EndingDef, out: &mut Vec<EndingDef>| {
        if let Some(&pos) = ending_pos.get(&item.ending_id) {
            out[pos] = item;
        } else {
            ending_pos.insert(item.ending_id.clone(), out.len());
            out.push(item);
        }
    };
    if pack.ending_policy.include_default_endings {
        for item in default_endings() {
            push_ending(item, &mut endings);
        }
    }
    for item in &pack.ending_defs {
        push_ending(item.clone(), &mut endings);
    }
    for item in &pack.ending_policy.ending_overrides {
        push_ending(item.clone(), &mut endings);
    }

    (fallbacks, endings)
}

/// Read-only resolved view of a story pack.
#[derive(Clone)]
pub struct ResolvedPack {
    pub pack: Arc<StoryPack>,
    pub effective_fallbacks: Vec<GlobalFallback>,
    /// Sorted ascending by `(priority, ending_id)` for trigger evaluation.
    pub effective_endings: Vec<EndingDef>,
    node_index: HashMap<String, usize>,
    fallback_index: HashMap<String, usize>,
    ending_index: HashMap<String, usize>,
    npc_index: HashMap<String, usize>,
    reaction_index: HashMap<String, usize>,
}

impl ResolvedPack {
    pub fn resolve(pack: Arc<StoryPack>) -> Self {
        let (effective_fallbacks, mut effective_endings) = effective_assets(&pack);
        effective_endings.sort_by(|a, b| {
            (a.priority, a.ending_id.as_str()).cmp(&(b.priority, b.ending_id.as_str()))
        });

        let node_index = pack
            .nodes
            .iter()
            .enumerate()
            .map(|(i, n)| (n.node_id.clone(), i))
            .collect();
        let fallback_index = effective_fallbacks
            .iter()
            .enumerate()
            .map(|(i, f)| (f.fallback_id.clone(), i))
            .collect();
        let ending_index = effective_endings
            .iter()
            .enumerate()
            .map(|(i, e)| (e.ending_id.clone(), i))
            .collect();
        let npc_index = pack
            .npc_defs
            .iter()
            .enumerate()
            .map(|(i, n)| (n.npc_id.clone(), i))
            .collect();
        let reaction_index = pack
            .npc_reaction_policies
            .iter()
            .enumerate()
            .map(|(i, p)| (p.npc_id.clone(), i))
            .collect();

        Self {
            pack,
            effective_fallbacks,
            effective_endings,
            node_index,
            fallback_index,
            ending_index,
            npc_index,
            reaction_index,
        }
    }

    pub fn node(&self, node_id: &str) -> Option<&SceneNode> {
        self.node_index.get(node_id).map(|&i| &self.pack.nodes[i])
    }

    pub fn fallback(&self, fallback_id: &str) -> Option<&GlobalFallback> {
        self.fallback_index
            .get(fallback_id)
            .map(|&i| &self.effective_fallbacks[i])
    }

    pub fn ending(&self, ending_id: &str) -> Option<&EndingDef> {
        self.ending_index
            .get(ending_id)
            .map(|&i| &self.effective_endings[i])
    }

    pub fn npc_def(&self, npc_id: &str) -> Option<&NpcDef> {
        self.npc_index.get(npc_id).map(|&i| &self.pack.npc_defs[i])
    }

    pub fn reaction_policy(&self, npc_id: &str) -> Option<&NpcReactionPolicy> {
        self.reaction_index
            .get(npc_id)
            .map(|&i| &self.pack.npc_reaction_policies[i])
    }

    /// Node fallbacks return players here when a fallback has no explicit
    /// target: `n_hub` by convention, else the start node.
    pub fn hub_node_id(&self) -> &str {
        if self.node_index.contains_key("n_hub") {
            "n_hub"
        } else {
            &self.pack.start_node_id
        }
    }

    /// Reactive npc ids for an action, with the single-NPC convenience rule:
    /// when the pack defines exactly one NPC, an empty list means that NPC.
    pub fn resolve_reactive_npc_ids(&self, explicit: &[String]) -> Vec<String> {
        let ids: Vec<String> = explicit
            .iter()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        if !ids.is_empty() {
            return ids;
        }
        if self.pack.npc_defs.len() == 1 {
            return vec![self.pack.npc_defs[0].npc_id.clone()];
        }
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::story::catalog::campus_week_pack;
    use crate::story::pack::{EndingCamp, EndingOutcome, EndingTrigger, FallbackReason};

    #[test]
    fn effective_fallbacks_include_defaults() {
        let pack = Arc::new(campus_week_pack());
        let resolved = ResolvedPack::resolve(pack);
        assert!(resolved.fallback("fb_no_match").is_some());
        assert!(resolved.fallback("fb_off_topic").is_some());
        assert!(resolved.fallback("fb_missing").is_none());
    }

    #[test]
    fn pack_override_replaces_default_by_id() {
        let mut pack = campus_week_pack();
        pack.global_fallbacks.push(GlobalFallback {
            fallback_id: "fb_off_topic".to_string(),
            reason_code: Some(FallbackReason::OffTopic),
            text: "custom override".to_string(),
            mainline_nudge: None,
            prompt_profile_id: None,
            range_effects: Vec::new(),
            target_node_id: None,
            ending_id: None,
            reactive_npc_ids: Vec::new(),
        });
        let resolved = ResolvedPack::resolve(Arc::new(pack));
        let overridden = resolved.fallback("fb_off_topic").unwrap();
        assert_eq!(overridden.text, "custom override");
        // Still exactly one fallback per reason code.
        let count = resolved
            .effective_fallbacks
            .iter()
            .filter(|f| f.reason_code == Some(FallbackReason::OffTopic))
            .count();
        assert_eq!(count, 1);
    }

    #[test]
    fn endings_sorted_by_priority_then_id() {
        let mut pack = campus_week_pack();
        pack.ending_defs.push(EndingDef {
            ending_id: "ending_aaa".to_string(),
            title: "A".to_string(),
            outcome: EndingOutcome::Neutral,
            camp: EndingCamp::World,
            epilogue: String::new(),
            priority: 5,
            trigger: EndingTrigger {
                day_at_least: Some(3),
                ..EndingTrigger::default()
            },
            prompt_profile_id: None,
        });
        let resolved = ResolvedPack::resolve(Arc::new(pack));
        assert_eq!(resolved.effective_endings[0].ending_id, "ending_aaa");
    }

    #[test]
    fn hub_node_preference() {
        let pack = Arc::new(campus_week_pack());
        let resolved = ResolvedPack::resolve(pack);
        assert_eq!(resolved.hub_node_id(), "n_hub");
    }

    #[test]
    fn single_npc_is_implicitly_reactive() {
        let pack = Arc::new(campus_week_pack());
        let resolved = ResolvedPack::resolve(pack);
        let ids = resolved.resolve_reactive_npc_ids(&[]);
        assert_eq!(ids, vec!["npc_mika".to_string()]);
        let explicit = resolved.resolve_reactive_npc_ids(&["npc_mika".to_string()]);
        assert_eq!(explicit, vec!["npc_mika".to_string()]);
    }
}
