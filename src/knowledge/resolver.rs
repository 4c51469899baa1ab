//! Knowledge resolution: merge all tiers into one addressable view.

use std::collections::BTreeMap;
use std::sync::Arc;

use super::{Snippet, SnippetStore, Tier};
use crate::errors::KnowledgeError;

/// Merges the tier collections into a single flattened mapping with
/// override semantics `LOCAL > PROJECT > ORG > BUILT_IN`.
///
/// Resolution is deterministic: identical inputs always yield identical
/// output. Within one tier, snippets are applied in store enumeration
/// order and the last writer wins, an explicit rule rather than silent
/// ambiguity. `DirStore` enumerates lexicographically, so on a filesystem
/// tier the rule never depends on readdir ordering.
#[derive(Clone)]
pub struct KnowledgeResolver {
    store: Arc<dyn SnippetStore>,
}

impl KnowledgeResolver {
    pub fn new(store: Arc<dyn SnippetStore>) -> Self {
        Self { store }
    }

    /// Produce the flattened name → snippet view. Tiers are overlaid from
    /// lowest to highest priority, so the final value for any name comes
    /// from the highest-priority tier that defines it.
    pub fn resolve(&self) -> Result<BTreeMap<String, Snippet>, KnowledgeError> {
        let mut resolved = BTreeMap::new();
        for tier in Tier::ASCENDING {
            for snippet in self.store.list(tier)? {
                resolved.insert(snippet.name.clone(), snippet);
            }
        }
        Ok(resolved)
    }

    /// Produce the tier-annotated view: every same-named snippet across
    /// all tiers, ordered highest-priority first, so `[0]` is the
    /// effective value and the rest are what it overrides.
    pub fn resolve_annotated(&self) -> Result<BTreeMap<String, Vec<Snippet>>, KnowledgeError> {
        let mut layers: BTreeMap<String, Vec<Snippet>> = BTreeMap::new();
        for tier in Tier::ASCENDING {
            for snippet in self.store.list(tier)? {
                // Ascending insertion then reversal puts the winner first,
                // including the within-tier last-writer.
                layers.entry(snippet.name.clone()).or_default().push(snippet);
            }
        }
        for stack in layers.values_mut() {
            stack.reverse();
        }
        Ok(layers)
    }

    /// Fetch the effective snippet for one name, honoring overrides.
    pub fn lookup(&self, name: &str) -> Result<Option<Snippet>, KnowledgeError> {
        Ok(self.resolve()?.remove(name))
    }
}

/// Render a resolved view into a markdown section for agent prompts.
/// Returns an empty string when there is nothing to inject.
pub fn context_block(resolved: &BTreeMap<String, Snippet>) -> String {
    if resolved.is_empty() {
        return String::new();
    }

    let sections: Vec<String> = resolved
        .values()
        .map(|s| format!("### {} [{}]\n\n{}", s.title, s.tier, s.body.trim()))
        .collect();

    format!(
        "## PROJECT KNOWLEDGE\n\nThe following guidance applies to this session:\n\n{}\n",
        sections.join("\n\n---\n\n")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::knowledge::MemoryStore;

    fn resolver(store: MemoryStore) -> KnowledgeResolver {
        KnowledgeResolver::new(Arc::new(store))
    }

    #[test]
    fn higher_tier_overrides_lower() {
        let mut store = MemoryStore::new();
        store.insert(Snippet::new("foo", "built-in version", Tier::BuiltIn));
        store.insert(Snippet::new("foo", "project version", Tier::Project));

        let resolved = resolver(store).resolve().unwrap();
        assert_eq!(resolved["foo"].body, "project version");
        assert_eq!(resolved["foo"].tier, Tier::Project);
    }

    #[test]
    fn override_is_independent_of_insertion_order() {
        // Same collision, tiers populated in the opposite order.
        let mut store = MemoryStore::new();
        store.insert(Snippet::new("foo", "project version", Tier::Project));
        store.insert(Snippet::new("foo", "built-in version", Tier::BuiltIn));

        let resolved = resolver(store).resolve().unwrap();
        assert_eq!(resolved["foo"].tier, Tier::Project);
    }

    #[test]
    fn local_beats_everything() {
        let mut store = MemoryStore::new();
        store.insert(Snippet::new("style", "b", Tier::BuiltIn));
        store.insert(Snippet::new("style", "o", Tier::Org));
        store.insert(Snippet::new("style", "p", Tier::Project));
        store.insert(Snippet::new("style", "l", Tier::Local));

        let resolved = resolver(store).resolve().unwrap();
        assert_eq!(resolved["style"].tier, Tier::Local);
    }

    #[test]
    fn non_colliding_names_all_appear() {
        let mut store = MemoryStore::new();
        store.insert(Snippet::new("a", "1", Tier::BuiltIn));
        store.insert(Snippet::new("b", "2", Tier::Org));
        store.insert(Snippet::new("c", "3", Tier::Local));

        let resolved = resolver(store).resolve().unwrap();
        assert_eq!(resolved.len(), 3);
    }

    #[test]
    fn same_tier_duplicate_last_writer_wins() {
        let mut store = MemoryStore::new();
        store.insert(Snippet::new("dup", "first", Tier::Project));
        store.insert(Snippet::new("dup", "second", Tier::Project));

        let resolved = resolver(store).resolve().unwrap();
        assert_eq!(resolved["dup"].body, "second");
    }

    #[test]
    fn unavailable_tier_fails_resolution() {
        let mut store = MemoryStore::new();
        store.insert(Snippet::new("a", "1", Tier::Local));
        store.mark_unavailable(Tier::Org);

        let err = resolver(store).resolve().unwrap_err();
        assert!(matches!(
            err,
            KnowledgeError::TierUnavailable { tier: Tier::Org, .. }
        ));
    }

    #[test]
    fn empty_tiers_resolve_to_empty_view() {
        let resolved = resolver(MemoryStore::new()).resolve().unwrap();
        assert!(resolved.is_empty());
    }

    #[test]
    fn annotated_view_orders_winner_first() {
        let mut store = MemoryStore::new();
        store.insert(Snippet::new("foo", "built-in version", Tier::BuiltIn));
        store.insert(Snippet::new("foo", "org version", Tier::Org));
        store.insert(Snippet::new("foo", "local version", Tier::Local));
        store.insert(Snippet::new("solo", "only one", Tier::Project));

        let layers = resolver(store).resolve_annotated().unwrap();
        let tiers: Vec<Tier> = layers["foo"].iter().map(|s| s.tier).collect();
        assert_eq!(tiers, vec![Tier::Local, Tier::Org, Tier::BuiltIn]);
        assert_eq!(layers["solo"].len(), 1);
    }

    #[test]
    fn annotated_and_flattened_views_agree_on_the_winner() {
        let mut store = MemoryStore::new();
        store.insert(Snippet::new("foo", "b", Tier::BuiltIn));
        store.insert(Snippet::new("foo", "p", Tier::Project));

        let r = resolver(store);
        let flat = r.resolve().unwrap();
        let layers = r.resolve_annotated().unwrap();
        assert_eq!(flat["foo"], layers["foo"][0]);
    }

    #[test]
    fn lookup_returns_effective_snippet() {
        let mut store = MemoryStore::new();
        store.insert(Snippet::new("foo", "b", Tier::BuiltIn));
        store.insert(Snippet::new("foo", "l", Tier::Local));

        let r = resolver(store);
        assert_eq!(r.lookup("foo").unwrap().unwrap().body, "l");
        assert!(r.lookup("absent").unwrap().is_none());
    }

    #[test]
    fn context_block_renders_titles_and_tiers() {
        let mut store = MemoryStore::new();
        store.insert(Snippet::new("testing", "Write failing tests first.", Tier::Org));

        let resolved = resolver(store).resolve().unwrap();
        let block = context_block(&resolved);
        assert!(block.contains("## PROJECT KNOWLEDGE"));
        assert!(block.contains("### testing [org]"));
        assert!(block.contains("Write failing tests first."));
    }

    #[test]
    fn context_block_is_empty_for_empty_view() {
        assert!(context_block(&BTreeMap::new()).is_empty());
    }
}
