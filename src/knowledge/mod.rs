//! Tiered knowledge snippets.
//!
//! Snippets are immutable content blobs sourced from four prioritized
//! tiers. Names are unique within a tier but collide across tiers on
//! purpose: a higher-priority tier overrides a lower one, which is how a
//! project customizes organization-wide or built-in guidance.

pub mod resolver;
pub mod source;

pub use resolver::KnowledgeResolver;
pub use source::{DirStore, MemoryStore, SnippetStore};

use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Source tier of a snippet, in strict priority order:
/// `LOCAL > PROJECT > ORG > BUILT_IN`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Local,
    Project,
    Org,
    BuiltIn,
}

impl Tier {
    /// All tiers from lowest to highest priority. The resolver overlays
    /// them in this order so later writes win.
    pub const ASCENDING: [Tier; 4] = [Tier::BuiltIn, Tier::Org, Tier::Project, Tier::Local];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Project => "project",
            Self::Org => "org",
            Self::BuiltIn => "built_in",
        }
    }

    /// Numeric priority; higher wins on name collisions.
    pub fn priority(&self) -> u8 {
        match self {
            Self::BuiltIn => 0,
            Self::Org => 1,
            Self::Project => 2,
            Self::Local => 3,
        }
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Tier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "local" => Ok(Self::Local),
            "project" => Ok(Self::Project),
            "org" => Ok(Self::Org),
            "built_in" => Ok(Self::BuiltIn),
            _ => Err(format!("Invalid knowledge tier: {}", s)),
        }
    }
}

/// An immutable knowledge snippet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snippet {
    /// Stable name, unique within a tier.
    pub name: String,
    pub title: String,
    pub category: String,
    pub tags: Vec<String>,
    pub body: String,
    pub tier: Tier,
}

impl Snippet {
    pub fn new(name: impl Into<String>, body: impl Into<String>, tier: Tier) -> Self {
        let name = name.into();
        Self {
            title: name.clone(),
            name,
            category: "general".to_string(),
            tags: Vec::new(),
            body: body.into(),
            tier,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tier_roundtrips_through_str() {
        for tier in Tier::ASCENDING {
            assert_eq!(tier.as_str().parse::<Tier>(), Ok(tier));
        }
        assert!("global".parse::<Tier>().is_err());
    }

    #[test]
    fn ascending_order_matches_priority() {
        let priorities: Vec<u8> = Tier::ASCENDING.iter().map(|t| t.priority()).collect();
        assert_eq!(priorities, vec![0, 1, 2, 3]);
        assert!(Tier::Local.priority() > Tier::Project.priority());
        assert!(Tier::Project.priority() > Tier::Org.priority());
        assert!(Tier::Org.priority() > Tier::BuiltIn.priority());
    }

    #[test]
    fn snippet_new_defaults_title_to_name() {
        let snippet = Snippet::new("error-style", "Use thiserror.", Tier::Project);
        assert_eq!(snippet.title, "error-style");
        assert_eq!(snippet.category, "general");
        assert!(snippet.tags.is_empty());
    }

    #[test]
    fn tier_serializes_snake_case() {
        assert_eq!(serde_json::to_string(&Tier::BuiltIn).unwrap(), "\"built_in\"");
    }
}
