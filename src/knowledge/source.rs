//! Read-only snippet store adapters.
//!
//! A [`SnippetStore`] gives the resolver enumerable access to each tier's
//! collection. Adapters are side-effect-free and do no caching of their
//! own.
//!
//! The filesystem layout mirrors a dot-directory of markdown files, one
//! directory per tier:
//!
//! ```text
//! .conductor/knowledge/
//! ├── error-style.md       # name = file stem
//! └── testing.md
//! ```
//!
//! A snippet file may open with a YAML front-matter block:
//!
//! ```text
//! ---
//! title: Error handling style
//! category: conventions
//! tags: [errors, style]
//! ---
//! Use typed errors at subsystem boundaries.
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use super::{Snippet, Tier};
use crate::errors::KnowledgeError;

/// Filename extension for snippet files.
const SNIPPET_EXT: &str = "md";

/// Read-only access to one named snippet collection per tier.
pub trait SnippetStore: Send + Sync {
    /// Enumerate a tier's snippets. A missing tier is empty, not an
    /// error; a tier that exists but cannot be read fails with
    /// [`KnowledgeError::TierUnavailable`].
    fn list(&self, tier: Tier) -> Result<Vec<Snippet>, KnowledgeError>;

    /// Fetch a single snippet by name.
    fn get(&self, tier: Tier, name: &str) -> Result<Snippet, KnowledgeError>;
}

#[derive(Debug, Deserialize, Default)]
struct FrontMatter {
    title: Option<String>,
    category: Option<String>,
    tags: Option<Vec<String>>,
}

/// Split an optional `---` delimited YAML front-matter block off the top
/// of a snippet file. Returns the parsed header and the remaining body.
fn split_front_matter(path: &Path, content: &str) -> Result<(FrontMatter, String), KnowledgeError> {
    let Some(rest) = content.strip_prefix("---\n") else {
        return Ok((FrontMatter::default(), content.to_string()));
    };
    let Some(end) = rest.find("\n---") else {
        return Ok((FrontMatter::default(), content.to_string()));
    };
    let header = &rest[..end];
    let body = rest[end + 4..].trim_start_matches('\n').to_string();
    let matter: FrontMatter =
        serde_yaml::from_str(header).map_err(|source| KnowledgeError::BadFrontMatter {
            path: path.to_path_buf(),
            source,
        })?;
    Ok((matter, body))
}

/// Filesystem-backed snippet store: one directory of `<name>.md` files per
/// configured tier. Enumeration is sorted by file name, so iteration order
/// is deterministic.
#[derive(Debug, Default)]
pub struct DirStore {
    roots: HashMap<Tier, PathBuf>,
}

impl DirStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the directory backing a tier. Unregistered tiers are
    /// treated as empty.
    pub fn with_tier(mut self, tier: Tier, root: impl Into<PathBuf>) -> Self {
        self.roots.insert(tier, root.into());
        self
    }

    fn load_file(&self, tier: Tier, path: &Path) -> Result<Snippet, KnowledgeError> {
        let content = std::fs::read_to_string(path).map_err(|source| {
            KnowledgeError::TierUnavailable { tier, source }
        })?;
        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let (matter, body) = split_front_matter(path, &content)?;
        Ok(Snippet {
            title: matter.title.unwrap_or_else(|| name.clone()),
            name,
            category: matter.category.unwrap_or_else(|| "general".to_string()),
            tags: matter.tags.unwrap_or_default(),
            body,
            tier,
        })
    }
}

impl SnippetStore for DirStore {
    fn list(&self, tier: Tier) -> Result<Vec<Snippet>, KnowledgeError> {
        let Some(root) = self.roots.get(&tier) else {
            return Ok(Vec::new());
        };
        if !root.exists() {
            return Ok(Vec::new());
        }

        let entries =
            std::fs::read_dir(root).map_err(|source| KnowledgeError::TierUnavailable {
                tier,
                source,
            })?;

        let mut paths: Vec<PathBuf> = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| KnowledgeError::TierUnavailable { tier, source })?;
            let path = entry.path();
            if path.is_file() && path.extension().is_some_and(|e| e == SNIPPET_EXT) {
                paths.push(path);
            }
        }
        paths.sort();

        paths
            .iter()
            .map(|path| self.load_file(tier, path))
            .collect()
    }

    fn get(&self, tier: Tier, name: &str) -> Result<Snippet, KnowledgeError> {
        let path = self
            .roots
            .get(&tier)
            .map(|root| root.join(format!("{}.{}", name, SNIPPET_EXT)));
        match path {
            Some(path) if path.is_file() => self.load_file(tier, &path),
            _ => Err(KnowledgeError::SnippetNotFound {
                tier,
                name: name.to_string(),
            }),
        }
    }
}

/// In-memory snippet store for tests and embedders. Enumeration order is
/// insertion order, which makes the resolver's last-writer rule directly
/// observable.
#[derive(Debug, Default)]
pub struct MemoryStore {
    snippets: HashMap<Tier, Vec<Snippet>>,
    unavailable: Vec<Tier>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, snippet: Snippet) {
        self.snippets.entry(snippet.tier).or_default().push(snippet);
    }

    /// Mark a tier as failing enumeration, for error-path tests.
    pub fn mark_unavailable(&mut self, tier: Tier) {
        self.unavailable.push(tier);
    }
}

impl SnippetStore for MemoryStore {
    fn list(&self, tier: Tier) -> Result<Vec<Snippet>, KnowledgeError> {
        if self.unavailable.contains(&tier) {
            return Err(KnowledgeError::TierUnavailable {
                tier,
                source: std::io::Error::other("tier marked unavailable"),
            });
        }
        Ok(self.snippets.get(&tier).cloned().unwrap_or_default())
    }

    fn get(&self, tier: Tier, name: &str) -> Result<Snippet, KnowledgeError> {
        self.list(tier)?
            .into_iter()
            .rev()
            .find(|s| s.name == name)
            .ok_or_else(|| KnowledgeError::SnippetNotFound {
                tier,
                name: name.to_string(),
            })
    }
}
