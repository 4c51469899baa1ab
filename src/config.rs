//! Runtime configuration.
//!
//! Reads `.conductor/conductor.toml` under the project directory, layered
//! file → environment → CLI. Everything has a sensible default, so a bare
//! project works without any config file at all.
//!
//! # Configuration File Format
//!
//! ```toml
//! [agent]
//! command = "claude"
//! args = ["--print"]
//! max_iterations = 32
//!
//! [server]
//! port = 4400
//! event_buffer = 64
//!
//! [knowledge]
//! local = ".conductor/knowledge"
//! project = "knowledge"
//! org = "~/.conductor/knowledge"
//! built_in = "/usr/share/conductor/knowledge"
//! ```

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::knowledge::{DirStore, Tier};

/// Directory under the project root that holds conductor state.
pub const CONDUCTOR_DIR: &str = ".conductor";

/// Config file name within [`CONDUCTOR_DIR`].
pub const CONFIG_FILE: &str = "conductor.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Command used to invoke the external coding agent.
    #[serde(default = "default_agent_command")]
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Agent invocations allowed per drive before the session is parked
    /// in `error`.
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            command: default_agent_command(),
            args: Vec::new(),
            max_iterations: default_max_iterations(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    /// Per-subscriber progress buffer capacity.
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            event_buffer: default_event_buffer(),
        }
    }
}

/// Per-tier knowledge directories. Relative paths are resolved against
/// the project directory; `~` expands to the home directory.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KnowledgeConfig {
    #[serde(default)]
    pub local: Option<String>,
    #[serde(default)]
    pub project: Option<String>,
    #[serde(default)]
    pub org: Option<String>,
    #[serde(default)]
    pub built_in: Option<String>,
}

fn default_agent_command() -> String {
    "claude".to_string()
}

fn default_max_iterations() -> u32 {
    32
}

fn default_port() -> u16 {
    4400
}

fn default_event_buffer() -> usize {
    64
}

/// The on-disk shape of `conductor.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub knowledge: KnowledgeConfig,
}

/// Resolved runtime configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub project_dir: PathBuf,
    /// Where session records live.
    pub data_dir: PathBuf,
    pub agent: AgentConfig,
    pub server: ServerConfig,
    knowledge: KnowledgeConfig,
}

impl Config {
    /// Load configuration for a project directory. A missing config file
    /// yields the defaults; a malformed one is an error.
    pub fn load(project_dir: impl Into<PathBuf>) -> Result<Self> {
        let project_dir = project_dir.into();
        let path = project_dir.join(CONDUCTOR_DIR).join(CONFIG_FILE);

        let file: ConfigFile = if path.exists() {
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            toml::from_str(&raw).with_context(|| format!("Failed to parse {}", path.display()))?
        } else {
            ConfigFile::default()
        };

        let mut config = Self {
            data_dir: project_dir.join(CONDUCTOR_DIR).join("sessions"),
            project_dir,
            agent: file.agent,
            server: file.server,
            knowledge: file.knowledge,
        };

        if let Ok(cmd) = std::env::var("CONDUCTOR_AGENT_CMD") {
            config.agent.command = cmd;
        }

        Ok(config)
    }

    fn resolve_path(&self, raw: &str) -> PathBuf {
        if let Some(stripped) = raw.strip_prefix("~/") {
            if let Some(home) = dirs::home_dir() {
                return home.join(stripped);
            }
        }
        let path = PathBuf::from(raw);
        if path.is_absolute() {
            path
        } else {
            self.project_dir.join(path)
        }
    }

    fn tier_dir(&self, tier: Tier) -> Option<PathBuf> {
        let configured = match tier {
            Tier::Local => self.knowledge.local.as_deref(),
            Tier::Project => self.knowledge.project.as_deref(),
            Tier::Org => self.knowledge.org.as_deref(),
            Tier::BuiltIn => self.knowledge.built_in.as_deref(),
        };
        if let Some(raw) = configured {
            return Some(self.resolve_path(raw));
        }
        // Defaults: local overrides live in the dot-directory, the
        // project tier is committed alongside the code, and the org tier
        // is shared per user. There is no default built-in directory.
        match tier {
            Tier::Local => Some(self.project_dir.join(CONDUCTOR_DIR).join("knowledge")),
            Tier::Project => Some(self.project_dir.join("knowledge")),
            Tier::Org => dirs::home_dir().map(|h| h.join(CONDUCTOR_DIR).join("knowledge")),
            Tier::BuiltIn => None,
        }
    }

    /// Build the snippet store over the configured tier directories.
    pub fn snippet_store(&self) -> DirStore {
        let mut store = DirStore::new();
        for tier in Tier::ASCENDING {
            if let Some(dir) = self.tier_dir(tier) {
                store = store.with_tier(tier, dir);
            }
        }
        store
    }

    pub fn ensure_directories(&self) -> Result<()> {
        std::fs::create_dir_all(&self.data_dir).with_context(|| {
            format!("Failed to create data directory {}", self.data_dir.display())
        })?;
        Ok(())
    }
}
