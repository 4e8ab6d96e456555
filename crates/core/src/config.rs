//! TOML-based configuration for a treesync peer.
//!
//! One file describes the local repository, the sync policy, the remote
//! sources to exchange revisions with and any extra tree-merge handlers:
//!
//! ```toml
//! [repository]
//! path = "/data/projects/dictionary"
//! user_id = "alice"
//!
//! [sync]
//! conflict_mode = "ours_wins"
//!
//! [[remotes]]
//! name = "server"
//! uri = "https://hub.example.org/dictionary"
//!
//! [[handlers]]
//! name = "lift"
//! extensions = ["lift"]
//! container = "entry"
//! key_attribute = "guid"
//! ```

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::errors::ConfigError;
use crate::merge::ConflictHandlingMode;
use crate::models::RemoteSource;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Top-level configuration loaded from a TOML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    pub repository: RepositoryConfig,

    #[serde(default)]
    pub sync: SyncPolicyConfig,

    /// Remote sources, tried in file order.
    #[serde(default)]
    pub remotes: Vec<RemoteSource>,

    /// Tree-merge handlers in addition to the built-in ones.
    #[serde(default)]
    pub handlers: Vec<HandlerConfig>,
}

// ---------------------------------------------------------------------------
// Repository
// ---------------------------------------------------------------------------

/// The local repository and the identity of the person committing to it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepositoryConfig {
    pub path: PathBuf,

    /// Recorded on every commit and used as "alpha" when merging.
    pub user_id: String,

    /// Only heads on this branch are merged (default "default").
    #[serde(default = "default_branch")]
    pub branch: String,
}

fn default_branch() -> String {
    "default".into()
}

// ---------------------------------------------------------------------------
// Sync policy
// ---------------------------------------------------------------------------

/// Policy knobs for a sync cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncPolicyConfig {
    /// Who wins when both sides change a value differently.
    #[serde(default)]
    pub conflict_mode: ConflictHandlingMode,

    /// Skip the push phase entirely. Useful for tests and dry runs.
    #[serde(default)]
    pub suppress_push: bool,

    /// Files larger than this many bytes are never committed. 0 = unlimited.
    #[serde(default)]
    pub max_file_size: u64,

    /// Globs of files to commit (default everything).
    #[serde(default = "default_include_patterns")]
    pub include_patterns: Vec<String>,

    /// Globs of files never to commit.
    #[serde(default)]
    pub exclude_patterns: Vec<String>,

    /// Heads whose tag contains this marker are never merged.
    #[serde(default = "default_reject_tag")]
    pub reject_tag: String,
}

fn default_include_patterns() -> Vec<String> {
    vec!["**/*".into()]
}

fn default_reject_tag() -> String {
    "[reject]".into()
}

impl Default for SyncPolicyConfig {
    fn default() -> Self {
        Self {
            conflict_mode: ConflictHandlingMode::default(),
            suppress_push: false,
            max_file_size: 0,
            include_patterns: default_include_patterns(),
            exclude_patterns: Vec::new(),
            reject_tag: default_reject_tag(),
        }
    }
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// A tree-merge handler for one file format.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HandlerConfig {
    pub name: String,

    /// File extensions claimed, without the leading dot.
    pub extensions: Vec<String>,

    /// Tag of the repeated record element, e.g. `rt` or `range`.
    pub container: String,

    /// Identifying attribute of the container element.
    #[serde(default)]
    pub key_attribute: Option<String>,

    /// Ordered identifying attributes for all other tags. Empty means the
    /// default `guid`, `id`, `ws`.
    #[serde(default)]
    pub key_candidates: Vec<String>,

    /// Tags merged as one indivisible value.
    #[serde(default)]
    pub atomic: Vec<String>,

    /// Child tags that make a parent holding only such children atomic.
    #[serde(default)]
    pub atomic_containers: Vec<String>,

    /// Declared key attribute per tag.
    #[serde(default)]
    pub keyed: BTreeMap<String, String>,

    /// Largest file this handler accepts, in bytes. 0 = unlimited.
    #[serde(default)]
    pub max_file_size: u64,
}

// ---------------------------------------------------------------------------
// Loading & validation
// ---------------------------------------------------------------------------

impl SyncConfig {
    /// Minimal in-code configuration for `user_id` working in `path`.
    pub fn new(path: impl Into<PathBuf>, user_id: impl Into<String>) -> Self {
        Self {
            repository: RepositoryConfig {
                path: path.into(),
                user_id: user_id.into(),
                branch: default_branch(),
            },
            sync: SyncPolicyConfig::default(),
            remotes: Vec::new(),
            handlers: Vec::new(),
        }
    }

    /// Load configuration from a TOML file.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        info!(path = %path.display(), "loading configuration");

        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()));
        }

        let contents = std::fs::read_to_string(path)?;
        let config: SyncConfig =
            toml::from_str(&contents).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        debug!(
            remotes = config.remotes.len(),
            handlers = config.handlers.len(),
            "configuration parsed successfully"
        );
        Ok(config)
    }

    /// Validate that required fields are present and consistent.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.repository.user_id.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "repository.user_id".into(),
                detail: "user id must not be empty".into(),
            });
        }
        if self.repository.branch.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "repository.branch".into(),
                detail: "branch must not be empty".into(),
            });
        }

        let mut names = HashSet::new();
        for remote in &self.remotes {
            if remote.name.is_empty() {
                return Err(ConfigError::InvalidValue {
                    field: "remotes.name".into(),
                    detail: format!("remote with uri '{}' has no name", remote.uri),
                });
            }
            if !names.insert(remote.name.as_str()) {
                return Err(ConfigError::InvalidValue {
                    field: "remotes.name".into(),
                    detail: format!("duplicate remote name '{}'", remote.name),
                });
            }
        }

        for handler in &self.handlers {
            if handler.extensions.is_empty() {
                return Err(ConfigError::InvalidValue {
                    field: format!("handlers.{}.extensions", handler.name),
                    detail: "handler must claim at least one extension".into(),
                });
            }
            if handler.container.is_empty() {
                return Err(ConfigError::InvalidValue {
                    field: format!("handlers.{}.container", handler.name),
                    detail: "handler must name its container tag".into(),
                });
            }
        }

        Ok(())
    }

    /// Convenience: load and validate in one call.
    pub fn load_and_validate<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config = Self::load_from_file(path)?;
        config.validate()?;
        Ok(config)
    }
}
