//! File-policy enforcement for the commit phase.
//!
//! Provides [`FilePolicy`] which combines the `[sync]` size limit and
//! exclude globs with per-handler size limits and evaluates every pending
//! working-copy file before it is committed.
//!
//! # Decision model
//!
//! | Condition | Decision |
//! |-----------|----------|
//! | Path matches an exclude pattern | `Ignored` |
//! | Size exceeds `max_file_size` (when > 0) | `Oversize` |
//! | Size exceeds the claiming handler's maximum | `Oversize` |
//! | None of the above | `Allow` |

use tracing::{debug, warn};

use crate::config::SyncPolicyConfig;
use crate::handlers::HandlerRegistry;

// ---------------------------------------------------------------------------
// Decision enum
// ---------------------------------------------------------------------------

/// The outcome of evaluating a file against the policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilePolicyDecision {
    Allow,
    Ignored { pattern: String },
    Oversize { size: u64, limit: u64 },
}

impl FilePolicyDecision {
    pub fn is_blocked(&self) -> bool {
        !matches!(self, Self::Allow)
    }

    /// Short label for logging.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Allow => "allow",
            Self::Ignored { .. } => "ignored",
            Self::Oversize { .. } => "oversize",
        }
    }
}

// ---------------------------------------------------------------------------
// FilePolicy
// ---------------------------------------------------------------------------

/// Evaluates candidate files against size limits and exclude patterns.
#[derive(Debug, Clone)]
pub struct FilePolicy {
    /// Maximum allowed file size in bytes. 0 = no limit.
    max_file_size: u64,
    /// Glob patterns to exclude, matched against the relative path.
    ignore_patterns: Vec<String>,
}

impl FilePolicy {
    pub fn new(max_file_size: u64, ignore_patterns: Vec<String>) -> Self {
        Self {
            max_file_size,
            ignore_patterns,
        }
    }

    /// Evaluate a file by path and size, ignoring handler limits.
    pub fn evaluate(&self, rel_path: &str, size: u64) -> FilePolicyDecision {
        for pattern in &self.ignore_patterns {
            if matches_pattern(rel_path, pattern) {
                debug!(path = rel_path, pattern = pattern.as_str(), "file matches exclude pattern");
                return FilePolicyDecision::Ignored {
                    pattern: pattern.clone(),
                };
            }
        }

        if self.max_file_size > 0 && size > self.max_file_size {
            warn!(
                path = rel_path,
                size,
                limit = self.max_file_size,
                "file exceeds max_file_size, not committing it"
            );
            return FilePolicyDecision::Oversize {
                size,
                limit: self.max_file_size,
            };
        }

        FilePolicyDecision::Allow
    }

    /// Evaluate a file, also applying the size limit of the handler that
    /// claims it.
    pub fn evaluate_with_handlers(
        &self,
        rel_path: &str,
        size: u64,
        handlers: &HandlerRegistry,
    ) -> FilePolicyDecision {
        let decision = self.evaluate(rel_path, size);
        if decision.is_blocked() {
            return decision;
        }
        let limit = handlers.handler_for(rel_path).maximum_file_size();
        if size > limit {
            warn!(
                path = rel_path,
                size,
                limit,
                "file is too large for its handler, not committing it"
            );
            return FilePolicyDecision::Oversize { size, limit };
        }
        FilePolicyDecision::Allow
    }
}

/// Test whether `rel_path` matches a glob `pattern`.
///
/// Patterns without a directory part also match at any depth, so `*.bak`
/// excludes `a/b/c.bak`. A leading `**/` also matches top-level files.
pub(crate) fn matches_pattern(rel_path: &str, pattern: &str) -> bool {
    let path = rel_path.replace('\\', "/");
    let pat = pattern.replace('\\', "/");
    if glob_match::glob_match(&pat, &path) {
        return true;
    }
    if let Some(rest) = pat.strip_prefix("**/") {
        return !path.contains('/') && glob_match::glob_match(rest, &path);
    }
    !pat.contains('/') && glob_match::glob_match(&format!("**/{pat}"), &path)
}

// ---------------------------------------------------------------------------
// Construct from SyncPolicyConfig
// ---------------------------------------------------------------------------

impl From<&SyncPolicyConfig> for FilePolicy {
    fn from(sync: &SyncPolicyConfig) -> Self {
        Self::new(sync.max_file_size, sync.exclude_patterns.clone())
    }
}
