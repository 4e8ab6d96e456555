//! File-type handlers.
//!
//! A [`FileTypeHandler`] is a fixed merge capability for one file format:
//! can-diff, can-merge, validate and do-merge. The [`HandlerRegistry`] maps
//! file extensions to handlers and is populated once at configuration time.
//! Files no registered handler claims fall back to the line-based
//! [`TextFileHandler`].

mod text;
mod xml;

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use tracing::debug;

pub use text::TextFileHandler;
pub use xml::XmlFileHandler;

use crate::config::HandlerConfig;
use crate::errors::MergeError;
use crate::merge::{IdentityConfig, MergeOrder};

/// The merge capability of one file format.
pub trait FileTypeHandler: Send + Sync {
    fn name(&self) -> &str;

    /// Extensions claimed, lowercase, without the leading dot.
    fn extensions(&self) -> &[String];

    fn can_diff_file(&self, path: &Path) -> bool {
        self.claims(path)
    }

    fn can_merge_file(&self, path: &Path) -> bool {
        self.claims(path)
    }

    /// Check that `contents` is acceptable for commit. Returns a
    /// human-readable reason on failure.
    fn validate(&self, contents: &str) -> Result<(), String>;

    /// Merge the three files named by `order`, writing the result over
    /// `order.ours_path` and reporting through `order.sink`.
    fn do_three_way_merge(&self, order: &mut MergeOrder<'_>) -> Result<(), MergeError>;

    /// Largest file this handler accepts into the repository.
    fn maximum_file_size(&self) -> u64 {
        u64::MAX
    }

    /// Whether the extension of `path` is one this handler claims.
    fn claims(&self, path: &Path) -> bool {
        extension_of(path).is_some_and(|ext| self.extensions().iter().any(|e| *e == ext))
    }
}

/// Lowercased extension of `path`, without the dot.
pub(crate) fn extension_of(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Extension-to-handler map with a text fallback.
pub struct HandlerRegistry {
    by_extension: BTreeMap<String, Arc<dyn FileTypeHandler>>,
    fallback: Arc<dyn FileTypeHandler>,
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl HandlerRegistry {
    /// An empty registry; everything falls back to line merging.
    pub fn new() -> Self {
        Self {
            by_extension: BTreeMap::new(),
            fallback: Arc::new(TextFileHandler::new()),
        }
    }

    /// A registry with the built-in tree formats:
    ///
    /// - `lift-ranges`: `range` records keyed by `id`.
    /// - `fwdata`: `rt` records keyed by `guid`, `CustomField` keyed by
    ///   `name`. `Prop` text properties and `Str`/`AStr` formatted strings
    ///   merge as single values, as do reference containers holding only
    ///   `objsur` elements.
    pub fn with_builtin_handlers() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(XmlFileHandler::new(
            "lift-ranges",
            ["lift-ranges"],
            "range",
            "id",
        )));
        registry.register(Arc::new(
            XmlFileHandler::new("fwdata", ["fwdata"], "rt", "guid").with_identity(
                IdentityConfig::new()
                    .with_key("rt", "guid")
                    .with_key("CustomField", "name")
                    .with_atomic("Prop")
                    .with_atomic("Str")
                    .with_atomic("AStr")
                    .with_atomic_container("objsur"),
            ),
        ));
        registry
    }

    /// Built-in handlers plus one tree handler per configured entry.
    /// Configured handlers replace built-ins claiming the same extension.
    pub fn from_config(handlers: &[HandlerConfig]) -> Self {
        let mut registry = Self::with_builtin_handlers();
        for config in handlers {
            registry.register(Arc::new(XmlFileHandler::from(config)));
        }
        registry
    }

    /// Register `handler` for each extension it claims.
    pub fn register(&mut self, handler: Arc<dyn FileTypeHandler>) {
        for ext in handler.extensions() {
            debug!(extension = %ext, handler = handler.name(), "registering file handler");
            self.by_extension
                .insert(ext.to_ascii_lowercase(), Arc::clone(&handler));
        }
    }

    /// The handler registered for the extension of `rel_path`, or the
    /// text fallback.
    pub fn handler_for(&self, rel_path: &str) -> &dyn FileTypeHandler {
        self.registered_for(rel_path)
            .unwrap_or(self.fallback.as_ref())
    }

    /// The registered handler for `rel_path`, without falling back.
    pub fn registered_for(&self, rel_path: &str) -> Option<&dyn FileTypeHandler> {
        let ext = extension_of(Path::new(rel_path))?;
        self.by_extension.get(&ext).map(|h| h.as_ref())
    }

    /// Registered extensions, sorted.
    pub fn extensions(&self) -> impl Iterator<Item = &str> {
        self.by_extension.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_lookup() {
        let registry = HandlerRegistry::with_builtin_handlers();
        assert_eq!(registry.handler_for("Lexicon.fwdata").name(), "fwdata");
        assert_eq!(registry.handler_for("dir/a.LIFT-RANGES").name(), "lift-ranges");
        assert_eq!(registry.handler_for("notes.txt").name(), "text");
        assert!(registry.registered_for("notes.txt").is_none());
        assert!(registry.registered_for("no_extension").is_none());

        let exts: Vec<&str> = registry.extensions().collect();
        assert_eq!(exts, vec!["fwdata", "lift-ranges"]);
    }

    #[test]
    fn test_can_merge_by_extension() {
        let registry = HandlerRegistry::with_builtin_handlers();
        let handler = registry.handler_for("x.lift-ranges");
        assert!(handler.can_merge_file(Path::new("a/b.lift-ranges")));
        assert!(handler.can_diff_file(Path::new("b.lift-ranges")));
        assert!(!handler.can_merge_file(Path::new("b.lift")));
    }

    #[test]
    fn test_config_overrides_builtin() {
        let registry = HandlerRegistry::from_config(&[HandlerConfig {
            name: "custom-ranges".into(),
            extensions: vec!["lift-ranges".into(), "lift".into()],
            container: "range".into(),
            key_attribute: Some("guid".into()),
            ..Default::default()
        }]);
        assert_eq!(registry.handler_for("a.lift-ranges").name(), "custom-ranges");
        assert_eq!(registry.handler_for("a.lift").name(), "custom-ranges");
        assert_eq!(registry.handler_for("a.fwdata").name(), "fwdata");
    }
}
