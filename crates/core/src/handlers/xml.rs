//! Tree-merge handler for XML record formats.
//!
//! Byte-identical sides short-circuit before parsing. Otherwise the three
//! versions are parsed and handed to [`MergeDriver`], and the merged document
//! is written back over the ours file.

use std::path::Path;

use tracing::{debug, info};

use super::FileTypeHandler;
use crate::config::HandlerConfig;
use crate::errors::{DocumentError, MergeError};
use crate::merge::{IdentityConfig, MergeDriver, MergeOrder};
use crate::xml::Document;

/// Tree-merge handler for an XML record format.
///
/// The format is described by its container tag (the repeated record
/// element) and that element's identifying attribute, e.g. `("range", "id")`
/// or `("rt", "guid")`. Everything else uses the identity configuration.
#[derive(Debug, Clone)]
pub struct XmlFileHandler {
    name: String,
    extensions: Vec<String>,
    container: String,
    identity: IdentityConfig,
    max_file_size: u64,
}

impl XmlFileHandler {
    pub fn new<I, S>(
        name: impl Into<String>,
        extensions: I,
        container: impl Into<String>,
        key_attribute: impl Into<String>,
    ) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let container = container.into();
        Self {
            name: name.into(),
            extensions: extensions
                .into_iter()
                .map(|e| e.into().to_ascii_lowercase())
                .collect(),
            identity: IdentityConfig::new().with_key(container.clone(), key_attribute),
            container,
            max_file_size: u64::MAX,
        }
    }

    /// Replace the identity rules wholesale.
    pub fn with_identity(mut self, identity: IdentityConfig) -> Self {
        self.identity = identity;
        self
    }

    pub fn with_max_file_size(mut self, max_file_size: u64) -> Self {
        self.max_file_size = max_file_size;
        self
    }

    pub fn container(&self) -> &str {
        &self.container
    }

    pub fn identity(&self) -> &IdentityConfig {
        &self.identity
    }
}

impl From<&HandlerConfig> for XmlFileHandler {
    fn from(config: &HandlerConfig) -> Self {
        let mut identity = IdentityConfig::new();
        if !config.key_candidates.is_empty() {
            identity = identity.with_candidates(config.key_candidates.iter().cloned());
        }
        if let Some(key) = &config.key_attribute {
            identity = identity.with_key(config.container.clone(), key.clone());
        }
        for (tag, key) in &config.keyed {
            identity = identity.with_key(tag.clone(), key.clone());
        }
        for tag in &config.atomic {
            identity = identity.with_atomic(tag.clone());
        }
        for tag in &config.atomic_containers {
            identity = identity.with_atomic_container(tag.clone());
        }

        let mut handler = Self {
            name: config.name.clone(),
            extensions: config
                .extensions
                .iter()
                .map(|e| e.trim_start_matches('.').to_ascii_lowercase())
                .collect(),
            container: config.container.clone(),
            identity,
            max_file_size: u64::MAX,
        };
        if config.max_file_size > 0 {
            handler.max_file_size = config.max_file_size;
        }
        handler
    }
}

impl FileTypeHandler for XmlFileHandler {
    fn name(&self) -> &str {
        &self.name
    }

    fn extensions(&self) -> &[String] {
        &self.extensions
    }

    fn validate(&self, contents: &str) -> Result<(), String> {
        Document::parse(contents)
            .map(|_| ())
            .map_err(|e| e.to_string())
    }

    fn do_three_way_merge(&self, order: &mut MergeOrder<'_>) -> Result<(), MergeError> {
        let path_label = order.ours_path.display().to_string();
        let ours_raw = read_input(&order.ours_path)?;
        let theirs_raw = read_input(&order.theirs_path)?;
        let ancestor_raw = match std::fs::read_to_string(&order.ancestor_path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(e.into()),
        };

        if theirs_raw == ancestor_raw {
            debug!(file = %path_label, "theirs unchanged, keeping ours");
            return Ok(());
        }
        if ours_raw == ancestor_raw {
            debug!(file = %path_label, "ours unchanged, taking theirs");
            std::fs::write(&order.ours_path, theirs_raw)?;
            return Ok(());
        }

        let ours = parse_input("ours", &path_label, &ours_raw)?;
        let theirs = parse_input("theirs", &path_label, &theirs_raw)?;
        let ancestor = if ancestor_raw.trim().is_empty() {
            debug!(file = %path_label, "no ancestor, merging against an empty root");
            Document::empty_like(&ours)
        } else {
            parse_input("ancestor", &path_label, &ancestor_raw)?
        };

        info!(handler = %self.name, file = %path_label, "three-way tree merge");
        let result = MergeDriver::merge(
            &ancestor,
            &ours,
            &theirs,
            &self.identity,
            &order.situation,
        );
        std::fs::write(&order.ours_path, result.document.to_xml_string())?;
        result.report_to(order.sink);
        Ok(())
    }

    fn maximum_file_size(&self) -> u64 {
        self.max_file_size
    }
}

fn read_input(path: &Path) -> Result<String, MergeError> {
    Ok(std::fs::read_to_string(path)?)
}

fn parse_input(which: &'static str, path: &str, content: &str) -> Result<Document, MergeError> {
    Document::parse(content).map_err(|source: DocumentError| MergeError::UnreadableInput {
        which,
        path: path.to_string(),
        source,
    })
}
