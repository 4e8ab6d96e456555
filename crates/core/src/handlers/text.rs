//! Plain-text handling through the line merge.

use tracing::warn;

use super::FileTypeHandler;
use crate::errors::MergeError;
use crate::merge::{ConflictKind, ConflictReport, MergeOrder, Side, TextMerger};

/// Fallback handler: line-based merge for anything no tree handler claims.
#[derive(Debug, Clone, Default)]
pub struct TextFileHandler {
    extensions: Vec<String>,
}

impl TextFileHandler {
    pub fn new() -> Self {
        Self::default()
    }
}

impl FileTypeHandler for TextFileHandler {
    fn name(&self) -> &str {
        "text"
    }

    fn extensions(&self) -> &[String] {
        &self.extensions
    }

    fn can_diff_file(&self, _path: &std::path::Path) -> bool {
        true
    }

    fn can_merge_file(&self, _path: &std::path::Path) -> bool {
        true
    }

    fn validate(&self, _contents: &str) -> Result<(), String> {
        Ok(())
    }

    fn do_three_way_merge(&self, order: &mut MergeOrder<'_>) -> Result<(), MergeError> {
        let label = order.ours_path.display().to_string();
        let ours = std::fs::read(&order.ours_path)?;
        let theirs = std::fs::read(&order.theirs_path)?;
        let ancestor = match std::fs::read(&order.ancestor_path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };

        match (
            std::str::from_utf8(&ancestor),
            std::str::from_utf8(&ours),
            std::str::from_utf8(&theirs),
        ) {
            (Ok(a), Ok(o), Ok(t)) => {
                let merged = TextMerger::merge(&label, a, o, t, &order.situation, order.sink);
                if merged.as_bytes() != ours.as_slice() {
                    std::fs::write(&order.ours_path, merged)?;
                }
            }
            _ => {
                // Binary content: keep ours or take theirs whole.
                if ours == ancestor {
                    std::fs::write(&order.ours_path, &theirs)?;
                } else if theirs != ancestor && theirs != ours {
                    let winner = order.situation.winner();
                    warn!(file = %label, winner = %winner, "binary file changed on both sides");
                    if winner == Side::Theirs {
                        std::fs::write(&order.ours_path, &theirs)?;
                    }
                    order.sink.conflict_occurred(ConflictReport::new(
                        ConflictKind::BothEditedFile,
                        label,
                        "",
                        "",
                        winner,
                        &order.situation,
                    ));
                }
            }
        }
        Ok(())
    }
}
