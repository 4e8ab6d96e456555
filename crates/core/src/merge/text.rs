//! Line-based fallback merge for files no tree handler claims.
//!
//! Uses `diffy` for the three-way line merge. When the line merge cannot
//! reconcile both sides, the winner's whole file is kept and a single
//! `BothEditedFile` conflict is recorded, so the result never contains
//! conflict markers.

use tracing::{debug, info};

use super::report::{ChangeKind, ChangeReport, ConflictKind, ConflictReport, ReportSink};
use super::situation::{MergeSituation, Side};

/// Stateless line-based merger.
pub struct TextMerger;

impl TextMerger {
    /// Merge `ours` and `theirs` against `ancestor`, reporting to `sink`.
    pub fn merge(
        path: &str,
        ancestor: &str,
        ours: &str,
        theirs: &str,
        situation: &MergeSituation,
        sink: &mut dyn ReportSink,
    ) -> String {
        if ours == ancestor {
            debug!(path, "ours == ancestor, taking theirs");
            return theirs.to_string();
        }
        if theirs == ancestor {
            debug!(path, "theirs == ancestor, keeping ours");
            return ours.to_string();
        }
        if ours == theirs {
            debug!(path, "identical changes on both sides");
            sink.change_occurred(ChangeReport::new(
                ChangeKind::Edit,
                path,
                format!(
                    "{} and {} made the same change",
                    situation.alpha_user_id, situation.beta_user_id
                ),
            ));
            return ours.to_string();
        }

        match diffy::merge(ancestor, ours, theirs) {
            Ok(merged) => {
                info!(path, "clean line merge");
                sink.change_occurred(ChangeReport::new(
                    ChangeKind::Edit,
                    path,
                    format!(
                        "combined line changes from {} and {}",
                        situation.alpha_user_id, situation.beta_user_id
                    ),
                ));
                merged
            }
            Err(_) => {
                let winner = situation.winner();
                let (kept, lost) = match winner {
                    Side::Ours => (ours, theirs),
                    Side::Theirs => (theirs, ours),
                };
                info!(path, winner = %winner, "line merge conflicted, keeping winner's file");
                sink.conflict_occurred(ConflictReport::new(
                    ConflictKind::BothEditedFile,
                    path,
                    kept,
                    lost,
                    winner,
                    situation,
                ));
                kept.to_string()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::merge::report::MergeReports;
    use crate::merge::situation::ConflictHandlingMode;

    fn situation(mode: ConflictHandlingMode) -> MergeSituation {
        MergeSituation::new("alice", "a1", "bob", "b1", mode)
    }

    #[test]
    fn test_fast_paths_are_silent() {
        let mut sink = MergeReports::new();
        let s = situation(ConflictHandlingMode::OursWins);
        assert_eq!(TextMerger::merge("f", "a\n", "a\n", "b\n", &s, &mut sink), "b\n");
        assert_eq!(TextMerger::merge("f", "a\n", "c\n", "a\n", &s, &mut sink), "c\n");
        assert!(sink.is_empty());
    }

    #[test]
    fn test_non_overlapping_edits_combine() {
        let base = "line1\nline2\nline3\nline4\nline5\n";
        let ours = "LINE1\nline2\nline3\nline4\nline5\n";
        let theirs = "line1\nline2\nline3\nline4\nLINE5\n";
        let mut sink = MergeReports::new();
        let merged = TextMerger::merge(
            "notes.txt",
            base,
            ours,
            theirs,
            &situation(ConflictHandlingMode::OursWins),
            &mut sink,
        );
        assert_eq!(merged, "LINE1\nline2\nline3\nline4\nLINE5\n");
        assert!(sink.conflicts.is_empty());
        assert_eq!(sink.changes.len(), 1);
    }

    #[test]
    fn test_conflict_keeps_winner_file() {
        let base = "a\nb\nc\n";
        let ours = "a\nOURS\nc\n";
        let theirs = "a\nTHEIRS\nc\n";

        let mut sink = MergeReports::new();
        let merged = TextMerger::merge(
            "notes.txt",
            base,
            ours,
            theirs,
            &situation(ConflictHandlingMode::OursWins),
            &mut sink,
        );
        assert_eq!(merged, ours);
        assert_eq!(sink.conflicts.len(), 1);
        assert_eq!(sink.conflicts[0].kind, ConflictKind::BothEditedFile);
        assert_eq!(sink.conflicts[0].losing_value, theirs);

        let mut sink = MergeReports::new();
        let merged = TextMerger::merge(
            "notes.txt",
            base,
            ours,
            theirs,
            &situation(ConflictHandlingMode::TheirsWins),
            &mut sink,
        );
        assert_eq!(merged, theirs);
        assert!(!merged.contains("<<<<<<<"));
    }
}
