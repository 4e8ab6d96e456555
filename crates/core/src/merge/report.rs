//! Change and conflict reports produced by a merge.
//!
//! Reports never block a merge. A [`ChangeReport`] records an accepted,
//! non-conflicting modification. A [`ConflictReport`] records a divergence
//! that was resolved by policy, keeping both the winning and losing values.
//! Kind tags serialize as stable snake_case strings for review tooling.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::situation::{MergeSituation, Side};

// ---------------------------------------------------------------------------
// Kinds
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Addition,
    Deletion,
    Edit,
}

impl std::fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Addition => write!(f, "addition"),
            Self::Deletion => write!(f, "deletion"),
            Self::Edit => write!(f, "edit"),
        }
    }
}

/// Categorisation of a resolved conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictKind {
    BothEditedAttribute,
    BothAddedAttribute,
    EditedVsRemovedAttribute,
    RemovedVsEditedAttribute,
    BothEditedText,
    BothAddedText,
    EditedVsRemovedText,
    RemovedVsEditedText,
    BothEditedElement,
    BothAddedElement,
    EditedVsRemovedElement,
    RemovedVsEditedElement,
    /// Line-based fallback merge could not reconcile the file.
    BothEditedFile,
}

impl std::fmt::Display for ConflictKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tag = match self {
            Self::BothEditedAttribute => "both_edited_attribute",
            Self::BothAddedAttribute => "both_added_attribute",
            Self::EditedVsRemovedAttribute => "edited_vs_removed_attribute",
            Self::RemovedVsEditedAttribute => "removed_vs_edited_attribute",
            Self::BothEditedText => "both_edited_text",
            Self::BothAddedText => "both_added_text",
            Self::EditedVsRemovedText => "edited_vs_removed_text",
            Self::RemovedVsEditedText => "removed_vs_edited_text",
            Self::BothEditedElement => "both_edited_element",
            Self::BothAddedElement => "both_added_element",
            Self::EditedVsRemovedElement => "edited_vs_removed_element",
            Self::RemovedVsEditedElement => "removed_vs_edited_element",
            Self::BothEditedFile => "both_edited_file",
        };
        f.write_str(tag)
    }
}

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeReport {
    pub kind: ChangeKind,
    /// Location of the change, e.g. `languageproject/rt[@guid='x']/@ownerguid`.
    pub path: String,
    pub description: String,
}

impl ChangeReport {
    pub fn new(kind: ChangeKind, path: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            kind,
            path: path.into(),
            description: description.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictReport {
    pub id: Uuid,
    pub kind: ConflictKind,
    pub path: String,
    /// The value kept in the merged result. Empty when the winner removed it.
    pub winning_value: String,
    /// The value that was discarded. Empty when the loser removed it.
    pub losing_value: String,
    pub winner_id: String,
    pub winner_revision: String,
    pub loser_id: String,
    pub loser_revision: String,
}

impl ConflictReport {
    /// Create a conflict with a fresh id, attributing it from `situation`.
    pub fn new(
        kind: ConflictKind,
        path: impl Into<String>,
        winning_value: impl Into<String>,
        losing_value: impl Into<String>,
        winner: Side,
        situation: &MergeSituation,
    ) -> Self {
        let (winner_id, winner_revision) = situation.party(winner);
        let (loser_id, loser_revision) = situation.party(winner.other());
        Self {
            id: Uuid::new_v4(),
            kind,
            path: path.into(),
            winning_value: winning_value.into(),
            losing_value: losing_value.into(),
            winner_id: winner_id.to_string(),
            winner_revision: winner_revision.to_string(),
            loser_id: loser_id.to_string(),
            loser_revision: loser_revision.to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Sinks
// ---------------------------------------------------------------------------

/// Receives reports in encounter order.
pub trait ReportSink {
    fn change_occurred(&mut self, report: ChangeReport);
    fn conflict_occurred(&mut self, report: ConflictReport);
}

/// Collects reports in encounter order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeReports {
    pub changes: Vec<ChangeReport>,
    pub conflicts: Vec<ConflictReport>,
}

impl MergeReports {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty() && self.conflicts.is_empty()
    }

    /// Render the collected reports as pretty-printed JSON.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

impl ReportSink for MergeReports {
    fn change_occurred(&mut self, report: ChangeReport) {
        self.changes.push(report);
    }

    fn conflict_occurred(&mut self, report: ConflictReport) {
        self.conflicts.push(report);
    }
}

/// The reports for one file merged during a sync cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMergeReport {
    /// Repository-relative path of the merged file.
    pub file: String,
    /// Hash of the head that was merged in.
    pub head: String,
    pub changes: Vec<ChangeReport>,
    pub conflicts: Vec<ConflictReport>,
}

impl FileMergeReport {
    pub fn new(file: impl Into<String>, head: impl Into<String>, reports: MergeReports) -> Self {
        Self {
            file: file.into(),
            head: head.into(),
            changes: reports.changes,
            conflicts: reports.conflicts,
        }
    }
}
