//! Who is merging with whom, and who wins a tie.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::report::ReportSink;

/// Which side's value survives when both sides changed a value differently.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictHandlingMode {
    /// The locally committing party ("alpha") wins.
    #[default]
    OursWins,
    /// The incoming party ("beta") wins.
    TheirsWins,
}

impl std::fmt::Display for ConflictHandlingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::OursWins => write!(f, "ours_wins"),
            Self::TheirsWins => write!(f, "theirs_wins"),
        }
    }
}

/// One of the two changed versions in a three-way merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Ours,
    Theirs,
}

impl Side {
    pub fn other(self) -> Self {
        match self {
            Self::Ours => Self::Theirs,
            Self::Theirs => Self::Ours,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ours => write!(f, "ours"),
            Self::Theirs => write!(f, "theirs"),
        }
    }
}

/// The parties and policy for one file merge.
///
/// "Alpha" is the party whose working copy receives the result (ours),
/// "beta" the party whose head is being merged in (theirs).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeSituation {
    pub alpha_user_id: String,
    pub alpha_revision: String,
    pub beta_user_id: String,
    pub beta_revision: String,
    pub mode: ConflictHandlingMode,
}

impl MergeSituation {
    pub fn new(
        alpha_user_id: impl Into<String>,
        alpha_revision: impl Into<String>,
        beta_user_id: impl Into<String>,
        beta_revision: impl Into<String>,
        mode: ConflictHandlingMode,
    ) -> Self {
        Self {
            alpha_user_id: alpha_user_id.into(),
            alpha_revision: alpha_revision.into(),
            beta_user_id: beta_user_id.into(),
            beta_revision: beta_revision.into(),
            mode,
        }
    }

    /// The side whose value wins a divergent edit.
    pub fn winner(&self) -> Side {
        match self.mode {
            ConflictHandlingMode::OursWins => Side::Ours,
            ConflictHandlingMode::TheirsWins => Side::Theirs,
        }
    }

    /// User id and revision hash of the given side.
    pub fn party(&self, side: Side) -> (&str, &str) {
        match side {
            Side::Ours => (&self.alpha_user_id, &self.alpha_revision),
            Side::Theirs => (&self.beta_user_id, &self.beta_revision),
        }
    }
}

/// A request to merge one file, created per invocation and discarded after.
///
/// The merged result is written over `ours_path`.
pub struct MergeOrder<'a> {
    pub ours_path: PathBuf,
    pub ancestor_path: PathBuf,
    pub theirs_path: PathBuf,
    pub situation: MergeSituation,
    pub sink: &'a mut dyn ReportSink,
}

impl<'a> MergeOrder<'a> {
    pub fn new(
        ours_path: impl Into<PathBuf>,
        ancestor_path: impl Into<PathBuf>,
        theirs_path: impl Into<PathBuf>,
        situation: MergeSituation,
        sink: &'a mut dyn ReportSink,
    ) -> Self {
        Self {
            ours_path: ours_path.into(),
            ancestor_path: ancestor_path.into(),
            theirs_path: theirs_path.into(),
            situation,
            sink,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_mode_is_ours_wins() {
        assert_eq!(ConflictHandlingMode::default(), ConflictHandlingMode::OursWins);
        assert_eq!(ConflictHandlingMode::TheirsWins.to_string(), "theirs_wins");
    }

    #[test]
    fn test_winner_follows_mode() {
        let mut situation =
            MergeSituation::new("alice", "a1", "bob", "b1", ConflictHandlingMode::OursWins);
        assert_eq!(situation.winner(), Side::Ours);
        assert_eq!(situation.party(situation.winner()), ("alice", "a1"));

        situation.mode = ConflictHandlingMode::TheirsWins;
        assert_eq!(situation.winner(), Side::Theirs);
        assert_eq!(situation.party(situation.winner().other()), ("alice", "a1"));
    }
}
