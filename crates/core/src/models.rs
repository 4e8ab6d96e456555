//! Domain model types shared by the sync coordinator and its backends.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::SyncError;
use crate::merge::FileMergeReport;

// ---------------------------------------------------------------------------
// Revisions
// ---------------------------------------------------------------------------

/// An immutable repository revision as reported by the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Revision {
    /// Repository-local sequence number. Differs between clones.
    pub local_number: u64,
    /// Content hash, identical in every clone.
    pub hash: String,
    pub branch: String,
    pub user_id: String,
    /// Free-form tag; may carry the reject marker.
    #[serde(default)]
    pub tag: String,
    pub summary: String,
    pub date: DateTime<Utc>,
    /// Parent hashes; two for a merge revision.
    #[serde(default)]
    pub parents: Vec<String>,
}

impl Revision {
    /// First twelve characters of the hash, for logs.
    pub fn short_hash(&self) -> &str {
        match self.hash.char_indices().nth(12) {
            Some((end, _)) => &self.hash[..end],
            None => &self.hash,
        }
    }
}

// ---------------------------------------------------------------------------
// Remote sources
// ---------------------------------------------------------------------------

/// How a remote source is reached.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteKind {
    #[default]
    Internet,
    NetworkFolder,
    Usb,
}

impl RemoteKind {
    /// Removable and folder destinations get a fresh clone when no repository
    /// exists there yet.
    pub fn clones_when_missing(&self) -> bool {
        matches!(self, Self::NetworkFolder | Self::Usb)
    }
}

impl std::fmt::Display for RemoteKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Internet => write!(f, "internet"),
            Self::NetworkFolder => write!(f, "network_folder"),
            Self::Usb => write!(f, "usb"),
        }
    }
}

/// A configured peer repository to pull from and push to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteSource {
    pub name: String,
    pub uri: String,
    #[serde(default)]
    pub kind: RemoteKind,
    /// Read-only sources are pulled from but never pushed to.
    #[serde(default)]
    pub read_only: bool,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

impl RemoteSource {
    pub fn new(name: impl Into<String>, uri: impl Into<String>, kind: RemoteKind) -> Self {
        Self {
            name: name.into(),
            uri: uri.into(),
            kind,
            read_only: false,
            enabled: true,
        }
    }

    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }
}

// ---------------------------------------------------------------------------
// Sync cycle state
// ---------------------------------------------------------------------------

/// Phase of a synchronization cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    Idle,
    LocksCleared,
    Committed,
    Pulled,
    HeadsMerged,
    Pushed,
    WorkingCopyUpdated,
    Done,
    Cancelled,
    RollingBack,
    Failed,
}

impl std::fmt::Display for SyncState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::LocksCleared => write!(f, "locks_cleared"),
            Self::Committed => write!(f, "committed"),
            Self::Pulled => write!(f, "pulled"),
            Self::HeadsMerged => write!(f, "heads_merged"),
            Self::Pushed => write!(f, "pushed"),
            Self::WorkingCopyUpdated => write!(f, "working_copy_updated"),
            Self::Done => write!(f, "done"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::RollingBack => write!(f, "rolling_back"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// What a caller wants one cycle to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncOptions {
    /// Commit message for local changes.
    pub checkin_description: String,
    pub do_pull_from_others: bool,
    pub do_merge_with_others: bool,
    pub do_send_to_others: bool,
    /// Sources to pull from and push to, in order.
    pub sources_to_try: Vec<RemoteSource>,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            checkin_description: "sync".to_string(),
            do_pull_from_others: true,
            do_merge_with_others: true,
            do_send_to_others: true,
            sources_to_try: Vec::new(),
        }
    }
}

impl SyncOptions {
    /// Options that try every enabled source from `remotes`.
    pub fn with_sources(checkin_description: impl Into<String>, remotes: &[RemoteSource]) -> Self {
        Self {
            checkin_description: checkin_description.into(),
            sources_to_try: remotes.iter().filter(|r| r.enabled).cloned().collect(),
            ..Default::default()
        }
    }
}

/// Outcome of one synchronization cycle.
#[derive(Debug)]
pub struct SyncResult {
    pub succeeded: bool,
    /// True if any source delivered new revisions.
    pub did_get_changes_from_others: bool,
    pub cancelled: bool,
    pub error: Option<SyncError>,
    /// Per-file merge reports in encounter order.
    pub merge_reports: Vec<FileMergeReport>,
    pub final_state: SyncState,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

impl SyncResult {
    /// Total conflicts recorded across every merged file.
    pub fn conflict_count(&self) -> usize {
        self.merge_reports.iter().map(|r| r.conflicts.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_kind_clone_policy() {
        assert!(RemoteKind::Usb.clones_when_missing());
        assert!(RemoteKind::NetworkFolder.clones_when_missing());
        assert!(!RemoteKind::Internet.clones_when_missing());
        assert_eq!(RemoteKind::NetworkFolder.to_string(), "network_folder");
    }

    #[test]
    fn test_sync_options_skip_disabled_sources() {
        let mut off = RemoteSource::new("off", "mem://off", RemoteKind::Internet);
        off.enabled = false;
        let remotes = vec![
            RemoteSource::new("server", "mem://server", RemoteKind::Internet),
            off,
        ];
        let options = SyncOptions::with_sources("edit", &remotes);
        assert_eq!(options.sources_to_try.len(), 1);
        assert_eq!(options.sources_to_try[0].name, "server");
        assert!(options.do_pull_from_others && options.do_send_to_others);
    }

    #[test]
    fn test_sync_state_display() {
        assert_eq!(SyncState::HeadsMerged.to_string(), "heads_merged");
        assert_eq!(SyncState::WorkingCopyUpdated.to_string(), "working_copy_updated");
    }

    #[test]
    fn test_short_hash() {
        let rev = Revision {
            local_number: 0,
            hash: "0123456789abcdef".into(),
            branch: "default".into(),
            user_id: "alice".into(),
            tag: String::new(),
            summary: "initial".into(),
            date: Utc::now(),
            parents: vec![],
        };
        assert_eq!(rev.short_hash(), "0123456789ab");

        let short = Revision {
            hash: "abc".into(),
            ..rev.clone()
        };
        assert_eq!(short.short_hash(), "abc");

        // Multi-byte characters straddling byte 12 must not split.
        let wide = Revision {
            hash: "ééééééééééééé".into(),
            ..rev
        };
        assert_eq!(wide.short_hash(), "éééééééééééé");
    }
}
