//! Error types for the treesync core library.
//!
//! Each subsystem has its own error type derived with `thiserror`, and a
//! top-level [`CoreError`] enum unifies them all for callers that want a
//! single error type.
//!
//! Structural divergence between document versions is never an error: it is
//! always recorded as a conflict report. The types here cover I/O, backend,
//! validation and configuration failures only.

use thiserror::Error;

// ---------------------------------------------------------------------------
// Top-level error
// ---------------------------------------------------------------------------

/// Unified error type for the entire core library.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Document(#[from] DocumentError),

    #[error(transparent)]
    Merge(#[from] MergeError),

    #[error(transparent)]
    Vcs(#[from] VcsError),

    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

// ---------------------------------------------------------------------------
// Document errors
// ---------------------------------------------------------------------------

/// Errors reading or writing an XML tree document.
#[derive(Debug, Error)]
pub enum DocumentError {
    /// The input is not well-formed XML.
    #[error("malformed xml at byte {position}: {detail}")]
    Malformed { position: usize, detail: String },

    /// The input ended while elements were still open.
    #[error("unexpected end of document, <{0}> is not closed")]
    Unclosed(String),

    /// The input contains no root element.
    #[error("document has no root element")]
    NoRoot,

    /// Generic I/O wrapper.
    #[error("document I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Merge errors
// ---------------------------------------------------------------------------

/// Errors that stop a single file merge from running at all.
#[derive(Debug, Error)]
pub enum MergeError {
    /// One of the three input documents could not be read.
    #[error("cannot read {which} version of '{path}': {source}")]
    UnreadableInput {
        which: &'static str,
        path: String,
        #[source]
        source: DocumentError,
    },

    /// Generic I/O wrapper (temp files, writing the result).
    #[error("merge I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// VCS backend errors
// ---------------------------------------------------------------------------

/// Errors from the version-control backend collaborator.
#[derive(Debug, Error)]
pub enum VcsError {
    /// The requested revision does not exist.
    #[error("revision {0} not found")]
    RevisionNotFound(String),

    /// A remote source could not be reached.
    #[error("cannot reach '{name}' at {uri}")]
    Unreachable { name: String, uri: String },

    /// The backend reported a failure it could not recover from.
    #[error("backend failure: {0}")]
    Backend(String),

    /// A merge hook failed while the backend was merging two revisions.
    #[error("merge of '{path}' failed: {source}")]
    MergeHook {
        path: String,
        #[source]
        source: MergeError,
    },

    /// Generic I/O wrapper.
    #[error("vcs I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Sync errors
// ---------------------------------------------------------------------------

/// What the user can do about a failed synchronization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Remediation {
    SuggestRestart,
    VerifyIntegrity,
    NeedExpertHelp,
    CheckAddressAndConnection,
    CheckSettings,
}

impl Remediation {
    /// Human-readable advice for this remediation.
    pub fn hint(&self) -> &'static str {
        match self {
            Self::SuggestRestart => "The problem might be helped by restarting your computer.",
            Self::VerifyIntegrity => "The repository should be checked for damage.",
            Self::NeedExpertHelp => "You may need expert help.",
            Self::CheckAddressAndConnection => {
                "Check your network connection and server address, or try again later."
            }
            Self::CheckSettings => {
                "Check your server settings, such as project name, user name, and password."
            }
        }
    }
}

impl std::fmt::Display for Remediation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SuggestRestart => write!(f, "suggest_restart"),
            Self::VerifyIntegrity => write!(f, "verify_integrity"),
            Self::NeedExpertHelp => write!(f, "need_expert_help"),
            Self::CheckAddressAndConnection => write!(f, "check_address_and_connection"),
            Self::CheckSettings => write!(f, "check_settings"),
        }
    }
}

/// Errors that end a synchronization cycle.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Another cycle is already running on this coordinator.
    #[error("sync already in progress (started at {started_at})")]
    AlreadyRunning { started_at: String },

    /// Stale repository locks could not be removed.
    #[error("synchronization abandoned for now because of file or directory locks")]
    LocksNotCleared,

    /// The freshly committed data failed handler validation.
    #[error(
        "the changed data did not pass validation tests; your project was moved back to \
         its state before this problem occurred, so that you can keep working. Error was: {detail}"
    )]
    ValidationFailed { detail: String },

    /// Committing local changes failed.
    #[error("could not store changes in the local repository: {0}")]
    CommitFailed(#[source] VcsError),

    /// Merging heads failed.
    #[error("unable to complete the merge with {with_user}: {source}")]
    MergeFailed {
        with_user: String,
        #[source]
        source: VcsError,
    },

    /// Sending to a remote source failed after connecting to it.
    #[error("failed to send to {name} ({uri}): {source}")]
    SendFailed {
        name: String,
        uri: String,
        #[source]
        source: VcsError,
    },

    /// Updating the working copy failed.
    #[error("could not update the working copy: {0}")]
    UpdateFailed(#[source] VcsError),

    /// A backend query outside any specific phase failed.
    #[error("repository error: {0}")]
    Backend(#[from] VcsError),
}

impl SyncError {
    /// Remediation hints for this failure, in display order.
    pub fn remediation(&self) -> &'static [Remediation] {
        match self {
            Self::AlreadyRunning { .. } => &[],
            Self::LocksNotCleared => &[Remediation::SuggestRestart],
            Self::ValidationFailed { .. } => &[Remediation::NeedExpertHelp],
            Self::CommitFailed(_) => &[Remediation::VerifyIntegrity, Remediation::SuggestRestart],
            Self::MergeFailed { .. } => &[Remediation::NeedExpertHelp],
            Self::SendFailed { .. } => &[
                Remediation::CheckAddressAndConnection,
                Remediation::CheckSettings,
            ],
            Self::UpdateFailed(_) => &[Remediation::SuggestRestart],
            Self::Backend(_) => &[Remediation::VerifyIntegrity],
        }
    }
}

// ---------------------------------------------------------------------------
// Configuration errors
// ---------------------------------------------------------------------------

/// Errors from configuration loading and validation.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file not found.
    #[error("configuration file not found: {0}")]
    FileNotFound(String),

    /// TOML parse error.
    #[error("configuration parse error: {0}")]
    ParseError(String),

    /// A config value is invalid.
    #[error("invalid configuration value for '{field}': {detail}")]
    InvalidValue { field: String, detail: String },

    /// Generic I/O error reading the config file.
    #[error("configuration I/O error: {0}")]
    IoError(#[from] std::io::Error),
}
