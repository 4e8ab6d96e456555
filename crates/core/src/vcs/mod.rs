//! The version-control collaborator contract.
//!
//! The sync coordinator never touches repository internals. It drives a
//! [`VcsBackend`] through the narrow operations below, and the backend calls
//! back into a [`MergeHook`] once per file that both sides changed while
//! merging two revisions.
//!
//! [`memory::MemoryRepository`] is a complete in-process implementation used
//! by the tests and usable by embedders.

pub mod memory;

use std::path::Path;

use crate::errors::{MergeError, VcsError};
use crate::models::{RemoteSource, Revision};

/// Called by the backend for each file changed on both sides of a merge.
///
/// The merged result must be written over `ours`; the backend reads it back
/// from there.
pub trait MergeHook {
    fn merge_file(
        &mut self,
        relative_path: &str,
        ours: &Path,
        ancestor: &Path,
        theirs: &Path,
    ) -> Result<(), MergeError>;
}

/// Operations the sync coordinator needs from a repository.
pub trait VcsBackend: Send + Sync {
    /// Revisions with no descendant, in local-number order.
    fn heads(&self) -> Result<Vec<Revision>, VcsError>;

    /// Parent revision of the working copy, `None` in an empty repository.
    fn working_revision(&self) -> Result<Option<Revision>, VcsError>;

    /// Nearest common ancestor of two revisions, by hash.
    fn common_ancestor(&self, a: &str, b: &str) -> Result<Option<Revision>, VcsError>;

    /// Whether a repository is reachable at `source`.
    fn can_connect(&self, source: &RemoteSource) -> bool;

    /// Fetch revisions from `source`. True if anything new arrived.
    fn pull(&self, source: &RemoteSource) -> Result<bool, VcsError>;

    /// Send local revisions to `source`.
    fn push(&self, source: &RemoteSource) -> Result<(), VcsError>;

    /// Create a new repository at `source` holding a copy of this one.
    /// Returns the location created.
    fn clone_to(&self, source: &RemoteSource) -> Result<String, VcsError>;

    /// Merge `theirs` into the working copy, calling `hook` for every file
    /// changed on both sides. False means there was nothing to merge.
    fn merge_revisions(&self, theirs: &Revision, hook: &mut dyn MergeHook)
        -> Result<bool, VcsError>;

    /// Update the working copy to the tip of its branch.
    fn update_working_copy(&self) -> Result<(), VcsError>;

    /// Update the working copy to a specific revision.
    fn update_to(&self, revision: &Revision) -> Result<(), VcsError>;

    /// Discard working-copy state and return to `local_number`.
    fn rollback_working_copy_to(&self, local_number: u64) -> Result<(), VcsError>;

    /// Remove the latest revision, which must be a head that was never sent
    /// anywhere. A working copy sitting on it moves to its first parent
    /// with the files left as they are, so the stripped changes show as
    /// uncommitted again.
    fn strip_revision(&self, hash: &str) -> Result<(), VcsError>;

    /// Remove stale advisory locks. False if some could not be removed.
    fn remove_stale_locks(&self) -> bool;

    /// Commit working-copy changes matching `include` and not `exclude`.
    /// `None` when there was nothing to commit.
    fn commit_all(
        &self,
        include: &[String],
        exclude: &[String],
        message: &str,
    ) -> Result<Option<Revision>, VcsError>;

    /// Working-copy files that differ from the working revision, with sizes.
    fn pending_files(&self) -> Result<Vec<(String, u64)>, VcsError>;

    /// Every file path present in a revision.
    fn files_in_revision(&self, hash: &str) -> Result<Vec<String>, VcsError>;

    /// Contents of `path` at a revision, `None` if absent there.
    fn file_at(&self, hash: &str, path: &str) -> Result<Option<String>, VcsError>;

    /// Kill merge helper processes left running by a failed merge. Returns
    /// how many were terminated.
    fn terminate_merge_helpers(&self) -> usize {
        0
    }
}
