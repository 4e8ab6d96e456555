//! In-memory repository backend.
//!
//! [`MemoryRepository`] implements [`VcsBackend`] entirely in process:
//! revisions are content-hashed with SHA-256, every clone numbers its
//! revisions locally, and peers find each other by URI through a shared
//! [`MemoryNetwork`]. Locations can be made unreachable, locks can be made
//! impossible to clear, and merges and pushes can be told to fail, so every
//! branch of a sync cycle can be exercised without touching disk.
//!
//! Files changed on both sides of a merge are written to a temporary
//! directory and handed to the [`MergeHook`], like an external merge tool
//! would receive them.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use chrono::{SecondsFormat, Utc};
use sha2::{Digest, Sha256};
use tracing::{debug, info, instrument, warn};

use super::{MergeHook, VcsBackend};
use crate::errors::VcsError;
use crate::file_policy::matches_pattern;
use crate::models::{RemoteSource, Revision};

type FileSet = BTreeMap<String, String>;

#[derive(Debug, Clone)]
struct StoredRevision {
    revision: Revision,
    files: FileSet,
}

fn recover<'a, T>(mutex: &'a Mutex<T>, what: &str) -> MutexGuard<'a, T> {
    mutex.lock().unwrap_or_else(|poisoned| {
        warn!(what, "mutex was poisoned, recovering");
        poisoned.into_inner()
    })
}

// ---------------------------------------------------------------------------
// Network
// ---------------------------------------------------------------------------

#[derive(Default)]
struct NetworkState {
    repositories: HashMap<String, MemoryRepository>,
    unreachable: HashSet<String>,
}

/// Shared address space in which memory repositories find each other.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl std::fmt::Debug for MemoryNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = recover(&self.state, "network");
        let mut uris: Vec<&String> = state.repositories.keys().collect();
        uris.sort();
        f.debug_struct("MemoryNetwork").field("repositories", &uris).finish()
    }
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty repository at `uri` owned by `user_id`.
    pub fn create_repository(
        &self,
        uri: impl Into<String>,
        user_id: impl Into<String>,
    ) -> MemoryRepository {
        let uri = uri.into();
        let repo = MemoryRepository::new(Arc::downgrade(&self.state), uri.clone(), user_id.into());
        recover(&self.state, "network")
            .repositories
            .insert(uri, repo.clone());
        repo
    }

    /// The repository at `uri`, reachable or not.
    pub fn repository(&self, uri: &str) -> Option<MemoryRepository> {
        recover(&self.state, "network").repositories.get(uri).cloned()
    }

    /// Make `uri` reachable or unreachable.
    pub fn set_reachable(&self, uri: &str, reachable: bool) {
        let mut state = recover(&self.state, "network");
        if reachable {
            state.unreachable.remove(uri);
        } else {
            state.unreachable.insert(uri.to_string());
        }
    }
}

// ---------------------------------------------------------------------------
// Repository
// ---------------------------------------------------------------------------

struct RepoState {
    user_id: String,
    branch: String,
    revisions: Vec<StoredRevision>,
    working_parent: Option<usize>,
    working_files: FileSet,
    pending_merge: Option<usize>,
    locks: BTreeSet<String>,
    locks_stuck: bool,
    fail_next_merge: Option<String>,
    fail_push: Option<String>,
    helpers_running: usize,
    commit_counter: u64,
    connection_checks: usize,
}

impl RepoState {
    fn index_of(&self, hash: &str) -> Option<usize> {
        self.revisions.iter().position(|r| r.revision.hash == hash)
    }

    fn require(&self, hash: &str) -> Result<usize, VcsError> {
        self.index_of(hash)
            .ok_or_else(|| VcsError::RevisionNotFound(hash.to_string()))
    }

    fn ancestors(&self, start: usize) -> HashSet<usize> {
        let mut seen = HashSet::new();
        let mut queue = VecDeque::from([start]);
        while let Some(idx) = queue.pop_front() {
            if !seen.insert(idx) {
                continue;
            }
            for parent in &self.revisions[idx].revision.parents {
                if let Some(p) = self.index_of(parent) {
                    queue.push_back(p);
                }
            }
        }
        seen
    }

    /// The shared ancestor with the highest local number.
    fn common_ancestor(&self, a: usize, b: usize) -> Option<usize> {
        let from_a = self.ancestors(a);
        self.ancestors(b)
            .into_iter()
            .filter(|idx| from_a.contains(idx))
            .max()
    }

    fn heads(&self) -> Vec<usize> {
        let parents: HashSet<&str> = self
            .revisions
            .iter()
            .flat_map(|r| r.revision.parents.iter().map(String::as_str))
            .collect();
        (0..self.revisions.len())
            .filter(|&idx| !parents.contains(self.revisions[idx].revision.hash.as_str()))
            .collect()
    }

    fn parent_files(&self) -> FileSet {
        self.working_parent
            .map(|idx| self.revisions[idx].files.clone())
            .unwrap_or_default()
    }

    /// Append a revision received from elsewhere, renumbering it locally.
    fn import(&mut self, mut stored: StoredRevision) -> usize {
        let idx = self.revisions.len();
        stored.revision.local_number = idx as u64;
        self.revisions.push(stored);
        idx
    }

    /// Discard the working copy and replace it with revision `idx`.
    fn checkout(&mut self, idx: usize) {
        self.working_parent = Some(idx);
        self.working_files = self.revisions[idx].files.clone();
        self.pending_merge = None;
    }

    /// Move to revision `idx`, carrying uncommitted edits along.
    fn update(&mut self, idx: usize) {
        let parent = self.parent_files();
        let mut files = self.revisions[idx].files.clone();
        let paths: BTreeSet<&String> = parent.keys().chain(self.working_files.keys()).collect();
        for path in paths {
            match (parent.get(path), self.working_files.get(path)) {
                (before, Some(now)) if before != Some(now) => {
                    files.insert(path.clone(), now.clone());
                }
                (Some(_), None) => {
                    files.remove(path);
                }
                _ => {}
            }
        }
        self.working_parent = Some(idx);
        self.working_files = files;
        self.pending_merge = None;
    }
}

/// A complete repository held in memory.
///
/// Cloning the handle shares the repository.
#[derive(Clone)]
pub struct MemoryRepository {
    uri: String,
    state: Arc<Mutex<RepoState>>,
    network: Weak<Mutex<NetworkState>>,
}

impl std::fmt::Debug for MemoryRepository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryRepository")
            .field("uri", &self.uri)
            .finish()
    }
}

impl MemoryRepository {
    fn new(network: Weak<Mutex<NetworkState>>, uri: String, user_id: String) -> Self {
        Self {
            uri,
            state: Arc::new(Mutex::new(RepoState {
                user_id,
                branch: "default".into(),
                revisions: Vec::new(),
                working_parent: None,
                working_files: FileSet::new(),
                pending_merge: None,
                locks: BTreeSet::new(),
                locks_stuck: false,
                fail_next_merge: None,
                fail_push: None,
                helpers_running: 0,
                commit_counter: 0,
                connection_checks: 0,
            })),
            network,
        }
    }

    fn state(&self) -> MutexGuard<'_, RepoState> {
        recover(&self.state, "repository")
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn user_id(&self) -> String {
        self.state().user_id.clone()
    }

    /// Branch recorded on future commits.
    pub fn set_branch(&self, branch: impl Into<String>) {
        self.state().branch = branch.into();
    }

    // -- working copy -------------------------------------------------------

    pub fn write_file(&self, path: impl Into<String>, content: impl Into<String>) {
        self.state().working_files.insert(path.into(), content.into());
    }

    pub fn read_file(&self, path: &str) -> Option<String> {
        self.state().working_files.get(path).cloned()
    }

    pub fn remove_file(&self, path: &str) {
        self.state().working_files.remove(path);
    }

    // -- history ------------------------------------------------------------

    /// Every revision in local-number order.
    pub fn revisions(&self) -> Vec<Revision> {
        self.state()
            .revisions
            .iter()
            .map(|r| r.revision.clone())
            .collect()
    }

    pub fn revision_count(&self) -> usize {
        self.state().revisions.len()
    }

    /// How many times `can_connect` has been asked about a remote.
    pub fn connection_check_count(&self) -> usize {
        self.state().connection_checks
    }

    /// Set the tag of an existing revision.
    pub fn tag_revision(&self, hash: &str, tag: impl Into<String>) -> Result<(), VcsError> {
        let mut state = self.state();
        let idx = state.require(hash)?;
        state.revisions[idx].revision.tag = tag.into();
        Ok(())
    }

    // -- failure injection --------------------------------------------------

    /// Hold an advisory lock, as a crashed process would leave behind.
    pub fn add_lock(&self, name: impl Into<String>) {
        self.state().locks.insert(name.into());
    }

    pub fn lock_count(&self) -> usize {
        self.state().locks.len()
    }

    /// Make locks impossible to remove.
    pub fn set_locks_stuck(&self, stuck: bool) {
        self.state().locks_stuck = stuck;
    }

    /// Make the next merge fail with `message`, leaving a helper running.
    pub fn fail_next_merge(&self, message: impl Into<String>) {
        self.state().fail_next_merge = Some(message.into());
    }

    /// Make every push fail with `message`, or succeed again with `None`.
    pub fn fail_pushes(&self, message: Option<String>) {
        self.state().fail_push = message;
    }

    // -- peer plumbing ------------------------------------------------------

    fn snapshot(&self) -> Vec<StoredRevision> {
        self.state().revisions.clone()
    }

    /// Store revisions not yet present. Returns how many were new.
    fn receive(&self, incoming: Vec<StoredRevision>) -> usize {
        let mut state = self.state();
        let mut added = 0;
        for stored in incoming {
            if state.index_of(&stored.revision.hash).is_none() {
                state.import(stored);
                added += 1;
            }
        }
        added
    }

    fn network(&self) -> Option<Arc<Mutex<NetworkState>>> {
        self.network.upgrade()
    }

    fn remote(&self, source: &RemoteSource) -> Result<MemoryRepository, VcsError> {
        let unreachable = || VcsError::Unreachable {
            name: source.name.clone(),
            uri: source.uri.clone(),
        };
        let network = self.network().ok_or_else(unreachable)?;
        let state = recover(&network, "network");
        if state.unreachable.contains(&source.uri) {
            return Err(unreachable());
        }
        state
            .repositories
            .get(&source.uri)
            .cloned()
            .ok_or_else(unreachable)
    }
}

fn selected(path: &str, include: &[String], exclude: &[String]) -> bool {
    (include.is_empty() || include.iter().any(|p| matches_pattern(path, p)))
        && !exclude.iter().any(|p| matches_pattern(path, p))
}

fn revision_hash(
    parents: &[String],
    user: &str,
    branch: &str,
    summary: &str,
    stamp: &str,
    files: &FileSet,
) -> String {
    let mut hasher = Sha256::new();
    for parent in parents {
        hasher.update(parent.as_bytes());
        hasher.update(b"\0");
    }
    for field in [user, branch, summary, stamp] {
        hasher.update(field.as_bytes());
        hasher.update(b"\0");
    }
    for (path, content) in files {
        hasher.update(path.as_bytes());
        hasher.update(b"\0");
        hasher.update(content.as_bytes());
        hasher.update(b"\0");
    }
    hex::encode(hasher.finalize())
}

fn temp_name(side: &str, rel_path: &str) -> String {
    match Path::new(rel_path).extension().and_then(|e| e.to_str()) {
        Some(ext) => format!("{side}.{ext}"),
        None => side.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Backend contract
// ---------------------------------------------------------------------------

impl VcsBackend for MemoryRepository {
    fn heads(&self) -> Result<Vec<Revision>, VcsError> {
        let state = self.state();
        Ok(state
            .heads()
            .into_iter()
            .map(|idx| state.revisions[idx].revision.clone())
            .collect())
    }

    fn working_revision(&self) -> Result<Option<Revision>, VcsError> {
        let state = self.state();
        Ok(state
            .working_parent
            .map(|idx| state.revisions[idx].revision.clone()))
    }

    fn common_ancestor(&self, a: &str, b: &str) -> Result<Option<Revision>, VcsError> {
        let state = self.state();
        let a = state.require(a)?;
        let b = state.require(b)?;
        Ok(state
            .common_ancestor(a, b)
            .map(|idx| state.revisions[idx].revision.clone()))
    }

    fn can_connect(&self, source: &RemoteSource) -> bool {
        self.state().connection_checks += 1;
        self.remote(source).is_ok()
    }

    #[instrument(skip(self, source), fields(remote = %source.name, uri = %source.uri))]
    fn pull(&self, source: &RemoteSource) -> Result<bool, VcsError> {
        let remote = self.remote(source)?;
        if Arc::ptr_eq(&remote.state, &self.state) {
            return Ok(false);
        }
        let added = self.receive(remote.snapshot());
        debug!(added, "pulled revisions");
        Ok(added > 0)
    }

    #[instrument(skip(self, source), fields(remote = %source.name, uri = %source.uri))]
    fn push(&self, source: &RemoteSource) -> Result<(), VcsError> {
        if let Some(message) = self.state().fail_push.clone() {
            return Err(VcsError::Backend(message));
        }
        let remote = self.remote(source)?;
        if Arc::ptr_eq(&remote.state, &self.state) {
            return Ok(());
        }
        let added = remote.receive(self.snapshot());
        debug!(added, "pushed revisions");
        Ok(())
    }

    #[instrument(skip(self, source), fields(remote = %source.name, uri = %source.uri))]
    fn clone_to(&self, source: &RemoteSource) -> Result<String, VcsError> {
        let network = self.network().ok_or_else(|| VcsError::Unreachable {
            name: source.name.clone(),
            uri: source.uri.clone(),
        })?;
        let (user_id, revisions, tip) = {
            let state = self.state();
            let tip = state.working_parent;
            (state.user_id.clone(), state.revisions.clone(), tip)
        };

        let mut net = recover(&network, "network");
        if net.unreachable.contains(&source.uri) {
            return Err(VcsError::Unreachable {
                name: source.name.clone(),
                uri: source.uri.clone(),
            });
        }
        if net.repositories.contains_key(&source.uri) {
            return Err(VcsError::Backend(format!(
                "a repository already exists at {}",
                source.uri
            )));
        }

        let clone = MemoryRepository::new(Arc::downgrade(&network), source.uri.clone(), user_id);
        {
            let mut state = clone.state();
            state.revisions = revisions;
            if let Some(idx) = tip {
                state.checkout(idx);
            }
        }
        net.repositories.insert(source.uri.clone(), clone);
        info!("cloned repository");
        Ok(source.uri.clone())
    }

    #[instrument(skip(self, theirs, hook), fields(theirs = %theirs.short_hash()))]
    fn merge_revisions(
        &self,
        theirs: &Revision,
        hook: &mut dyn MergeHook,
    ) -> Result<bool, VcsError> {
        let (ancestor_files, ours_files, theirs_files, theirs_idx) = {
            let mut state = self.state();
            let theirs_idx = state.require(&theirs.hash)?;
            let ours_idx = state
                .working_parent
                .ok_or_else(|| VcsError::Backend("no working revision to merge into".into()))?;
            let ancestor = state.common_ancestor(ours_idx, theirs_idx);
            if ours_idx == theirs_idx
                || ancestor == Some(theirs_idx)
                || ancestor == Some(ours_idx)
            {
                debug!("nothing to merge");
                return Ok(false);
            }
            state.helpers_running += 1;
            if let Some(message) = state.fail_next_merge.take() {
                return Err(VcsError::Backend(message));
            }
            let ancestor_files = ancestor
                .map(|idx| state.revisions[idx].files.clone())
                .unwrap_or_default();
            (
                ancestor_files,
                state.working_files.clone(),
                state.revisions[theirs_idx].files.clone(),
                theirs_idx,
            )
        };

        let scratch = tempfile::tempdir()?;
        let mut merged = ours_files.clone();
        let paths: BTreeSet<&String> = ancestor_files
            .keys()
            .chain(ours_files.keys())
            .chain(theirs_files.keys())
            .collect();

        for path in paths {
            let a = ancestor_files.get(path);
            let o = ours_files.get(path);
            let t = theirs_files.get(path);
            if o == t || a == t {
                continue;
            }
            if a == o {
                match t {
                    Some(content) => merged.insert(path.clone(), content.clone()),
                    None => merged.remove(path),
                };
                continue;
            }
            match (o, t) {
                (Some(o), Some(t)) => {
                    let ours_path = scratch.path().join(temp_name("ours", path));
                    let ancestor_path = scratch.path().join(temp_name("ancestor", path));
                    let theirs_path = scratch.path().join(temp_name("theirs", path));
                    std::fs::write(&ours_path, o)?;
                    std::fs::write(&ancestor_path, a.map(String::as_str).unwrap_or(""))?;
                    std::fs::write(&theirs_path, t)?;

                    debug!(file = %path, "both sides changed, calling merge hook");
                    hook.merge_file(path, &ours_path, &ancestor_path, &theirs_path)
                        .map_err(|source| VcsError::MergeHook {
                            path: path.clone(),
                            source,
                        })?;
                    merged.insert(path.clone(), std::fs::read_to_string(&ours_path)?);
                }
                // Edited on one side, deleted on the other: the edit survives.
                (None, Some(t)) => {
                    merged.insert(path.clone(), t.clone());
                }
                (Some(_), None) | (None, None) => {}
            }
        }

        let mut state = self.state();
        state.working_files = merged;
        state.pending_merge = Some(theirs_idx);
        state.helpers_running = state.helpers_running.saturating_sub(1);
        Ok(true)
    }

    fn update_working_copy(&self) -> Result<(), VcsError> {
        let mut state = self.state();
        let branch = state.branch.clone();
        let tip = state
            .heads()
            .into_iter()
            .filter(|&idx| state.revisions[idx].revision.branch == branch)
            .max();
        if let Some(idx) = tip {
            state.update(idx);
        }
        Ok(())
    }

    fn update_to(&self, revision: &Revision) -> Result<(), VcsError> {
        let mut state = self.state();
        let idx = state.require(&revision.hash)?;
        state.update(idx);
        Ok(())
    }

    fn rollback_working_copy_to(&self, local_number: u64) -> Result<(), VcsError> {
        let mut state = self.state();
        let idx = usize::try_from(local_number)
            .ok()
            .filter(|&idx| idx < state.revisions.len())
            .ok_or_else(|| VcsError::RevisionNotFound(local_number.to_string()))?;
        state.checkout(idx);
        info!(local_number, "working copy rolled back");
        Ok(())
    }

    fn strip_revision(&self, hash: &str) -> Result<(), VcsError> {
        let mut state = self.state();
        let idx = state.require(hash)?;
        if idx + 1 != state.revisions.len() {
            return Err(VcsError::Backend(format!(
                "cannot strip {hash}: it is not the latest revision"
            )));
        }
        let Some(stripped) = state.revisions.pop() else {
            return Err(VcsError::RevisionNotFound(hash.to_string()));
        };
        if state.working_parent == Some(idx) {
            let parent = stripped
                .revision
                .parents
                .first()
                .and_then(|p| state.index_of(p));
            state.working_parent = parent;
        }
        if state.pending_merge == Some(idx) {
            state.pending_merge = None;
        }
        info!(hash = %stripped.revision.short_hash(), "stripped revision");
        Ok(())
    }

    fn remove_stale_locks(&self) -> bool {
        let mut state = self.state();
        if state.locks_stuck {
            return false;
        }
        if !state.locks.is_empty() {
            debug!(count = state.locks.len(), "removing stale locks");
            state.locks.clear();
        }
        true
    }

    #[instrument(skip(self, include, exclude))]
    fn commit_all(
        &self,
        include: &[String],
        exclude: &[String],
        message: &str,
    ) -> Result<Option<Revision>, VcsError> {
        let mut state = self.state();
        let parent_files = state.parent_files();
        let mut files = parent_files.clone();
        let paths: BTreeSet<String> = parent_files
            .keys()
            .chain(state.working_files.keys())
            .cloned()
            .collect();

        let mut changed = 0usize;
        for path in paths {
            if !selected(&path, include, exclude) {
                continue;
            }
            match state.working_files.get(&path) {
                Some(content) if parent_files.get(&path) != Some(content) => {
                    files.insert(path, content.clone());
                    changed += 1;
                }
                Some(_) => {}
                None => {
                    if files.remove(&path).is_some() {
                        changed += 1;
                    }
                }
            }
        }

        if changed == 0 && state.pending_merge.is_none() {
            debug!("nothing to commit");
            return Ok(None);
        }

        let mut parents: Vec<String> = state
            .working_parent
            .map(|idx| state.revisions[idx].revision.hash.clone())
            .into_iter()
            .collect();
        if let Some(idx) = state.pending_merge {
            parents.push(state.revisions[idx].revision.hash.clone());
        }

        state.commit_counter += 1;
        let date = Utc::now();
        let stamp = format!(
            "{}#{}@{}",
            date.to_rfc3339_opts(SecondsFormat::Nanos, true),
            state.commit_counter,
            self.uri
        );
        let hash = revision_hash(&parents, &state.user_id, &state.branch, message, &stamp, &files);
        let revision = Revision {
            local_number: state.revisions.len() as u64,
            hash,
            branch: state.branch.clone(),
            user_id: state.user_id.clone(),
            tag: String::new(),
            summary: message.to_string(),
            date,
            parents,
        };

        let idx = state.import(StoredRevision {
            revision: revision.clone(),
            files,
        });
        state.working_parent = Some(idx);
        state.pending_merge = None;
        info!(files = changed, hash = %revision.short_hash(), "committed");
        Ok(Some(revision))
    }

    fn pending_files(&self) -> Result<Vec<(String, u64)>, VcsError> {
        let state = self.state();
        let parent_files = state.parent_files();
        let paths: BTreeSet<&String> = parent_files
            .keys()
            .chain(state.working_files.keys())
            .collect();
        Ok(paths
            .into_iter()
            .filter(|path| parent_files.get(*path) != state.working_files.get(*path))
            .map(|path| {
                let size = state
                    .working_files
                    .get(path)
                    .map(|c| c.len() as u64)
                    .unwrap_or(0);
                (path.clone(), size)
            })
            .collect())
    }

    fn files_in_revision(&self, hash: &str) -> Result<Vec<String>, VcsError> {
        let state = self.state();
        let idx = state.require(hash)?;
        Ok(state.revisions[idx].files.keys().cloned().collect())
    }

    fn file_at(&self, hash: &str, path: &str) -> Result<Option<String>, VcsError> {
        let state = self.state();
        let idx = state.require(hash)?;
        Ok(state.revisions[idx].files.get(path).cloned())
    }

    fn terminate_merge_helpers(&self) -> usize {
        let mut state = self.state();
        let count = std::mem::take(&mut state.helpers_running);
        if count > 0 {
            warn!(count, "terminated merge helpers");
        }
        count
    }
}
