//! Peer-to-peer synchronization coordinator.
//!
//! The [`SyncCoordinator`] runs one synchronization cycle against a local
//! repository and a list of remote sources:
//!
//! 1. Clear stale repository locks.
//! 2. Commit local changes (after the large-file filter), then validate them.
//! 3. Pull from each remote source in turn.
//! 4. Merge every divergent head on our branch into the working revision.
//! 5. Push to each writable source, cloning onto removable media if needed.
//! 6. Update the working copy to the head descending from where we started.
//!
//! Cancellation is cooperative and only observed between phases and around
//! each remote operation. A fatal error during or after the merge phase
//! rolls the working copy back to the revision recorded after the commit.
//!
//! A lock flag prevents concurrent cycles on the same coordinator.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use crate::config::SyncConfig;
use crate::errors::{MergeError, SyncError, VcsError};
use crate::file_policy::FilePolicy;
use crate::handlers::HandlerRegistry;
use crate::merge::{FileMergeReport, MergeOrder, MergeReports, MergeSituation};
use crate::models::{RemoteSource, Revision, SyncOptions, SyncResult, SyncState};
use crate::vcs::{MergeHook, VcsBackend};

/// Called with each state the coordinator enters.
pub type ProgressObserver = Arc<dyn Fn(SyncState) + Send + Sync>;

// ---------------------------------------------------------------------------
// Cancellation
// ---------------------------------------------------------------------------

/// Cloneable handle used by a foreground context to cancel a running cycle.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    /// Request cancellation at the next checked boundary.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Why a cycle stopped early.
enum Halt {
    Cancelled,
    Failed(SyncError),
}

impl From<SyncError> for Halt {
    fn from(err: SyncError) -> Self {
        Self::Failed(err)
    }
}

/// Per-cycle bookkeeping.
#[derive(Default)]
struct Cycle {
    /// Connectivity results by source URI, shared by pull and push.
    connectivity: HashMap<String, bool>,
    /// Working revision after the commit phase.
    before: Option<Revision>,
    /// Set once the merge phase starts; failures after this roll back.
    rollback_armed: bool,
    got_changes: bool,
    merge_reports: Vec<FileMergeReport>,
}

// ---------------------------------------------------------------------------
// Coordinator
// ---------------------------------------------------------------------------

/// Runs synchronization cycles for one local repository.
pub struct SyncCoordinator<R: VcsBackend> {
    repo: R,
    config: SyncConfig,
    handlers: HandlerRegistry,
    state: Mutex<SyncState>,
    cancel: CancelHandle,
    progress: Option<ProgressObserver>,
    /// Atomic flag preventing concurrent sync cycles.
    running: Arc<AtomicBool>,
    cycle_started_at: Mutex<Option<DateTime<Utc>>>,
}

impl<R: VcsBackend> SyncCoordinator<R> {
    /// Create a coordinator with the built-in handlers plus those configured
    /// in `config.handlers`.
    pub fn new(repo: R, config: SyncConfig) -> Self {
        info!(
            user = %config.repository.user_id,
            branch = %config.repository.branch,
            mode = %config.sync.conflict_mode,
            "initializing sync coordinator"
        );
        let handlers = HandlerRegistry::from_config(&config.handlers);
        Self {
            repo,
            config,
            handlers,
            state: Mutex::new(SyncState::Idle),
            cancel: CancelHandle::default(),
            progress: None,
            running: Arc::new(AtomicBool::new(false)),
            cycle_started_at: Mutex::new(None),
        }
    }

    /// Replace the handler registry.
    pub fn with_handlers(mut self, handlers: HandlerRegistry) -> Self {
        self.handlers = handlers;
        self
    }

    /// Observe state transitions.
    pub fn with_progress<F>(mut self, observer: F) -> Self
    where
        F: Fn(SyncState) + Send + Sync + 'static,
    {
        self.progress = Some(Arc::new(observer));
        self
    }

    pub fn repository(&self) -> &R {
        &self.repo
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn handlers(&self) -> &HandlerRegistry {
        &self.handlers
    }

    /// The state the coordinator is in, or ended the last cycle in.
    pub fn state(&self) -> SyncState {
        *self.lock_state()
    }

    /// Check if a sync cycle is currently running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    fn lock_state(&self) -> MutexGuard<'_, SyncState> {
        self.state.lock().unwrap_or_else(|poisoned| {
            warn!("sync state mutex was poisoned, recovering");
            poisoned.into_inner()
        })
    }

    fn set_state(&self, state: SyncState) {
        *self.lock_state() = state;
        debug!(state = %state, "sync state");
        if let Some(observer) = &self.progress {
            observer(state);
        }
    }

    fn check_cancel(&self) -> Result<(), Halt> {
        if self.cancel.is_cancelled() {
            info!("operation cancelled");
            return Err(Halt::Cancelled);
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Main entry point
    // -----------------------------------------------------------------------

    /// Execute one full synchronization cycle.
    ///
    /// Never panics and never returns early with `Err`: every outcome,
    /// including cancellation and failure, is described by the returned
    /// [`SyncResult`].
    pub fn sync(&self, options: &SyncOptions) -> SyncResult {
        let started_at = Utc::now();

        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            let since = self
                .cycle_started_at
                .lock()
                .map(|at| *at)
                .unwrap_or_else(|poisoned| *poisoned.into_inner())
                .unwrap_or(started_at);
            warn!("sync requested while another cycle is running");
            return SyncResult {
                succeeded: false,
                did_get_changes_from_others: false,
                cancelled: false,
                error: Some(SyncError::AlreadyRunning {
                    started_at: since.to_rfc3339(),
                }),
                merge_reports: Vec::new(),
                final_state: SyncState::Failed,
                started_at,
                completed_at: Utc::now(),
            };
        }

        // RAII guard that clears the running flag on drop (even on panic).
        let _guard = SyncLockGuard(self.running.clone());
        if let Ok(mut at) = self.cycle_started_at.lock() {
            *at = Some(started_at);
        }

        info!(
            sources = options.sources_to_try.len(),
            pull = options.do_pull_from_others,
            merge = options.do_merge_with_others,
            send = options.do_send_to_others,
            "starting sync cycle"
        );
        self.set_state(SyncState::Idle);

        let mut cycle = Cycle::default();
        let outcome = self.run_cycle(options, &mut cycle);

        let (succeeded, cancelled, error) = match outcome {
            Ok(()) => {
                self.set_state(SyncState::Done);
                info!(
                    got_changes = cycle.got_changes,
                    merged_files = cycle.merge_reports.len(),
                    "sync cycle completed"
                );
                (true, false, None)
            }
            Err(Halt::Cancelled) => {
                self.set_state(SyncState::Cancelled);
                (false, true, None)
            }
            Err(Halt::Failed(err)) => {
                error!(error = %err, "sync cycle failed");
                if cycle.rollback_armed {
                    self.roll_back(cycle.before.as_ref());
                }
                self.set_state(SyncState::Failed);
                (false, false, Some(err))
            }
        };
        self.cancel.reset();

        SyncResult {
            succeeded,
            did_get_changes_from_others: cycle.got_changes,
            cancelled,
            error,
            merge_reports: cycle.merge_reports,
            final_state: self.state(),
            started_at,
            completed_at: Utc::now(),
        }
    }

    /// Run a cycle on tokio's blocking pool.
    pub fn spawn(self: &Arc<Self>, options: SyncOptions) -> tokio::task::JoinHandle<SyncResult>
    where
        R: 'static,
    {
        let coordinator = Arc::clone(self);
        tokio::task::spawn_blocking(move || coordinator.sync(&options))
    }

    fn run_cycle(&self, options: &SyncOptions, cycle: &mut Cycle) -> Result<(), Halt> {
        self.check_cancel()?;
        self.clear_locks()?;
        self.set_state(SyncState::LocksCleared);

        self.check_cancel()?;
        self.commit_local(options)?;
        self.set_state(SyncState::Committed);

        cycle.before = self.repo.working_revision().map_err(SyncError::Backend)?;

        if options.do_pull_from_others {
            cycle.got_changes = self.pull_from_others(&options.sources_to_try, cycle)?;
        }
        self.set_state(SyncState::Pulled);

        self.check_cancel()?;
        cycle.rollback_armed = true;
        if options.do_merge_with_others {
            self.merge_heads(cycle)?;
        }
        self.set_state(SyncState::HeadsMerged);

        if options.do_send_to_others {
            self.send_to_others(&options.sources_to_try, cycle)?;
        }
        self.set_state(SyncState::Pushed);

        self.update_to_descendant(cycle.before.as_ref())?;
        self.set_state(SyncState::WorkingCopyUpdated);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Locks and commit
    // -----------------------------------------------------------------------

    fn clear_locks(&self) -> Result<(), SyncError> {
        if !self.repo.remove_stale_locks() {
            return Err(SyncError::LocksNotCleared);
        }
        Ok(())
    }

    fn commit_local(&self, options: &SyncOptions) -> Result<(), SyncError> {
        info!("storing changes in local repository");
        let policy = FilePolicy::from(&self.config.sync);
        let mut exclude = self.config.sync.exclude_patterns.clone();
        for (path, size) in self.repo.pending_files().map_err(SyncError::CommitFailed)? {
            let decision = policy.evaluate_with_handlers(&path, size, &self.handlers);
            if decision.is_blocked() {
                debug!(path = %path, reason = decision.label(), "leaving file out of this commit");
                exclude.push(path);
            }
        }

        let pre_commit = self
            .repo
            .working_revision()
            .map_err(SyncError::CommitFailed)?;
        let committed = self
            .repo
            .commit_all(
                &self.config.sync.include_patterns,
                &exclude,
                &options.checkin_description,
            )
            .map_err(SyncError::CommitFailed)?;

        match committed {
            Some(revision) => self.validate_commit(&revision, pre_commit.as_ref()),
            None => {
                debug!("no local changes to commit");
                Ok(())
            }
        }
    }

    /// Validate every file the commit changed that a registered handler
    /// claims. On failure, strip the commit and move the working copy back
    /// to `pre_commit`.
    fn validate_commit(
        &self,
        revision: &Revision,
        pre_commit: Option<&Revision>,
    ) -> Result<(), SyncError> {
        let mut problems = Vec::new();
        for path in self
            .repo
            .files_in_revision(&revision.hash)
            .map_err(SyncError::CommitFailed)?
        {
            let Some(handler) = self.handlers.registered_for(&path) else {
                continue;
            };
            let Some(content) = self
                .repo
                .file_at(&revision.hash, &path)
                .map_err(SyncError::CommitFailed)?
            else {
                continue;
            };
            if let Some(previous) = pre_commit {
                let before = self
                    .repo
                    .file_at(&previous.hash, &path)
                    .map_err(SyncError::CommitFailed)?;
                if before.as_deref() == Some(content.as_str()) {
                    continue;
                }
            }
            if let Err(reason) = handler.validate(&content) {
                warn!(
                    file = %path,
                    handler = handler.name(),
                    reason = %reason,
                    "file failed validation"
                );
                problems.push(format!("{path}: {reason}"));
            }
        }

        if problems.is_empty() {
            return Ok(());
        }

        error!(hash = %revision.short_hash(), "stripping invalid commit");
        self.repo
            .strip_revision(&revision.hash)
            .map_err(SyncError::CommitFailed)?;
        match pre_commit {
            Some(previous) => {
                self.repo
                    .rollback_working_copy_to(previous.local_number)
                    .map_err(SyncError::CommitFailed)?;
            }
            None => warn!("invalid first commit stripped, its files are left uncommitted"),
        }
        Err(SyncError::ValidationFailed {
            detail: problems.join("; "),
        })
    }

    // -----------------------------------------------------------------------
    // Pull
    // -----------------------------------------------------------------------

    fn pull_from_others(&self, sources: &[RemoteSource], cycle: &mut Cycle) -> Result<bool, Halt> {
        let mut got_changes = false;
        for source in sources {
            self.check_cancel()?;
            if self.pull_from_one(source, cycle) {
                got_changes = true;
            }
            self.check_cancel()?;
        }
        Ok(got_changes)
    }

    /// Pull from one source. Connectivity and transfer failures are logged
    /// and reported as "nothing received".
    fn pull_from_one(&self, source: &RemoteSource, cycle: &mut Cycle) -> bool {
        info!(remote = %source.name, "connecting");
        let can_connect = *cycle
            .connectivity
            .entry(source.uri.clone())
            .or_insert_with(|| self.repo.can_connect(source));
        if !can_connect {
            warn!(remote = %source.name, uri = %source.uri, "could not connect");
            return false;
        }
        match self.repo.pull(source) {
            Ok(received) => {
                info!(remote = %source.name, received, "pulled");
                received
            }
            Err(err) => {
                warn!(remote = %source.name, error = %err, "pull failed");
                false
            }
        }
    }

    // -----------------------------------------------------------------------
    // Merge
    // -----------------------------------------------------------------------

    fn merge_heads(&self, cycle: &mut Cycle) -> Result<(), SyncError> {
        let Some(mut my_head) = self.repo.working_revision()? else {
            debug!("empty repository, nothing to merge");
            return Ok(());
        };
        let reject_tag = self.config.sync.reject_tag.as_str();
        let alpha = self.config.repository.user_id.as_str();

        for head in self.repo.heads()? {
            if head.hash == my_head.hash {
                continue;
            }
            if !reject_tag.is_empty() && head.tag.contains(reject_tag) {
                debug!(head = %head.short_hash(), "skipping rejected head");
                continue;
            }
            if head.branch != my_head.branch {
                continue;
            }

            let merge_failed = |source: VcsError| SyncError::MergeFailed {
                with_user: head.user_id.clone(),
                source,
            };

            if self
                .repo
                .common_ancestor(&my_head.hash, &head.hash)
                .map_err(merge_failed)?
                .is_none()
            {
                warn!(
                    ours = %my_head.short_hash(),
                    ours_user = %my_head.user_id,
                    theirs = %head.short_hash(),
                    theirs_user = %head.user_id,
                    "repository anomaly: heads have no common ancestor, not merging"
                );
                continue;
            }

            info!(ours = %alpha, theirs = %head.user_id, head = %head.short_hash(), "merging");
            let situation = MergeSituation::new(
                alpha,
                my_head.hash.clone(),
                head.user_id.clone(),
                head.hash.clone(),
                self.config.sync.conflict_mode,
            );
            let mut hook = HandlerMergeHook {
                handlers: &self.handlers,
                situation,
                head: head.hash.clone(),
                reports: Vec::new(),
            };
            let merged = self
                .repo
                .merge_revisions(&head, &mut hook)
                .map_err(merge_failed)?;
            cycle.merge_reports.append(&mut hook.reports);

            if merged {
                let summary = format!("Merged {} with {}", alpha, head.user_id);
                if let Some(revision) = self
                    .repo
                    .commit_all(
                        &self.config.sync.include_patterns,
                        &self.config.sync.exclude_patterns,
                        &summary,
                    )
                    .map_err(merge_failed)?
                {
                    my_head = revision;
                }
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Push
    // -----------------------------------------------------------------------

    fn send_to_others(&self, sources: &[RemoteSource], cycle: &mut Cycle) -> Result<(), Halt> {
        for source in sources {
            self.check_cancel()?;
            if !source.read_only {
                self.send_to_one(source, cycle)?;
            }
        }
        self.check_cancel()
    }

    fn send_to_one(&self, source: &RemoteSource, cycle: &mut Cycle) -> Result<(), SyncError> {
        let can_connect = *cycle
            .connectivity
            .entry(source.uri.clone())
            .or_insert_with(|| self.repo.can_connect(source));
        let send_failed = |err: VcsError| SyncError::SendFailed {
            name: source.name.clone(),
            uri: source.uri.clone(),
            source: err,
        };

        if can_connect {
            if self.config.sync.suppress_push {
                warn!(remote = %source.name, "skipping push because suppress_push is set");
                return Ok(());
            }
            self.repo.push(source).map_err(send_failed)?;
            info!(remote = %source.name, "sent changes");
        } else if source.kind.clones_when_missing() {
            match self.repo.clone_to(source) {
                Ok(target) => {
                    info!(remote = %source.name, target = %target, "created repository by cloning");
                    cycle.connectivity.insert(source.uri.clone(), true);
                }
                Err(err) => {
                    warn!(remote = %source.name, error = %err, "could not create repository");
                }
            }
        } else {
            warn!(remote = %source.name, uri = %source.uri, "could not connect, not sending");
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Update and rollback
    // -----------------------------------------------------------------------

    /// Move the working copy to the head that is `before` or descends from
    /// it. Stays put with a warning if none qualifies.
    fn update_to_descendant(&self, before: Option<&Revision>) -> Result<(), SyncError> {
        let heads = self.repo.heads().map_err(SyncError::UpdateFailed)?;
        if heads.is_empty() {
            return Ok(());
        }
        let before = match before {
            Some(before) if heads.len() > 1 => before,
            _ => {
                return self
                    .repo
                    .update_working_copy()
                    .map_err(SyncError::UpdateFailed);
            }
        };

        for head in &heads {
            let descends = head.hash == before.hash
                || self
                    .repo
                    .common_ancestor(&head.hash, &before.hash)
                    .map_err(SyncError::UpdateFailed)?
                    .is_some_and(|a| a.hash == before.hash);
            if descends {
                debug!(head = %head.short_hash(), "updating to descendant head");
                return self.repo.update_to(head).map_err(SyncError::UpdateFailed);
            }
        }

        warn!(heads = heads.len(), "staying at previous tip (unusual)");
        Ok(())
    }

    fn roll_back(&self, before: Option<&Revision>) {
        self.set_state(SyncState::RollingBack);
        let killed = self.repo.terminate_merge_helpers();
        if killed > 0 {
            warn!(count = killed, "killed merge helper processes");
        }
        let Some(before) = before else {
            warn!("no revision recorded before the cycle, nothing to roll back to");
            return;
        };
        error!(revision = before.local_number, hash = %before.short_hash(), "rolling back");
        if let Err(err) = self.repo.rollback_working_copy_to(before.local_number) {
            error!(error = %err, "rollback failed");
        }
    }
}

// ---------------------------------------------------------------------------
// Merge hook
// ---------------------------------------------------------------------------

/// Routes each conflicting file to its handler and keeps the reports.
struct HandlerMergeHook<'h> {
    handlers: &'h HandlerRegistry,
    situation: MergeSituation,
    head: String,
    reports: Vec<FileMergeReport>,
}

impl MergeHook for HandlerMergeHook<'_> {
    fn merge_file(
        &mut self,
        relative_path: &str,
        ours: &Path,
        ancestor: &Path,
        theirs: &Path,
    ) -> Result<(), MergeError> {
        let handler = self.handlers.handler_for(relative_path);
        let mut collected = MergeReports::new();
        {
            let mut order =
                MergeOrder::new(ours, ancestor, theirs, self.situation.clone(), &mut collected);
            handler.do_three_way_merge(&mut order)?;
        }
        info!(
            file = relative_path,
            handler = handler.name(),
            changes = collected.changes.len(),
            conflicts = collected.conflicts.len(),
            "merged file"
        );
        self.reports
            .push(FileMergeReport::new(relative_path, self.head.clone(), collected));
        Ok(())
    }
}

/// Releases the sync lock when dropped.
struct SyncLockGuard(Arc<AtomicBool>);

impl Drop for SyncLockGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}
