use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use fieldcast_core::{failure, CancelToken, FailureCode, UpdateConfig};
use fieldcast_service::{
    ServiceLifecycleCoordinator, ServiceManager, SystemdManager, UnitSpec,
};
use fieldcast_vcs::{Candidates, GitCli, RepoState, StashHandle, VersionResolver, VersionTarget};

use crate::lock::UpdateLock;
use crate::marker::{unix_timestamp, UpdateMarker};
use crate::selfupdate::{CarryState, Handoff, SelfUpdateGuard};
use crate::transaction::{restore_stash_handle, Transaction};

pub const PROGRAM_NAME: &str = "fieldcast-update";

/// Required verbatim by `hard_reset`; a plain yes/no is not enough consent
/// to discard local changes.
pub const RESET_CONFIRMATION_TOKEN: &str = "discard-local-changes";

/// Fixed locations of the engine's durable state under the configured
/// state directory.
pub struct StatePaths {
    state_dir: PathBuf,
}

impl StatePaths {
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            state_dir: state_dir.into(),
        }
    }

    pub fn lock_dir(&self) -> PathBuf {
        self.state_dir.join("update.lock")
    }

    pub fn marker_file(&self) -> PathBuf {
        self.state_dir.join("update-marker.json")
    }

    pub fn backups_dir(&self) -> PathBuf {
        self.state_dir.join("backups")
    }
}

/// What to do with local edits when switching out of a dirty workspace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DirtyPolicy {
    /// Stash before the switch, restore after. The default.
    #[default]
    Stash,
    /// Throw local edits away before switching.
    Discard,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwitchReport {
    pub from_ref: String,
    pub from_commit: String,
    pub target: VersionTarget,
    pub stashed: bool,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SwitchOutcome {
    Completed(SwitchReport),
    AlreadyAtTarget {
        target: VersionTarget,
        warnings: Vec<String>,
    },
    /// The switch replaced this program's own artifact. The front end must
    /// exec `handoff.artifact` with `handoff.args`; the marker stays on
    /// disk for the new process to finish from.
    HandoffTo(Handoff),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResumeOutcome {
    /// HEAD was already at the interrupted target; the update was carried
    /// forward to completion.
    Completed {
        target_refname: String,
        warnings: Vec<String>,
    },
    /// The interrupted update was undone.
    RolledBack {
        restored_ref: String,
        warnings: Vec<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusReport {
    pub describe: String,
    pub current_ref: String,
    pub head_commit: String,
    pub repo_state: RepoState,
    pub service_active: bool,
    pub service_enabled: bool,
    pub marker_present: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResetReport {
    pub target: VersionTarget,
    pub warnings: Vec<String>,
}

/// Top-level coordinator. Owns every collaborator; no globals beyond the
/// signal flag the cancel token watches.
pub struct UpdateEngine {
    config: UpdateConfig,
    paths: StatePaths,
    git: GitCli,
    service: ServiceLifecycleCoordinator,
    cancel: CancelToken,
}

impl UpdateEngine {
    pub fn open(config: UpdateConfig) -> Self {
        let git = GitCli::new(&config.repo_root);
        let manager = Box::new(SystemdManager::detect());
        Self::with_collaborators(config, git, manager, CancelToken::new())
    }

    /// Test seam: inject a scripted git runner and service manager.
    pub fn with_collaborators(
        config: UpdateConfig,
        git: GitCli,
        manager: Box<dyn ServiceManager>,
        cancel: CancelToken,
    ) -> Self {
        let paths = StatePaths::new(&config.state_dir);
        let timeouts = &config.timeouts;
        let service = ServiceLifecycleCoordinator::new(
            manager,
            config.service_name.clone(),
            config.unit_file_path.clone(),
            config.cron_file_path.clone(),
            paths.backups_dir(),
            Duration::from_secs(timeouts.service_stop_secs),
            Duration::from_secs(timeouts.service_start_secs),
            Duration::from_millis(timeouts.service_poll_ms),
        );
        Self {
            config,
            paths,
            git,
            service,
            cancel,
        }
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Move the managed checkout to `input`, carrying the service and local
    /// edits across. Every failure before completion rolls back; a switch
    /// that replaces our own artifact returns a handoff instead of
    /// finishing here.
    pub fn switch(&mut self, input: &str, policy: DirtyPolicy) -> Result<SwitchOutcome> {
        let lock = self.acquire_lock()?;
        let mut warnings = Vec::new();
        note_resume(self.resume_with_lock(None)?, &mut warnings);

        let state = RepoState::classify(&self.git)?;
        if state.is_operation_in_progress() {
            return Err(failure(
                FailureCode::BadRepositoryState,
                format!(
                    "repository is {}; resolve that before switching versions",
                    state.as_str()
                ),
            ));
        }
        if let Some(warning) = self.fetch_with_warning()? {
            warnings.push(warning);
        }
        let target = self.resolver().resolve(input)?;
        if self.git.head_commit()? == target.resolved_commit {
            return Ok(SwitchOutcome::AlreadyAtTarget { target, warnings });
        }

        let label = format!("{PROGRAM_NAME}: switch to {}", target.refname);
        let mut tx = Transaction::begin(&self.git, &label)?;
        match self.switch_steps(&mut tx, &target, state, policy) {
            Ok(SwitchOutcome::Completed(mut report)) => {
                tx.commit();
                warnings.extend(report.warnings);
                report.warnings = warnings;
                Ok(SwitchOutcome::Completed(report))
            }
            Ok(SwitchOutcome::HandoffTo(handoff)) => {
                // The marker stays; the new process resumes from it. The
                // lock must be gone before the exec so the new process can
                // take it.
                tx.commit();
                lock.release()?;
                Ok(SwitchOutcome::HandoffTo(handoff))
            }
            Ok(outcome) => Ok(outcome),
            Err(err) => {
                let rollback_warnings = self.rollback_after_failure(&mut tx);
                if rollback_warnings.is_empty() {
                    Err(err)
                } else {
                    Err(err.context(format!(
                        "rollback finished with warnings: {}",
                        rollback_warnings.join("; ")
                    )))
                }
            }
        }
    }

    fn switch_steps(
        &mut self,
        tx: &mut Transaction,
        target: &VersionTarget,
        state: RepoState,
        policy: DirtyPolicy,
    ) -> Result<SwitchOutcome> {
        self.cancel.check("switch preparation")?;

        let mut stashed = false;
        if state == RepoState::Dirty {
            match policy {
                DirtyPolicy::Stash => {
                    stashed = tx.stash_if_dirty(&self.git)?;
                }
                DirtyPolicy::Discard => {
                    self.git.reset_hard("HEAD")?;
                }
            }
        }

        let mut snapshot = self.service.detect()?;
        self.service.backup(&mut snapshot)?;

        let marker = UpdateMarker {
            started_at: unix_timestamp(),
            operation: format!("switch {}", target.raw_input),
            original_ref: tx.original_ref().to_string(),
            original_head: tx.original_head().to_string(),
            target_refname: target.refname.clone(),
            target_commit: target.resolved_commit.clone(),
            stash_commit: tx.stash().map(|handle| handle.commit.clone()),
            stash_label: tx.stash().map(|handle| handle.label.clone()),
            service: snapshot.clone(),
        };
        marker.write(&self.paths.marker_file())?;

        self.service.stop(&snapshot, &self.cancel)?;

        let guard = SelfUpdateGuard::from_config(&self.config);
        let fingerprint_before = guard.fingerprint()?;

        self.cancel.check("checkout")?;
        tx.checkout(&self.git, target)?;

        let self_changed = guard.changed_between(
            &self.git,
            tx.original_head(),
            &target.resolved_commit,
        )? && fingerprint_before != guard.fingerprint()?;
        if self_changed {
            guard.validate()?;
            let carry = CarryState::from_stash(tx.stash());
            let mut args = vec!["resume".to_string()];
            args.extend(carry.as_args());
            return Ok(SwitchOutcome::HandoffTo(Handoff {
                artifact: guard.artifact_abs().to_path_buf(),
                args,
            }));
        }

        let spec = UnitSpec::stream_supervisor(&self.config.repo_root);
        self.service.reinstall(&spec, &snapshot)?;
        self.service.start(&snapshot, &self.cancel)?;

        let mut warnings = Vec::new();
        if let Some(warning) = tx.restore_stash(&self.git) {
            warnings.push(warning);
        }
        self.service.cleanup_backup(&snapshot);
        UpdateMarker::clear(&self.paths.marker_file())?;

        Ok(SwitchOutcome::Completed(SwitchReport {
            from_ref: tx.original_ref().to_string(),
            from_commit: tx.original_head().to_string(),
            target: target.clone(),
            stashed,
            warnings,
        }))
    }

    /// Finish or undo an update the marker says was interrupted. Ok(None)
    /// when there is nothing to resume. Runs under the lock the caller
    /// already holds when called internally; `resume` takes it.
    pub fn resume(&mut self, carry: Option<CarryState>) -> Result<Option<ResumeOutcome>> {
        let _lock = self.acquire_lock()?;
        self.resume_with_lock(carry)
    }

    fn resume_with_lock(&mut self, carry: Option<CarryState>) -> Result<Option<ResumeOutcome>> {
        let marker_path = self.paths.marker_file();
        let Some(marker) = UpdateMarker::load(&marker_path)? else {
            return Ok(None);
        };

        let stash = match carry {
            Some(CarryState::Stash { commit }) => Some(StashHandle {
                commit,
                label: format!("{PROGRAM_NAME} carry"),
            }),
            Some(CarryState::None) => None,
            None => marker.stash_handle(),
        };

        let head = self.git.head_commit()?;
        if head == marker.target_commit {
            let warnings = self.finish_forward(&marker, stash)?;
            UpdateMarker::clear(&marker_path)?;
            return Ok(Some(ResumeOutcome::Completed {
                target_refname: marker.target_refname,
                warnings,
            }));
        }

        let warnings = self.roll_back_marker(&marker, stash);
        UpdateMarker::clear(&marker_path)?;
        Ok(Some(ResumeOutcome::RolledBack {
            restored_ref: marker.original_ref,
            warnings,
        }))
    }

    /// HEAD already sits at the interrupted target: complete the service
    /// side and the stash restore. A service failure here restores the
    /// backup and fails the resume.
    fn finish_forward(
        &mut self,
        marker: &UpdateMarker,
        stash: Option<StashHandle>,
    ) -> Result<Vec<String>> {
        let snapshot = marker.service.clone();
        let spec = UnitSpec::stream_supervisor(&self.config.repo_root);
        let completed = self
            .service
            .reinstall(&spec, &snapshot)
            .and_then(|()| self.service.start(&snapshot, &self.cancel));
        if let Err(err) = completed {
            let mut restore_note = String::new();
            if let Err(restore_err) = self.service.restore_from_backup(&snapshot) {
                restore_note = format!("; backup restore also failed: {restore_err:#}");
            } else if let Some(warning) = self.service.try_restart_after_restore(&snapshot) {
                restore_note = format!("; {warning}");
            }
            return Err(err.context(format!(
                "could not finish the interrupted update{restore_note}"
            )));
        }

        let mut warnings = Vec::new();
        if let Some(handle) = stash {
            if let Some(warning) = restore_stash_handle(&self.git, &handle) {
                warnings.push(warning);
            }
        }
        self.service.cleanup_backup(&snapshot);
        Ok(warnings)
    }

    /// Undo an interrupted update from its marker. Fixed order, every step
    /// best-effort: workspace, stash, service, marker.
    fn roll_back_marker(
        &mut self,
        marker: &UpdateMarker,
        stash: Option<StashHandle>,
    ) -> Vec<String> {
        self.cancel.disarm();
        let mut warnings = Vec::new();

        if let Err(primary) = self.git.checkout(&marker.original_ref) {
            if let Err(fallback) = self.git.checkout(&marker.original_head) {
                warnings.push(format!(
                    "could not restore '{}' ({primary:#}) nor detach at {} ({fallback:#})",
                    marker.original_ref, marker.original_head
                ));
            }
        }
        if let Some(handle) = stash {
            if let Some(warning) = restore_stash_handle(&self.git, &handle) {
                warnings.push(warning);
            }
        }
        if let Err(err) = self.service.restore_from_backup(&marker.service) {
            warnings.push(format!("service restore failed: {err:#}"));
        } else {
            if let Some(warning) = self.service.try_restart_after_restore(&marker.service) {
                warnings.push(warning);
            }
            self.service.cleanup_backup(&marker.service);
        }

        self.cancel.rearm();
        warnings
    }

    /// Undo a failed in-process switch: transaction first, then whatever
    /// the marker recorded about the service.
    fn rollback_after_failure(&mut self, tx: &mut Transaction) -> Vec<String> {
        self.cancel.disarm();
        let mut warnings = tx.rollback(&self.git);

        let marker_path = self.paths.marker_file();
        match UpdateMarker::load(&marker_path) {
            Ok(Some(marker)) => {
                if let Err(err) = self.service.restore_from_backup(&marker.service) {
                    warnings.push(format!("service restore failed: {err:#}"));
                } else {
                    if let Some(warning) = self.service.try_restart_after_restore(&marker.service)
                    {
                        warnings.push(warning);
                    }
                    self.service.cleanup_backup(&marker.service);
                }
                if let Err(err) = UpdateMarker::clear(&marker_path) {
                    warnings.push(format!("could not clear the update marker: {err:#}"));
                }
            }
            Ok(None) => {}
            Err(err) => warnings.push(format!("could not read the update marker: {err:#}")),
        }

        self.cancel.rearm();
        warnings
    }

    /// Read-only snapshot for the `status` command. Takes no lock.
    pub fn status(&self) -> Result<StatusReport> {
        Ok(StatusReport {
            describe: self.git.describe()?,
            current_ref: self.git.current_ref()?,
            head_commit: self.git.head_commit()?,
            repo_state: RepoState::classify(&self.git)?,
            service_active: self.service.is_active_now()?,
            service_enabled: self.service.is_enabled_now()?,
            marker_present: self.paths.marker_file().exists(),
        })
    }

    /// Tags and branches the operator can switch to. Fetches first so the
    /// listing is fresh; a failed fetch degrades to cached refs with a
    /// warning.
    pub fn list(&self) -> Result<(Candidates, Option<String>)> {
        let warning = self.fetch_with_warning()?;
        let candidates = self.resolver().list_candidates()?;
        Ok((candidates, warning))
    }

    /// Destructive repair: discard every local change and force the
    /// checkout to the target. Requires the exact confirmation token.
    pub fn hard_reset(&mut self, input: &str, confirmation: &str) -> Result<ResetReport> {
        if confirmation != RESET_CONFIRMATION_TOKEN {
            anyhow::bail!(
                "hard reset discards all local changes; pass --confirm {RESET_CONFIRMATION_TOKEN} to proceed"
            );
        }
        let _lock = self.acquire_lock()?;
        let mut warnings = Vec::new();
        note_resume(self.resume_with_lock(None)?, &mut warnings);
        if let Some(warning) = self.fetch_with_warning()? {
            warnings.push(warning);
        }

        let target = self.resolver().resolve(input)?;
        let snapshot = self.service.detect()?;
        self.service.stop(&snapshot, &self.cancel)?;
        self.git
            .reset_hard(&target.resolved_commit)
            .with_context(|| format!("hard reset to {} failed", target.refname))?;
        let spec = UnitSpec::stream_supervisor(&self.config.repo_root);
        self.service.reinstall(&spec, &snapshot)?;
        self.service.start(&snapshot, &self.cancel)?;

        Ok(ResetReport { target, warnings })
    }

    fn acquire_lock(&self) -> Result<UpdateLock> {
        let timeouts = &self.config.timeouts;
        UpdateLock::acquire(
            &self.paths.lock_dir(),
            PROGRAM_NAME,
            Duration::from_secs(timeouts.lock_wait_secs),
            Duration::from_millis(timeouts.lock_poll_ms),
        )
    }

    fn resolver(&self) -> VersionResolver<'_> {
        VersionResolver::new(
            &self.git,
            self.config.remote_name.clone(),
            self.config.development_branch.clone(),
            self.config.stable_tag_prefix.clone(),
        )
    }

    /// Fetch with retries. Exhausted retries degrade to cached refs with a
    /// warning; an operator interrupt during the fetch still aborts.
    fn fetch_with_warning(&self) -> Result<Option<String>> {
        let timeouts = &self.config.timeouts;
        let result = self.resolver().fetch_remote(
            Duration::from_secs(timeouts.fetch_timeout_secs),
            timeouts.fetch_retries,
            Duration::from_secs(timeouts.fetch_retry_delay_secs),
            &self.cancel,
        );
        match result {
            Ok(()) => Ok(None),
            Err(err) if fieldcast_core::failure_code(&err) == Some(FailureCode::Interrupted) => {
                Err(err)
            }
            Err(err) => Ok(Some(format!("proceeding on cached refs: {err:#}"))),
        }
    }

    pub fn marker_file(&self) -> PathBuf {
        self.paths.marker_file()
    }

    pub fn repo_root(&self) -> &Path {
        &self.config.repo_root
    }
}

fn note_resume(outcome: Option<ResumeOutcome>, warnings: &mut Vec<String>) {
    match outcome {
        Some(ResumeOutcome::Completed {
            target_refname,
            warnings: resume_warnings,
        }) => {
            warnings.push(format!(
                "finished an earlier interrupted update to {target_refname}"
            ));
            warnings.extend(resume_warnings);
        }
        Some(ResumeOutcome::RolledBack {
            restored_ref,
            warnings: resume_warnings,
        }) => {
            warnings.push(format!(
                "rolled back an earlier interrupted update; workspace is back on {restored_ref}"
            ));
            warnings.extend(resume_warnings);
        }
        None => {}
    }
}
