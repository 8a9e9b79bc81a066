use anyhow::Result;
use fieldcast_core::{failure, FailureCode};
use fieldcast_vcs::{GitCli, StashHandle, VersionTarget};

/// One version switch as a unit of work. Records where the workspace was,
/// optionally where local edits went, and knows how to put both back.
/// Nothing here is durable; crash recovery is the marker's job.
pub struct Transaction {
    label: String,
    original_ref: String,
    original_head: String,
    stash: Option<StashHandle>,
    active: bool,
}

impl Transaction {
    pub fn begin(git: &GitCli, label: &str) -> Result<Self> {
        Ok(Self {
            label: label.to_string(),
            original_ref: git.current_ref()?,
            original_head: git.head_commit()?,
            stash: None,
            active: true,
        })
    }

    pub fn original_ref(&self) -> &str {
        &self.original_ref
    }

    pub fn original_head(&self) -> &str {
        &self.original_head
    }

    pub fn stash(&self) -> Option<&StashHandle> {
        self.stash.as_ref()
    }

    /// Stash local edits including untracked files. Records the handle only
    /// when git actually created a stash.
    pub fn stash_if_dirty(&mut self, git: &GitCli) -> Result<bool> {
        if self.stash.is_some() {
            anyhow::bail!("transaction already holds a stash");
        }
        self.stash = git.stash_push(&self.label)?;
        Ok(self.stash.is_some())
    }

    /// Move to the target and verify the move: HEAD must resolve to the
    /// commit the target resolved to, even when git itself exited zero.
    pub fn checkout(&self, git: &GitCli, target: &VersionTarget) -> Result<()> {
        git.checkout(&target.refname)?;
        let head = git.head_commit()?;
        if head != target.resolved_commit {
            return Err(failure(
                FailureCode::CheckoutVerificationFailed,
                format!(
                    "checkout of '{}' left HEAD at {} instead of {}",
                    target.refname, head, target.resolved_commit
                ),
            ));
        }
        Ok(())
    }

    /// Bring stashed edits back after a successful switch. Conflicts are a
    /// warning, never grounds for rollback; the stash commit survives for
    /// manual recovery.
    pub fn restore_stash(&mut self, git: &GitCli) -> Option<String> {
        let handle = self.stash.take()?;
        restore_stash_handle(git, &handle)
    }

    /// Undo everything this transaction did. Tolerant of partial failure;
    /// every step that cannot complete becomes a warning with the data the
    /// operator needs to finish by hand. No-op once committed or rolled
    /// back.
    pub fn rollback(&mut self, git: &GitCli) -> Vec<String> {
        if !self.active {
            return Vec::new();
        }
        self.active = false;

        let mut warnings = Vec::new();
        if let Err(primary) = git.checkout(&self.original_ref) {
            if let Err(fallback) = git.checkout(&self.original_head) {
                warnings.push(format!(
                    "could not restore '{}' ({primary:#}) nor detach at {} ({fallback:#})",
                    self.original_ref, self.original_head
                ));
            }
        }
        if let Some(handle) = self.stash.take() {
            if let Some(warning) = restore_stash_handle(git, &handle) {
                warnings.push(warning);
            }
        }
        warnings
    }

    /// Mark the switch as done; rollback becomes a no-op.
    pub fn commit(&mut self) {
        self.active = false;
    }
}

/// Pop a recorded stash; fall back to apply-by-commit when the pop fails
/// (conflicts, shifted reflog). Returns a warning when anything short of a
/// clean pop happened.
pub fn restore_stash_handle(git: &GitCli, handle: &StashHandle) -> Option<String> {
    if git.stash_pop(handle).is_ok() {
        return None;
    }
    match git.stash_apply(handle) {
        Ok(()) => Some(format!(
            "stashed changes were applied but not dropped; stash commit {} remains",
            handle.commit
        )),
        Err(err) => Some(format!(
            "could not restore stashed changes: {err:#}; recover with `git stash apply {}`",
            handle.commit
        )),
    }
}
