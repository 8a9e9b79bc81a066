use anyhow::Result;

use crate::git::GitCli;

/// Classification of the workspace. Only `Clean` and `Dirty` are valid
/// starting points for a version switch; every in-progress state must be
/// resolved by the operator before the engine will touch the checkout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepoState {
    Clean,
    Dirty,
    MergeInProgress,
    RebaseInProgress,
    RevertInProgress,
    CherryPickInProgress,
    BisectInProgress,
    SequencerInProgress,
}

impl RepoState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Clean => "clean",
            Self::Dirty => "dirty",
            Self::MergeInProgress => "merge-in-progress",
            Self::RebaseInProgress => "rebase-in-progress",
            Self::RevertInProgress => "revert-in-progress",
            Self::CherryPickInProgress => "cherry-pick-in-progress",
            Self::BisectInProgress => "bisect-in-progress",
            Self::SequencerInProgress => "sequencer-in-progress",
        }
    }

    pub fn is_operation_in_progress(&self) -> bool {
        !matches!(self, Self::Clean | Self::Dirty)
    }

    /// Inspect git metadata and report the current state. Read-only, derived
    /// fresh on every call. In-progress markers are checked most specific
    /// first; the dirtiness check runs only when none of them is present.
    pub fn classify(git: &GitCli) -> Result<Self> {
        let git_dir = git.git_dir()?;

        if git_dir.join("MERGE_HEAD").exists() {
            return Ok(Self::MergeInProgress);
        }
        if git_dir.join("rebase-merge").exists() || git_dir.join("rebase-apply").exists() {
            return Ok(Self::RebaseInProgress);
        }
        if git_dir.join("REVERT_HEAD").exists() {
            return Ok(Self::RevertInProgress);
        }
        if git_dir.join("CHERRY_PICK_HEAD").exists() {
            return Ok(Self::CherryPickInProgress);
        }
        if git_dir.join("BISECT_LOG").exists() {
            return Ok(Self::BisectInProgress);
        }
        if git_dir.join("sequencer").join("todo").exists() {
            return Ok(Self::SequencerInProgress);
        }

        if git.status_porcelain()?.is_empty() {
            Ok(Self::Clean)
        } else {
            Ok(Self::Dirty)
        }
    }
}
