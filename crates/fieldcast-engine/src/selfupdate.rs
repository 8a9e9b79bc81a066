use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{Context, Result};
use fieldcast_core::{failure, FailureCode, UpdateConfig};
use fieldcast_vcs::{GitCli, StashHandle};
use sha2::{Digest, Sha256};

/// Watches the engine's own executable artifact across a switch. When the
/// switch replaces it, the running process must not continue with stale
/// code: the new artifact is syntax-checked, then control is handed to it.
pub struct SelfUpdateGuard {
    artifact_rel: PathBuf,
    artifact_abs: PathBuf,
    validator: Vec<String>,
}

impl SelfUpdateGuard {
    pub fn from_config(config: &UpdateConfig) -> Self {
        Self {
            artifact_rel: config.self_artifact.clone(),
            artifact_abs: config.self_artifact_abs(),
            validator: config.artifact_validator.clone(),
        }
    }

    pub fn artifact_abs(&self) -> &Path {
        &self.artifact_abs
    }

    /// sha2 digest of the artifact on disk; None when it does not exist at
    /// the current revision.
    pub fn fingerprint(&self) -> Result<Option<String>> {
        match std::fs::read(&self.artifact_abs) {
            Ok(bytes) => Ok(Some(hex::encode(Sha256::digest(&bytes)))),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err).with_context(|| {
                format!("failed reading artifact: {}", self.artifact_abs.display())
            }),
        }
    }

    /// Whether history touches the artifact path between two revisions.
    /// A touch-only commit still shows up here; the caller cross-checks
    /// fingerprints to avoid a pointless handoff.
    pub fn changed_between(&self, git: &GitCli, old: &str, new: &str) -> Result<bool> {
        git.path_changed_between(old, new, &self.artifact_rel)
    }

    /// Run the configured syntax gate against the freshly checked-out
    /// artifact. A rejected artifact is never executed.
    pub fn validate(&self) -> Result<()> {
        let program = self
            .validator
            .first()
            .context("artifact validator command is empty")?;
        let output = Command::new(program)
            .args(&self.validator[1..])
            .arg(&self.artifact_abs)
            .output()
            .with_context(|| format!("failed launching validator '{program}'"))?;
        if !output.status.success() {
            return Err(failure(
                FailureCode::ArtifactValidationFailed,
                format!(
                    "{} rejected {}: {}",
                    self.validator.join(" "),
                    self.artifact_abs.display(),
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            ));
        }
        Ok(())
    }
}

/// What the replacement process must finish on our behalf: the stashed
/// local edits, or an explicit nothing. Travels as argv across the exec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CarryState {
    None,
    Stash { commit: String },
}

impl CarryState {
    pub fn from_stash(stash: Option<&StashHandle>) -> Self {
        match stash {
            Some(handle) => Self::Stash {
                commit: handle.commit.clone(),
            },
            None => Self::None,
        }
    }

    pub fn as_args(&self) -> Vec<String> {
        match self {
            Self::None => vec!["--carry-none".to_string()],
            Self::Stash { commit } => vec!["--carry-stash".to_string(), commit.clone()],
        }
    }
}

/// Instruction to the front end to replace this process with the new
/// artifact. Built by the engine; only `main` performs the exec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handoff {
    pub artifact: PathBuf,
    pub args: Vec<String>,
}
