use std::fs;
use std::io;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use fieldcast_service::ServiceSnapshot;
use fieldcast_vcs::StashHandle;
use serde::{Deserialize, Serialize};

/// Durable record of an in-flight update, written before the service is
/// stopped and removed only after a confirmed finish or a confirmed
/// rollback. Its presence at startup means the previous run died mid-switch
/// and must be resolved before anything else.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateMarker {
    pub started_at: u64,
    pub operation: String,
    pub original_ref: String,
    pub original_head: String,
    pub target_refname: String,
    pub target_commit: String,
    pub stash_commit: Option<String>,
    pub stash_label: Option<String>,
    pub service: ServiceSnapshot,
}

impl UpdateMarker {
    pub fn stash_handle(&self) -> Option<StashHandle> {
        let commit = self.stash_commit.clone()?;
        Some(StashHandle {
            commit,
            label: self.stash_label.clone().unwrap_or_default(),
        })
    }

    /// Claim the marker file. `create_new` makes the claim atomic; an
    /// existing marker means an unresolved earlier update, which is a hard
    /// error rather than something to overwrite.
    pub fn write(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed creating state dir: {}", parent.display()))?;
        }
        let file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o600)
            .open(path)
            .with_context(|| format!("failed claiming update marker: {}", path.display()))?;
        serde_json::to_writer_pretty(file, self)
            .with_context(|| format!("failed writing update marker: {}", path.display()))
    }

    pub fn load(path: &Path) -> Result<Option<Self>> {
        let raw = match fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed reading update marker: {}", path.display()))
            }
        };
        let marker = serde_json::from_str(&raw)
            .with_context(|| format!("corrupt update marker: {}", path.display()))?;
        Ok(Some(marker))
    }

    pub fn clear(path: &Path) -> Result<()> {
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err)
                .with_context(|| format!("failed clearing update marker: {}", path.display())),
        }
    }
}

pub fn unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0)
}
