use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use fieldcast_core::{failure, FailureCode};
use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};

/// How long a claim may sit without a readable owner before a contender may
/// treat it as abandoned. Covers the window between `create_dir` and the
/// pid write, and a reclaimer that died while holding the reclaim marker.
const ABANDONED_CLAIM_GRACE: Duration = Duration::from_secs(5);

/// Recorded inside the lock directory so contenders can tell a live holder
/// from a crashed one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct LockInfo {
    pid: u32,
    program: String,
    acquired_at: u64,
}

/// Directory-based mutual exclusion for the whole update state. The
/// directory creation is the atomic claim; a `pid` file inside names the
/// holder. Dropping the handle releases the lock.
#[derive(Debug)]
pub struct UpdateLock {
    dir: PathBuf,
    released: bool,
}

impl UpdateLock {
    /// Claim the lock, waiting up to `wait` for a live holder to finish.
    /// A holder whose PID is dead, or whose PID now belongs to an unrelated
    /// program, is stale and gets reclaimed.
    pub fn acquire(dir: &Path, program: &str, wait: Duration, poll: Duration) -> Result<Self> {
        if let Some(parent) = dir.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed creating state dir: {}", parent.display()))?;
        }

        let deadline = Instant::now() + wait;
        loop {
            match fs::create_dir(dir) {
                Ok(()) => {
                    let info = LockInfo {
                        pid: std::process::id(),
                        program: program.to_string(),
                        acquired_at: unix_timestamp(),
                    };
                    let encoded = serde_json::to_string_pretty(&info)
                        .context("failed encoding lock info")?;
                    if let Err(err) = fs::write(dir.join("pid"), encoded) {
                        let _ = fs::remove_dir_all(dir);
                        return Err(err).with_context(|| {
                            format!("failed recording lock owner in {}", dir.display())
                        });
                    }
                    return Ok(Self {
                        dir: dir.to_path_buf(),
                        released: false,
                    });
                }
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                    match Self::holder(dir) {
                        Some(info) if !is_stale(&info) => {
                            if Instant::now() >= deadline {
                                return Err(failure(
                                    FailureCode::Locked,
                                    format!(
                                        "another update (pid {}) holds the lock at {}",
                                        info.pid,
                                        dir.display()
                                    ),
                                ));
                            }
                            std::thread::sleep(poll);
                        }
                        Some(info) => {
                            // Stale holder: only the contender that wins the
                            // reclaim marker may remove it.
                            if !Self::reclaim(dir, Some(&info))? {
                                if Instant::now() >= deadline {
                                    return Err(failure(
                                        FailureCode::Locked,
                                        format!(
                                            "could not reclaim the stale lock at {}",
                                            dir.display()
                                        ),
                                    ));
                                }
                                std::thread::sleep(poll);
                            }
                        }
                        None => {
                            // No readable pid file. Either the holder crashed
                            // mid-claim or another contender is between
                            // create_dir and the write; the reclaim refuses
                            // removal until the directory has aged past the
                            // claim window.
                            if !Self::reclaim(dir, None)? {
                                if Instant::now() >= deadline {
                                    return Err(failure(
                                        FailureCode::Locked,
                                        format!(
                                            "lock at {} is held with no readable owner",
                                            dir.display()
                                        ),
                                    ));
                                }
                                std::thread::sleep(poll);
                            }
                        }
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::PermissionDenied => {
                    return Err(failure(
                        FailureCode::PermissionError,
                        format!("cannot create lock {}: {err}", dir.display()),
                    ));
                }
                Err(err) => {
                    return Err(err)
                        .with_context(|| format!("failed creating lock {}", dir.display()));
                }
            }
        }
    }

    fn holder(dir: &Path) -> Option<LockInfo> {
        let raw = fs::read_to_string(dir.join("pid")).ok()?;
        serde_json::from_str(&raw).ok()
    }

    /// Single-winner removal of a dead claim. Contenders race for a sibling
    /// marker directory; the winner re-reads the holder under the marker and
    /// removes the lock only while it still carries the exact claim that was
    /// observed, so a fresh claim that replaced the dead one in the meantime
    /// survives. Returns whether the lock directory was removed.
    fn reclaim(dir: &Path, observed: Option<&LockInfo>) -> Result<bool> {
        let marker = dir.with_extension("lock.reclaim");
        match fs::create_dir(&marker) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                // A reclaimer that died here would block everyone; age its
                // marker out.
                if lock_dir_age(&marker) > ABANDONED_CLAIM_GRACE {
                    let _ = fs::remove_dir(&marker);
                }
                return Ok(false);
            }
            Err(err) => {
                return Err(err).with_context(|| {
                    format!("failed claiming reclaim marker {}", marker.display())
                });
            }
        }

        let current = Self::holder(dir);
        let removable = match observed {
            Some(_) => current.as_ref() == observed,
            None => current.is_none() && lock_dir_age(dir) > ABANDONED_CLAIM_GRACE,
        };
        if removable {
            let _ = fs::remove_dir_all(dir);
        }
        let _ = fs::remove_dir(&marker);
        Ok(removable)
    }

    /// Release explicitly. Only removes the directory when this process is
    /// still the recorded holder.
    pub fn release(mut self) -> Result<()> {
        self.release_inner()
    }

    fn release_inner(&mut self) -> Result<()> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        match Self::holder(&self.dir) {
            Some(info) if info.pid == std::process::id() => fs::remove_dir_all(&self.dir)
                .with_context(|| {
                    format!("failed releasing update lock: {}", self.dir.display())
                }),
            // Reclaimed out from under us, already gone, or unreadable; an
            // unreadable owner may be a contender mid-claim, so the
            // directory is not ours to remove.
            _ => Ok(()),
        }
    }
}

impl Drop for UpdateLock {
    fn drop(&mut self) {
        let _ = self.release_inner();
    }
}

fn is_stale(info: &LockInfo) -> bool {
    if info.program.is_empty() {
        return false;
    }
    if matches!(kill(Pid::from_raw(info.pid as i32), None), Err(Errno::ESRCH)) {
        return true;
    }
    // The PID is alive; make sure it still belongs to the program that
    // claimed the lock and was not recycled by the kernel.
    match fs::read(format!("/proc/{}/cmdline", info.pid)) {
        Ok(cmdline) => !cmdline
            .windows(info.program.len())
            .any(|window| window == info.program.as_bytes()),
        Err(_) => false,
    }
}

fn lock_dir_age(dir: &Path) -> Duration {
    fs::metadata(dir)
        .and_then(|meta| meta.modified())
        .ok()
        .and_then(|modified| modified.elapsed().ok())
        .unwrap_or(Duration::MAX)
}

fn unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0)
}
