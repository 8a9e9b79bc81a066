use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use fieldcast_core::{failure, CancelToken, FailureCode};
use serde::{Deserialize, Serialize};

use crate::manager::ServiceManager;
use crate::unit_file::{custom_environment_lines, generate_unit, splice_custom_lines, UnitSpec};

/// Where the coordinator is in the stop/reinstall/restore choreography.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServicePhase {
    Absent,
    Detected,
    Stopped,
    Reinstalled,
    Restored,
    RolledBack,
}

impl ServicePhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Absent => "absent",
            Self::Detected => "detected",
            Self::Stopped => "stopped",
            Self::Reinstalled => "reinstalled",
            Self::Restored => "restored",
            Self::RolledBack => "rolled-back",
        }
    }
}

/// Everything needed to put the service back the way it was: captured before
/// stopping, consumed after reinstallation, and carried inside the update
/// marker for crash recovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ServiceSnapshot {
    pub installed: bool,
    pub was_running: bool,
    pub was_enabled: bool,
    pub custom_environment_lines: Vec<String>,
    pub backup_unit_path: Option<PathBuf>,
    pub backup_cron_path: Option<PathBuf>,
}

pub struct ServiceLifecycleCoordinator {
    manager: Box<dyn ServiceManager>,
    unit_name: String,
    unit_path: PathBuf,
    cron_path: PathBuf,
    backup_dir: PathBuf,
    stop_timeout: Duration,
    start_timeout: Duration,
    poll_interval: Duration,
    phase: ServicePhase,
}

impl ServiceLifecycleCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        manager: Box<dyn ServiceManager>,
        unit_name: impl Into<String>,
        unit_path: impl Into<PathBuf>,
        cron_path: impl Into<PathBuf>,
        backup_dir: impl Into<PathBuf>,
        stop_timeout: Duration,
        start_timeout: Duration,
        poll_interval: Duration,
    ) -> Self {
        Self {
            manager,
            unit_name: unit_name.into(),
            unit_path: unit_path.into(),
            cron_path: cron_path.into(),
            backup_dir: backup_dir.into(),
            stop_timeout,
            start_timeout,
            poll_interval,
            phase: ServicePhase::Absent,
        }
    }

    pub fn phase(&self) -> ServicePhase {
        self.phase
    }

    pub fn unit_name(&self) -> &str {
        &self.unit_name
    }

    /// Capture the service's current definition and state. No side effects.
    pub fn detect(&mut self) -> Result<ServiceSnapshot> {
        if !self.manager.available() || !self.unit_path.exists() {
            self.phase = ServicePhase::Absent;
            return Ok(ServiceSnapshot::default());
        }

        let unit_text = fs::read_to_string(&self.unit_path)
            .with_context(|| format!("failed reading unit file: {}", self.unit_path.display()))?;
        let snapshot = ServiceSnapshot {
            installed: true,
            was_running: self.manager.is_active(&self.unit_name)?,
            was_enabled: self.manager.is_enabled(&self.unit_name)?,
            custom_environment_lines: custom_environment_lines(&unit_text),
            backup_unit_path: None,
            backup_cron_path: None,
        };
        self.phase = ServicePhase::Detected;
        Ok(snapshot)
    }

    /// Copy the live definition (and the cron companion, when present) to
    /// timestamped backup paths. Must run before any mutation.
    pub fn backup(&self, snapshot: &mut ServiceSnapshot) -> Result<()> {
        if !snapshot.installed {
            return Ok(());
        }
        fs::create_dir_all(&self.backup_dir).map_err(|err| {
            io_failure(
                err,
                format!("failed creating backup dir: {}", self.backup_dir.display()),
            )
        })?;

        let stamp = unix_timestamp();
        let unit_backup = self
            .backup_dir
            .join(format!("{}.service.{stamp}.bak", self.unit_name));
        copy_with_permission_code(&self.unit_path, &unit_backup)?;
        snapshot.backup_unit_path = Some(unit_backup);

        if self.cron_path.exists() {
            let cron_backup = self
                .backup_dir
                .join(format!("{}.cron.{stamp}.bak", self.unit_name));
            copy_with_permission_code(&self.cron_path, &cron_backup)?;
            snapshot.backup_cron_path = Some(cron_backup);
        }
        Ok(())
    }

    /// Stop the service: graceful first, poll for convergence, escalate to a
    /// kill, and fail only if the unit is still active after that. A failure
    /// here aborts the update before anything touches the workspace.
    pub fn stop(&mut self, snapshot: &ServiceSnapshot, cancel: &CancelToken) -> Result<()> {
        if !snapshot.installed {
            return Ok(());
        }
        if !self.manager.is_active(&self.unit_name)? {
            self.phase = ServicePhase::Stopped;
            return Ok(());
        }

        self.manager.stop(&self.unit_name).map_err(|err| {
            failure(
                FailureCode::ServiceStopFailed,
                format!("stop request for '{}' failed: {err:#}", self.unit_name),
            )
        })?;
        if self.poll_until_inactive(self.stop_timeout, cancel)? {
            self.phase = ServicePhase::Stopped;
            return Ok(());
        }

        self.manager.kill(&self.unit_name).map_err(|err| {
            failure(
                FailureCode::ServiceStopFailed,
                format!("kill request for '{}' failed: {err:#}", self.unit_name),
            )
        })?;
        if self.poll_until_inactive(self.stop_timeout, cancel)? {
            self.phase = ServicePhase::Stopped;
            return Ok(());
        }

        Err(failure(
            FailureCode::ServiceStopFailed,
            format!(
                "'{}' is still active after graceful stop and kill within {}s",
                self.unit_name,
                self.stop_timeout.as_secs()
            ),
        ))
    }

    /// Regenerate the unit from the (possibly updated) generator inputs and
    /// splice the recorded custom assignments back in, then reload the
    /// service manager's view of definitions.
    pub fn reinstall(&mut self, spec: &UnitSpec, snapshot: &ServiceSnapshot) -> Result<()> {
        if !snapshot.installed {
            return Ok(());
        }
        let generated = generate_unit(spec);
        let merged = splice_custom_lines(&generated, &snapshot.custom_environment_lines)?;
        write_with_permission_code(&self.unit_path, &merged)?;
        self.manager.daemon_reload()?;
        if snapshot.was_enabled {
            self.manager.enable(&self.unit_name)?;
        }
        self.phase = ServicePhase::Reinstalled;
        Ok(())
    }

    /// Start the service again, but only if it was running before the
    /// switch. Poll for activation; report failures with concrete places to
    /// look instead of swallowing them.
    pub fn start(&mut self, snapshot: &ServiceSnapshot, cancel: &CancelToken) -> Result<()> {
        if !snapshot.installed || !snapshot.was_running {
            self.phase = ServicePhase::Restored;
            return Ok(());
        }

        self.manager.start(&self.unit_name).map_err(|err| {
            failure(
                FailureCode::ServiceStartFailed,
                format!("start request for '{}' failed: {err:#}", self.unit_name),
            )
        })?;
        if self.poll_until_active(self.start_timeout, cancel)? {
            self.phase = ServicePhase::Restored;
            return Ok(());
        }

        Err(failure(
            FailureCode::ServiceStartFailed,
            format!(
                "'{}' did not become active within {}s; \
                 check `systemctl status {}` and `journalctl -u {} -n 50`",
                self.unit_name,
                self.start_timeout.as_secs(),
                self.unit_name,
                self.unit_name
            ),
        ))
    }

    /// Put the pre-switch definition files back and reload. Used by rollback
    /// and by the reinstall/start failure path.
    pub fn restore_from_backup(&mut self, snapshot: &ServiceSnapshot) -> Result<()> {
        if !snapshot.installed {
            return Ok(());
        }
        if let Some(backup) = &snapshot.backup_unit_path {
            copy_with_permission_code(backup, &self.unit_path)?;
        }
        if let Some(backup) = &snapshot.backup_cron_path {
            copy_with_permission_code(backup, &self.cron_path)?;
        }
        self.manager.daemon_reload()?;
        self.phase = ServicePhase::RolledBack;
        Ok(())
    }

    /// Best-effort restart after a restore; rollback must not fail just
    /// because the old service will not come back up, but the operator needs
    /// to know.
    pub fn try_restart_after_restore(&mut self, snapshot: &ServiceSnapshot) -> Option<String> {
        if !snapshot.installed || !snapshot.was_running {
            return None;
        }
        match self.manager.start(&self.unit_name) {
            Ok(()) => None,
            Err(err) => Some(format!(
                "restored '{}' but could not restart it: {err:#}",
                self.unit_name
            )),
        }
    }

    /// Remove backup files after a confirmed-successful update.
    pub fn cleanup_backup(&self, snapshot: &ServiceSnapshot) {
        if let Some(backup) = &snapshot.backup_unit_path {
            let _ = fs::remove_file(backup);
        }
        if let Some(backup) = &snapshot.backup_cron_path {
            let _ = fs::remove_file(backup);
        }
    }

    pub fn is_active_now(&self) -> Result<bool> {
        if !self.manager.available() {
            return Ok(false);
        }
        self.manager.is_active(&self.unit_name)
    }

    pub fn is_enabled_now(&self) -> Result<bool> {
        if !self.manager.available() {
            return Ok(false);
        }
        self.manager.is_enabled(&self.unit_name)
    }

    fn poll_until_inactive(&self, timeout: Duration, cancel: &CancelToken) -> Result<bool> {
        let deadline = Instant::now() + timeout;
        loop {
            cancel.check("service stop")?;
            if !self.manager.is_active(&self.unit_name)? {
                return Ok(true);
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
            std::thread::sleep(self.poll_interval);
        }
    }

    fn poll_until_active(&self, timeout: Duration, cancel: &CancelToken) -> Result<bool> {
        let deadline = Instant::now() + timeout;
        loop {
            cancel.check("service start")?;
            if self.manager.is_active(&self.unit_name)? {
                return Ok(true);
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
            std::thread::sleep(self.poll_interval);
        }
    }
}

fn unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0)
}

fn io_failure(err: io::Error, message: String) -> anyhow::Error {
    if err.kind() == io::ErrorKind::PermissionDenied {
        failure(FailureCode::PermissionError, format!("{message}: {err}"))
    } else {
        anyhow::Error::new(err).context(message)
    }
}

fn copy_with_permission_code(from: &Path, to: &Path) -> Result<()> {
    fs::copy(from, to)
        .map_err(|err| {
            io_failure(
                err,
                format!("failed copying {} to {}", from.display(), to.display()),
            )
        })
        .map(|_| ())
}

fn write_with_permission_code(path: &Path, content: &str) -> Result<()> {
    fs::write(path, content)
        .map_err(|err| io_failure(err, format!("failed writing {}", path.display())))
}
