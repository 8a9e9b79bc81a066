use std::process::Command;

use anyhow::{Context, Result};

/// Seam over the OS service manager. The real implementation drives
/// `systemctl`; tests substitute a scripted fake. Platforms without a
/// service manager get a permanently-unavailable implementation rather than
/// errors.
pub trait ServiceManager {
    fn available(&self) -> bool;
    fn is_active(&self, unit: &str) -> Result<bool>;
    fn is_enabled(&self, unit: &str) -> Result<bool>;
    fn start(&self, unit: &str) -> Result<()>;
    fn stop(&self, unit: &str) -> Result<()>;
    fn kill(&self, unit: &str) -> Result<()>;
    fn enable(&self, unit: &str) -> Result<()>;
    fn daemon_reload(&self) -> Result<()>;
    /// Read a named unit property (e.g. `NRestarts`); None when the manager
    /// does not expose it.
    fn show_property(&self, unit: &str, key: &str) -> Result<Option<String>>;
}

pub struct SystemdManager {
    available: bool,
}

impl SystemdManager {
    /// Probe for systemctl once at construction; a host without it degrades
    /// to `available() == false` and the coordinator treats the service as
    /// absent.
    pub fn detect() -> Self {
        let available = Command::new("systemctl")
            .arg("--version")
            .output()
            .map(|output| output.status.success())
            .unwrap_or(false);
        Self { available }
    }

    fn run(&self, args: &[&str]) -> Result<(bool, String)> {
        let output = Command::new("systemctl")
            .args(args)
            .output()
            .with_context(|| format!("failed launching systemctl {}", args.join(" ")))?;
        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        Ok((output.status.success(), stdout))
    }

    fn run_ok(&self, args: &[&str]) -> Result<()> {
        let output = Command::new("systemctl")
            .args(args)
            .output()
            .with_context(|| format!("failed launching systemctl {}", args.join(" ")))?;
        if !output.status.success() {
            anyhow::bail!(
                "systemctl {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(())
    }
}

impl ServiceManager for SystemdManager {
    fn available(&self) -> bool {
        self.available
    }

    fn is_active(&self, unit: &str) -> Result<bool> {
        // Non-zero exit means "not active", not an error.
        let (success, _) = self.run(&["is-active", "--quiet", unit])?;
        Ok(success)
    }

    fn is_enabled(&self, unit: &str) -> Result<bool> {
        let (success, _) = self.run(&["is-enabled", "--quiet", unit])?;
        Ok(success)
    }

    fn start(&self, unit: &str) -> Result<()> {
        self.run_ok(&["start", unit])
    }

    fn stop(&self, unit: &str) -> Result<()> {
        self.run_ok(&["stop", unit])
    }

    fn kill(&self, unit: &str) -> Result<()> {
        self.run_ok(&["kill", "-s", "SIGKILL", unit])
    }

    fn enable(&self, unit: &str) -> Result<()> {
        self.run_ok(&["enable", unit])
    }

    fn daemon_reload(&self) -> Result<()> {
        self.run_ok(&["daemon-reload"])
    }

    fn show_property(&self, unit: &str, key: &str) -> Result<Option<String>> {
        let property = format!("--property={key}");
        let (success, stdout) = self.run(&["show", unit, &property, "--value"])?;
        if !success || stdout.is_empty() {
            return Ok(None);
        }
        Ok(Some(stdout))
    }
}
