use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Installation-wide configuration for the update engine, loaded from
/// `update.toml`. Every field has a default so a missing or partial file is
/// still a valid installation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdateConfig {
    /// Root of the managed git checkout.
    pub repo_root: PathBuf,
    pub remote_name: String,
    pub development_branch: String,
    /// Tags carrying this prefix and a semver body count as stable releases.
    pub stable_tag_prefix: String,
    pub service_name: String,
    pub unit_file_path: PathBuf,
    pub cron_file_path: PathBuf,
    /// Durable engine state: lock directory, update marker, backups.
    pub state_dir: PathBuf,
    /// Path of the engine's own executable artifact, relative to repo_root.
    pub self_artifact: PathBuf,
    /// Command prepended to the artifact path for the pre-handoff syntax gate.
    pub artifact_validator: Vec<String>,
    pub timeouts: TimeoutConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub lock_wait_secs: u64,
    pub lock_poll_ms: u64,
    pub fetch_timeout_secs: u64,
    pub fetch_retries: u32,
    pub fetch_retry_delay_secs: u64,
    pub service_stop_secs: u64,
    pub service_start_secs: u64,
    pub service_poll_ms: u64,
}

impl Default for UpdateConfig {
    fn default() -> Self {
        Self {
            repo_root: PathBuf::from("/home/fieldcast/fieldcast"),
            remote_name: "origin".to_string(),
            development_branch: "main".to_string(),
            stable_tag_prefix: "v".to_string(),
            service_name: "fieldcast-stream".to_string(),
            unit_file_path: PathBuf::from("/etc/systemd/system/fieldcast-stream.service"),
            cron_file_path: PathBuf::from("/etc/cron.d/fieldcast"),
            state_dir: PathBuf::from("/var/lib/fieldcast/update"),
            self_artifact: PathBuf::from("scripts/fieldcast-update"),
            artifact_validator: vec!["bash".to_string(), "-n".to_string()],
            timeouts: TimeoutConfig::default(),
        }
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            lock_wait_secs: 30,
            lock_poll_ms: 500,
            fetch_timeout_secs: 60,
            fetch_retries: 3,
            fetch_retry_delay_secs: 5,
            service_stop_secs: 20,
            service_start_secs: 20,
            service_poll_ms: 500,
        }
    }
}

impl UpdateConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed reading update config: {}", path.display()))?;
        Self::from_toml_str(&content)
            .with_context(|| format!("failed parsing update config: {}", path.display()))
    }

    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn from_toml_str(input: &str) -> Result<Self> {
        let config: Self = toml::from_str(input).context("invalid update config")?;
        if config.self_artifact.is_absolute() {
            anyhow::bail!(
                "self_artifact must be relative to repo_root: {}",
                config.self_artifact.display()
            );
        }
        if config.artifact_validator.is_empty() {
            anyhow::bail!("artifact_validator must name a command");
        }
        Ok(config)
    }

    pub fn self_artifact_abs(&self) -> PathBuf {
        self.repo_root.join(&self.self_artifact)
    }
}
