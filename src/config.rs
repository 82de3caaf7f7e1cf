//! Configuration for the moderation engine.
//!
//! TOML file with fully defaulted sections, so an empty file (or no
//! file at all) yields a working configuration. The reviewer
//! allow-list is the only authorization mechanism.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Environment variable overriding the config file location.
const CONFIG_PATH_ENV: &str = "REPLYGATE_CONFIG";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub storage: StorageConfig,
    pub intake: IntakeConfig,
    pub locking: LockingConfig,
    pub queue: QueueConfig,
    /// Reviewer allow-list. Anyone not listed here cannot act.
    pub reviewers: Vec<ReviewerConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StorageConfig {
    /// Path of the queue snapshot file.
    pub path: PathBuf,
    /// Rolling window of prior snapshots kept for disaster recovery.
    pub max_backups: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: default_data_dir().join("moderation_queue.json"),
            max_backups: 5,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct IntakeConfig {
    /// Fixed worker pool size for draining the intake queue.
    pub workers: usize,
}

impl Default for IntakeConfig {
    fn default() -> Self {
        Self { workers: 3 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LockingConfig {
    /// Editing lock lifetime before it is considered abandoned.
    pub timeout_secs: u64,
    /// Interval of the background sweep that force-releases stale locks.
    pub sweep_secs: u64,
}

impl Default for LockingConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 600,
            sweep_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct QueueConfig {
    /// Hours until an undecided record expires.
    pub expiry_hours: u64,
    /// Interval of the expiry-and-reminder sweep.
    pub sweep_secs: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            expiry_hours: 24,
            sweep_secs: 3600,
        }
    }
}

/// One authorized reviewer.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReviewerConfig {
    pub id: String,
    pub name: String,
}

impl Config {
    /// Load from the given path, the `REPLYGATE_CONFIG` env var, or
    /// the platform config directory, in that order. A missing file
    /// yields defaults; a malformed file is an error.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => match std::env::var_os(CONFIG_PATH_ENV) {
                Some(p) => PathBuf::from(p),
                None => default_config_path(),
            },
        };

        if !path.exists() {
            tracing::info!(path = %path.display(), "no config file found, using defaults");
            return Ok(Self::default());
        }

        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read config: {}", path.display()))?;
        let config: Self = toml::from_str(&raw)
            .with_context(|| format!("failed to parse config: {}", path.display()))?;

        tracing::info!(
            path = %path.display(),
            reviewers = config.reviewers.len(),
            "configuration loaded"
        );
        Ok(config)
    }

    /// Whether the given id is on the reviewer allow-list.
    pub fn is_reviewer(&self, reviewer_id: &str) -> bool {
        self.reviewers.iter().any(|r| r.id == reviewer_id)
    }

    /// Display name for a reviewer id, if allow-listed.
    pub fn reviewer_name(&self, reviewer_id: &str) -> Option<&str> {
        self.reviewers
            .iter()
            .find(|r| r.id == reviewer_id)
            .map(|r| r.name.as_str())
    }
}

fn default_config_path() -> PathBuf {
    directories::ProjectDirs::from("", "", "replygate")
        .map(|dirs| dirs.config_dir().join("replygate.toml"))
        .unwrap_or_else(|| PathBuf::from("replygate.toml"))
}

fn default_data_dir() -> PathBuf {
    directories::ProjectDirs::from("", "", "replygate")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from("."))
}
