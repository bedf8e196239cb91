//! Job manager configuration.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {var}: {value} ({reason})")]
    InvalidValue {
        var: &'static str,
        value: String,
        reason: String,
    },
}

/// Configuration for the job manager and its workers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Maximum number of jobs running at once.
    pub concurrency: usize,
    /// Number of removed jobs kept for restore.
    pub undo_capacity: usize,
    /// Remove succeeded jobs from the active list after this many seconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auto_remove_after_secs: Option<u64>,
    /// How long a running job may take to acknowledge a cancel before it is
    /// forced to cancelled.
    pub cancel_grace_ms: u64,
    /// Upper bound for one optimisation run.
    pub job_timeout_secs: u64,
    /// Directory for staged clipboard payloads and optimised outputs.
    pub workdir: PathBuf,
    /// Directory searched for codec tools before `PATH`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bin_dir: Option<PathBuf>,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            concurrency: 2,
            undo_capacity: 5,
            auto_remove_after_secs: None,
            cancel_grace_ms: 2_000,
            job_timeout_secs: 600,
            workdir: std::env::temp_dir().join("optimiser"),
            bin_dir: None,
        }
    }
}

impl ManagerConfig {
    /// Build a config from environment variables on top of the defaults.
    ///
    /// - `OPTIMISER_CONCURRENCY` (default: 2)
    /// - `OPTIMISER_UNDO_CAPACITY` (default: 5)
    /// - `OPTIMISER_AUTO_REMOVE_SECS` (default: unset, never auto-remove)
    /// - `OPTIMISER_CANCEL_GRACE_MS` (default: 2000)
    /// - `OPTIMISER_JOB_TIMEOUT_SECS` (default: 600)
    /// - `OPTIMISER_WORKDIR` (default: `$TMPDIR/optimiser`)
    /// - `OPTIMISER_BIN_DIR` (optional)
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut cfg = Self::default();

        if let Some(v) = parse_env::<usize>("OPTIMISER_CONCURRENCY")? {
            cfg.concurrency = v;
        }
        if let Some(v) = parse_env::<usize>("OPTIMISER_UNDO_CAPACITY")? {
            cfg.undo_capacity = v;
        }
        if let Some(v) = parse_env::<u64>("OPTIMISER_AUTO_REMOVE_SECS")? {
            cfg.auto_remove_after_secs = Some(v);
        }
        if let Some(v) = parse_env::<u64>("OPTIMISER_CANCEL_GRACE_MS")? {
            cfg.cancel_grace_ms = v;
        }
        if let Some(v) = parse_env::<u64>("OPTIMISER_JOB_TIMEOUT_SECS")? {
            cfg.job_timeout_secs = v;
        }
        if let Some(v) = env_non_empty("OPTIMISER_WORKDIR") {
            cfg.workdir = PathBuf::from(v);
        }
        if let Some(v) = env_non_empty("OPTIMISER_BIN_DIR") {
            cfg.bin_dir = Some(PathBuf::from(v));
        }

        cfg.validate()?;
        Ok(cfg)
    }

    /// Reject values the manager cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.concurrency == 0 {
            return Err(ConfigError::InvalidValue {
                var: "concurrency",
                value: "0".into(),
                reason: "at least one job must be able to run".into(),
            });
        }
        if self.undo_capacity == 0 {
            return Err(ConfigError::InvalidValue {
                var: "undo_capacity",
                value: "0".into(),
                reason: "the undo stack must hold at least one job".into(),
            });
        }
        if self.job_timeout_secs == 0 {
            return Err(ConfigError::InvalidValue {
                var: "job_timeout_secs",
                value: "0".into(),
                reason: "jobs need time to run".into(),
            });
        }
        Ok(())
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_undo_capacity(mut self, capacity: usize) -> Self {
        self.undo_capacity = capacity;
        self
    }

    pub fn with_workdir(mut self, workdir: impl Into<PathBuf>) -> Self {
        self.workdir = workdir.into();
        self
    }

    pub fn with_auto_remove_after(mut self, secs: u64) -> Self {
        self.auto_remove_after_secs = Some(secs);
        self
    }

    pub fn with_cancel_grace_ms(mut self, ms: u64) -> Self {
        self.cancel_grace_ms = ms;
        self
    }

    pub fn auto_remove_after(&self) -> Option<Duration> {
        self.auto_remove_after_secs.map(Duration::from_secs)
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::from_millis(self.cancel_grace_ms)
    }

    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.job_timeout_secs)
    }
}

fn env_non_empty(var: &str) -> Option<String> {
    let v = std::env::var(var).ok()?;
    let trimmed = v.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn parse_env<T>(var: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env_non_empty(var) {
        None => Ok(None),
        Some(value) => value
            .parse::<T>()
            .map(Some)
            .map_err(|e| ConfigError::InvalidValue {
                var,
                reason: e.to_string(),
                value,
            }),
    }
}
