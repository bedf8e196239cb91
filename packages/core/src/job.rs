//! Job domain types for optimisation requests.

use std::path::{Path, PathBuf};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use ulid::Ulid;

/// Unique identifier for a job, using ULID for chronological sorting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Ulid);

impl JobId {
    /// Create a new unique job ID.
    pub fn new() -> Self {
        Self(Ulid::new())
    }

    /// Parse a job ID from a string.
    pub fn parse(s: &str) -> Result<Self, ulid::DecodeError> {
        Ok(Self(Ulid::from_string(s)?))
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Waiting for a free worker slot.
    #[default]
    Queued,
    /// Being optimised by a worker.
    Running,
    /// Optimised; `result` is set.
    Succeeded,
    /// Optimisation failed; `error` is set.
    Failed,
    /// Cancelled before or while running.
    Cancelled,
}

impl JobState {
    /// Check if the job is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Succeeded | JobState::Failed | JobState::Cancelled
        )
    }

    /// Get a simple state string for display.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Queued => "queued",
            JobState::Running => "running",
            JobState::Succeeded => "succeeded",
            JobState::Failed => "failed",
            JobState::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where the payload of a job comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobSource {
    /// A file on disk, e.g. dropped on the app or found by a folder watcher.
    File { path: PathBuf },
    /// Raw clipboard contents. The bytes are not serialised, only their size.
    Clipboard {
        #[serde(skip)]
        bytes: Bytes,
        /// File extension hinting the payload type (`png`, `jpg`, ...).
        extension: String,
        size: u64,
    },
}

impl JobSource {
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self::File { path: path.into() }
    }

    pub fn clipboard(bytes: impl Into<Bytes>, extension: impl Into<String>) -> Self {
        let bytes = bytes.into();
        Self::Clipboard {
            size: bytes.len() as u64,
            bytes,
            extension: extension.into().trim_start_matches('.').to_ascii_lowercase(),
        }
    }

    /// File path of the source, if it lives on disk.
    pub fn path(&self) -> Option<&Path> {
        match self {
            JobSource::File { path } => Some(path),
            JobSource::Clipboard { .. } => None,
        }
    }

    /// Name used for backups and output files.
    pub fn file_name(&self, id: JobId) -> String {
        match self {
            JobSource::File { path } => path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| id.to_string()),
            JobSource::Clipboard { extension, .. } if extension.is_empty() => {
                format!("clipboard-{id}")
            }
            JobSource::Clipboard { extension, .. } => format!("clipboard-{id}.{extension}"),
        }
    }

    /// Short human-readable description for logs.
    pub fn describe(&self) -> String {
        match self {
            JobSource::File { path } => path.display().to_string(),
            JobSource::Clipboard { extension, size, .. } => {
                format!("clipboard ({extension}, {size} bytes)")
            }
        }
    }
}

/// Per-job optimisation options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimiseOptions {
    /// Trade more quality for smaller output.
    pub aggressive: bool,
    /// Scale both dimensions by this factor before compressing (0.1..1.0).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub downscale_factor: Option<f32>,
}

impl OptimiseOptions {
    pub const MIN_DOWNSCALE_FACTOR: f32 = 0.1;

    pub fn aggressive() -> Self {
        Self {
            aggressive: true,
            downscale_factor: None,
        }
    }

    pub fn with_downscale(mut self, factor: f32) -> Self {
        self.downscale_factor = Some(factor);
        self
    }

    /// Validate option ranges, returning a description of the problem.
    pub fn validate(&self) -> Result<(), String> {
        if let Some(factor) = self.downscale_factor
            && !(Self::MIN_DOWNSCALE_FACTOR..1.0).contains(&factor)
        {
            return Err(format!(
                "downscale factor {factor} outside {}..1.0",
                Self::MIN_DOWNSCALE_FACTOR
            ));
        }
        Ok(())
    }
}

/// Output of a successful optimisation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OptimisedOutput {
    /// Where the current payload lives.
    pub path: PathBuf,
    /// Current payload size in bytes.
    pub size: u64,
    /// Size of the original payload in bytes.
    pub original_size: u64,
}

impl OptimisedOutput {
    /// Bytes saved (negative if the payload grew).
    pub fn saved_bytes(&self) -> i64 {
        self.original_size as i64 - self.size as i64
    }

    /// Savings as a percentage of the original size.
    pub fn compression_ratio(&self) -> f64 {
        if self.original_size == 0 {
            0.0
        } else {
            self.saved_bytes() as f64 / self.original_size as f64 * 100.0
        }
    }
}

/// Rejected state transition.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("job {job_id}: cannot move from {from} to {to}")]
pub struct TransitionError {
    pub job_id: JobId,
    pub from: JobState,
    pub to: JobState,
}

/// One optimisation job and its lifecycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    pub source: JobSource,
    pub options: OptimiseOptions,
    pub state: JobState,
    /// True until a successful optimisation replaced the payload.
    pub is_original: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<OptimisedOutput>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Insertion sequence, the logical position among active jobs.
    pub seq: u64,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl JobRecord {
    /// Fallback message so a failed job never carries an empty error.
    pub const UNKNOWN_ERROR: &'static str = "optimisation failed for an unknown reason";

    /// Create a new queued job.
    pub fn new(source: JobSource, options: OptimiseOptions, seq: u64) -> Self {
        Self {
            id: JobId::new(),
            source,
            options,
            state: JobState::Queued,
            is_original: true,
            result: None,
            error: None,
            seq,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    /// Whether the job ever left the queue.
    pub fn has_started(&self) -> bool {
        self.started_at.is_some()
    }

    /// Duration of the run, once finished.
    pub fn duration_ms(&self) -> Option<u64> {
        let started = self.started_at?;
        let finished = self.finished_at?;
        Some((finished - started).num_milliseconds().max(0) as u64)
    }

    fn check(&self, allowed_from: JobState, to: JobState) -> Result<(), TransitionError> {
        if self.state == allowed_from {
            Ok(())
        } else {
            Err(TransitionError {
                job_id: self.id,
                from: self.state,
                to,
            })
        }
    }

    /// Queued -> Running.
    pub fn start(&mut self) -> Result<(), TransitionError> {
        self.check(JobState::Queued, JobState::Running)?;
        self.state = JobState::Running;
        self.started_at = Some(Utc::now());
        Ok(())
    }

    /// Running -> Succeeded. An output no smaller than the original keeps the
    /// payload original.
    pub fn succeed(&mut self, output: OptimisedOutput) -> Result<(), TransitionError> {
        self.check(JobState::Running, JobState::Succeeded)?;
        self.state = JobState::Succeeded;
        self.is_original = output.size >= output.original_size;
        self.result = Some(output);
        self.finished_at = Some(Utc::now());
        Ok(())
    }

    /// Running -> Failed with a non-empty message.
    pub fn fail(&mut self, error: impl Into<String>) -> Result<(), TransitionError> {
        self.check(JobState::Running, JobState::Failed)?;
        let error = error.into();
        let error = if error.trim().is_empty() {
            Self::UNKNOWN_ERROR.to_string()
        } else {
            error
        };
        self.state = JobState::Failed;
        self.error = Some(error);
        self.finished_at = Some(Utc::now());
        Ok(())
    }

    /// Queued or Running -> Cancelled.
    pub fn cancel(&mut self) -> Result<(), TransitionError> {
        if self.state.is_terminal() {
            return Err(TransitionError {
                job_id: self.id,
                from: self.state,
                to: JobState::Cancelled,
            });
        }
        self.state = JobState::Cancelled;
        self.finished_at = Some(Utc::now());
        Ok(())
    }

    /// Point the result back at the original payload.
    ///
    /// Returns false when there is nothing to restore.
    pub fn restore_original(&mut self) -> bool {
        if self.is_original {
            return false;
        }
        match self.result.as_mut() {
            Some(output) => {
                output.size = output.original_size;
                self.is_original = true;
                true
            }
            None => false,
        }
    }
}
