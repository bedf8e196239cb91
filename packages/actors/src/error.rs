//! Errors returned by the job manager.

use optimiser_core::{ConfigError, JobId};

/// Why a manager operation was rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ManagerError {
    /// The source is missing, unreadable, empty or the options are invalid.
    /// No record was created.
    #[error("Invalid source: {0}")]
    InvalidSource(String),

    #[error("Job not found: {0}")]
    JobNotFound(JobId),

    /// Running jobs must be cancelled before they can be removed.
    #[error("Job {0} is running and cannot be removed")]
    JobNotRemovable(JobId),

    /// The payload is already the original.
    #[error("Nothing to restore for job {0}")]
    NothingToRestore(JobId),

    #[error("Backup error: {0}")]
    Backup(String),

    #[error("Workdir error: {0}")]
    Io(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    /// The manager actor is gone or did not answer.
    #[error("Manager unavailable: {0}")]
    Unavailable(String),
}

impl From<ConfigError> for ManagerError {
    fn from(err: ConfigError) -> Self {
        Self::Config(err.to_string())
    }
}

impl From<storage::StorageError> for ManagerError {
    fn from(err: storage::StorageError) -> Self {
        Self::Backup(err.to_string())
    }
}
