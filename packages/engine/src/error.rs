//! Error types for optimisation runs.

use std::io;

use thiserror::Error;

/// Why an optimisation run did not produce an output.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// The payload is not a format any tool handles.
    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    /// A codec tool is missing, failed to start, or exited unsuccessfully.
    #[error("Tool error: {0}")]
    ToolInvocation(String),

    /// Disk full, quota exceeded or similar.
    #[error("Out of resources: {0}")]
    ResourceExhausted(String),

    /// Any other file IO error.
    #[error("IO error: {0}")]
    Io(String),

    /// The run was cancelled. Not a failure.
    #[error("Cancelled")]
    Cancelled,
}

/// Convenience result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

impl EngineError {
    pub fn unsupported<T: Into<String>>(msg: T) -> Self {
        Self::UnsupportedFormat(msg.into())
    }

    pub fn tool<T: Into<String>>(msg: T) -> Self {
        Self::ToolInvocation(msg.into())
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Map an IO error, adding what was being done when it happened.
    pub fn io(context: &str, err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::StorageFull | io::ErrorKind::QuotaExceeded | io::ErrorKind::OutOfMemory => {
                Self::ResourceExhausted(format!("{context}: {err}"))
            }
            _ => Self::Io(format!("{context}: {err}")),
        }
    }
}

impl From<io::Error> for EngineError {
    fn from(err: io::Error) -> Self {
        Self::io("io", err)
    }
}
