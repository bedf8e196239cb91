//! Event types for observing the job manager.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{JobId, JobRecord, JobState};

/// Events emitted by the job manager for real-time updates.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum JobEvent {
    /// A new job was accepted and queued.
    JobSubmitted {
        job: Box<JobRecord>,
        timestamp: DateTime<Utc>,
    },
    /// A job's state changed.
    JobStateChanged {
        job_id: JobId,
        old_state: JobState,
        new_state: JobState,
        #[serde(skip_serializing_if = "Option::is_none")]
        worker_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        timestamp: DateTime<Utc>,
    },
    /// A job left the active list.
    JobRemoved {
        job_id: JobId,
        /// Whether the job went onto the undo stack.
        undoable: bool,
        timestamp: DateTime<Utc>,
    },
    /// A removed job was put back into the active list.
    JobRestored {
        job: Box<JobRecord>,
        timestamp: DateTime<Utc>,
    },
    /// The original payload of a job was put back.
    OriginalRestored {
        job_id: JobId,
        timestamp: DateTime<Utc>,
    },
    /// The undo stack depth changed.
    UndoStackChanged {
        depth: usize,
        timestamp: DateTime<Utc>,
    },
    /// Dispatch was paused or resumed.
    ManagerStateChanged {
        paused: bool,
        timestamp: DateTime<Utc>,
    },
}

impl JobEvent {
    /// Get the timestamp of the event.
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            JobEvent::JobSubmitted { timestamp, .. } => *timestamp,
            JobEvent::JobStateChanged { timestamp, .. } => *timestamp,
            JobEvent::JobRemoved { timestamp, .. } => *timestamp,
            JobEvent::JobRestored { timestamp, .. } => *timestamp,
            JobEvent::OriginalRestored { timestamp, .. } => *timestamp,
            JobEvent::UndoStackChanged { timestamp, .. } => *timestamp,
            JobEvent::ManagerStateChanged { timestamp, .. } => *timestamp,
        }
    }

    /// Get the job ID associated with this event, if any.
    pub fn job_id(&self) -> Option<JobId> {
        match self {
            JobEvent::JobSubmitted { job, .. } => Some(job.id),
            JobEvent::JobStateChanged { job_id, .. } => Some(*job_id),
            JobEvent::JobRemoved { job_id, .. } => Some(*job_id),
            JobEvent::JobRestored { job, .. } => Some(job.id),
            JobEvent::OriginalRestored { job_id, .. } => Some(*job_id),
            _ => None,
        }
    }

    /// New state carried by a state change, if this is one.
    pub fn new_state(&self) -> Option<JobState> {
        match self {
            JobEvent::JobStateChanged { new_state, .. } => Some(*new_state),
            _ => None,
        }
    }

    /// Get a short description of this event for logging.
    pub fn description(&self) -> String {
        match self {
            JobEvent::JobSubmitted { job, .. } => {
                format!("Job {} submitted: {}", job.id, job.source.describe())
            }
            JobEvent::JobStateChanged {
                job_id,
                new_state,
                error,
                ..
            } => match error {
                Some(error) => format!("Job {} -> {}: {}", job_id, new_state, error),
                None => format!("Job {} -> {}", job_id, new_state),
            },
            JobEvent::JobRemoved {
                job_id, undoable, ..
            } => {
                let undo = if *undoable { " (undoable)" } else { "" };
                format!("Job {} removed{}", job_id, undo)
            }
            JobEvent::JobRestored { job, .. } => format!("Job {} restored", job.id),
            JobEvent::OriginalRestored { job_id, .. } => {
                format!("Job {} original restored", job_id)
            }
            JobEvent::UndoStackChanged { depth, .. } => format!("Undo stack depth {}", depth),
            JobEvent::ManagerStateChanged { paused, .. } => {
                if *paused {
                    "Dispatch paused".to_string()
                } else {
                    "Dispatch resumed".to_string()
                }
            }
        }
    }
}
