//! Message types for actor communication.

use std::sync::Arc;

use engine::{EngineOutput, EngineResult};
use optimiser_core::{JobId, JobRecord, JobSource, OptimiseOptions};
use ractor::RpcReplyPort;
use tokio_util::sync::CancellationToken;

use crate::error::ManagerError;
use crate::manager_actor::ManagerSnapshot;

/// Callback invoked once per job when it reaches a terminal state.
pub type TerminalHook = Arc<dyn Fn(&JobRecord) + Send + Sync>;

/// Messages for the ManagerActor.
#[derive(Debug)]
pub enum ManagerMessage {
    /// Validate a source and queue a job for it.
    Submit {
        source: JobSource,
        options: OptimiseOptions,
        reply: RpcReplyPort<Result<JobId, ManagerError>>,
    },

    /// Cancel a queued or running job.
    Cancel {
        job_id: JobId,
        reply: RpcReplyPort<Result<(), ManagerError>>,
    },

    /// Remove a job from the active list.
    Remove {
        job_id: JobId,
        reply: RpcReplyPort<Result<(), ManagerError>>,
    },

    /// Put the most recently removed job back.
    RestoreLast {
        reply: RpcReplyPort<Option<JobRecord>>,
    },

    /// Write the backed up original over a job's result.
    RestoreOriginal {
        job_id: JobId,
        reply: RpcReplyPort<Result<(), ManagerError>>,
    },

    /// Get an active job by ID.
    GetJob {
        job_id: JobId,
        reply: RpcReplyPort<Option<JobRecord>>,
    },

    /// Active jobs, most recent first.
    ListJobs { reply: RpcReplyPort<Vec<JobRecord>> },

    /// Everything a UI needs to render the job list.
    Snapshot { reply: RpcReplyPort<ManagerSnapshot> },

    /// Stop handing queued jobs to workers.
    Pause,

    /// Resume dispatch.
    Resume,

    /// Delete workdir entries no job references any more.
    CleanWorkdir {
        reply: RpcReplyPort<Result<usize, ManagerError>>,
    },

    /// A worker finished a run.
    JobFinished {
        job_id: JobId,
        worker_id: String,
        generation: u64,
        outcome: EngineResult<EngineOutput>,
    },

    /// A cancelled run did not acknowledge in time.
    CancelGraceElapsed { job_id: JobId, generation: u64 },

    /// Display timeout of a succeeded job elapsed.
    AutoRemove { job_id: JobId },

    /// Cancel everything and stop.
    Shutdown,
}

/// Messages for the WorkerActor.
#[derive(Debug)]
pub enum WorkerMessage {
    /// Run one job to completion and report back.
    ProcessJob {
        job: Box<JobRecord>,
        generation: u64,
        cancel: CancellationToken,
    },

    /// Shutdown the worker.
    Shutdown,
}
