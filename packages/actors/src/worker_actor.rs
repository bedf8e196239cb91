//! Worker actor for executing optimisation jobs.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use engine::{EngineError, EngineOutput, EngineRequest, EngineResult, OptimisationEngine};
use optimiser_core::{JobId, JobRecord, JobSource};
use ractor::{Actor, ActorProcessingErr, ActorRef};
use storage::{BackupStore, StorageError};
use tokio_util::sync::CancellationToken;

use crate::messages::{ManagerMessage, WorkerMessage};

/// Per-job directories live under `<workdir>/jobs/<job id>/`.
pub const JOBS_DIR: &str = "jobs";

/// Directory holding everything written for one job.
pub fn job_dir(workdir: &Path, job_id: JobId) -> PathBuf {
    workdir.join(JOBS_DIR).join(job_id.to_string())
}

/// State for the worker actor.
pub struct WorkerActorState {
    /// Unique worker ID.
    pub worker_id: String,
    /// Manager actor reference.
    pub manager: ActorRef<ManagerMessage>,
    engine: Arc<dyn OptimisationEngine>,
    backups: BackupStore,
    workdir: PathBuf,
    job_timeout: Duration,
}

/// Worker actor arguments.
#[derive(Clone)]
pub struct WorkerArgs {
    pub worker_id: String,
    pub manager: ActorRef<ManagerMessage>,
    pub engine: Arc<dyn OptimisationEngine>,
    pub backups: BackupStore,
    pub workdir: PathBuf,
    pub job_timeout: Duration,
}

/// Worker actor that runs one job at a time.
///
/// The manager only hands jobs to idle workers, so a `ProcessJob` never
/// waits behind another one.
pub struct WorkerActor;

impl Actor for WorkerActor {
    type Msg = WorkerMessage;
    type State = WorkerActorState;
    type Arguments = WorkerArgs;

    async fn pre_start(
        &self,
        _myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        tracing::info!(
            "Starting worker: {} (engine: {})",
            args.worker_id,
            args.engine.name()
        );

        Ok(WorkerActorState {
            worker_id: args.worker_id,
            manager: args.manager,
            engine: args.engine,
            backups: args.backups,
            workdir: args.workdir,
            job_timeout: args.job_timeout,
        })
    }

    async fn handle(
        &self,
        myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            WorkerMessage::ProcessJob {
                job,
                generation,
                cancel,
            } => {
                let job_id = job.id;
                tracing::debug!("Worker {} processing job {}", state.worker_id, job_id);

                let outcome = run_job(state, &job, cancel).await;
                if let Err(e) = &outcome {
                    tracing::debug!("Job {} ended without output: {}", job_id, e);
                }

                if let Err(e) = state.manager.send_message(ManagerMessage::JobFinished {
                    job_id,
                    worker_id: state.worker_id.clone(),
                    generation,
                    outcome,
                }) {
                    tracing::warn!("Worker {} could not report job {}: {}", state.worker_id, job_id, e);
                }
            }

            WorkerMessage::Shutdown => {
                tracing::info!("Shutting down worker: {}", state.worker_id);
                myself.stop(None);
            }
        }

        Ok(())
    }
}

/// Stage the payload, back up the original and run the engine under the
/// job timeout.
async fn run_job(
    state: &WorkerActorState,
    job: &JobRecord,
    cancel: CancellationToken,
) -> EngineResult<EngineOutput> {
    let dir = job_dir(&state.workdir, job.id);
    let file_name = job.source.file_name(job.id);

    let input = match &job.source {
        JobSource::File { path } => {
            state
                .backups
                .backup_file(job.id, path)
                .await
                .map_err(backup_error)?;
            path.clone()
        }
        JobSource::Clipboard { bytes, .. } => {
            let staged = dir.join("input").join(&file_name);
            if let Some(parent) = staged.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| EngineError::io("staging clipboard payload", e))?;
            }
            tokio::fs::write(&staged, bytes)
                .await
                .map_err(|e| EngineError::io("staging clipboard payload", e))?;
            state
                .backups
                .backup_bytes(job.id, &file_name, bytes.clone())
                .await
                .map_err(backup_error)?;
            staged
        }
    };

    let request = EngineRequest {
        job_id: job.id,
        input,
        output: dir.join(&file_name),
        scratch_dir: dir.join("scratch"),
        options: job.options,
    };

    match tokio::time::timeout(state.job_timeout, state.engine.optimise(request, cancel)).await {
        Ok(outcome) => outcome,
        Err(_) => Err(EngineError::tool(format!(
            "timed out after {}s",
            state.job_timeout.as_secs()
        ))),
    }
}

/// Keep disk-full and out-of-memory failures typed as resource exhaustion.
fn backup_error(err: StorageError) -> EngineError {
    match err {
        StorageError::Io(e) => EngineError::io("backing up original", e),
        other => EngineError::Io(format!("backing up original: {other}")),
    }
}
