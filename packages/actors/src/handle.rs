//! Cloneable handle to a running job manager.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use engine::OptimisationEngine;
use optimiser_core::{JobEvent, JobId, JobRecord, JobSource, ManagerConfig, OptimiseOptions};
use ractor::rpc::CallResult;
use ractor::{Actor, ActorRef, RpcReplyPort};
use storage::BackupStore;
use tokio::sync::{Mutex, broadcast};
use tokio::task::JoinHandle;

use crate::error::ManagerError;
use crate::manager_actor::{ManagerActor, ManagerArgs, ManagerSnapshot};
use crate::messages::{ManagerMessage, TerminalHook};

/// Upper bound for one request to the manager actor.
const CALL_TIMEOUT: Duration = Duration::from_secs(30);

const EVENT_CAPACITY: usize = 1024;

/// Handle to the job manager. Clones talk to the same manager.
#[derive(Clone)]
pub struct JobManager {
    actor: ActorRef<ManagerMessage>,
    event_tx: broadcast::Sender<JobEvent>,
    join: Arc<Mutex<Option<JoinHandle<()>>>>,
}

/// Start a job manager and its worker pool.
///
/// `on_terminal` runs on the manager actor once per job, right after the job
/// reaches a terminal state. It must not block.
pub async fn start_manager(
    config: ManagerConfig,
    engine: Arc<dyn OptimisationEngine>,
    backups: BackupStore,
    on_terminal: Option<TerminalHook>,
) -> Result<JobManager, ManagerError> {
    config.validate()?;
    let (event_tx, _) = broadcast::channel(EVENT_CAPACITY);

    let args = ManagerArgs {
        config,
        engine,
        backups,
        event_tx: event_tx.clone(),
        on_terminal,
    };
    let (actor, join) = Actor::spawn(None, ManagerActor, args)
        .await
        .map_err(|e| ManagerError::Unavailable(format!("failed to start manager: {e}")))?;

    Ok(JobManager {
        actor,
        event_tx,
        join: Arc::new(Mutex::new(Some(join))),
    })
}

impl JobManager {
    async fn call<T, F>(&self, build: F) -> Result<T, ManagerError>
    where
        T: Send + 'static,
        F: FnOnce(RpcReplyPort<T>) -> ManagerMessage,
    {
        match ractor::rpc::call(&self.actor, build, Some(CALL_TIMEOUT)).await {
            Ok(CallResult::Success(value)) => Ok(value),
            Ok(CallResult::Timeout) => Err(ManagerError::Unavailable("request timed out".into())),
            Ok(CallResult::SenderError) => {
                Err(ManagerError::Unavailable("request dropped".into()))
            }
            Err(e) => Err(ManagerError::Unavailable(e.to_string())),
        }
    }

    fn cast(&self, message: ManagerMessage) -> Result<(), ManagerError> {
        self.actor
            .send_message(message)
            .map_err(|e| ManagerError::Unavailable(e.to_string()))
    }

    /// Queue a job. Returns once the job is recorded, not when it runs.
    pub async fn submit(
        &self,
        source: JobSource,
        options: OptimiseOptions,
    ) -> Result<JobId, ManagerError> {
        self.call(|reply| ManagerMessage::Submit {
            source,
            options,
            reply,
        })
        .await?
    }

    pub async fn submit_file(
        &self,
        path: impl Into<PathBuf>,
        options: OptimiseOptions,
    ) -> Result<JobId, ManagerError> {
        self.submit(JobSource::file(path), options).await
    }

    pub async fn submit_clipboard(
        &self,
        bytes: impl Into<bytes::Bytes>,
        extension: impl Into<String>,
        options: OptimiseOptions,
    ) -> Result<JobId, ManagerError> {
        self.submit(JobSource::clipboard(bytes, extension), options)
            .await
    }

    /// Cancel a job. Queued jobs are cancelled at once; running jobs once
    /// their worker stops or the cancel grace period runs out.
    pub async fn cancel(&self, job_id: JobId) -> Result<(), ManagerError> {
        self.call(|reply| ManagerMessage::Cancel { job_id, reply })
            .await?
    }

    pub async fn remove(&self, job_id: JobId) -> Result<(), ManagerError> {
        self.call(|reply| ManagerMessage::Remove { job_id, reply })
            .await?
    }

    /// Put the most recently removed job back. `None` when nothing was removed.
    pub async fn restore_last(&self) -> Result<Option<JobRecord>, ManagerError> {
        self.call(|reply| ManagerMessage::RestoreLast { reply })
            .await
    }

    pub async fn restore_original(&self, job_id: JobId) -> Result<(), ManagerError> {
        self.call(|reply| ManagerMessage::RestoreOriginal { job_id, reply })
            .await?
    }

    pub async fn get(&self, job_id: JobId) -> Result<Option<JobRecord>, ManagerError> {
        self.call(|reply| ManagerMessage::GetJob { job_id, reply })
            .await
    }

    /// Active jobs, most recent first.
    pub async fn list(&self) -> Result<Vec<JobRecord>, ManagerError> {
        self.call(|reply| ManagerMessage::ListJobs { reply }).await
    }

    pub async fn snapshot(&self) -> Result<ManagerSnapshot, ManagerError> {
        self.call(|reply| ManagerMessage::Snapshot { reply }).await
    }

    /// Subscribe to manager events from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.event_tx.subscribe()
    }

    pub fn pause(&self) -> Result<(), ManagerError> {
        self.cast(ManagerMessage::Pause)
    }

    pub fn resume(&self) -> Result<(), ManagerError> {
        self.cast(ManagerMessage::Resume)
    }

    /// Remove workdir leftovers of jobs that are gone. Returns how many
    /// entries were deleted.
    pub async fn clean_workdir(&self) -> Result<usize, ManagerError> {
        self.call(|reply| ManagerMessage::CleanWorkdir { reply })
            .await?
    }

    /// Cancel running jobs, stop the workers and wait for the manager to exit.
    pub async fn shutdown(&self) -> Result<(), ManagerError> {
        let join = self.join.lock().await.take();
        // Already stopped when the message cannot be delivered.
        let _ = self.cast(ManagerMessage::Shutdown);
        if let Some(join) = join {
            join.await
                .map_err(|e| ManagerError::Unavailable(format!("manager task failed: {e}")))?;
        }
        Ok(())
    }
}
