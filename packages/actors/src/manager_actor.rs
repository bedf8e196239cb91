//! Manager actor: the single owner of every job record.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use engine::{EngineError, EngineOutput, EngineResult, OptimisationEngine};
use optimiser_core::{
    JobEvent, JobId, JobRecord, JobSource, JobState, JobStore, ManagerConfig, OptimiseOptions,
    OptimisedOutput,
};
use ractor::{Actor, ActorProcessingErr, ActorRef, SupervisionEvent};
use serde::Serialize;
use storage::BackupStore;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::error::ManagerError;
use crate::messages::{ManagerMessage, TerminalHook, WorkerMessage};
use crate::worker_actor::{JOBS_DIR, WorkerActor, WorkerArgs, job_dir};

/// Point-in-time view of the manager.
#[derive(Debug, Clone, Serialize)]
pub struct ManagerSnapshot {
    /// Active jobs, most recent first.
    pub jobs: Vec<JobRecord>,
    pub running: usize,
    pub queued: usize,
    pub undo_depth: usize,
    pub undo_capacity: usize,
    pub paused: bool,
}

impl ManagerSnapshot {
    /// Whether "restore last result" has anything to restore.
    pub fn can_restore(&self) -> bool {
        self.undo_depth > 0
    }

    /// Whether every active job reached a terminal state.
    pub fn is_idle(&self) -> bool {
        self.running == 0 && self.queued == 0
    }
}

struct WorkerSlot {
    worker_id: String,
    actor: ActorRef<WorkerMessage>,
    /// Generation of the run the worker is busy with. Cleared only by the
    /// worker's own report, even when the job was forced to cancelled.
    busy: Option<u64>,
}

struct RunningJob {
    generation: u64,
    worker_id: String,
    cancel: CancellationToken,
    cancel_requested: bool,
}

/// State for the manager actor.
pub struct ManagerState {
    config: ManagerConfig,
    store: JobStore,
    /// Queued job IDs in FIFO order.
    queue: VecDeque<JobId>,
    workers: Vec<WorkerSlot>,
    running: HashMap<JobId, RunningJob>,
    /// Succeeded jobs waiting for their display timeout.
    auto_remove: HashSet<JobId>,
    paused: bool,
    shutting_down: bool,
    next_generation: u64,
    worker_counter: u64,
    engine: Arc<dyn OptimisationEngine>,
    backups: BackupStore,
    event_tx: broadcast::Sender<JobEvent>,
    on_terminal: Option<TerminalHook>,
}

/// Manager actor arguments.
pub struct ManagerArgs {
    pub config: ManagerConfig,
    pub engine: Arc<dyn OptimisationEngine>,
    pub backups: BackupStore,
    pub event_tx: broadcast::Sender<JobEvent>,
    pub on_terminal: Option<TerminalHook>,
}

impl ManagerState {
    fn new(args: ManagerArgs) -> Self {
        Self {
            store: JobStore::new(args.config.undo_capacity),
            config: args.config,
            queue: VecDeque::new(),
            workers: Vec::new(),
            running: HashMap::new(),
            auto_remove: HashSet::new(),
            paused: false,
            shutting_down: false,
            next_generation: 0,
            worker_counter: 0,
            engine: args.engine,
            backups: args.backups,
            event_tx: args.event_tx,
            on_terminal: args.on_terminal,
        }
    }

    fn broadcast(&self, event: JobEvent) {
        let _ = self.event_tx.send(event);
    }

    fn broadcast_transition(
        &self,
        job_id: JobId,
        old_state: JobState,
        worker_id: Option<String>,
    ) {
        let Some(record) = self.store.get(job_id) else {
            return;
        };
        self.broadcast(JobEvent::JobStateChanged {
            job_id,
            old_state,
            new_state: record.state,
            worker_id,
            error: record.error.clone(),
            timestamp: Utc::now(),
        });
        if record.state.is_terminal()
            && let Some(hook) = &self.on_terminal
        {
            hook(record);
        }
    }

    fn snapshot(&self) -> ManagerSnapshot {
        let jobs: Vec<JobRecord> = self.store.iter_recent().cloned().collect();
        let running = jobs.iter().filter(|j| j.state == JobState::Running).count();
        ManagerSnapshot {
            running,
            queued: self.queue.len(),
            jobs,
            undo_depth: self.store.undo_depth(),
            undo_capacity: self.store.undo_capacity(),
            paused: self.paused,
        }
    }

    fn next_worker_id(&mut self) -> String {
        self.worker_counter += 1;
        format!("worker-{}", self.worker_counter)
    }

    fn worker_args(&mut self, manager: ActorRef<ManagerMessage>) -> WorkerArgs {
        WorkerArgs {
            worker_id: self.next_worker_id(),
            manager,
            engine: self.engine.clone(),
            backups: self.backups.clone(),
            workdir: self.config.workdir.clone(),
            job_timeout: self.config.job_timeout(),
        }
    }

    /// Hand queued jobs to idle workers, oldest first.
    fn dispatch(&mut self) {
        if self.paused || self.shutting_down {
            return;
        }

        while let Some(slot) = self.workers.iter().position(|w| w.busy.is_none()) {
            let Some(job_id) = self.queue.pop_front() else {
                break;
            };
            let Some(record) = self.store.get_mut(job_id) else {
                continue;
            };
            if let Err(e) = record.start() {
                tracing::warn!("Skipping queued job: {}", e);
                continue;
            }
            let job = Box::new(record.clone());

            self.next_generation += 1;
            let generation = self.next_generation;
            let cancel = CancellationToken::new();
            let worker_id = self.workers[slot].worker_id.clone();

            let sent = self.workers[slot].actor.send_message(WorkerMessage::ProcessJob {
                job,
                generation,
                cancel: cancel.clone(),
            });
            if let Err(e) = sent {
                tracing::warn!("Worker {} unavailable: {}", worker_id, e);
                if let Some(record) = self.store.get_mut(job_id) {
                    let _ = record.fail(format!("worker unavailable: {e}"));
                }
                self.broadcast_transition(job_id, JobState::Queued, Some(worker_id));
                continue;
            }

            tracing::debug!("Dispatched job {} to {} (generation {})", job_id, worker_id, generation);
            self.workers[slot].busy = Some(generation);
            self.running.insert(
                job_id,
                RunningJob {
                    generation,
                    worker_id: worker_id.clone(),
                    cancel,
                    cancel_requested: false,
                },
            );
            self.broadcast_transition(job_id, JobState::Queued, Some(worker_id));
        }
    }

    async fn submit(
        &mut self,
        source: JobSource,
        options: OptimiseOptions,
    ) -> Result<JobId, ManagerError> {
        if self.shutting_down {
            return Err(ManagerError::Unavailable("manager is shutting down".into()));
        }
        options.validate().map_err(ManagerError::InvalidSource)?;
        validate_source(&source).await?;

        let seq = self.store.next_seq();
        let record = JobRecord::new(source, options, seq);
        let job_id = record.id;
        tracing::info!("Queued job {} for {}", job_id, record.source.describe());

        self.broadcast(JobEvent::JobSubmitted {
            job: Box::new(record.clone()),
            timestamp: Utc::now(),
        });
        self.store.insert(record);
        self.queue.push_back(job_id);
        Ok(job_id)
    }

    fn cancel(&mut self, myself: &ActorRef<ManagerMessage>, job_id: JobId) -> Result<(), ManagerError> {
        let record = self
            .store
            .get_mut(job_id)
            .ok_or(ManagerError::JobNotFound(job_id))?;

        match record.state {
            JobState::Queued => {
                self.queue.retain(|id| *id != job_id);
                let _ = record.cancel();
                tracing::info!("Cancelled queued job {}", job_id);
                self.broadcast_transition(job_id, JobState::Queued, None);
            }
            JobState::Running => {
                let Some(run) = self.running.get_mut(&job_id) else {
                    return Ok(());
                };
                if !run.cancel_requested {
                    run.cancel_requested = true;
                    run.cancel.cancel();
                    tracing::info!("Cancelling running job {}", job_id);
                    schedule(
                        myself,
                        self.config.cancel_grace(),
                        ManagerMessage::CancelGraceElapsed {
                            job_id,
                            generation: run.generation,
                        },
                    );
                }
            }
            _ => {}
        }
        Ok(())
    }

    async fn remove(&mut self, myself: &ActorRef<ManagerMessage>, job_id: JobId) -> Result<(), ManagerError> {
        let state = self
            .store
            .get(job_id)
            .map(|r| r.state)
            .ok_or(ManagerError::JobNotFound(job_id))?;

        match state {
            JobState::Running => return Err(ManagerError::JobNotRemovable(job_id)),
            JobState::Queued => self.cancel(myself, job_id)?,
            _ => {}
        }

        self.auto_remove.remove(&job_id);
        let Some(record) = self.store.remove(job_id) else {
            return Err(ManagerError::JobNotFound(job_id));
        };

        let undoable = record.has_started();
        if undoable {
            if let Some(evicted) = self.store.push_undo(record) {
                tracing::debug!("Undo stack full, dropping job {}", evicted.id);
                self.discard(&evicted).await;
            }
        } else {
            self.discard(&record).await;
        }

        tracing::info!("Removed job {} (undoable: {})", job_id, undoable);
        self.broadcast(JobEvent::JobRemoved {
            job_id,
            undoable,
            timestamp: Utc::now(),
        });
        if undoable {
            self.broadcast_undo_depth();
        }
        Ok(())
    }

    fn restore_last(&mut self) -> Option<JobRecord> {
        let record = self.store.restore_last()?;
        tracing::info!("Restored job {}", record.id);
        self.broadcast(JobEvent::JobRestored {
            job: Box::new(record.clone()),
            timestamp: Utc::now(),
        });
        self.broadcast_undo_depth();
        Some(record)
    }

    async fn restore_original(&mut self, job_id: JobId) -> Result<(), ManagerError> {
        let record = self
            .store
            .get(job_id)
            .ok_or(ManagerError::JobNotFound(job_id))?;
        let path = match (&record.result, record.is_original) {
            (Some(output), false) => output.path.clone(),
            _ => return Err(ManagerError::NothingToRestore(job_id)),
        };

        let written = self.backups.restore_to(job_id, &path).await?;
        let record = self
            .store
            .get_mut(job_id)
            .ok_or(ManagerError::JobNotFound(job_id))?;
        if !record.restore_original() {
            return Err(ManagerError::NothingToRestore(job_id));
        }
        tracing::info!("Restored original of job {} ({} bytes)", job_id, written);

        self.broadcast(JobEvent::OriginalRestored {
            job_id,
            timestamp: Utc::now(),
        });
        Ok(())
    }

    fn job_finished(
        &mut self,
        myself: &ActorRef<ManagerMessage>,
        job_id: JobId,
        worker_id: String,
        generation: u64,
        outcome: EngineResult<EngineOutput>,
    ) -> Option<PathBuf> {
        if let Some(slot) = self.workers.iter_mut().find(|w| w.busy == Some(generation)) {
            slot.busy = None;
        }

        let current = self
            .running
            .get(&job_id)
            .is_some_and(|run| run.generation == generation);
        if !current {
            tracing::debug!(
                "Ignoring stale report for job {} from {} (generation {})",
                job_id,
                worker_id,
                generation
            );
            return outcome.ok().map(|output| output.path);
        }
        let run = self.running.remove(&job_id)?;

        let Some(record) = self.store.get_mut(job_id) else {
            tracing::warn!("Finished job {} is no longer active", job_id);
            return outcome.ok().map(|output| output.path);
        };

        let mut orphaned = None;
        let transition = match outcome {
            Ok(output) if run.cancel_requested => {
                orphaned = Some(output.path);
                record.cancel()
            }
            Err(EngineError::Cancelled) => record.cancel(),
            _ if run.cancel_requested => record.cancel(),
            Ok(output) => record.succeed(OptimisedOutput {
                path: output.path,
                size: output.size,
                original_size: output.original_size,
            }),
            Err(e) => record.fail(e.to_string()),
        };
        if let Err(e) = transition {
            tracing::warn!("Dropping report for job {}: {}", job_id, e);
            return orphaned;
        }

        let state = record.state;
        match state {
            JobState::Succeeded => tracing::info!("Job {} succeeded", job_id),
            JobState::Failed => tracing::warn!(
                "Job {} failed: {}",
                job_id,
                record.error.as_deref().unwrap_or(JobRecord::UNKNOWN_ERROR)
            ),
            _ => tracing::info!("Job {} cancelled", job_id),
        }
        self.broadcast_transition(job_id, JobState::Running, Some(run.worker_id));

        if state == JobState::Succeeded
            && let Some(delay) = self.config.auto_remove_after()
        {
            self.auto_remove.insert(job_id);
            schedule(myself, delay, ManagerMessage::AutoRemove { job_id });
        }
        orphaned
    }

    /// Force a cancelled job that did not acknowledge in time.
    fn cancel_grace_elapsed(&mut self, job_id: JobId, generation: u64) {
        let overdue = self
            .running
            .get(&job_id)
            .is_some_and(|run| run.generation == generation && run.cancel_requested);
        if !overdue {
            return;
        }
        let Some(run) = self.running.remove(&job_id) else {
            return;
        };
        if let Some(record) = self.store.get_mut(job_id)
            && record.cancel().is_ok()
        {
            tracing::warn!(
                "Job {} did not stop within {:?}, forcing cancelled",
                job_id,
                self.config.cancel_grace()
            );
            self.broadcast_transition(job_id, JobState::Running, Some(run.worker_id));
        }
    }

    fn broadcast_undo_depth(&self) {
        self.broadcast(JobEvent::UndoStackChanged {
            depth: self.store.undo_depth(),
            timestamp: Utc::now(),
        });
    }

    fn set_paused(&mut self, paused: bool) {
        if self.paused == paused {
            return;
        }
        self.paused = paused;
        tracing::info!("Dispatch {}", if paused { "paused" } else { "resumed" });
        self.broadcast(JobEvent::ManagerStateChanged {
            paused,
            timestamp: Utc::now(),
        });
    }

    /// Drop a job's backup and workdir files.
    async fn discard(&self, record: &JobRecord) {
        if let Err(e) = self.backups.discard(record.id).await {
            tracing::warn!("Failed to discard backup of job {}: {}", record.id, e);
        }
        remove_path(&job_dir(&self.config.workdir, record.id)).await;
    }

    async fn clean_workdir(&self) -> Result<usize, ManagerError> {
        let jobs_dir = self.config.workdir.join(JOBS_DIR);
        let mut entries = match tokio::fs::read_dir(&jobs_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(ManagerError::Io(format!("{}: {e}", jobs_dir.display()))),
        };

        let live: HashSet<String> = self
            .store
            .all_records()
            .map(|r| r.id.to_string())
            .chain(self.running.keys().map(|id| id.to_string()))
            .collect();

        let mut removed = 0;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| ManagerError::Io(format!("{}: {e}", jobs_dir.display())))?
        {
            let name = entry.file_name().to_string_lossy().into_owned();
            if live.contains(&name) {
                continue;
            }
            if let Ok(job_id) = JobId::parse(&name)
                && let Err(e) = self.backups.discard(job_id).await
            {
                tracing::warn!("Failed to discard backup of job {}: {}", job_id, e);
            }
            remove_path(&entry.path()).await;
            removed += 1;
        }

        tracing::info!("Cleaned {} stale entries from {}", removed, jobs_dir.display());
        Ok(removed)
    }

    fn shutdown(&mut self) {
        self.shutting_down = true;
        for run in self.running.values() {
            run.cancel.cancel();
        }
        for worker in &self.workers {
            let _ = worker.actor.send_message(WorkerMessage::Shutdown);
        }
    }
}

/// Check a source before any record exists for it.
async fn validate_source(source: &JobSource) -> Result<(), ManagerError> {
    match source {
        JobSource::File { path } => {
            let meta = tokio::fs::metadata(path).await.map_err(|e| {
                ManagerError::InvalidSource(format!("cannot read {}: {e}", path.display()))
            })?;
            if !meta.is_file() {
                return Err(ManagerError::InvalidSource(format!(
                    "{} is not a regular file",
                    path.display()
                )));
            }
            if meta.len() == 0 {
                return Err(ManagerError::InvalidSource(format!(
                    "{} is empty",
                    path.display()
                )));
            }
            tokio::fs::File::open(path).await.map_err(|e| {
                ManagerError::InvalidSource(format!("cannot open {}: {e}", path.display()))
            })?;
            Ok(())
        }
        JobSource::Clipboard { bytes, .. } if bytes.is_empty() => Err(
            ManagerError::InvalidSource("clipboard payload is empty".into()),
        ),
        JobSource::Clipboard { .. } => Ok(()),
    }
}

async fn remove_path(path: &Path) {
    let result = match tokio::fs::symlink_metadata(path).await {
        Ok(meta) if meta.is_dir() => tokio::fs::remove_dir_all(path).await,
        Ok(_) => tokio::fs::remove_file(path).await,
        Err(_) => return,
    };
    if let Err(e) = result {
        tracing::warn!("Failed to remove {}: {}", path.display(), e);
    }
}

/// Send `message` to `actor` after `delay`.
fn schedule(actor: &ActorRef<ManagerMessage>, delay: Duration, message: ManagerMessage) {
    let actor = actor.clone();
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        let _ = actor.send_message(message);
    });
}

/// Manager actor that owns the job store and the worker pool.
pub struct ManagerActor;

impl Actor for ManagerActor {
    type Msg = ManagerMessage;
    type State = ManagerState;
    type Arguments = ManagerArgs;

    async fn pre_start(
        &self,
        myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        tracing::info!(
            "Starting job manager ({} workers, undo capacity {})",
            args.config.concurrency,
            args.config.undo_capacity
        );

        tokio::fs::create_dir_all(&args.config.workdir)
            .await
            .map_err(|e| {
                ActorProcessingErr::from(format!(
                    "Failed to create workdir {}: {}",
                    args.config.workdir.display(),
                    e
                ))
            })?;

        let mut state = ManagerState::new(args);
        for _ in 0..state.config.concurrency {
            spawn_worker(&myself, &mut state).await?;
        }
        Ok(state)
    }

    async fn handle(
        &self,
        myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            ManagerMessage::Submit {
                source,
                options,
                reply,
            } => {
                let result = state.submit(source, options).await;
                state.dispatch();
                let _ = reply.send(result);
            }

            ManagerMessage::Cancel { job_id, reply } => {
                let _ = reply.send(state.cancel(&myself, job_id));
            }

            ManagerMessage::Remove { job_id, reply } => {
                let _ = reply.send(state.remove(&myself, job_id).await);
            }

            ManagerMessage::RestoreLast { reply } => {
                let _ = reply.send(state.restore_last());
            }

            ManagerMessage::RestoreOriginal { job_id, reply } => {
                let _ = reply.send(state.restore_original(job_id).await);
            }

            ManagerMessage::GetJob { job_id, reply } => {
                let _ = reply.send(state.store.get(job_id).cloned());
            }

            ManagerMessage::ListJobs { reply } => {
                let _ = reply.send(state.store.iter_recent().cloned().collect());
            }

            ManagerMessage::Snapshot { reply } => {
                let _ = reply.send(state.snapshot());
            }

            ManagerMessage::Pause => state.set_paused(true),

            ManagerMessage::Resume => {
                state.set_paused(false);
                state.dispatch();
            }

            ManagerMessage::CleanWorkdir { reply } => {
                let _ = reply.send(state.clean_workdir().await);
            }

            ManagerMessage::JobFinished {
                job_id,
                worker_id,
                generation,
                outcome,
            } => {
                if let Some(orphan) =
                    state.job_finished(&myself, job_id, worker_id, generation, outcome)
                {
                    remove_path(&orphan).await;
                }
                state.dispatch();
            }

            ManagerMessage::CancelGraceElapsed { job_id, generation } => {
                state.cancel_grace_elapsed(job_id, generation);
            }

            ManagerMessage::AutoRemove { job_id } => {
                if state.auto_remove.remove(&job_id)
                    && let Err(e) = state.remove(&myself, job_id).await
                {
                    tracing::debug!("Auto-remove of job {} skipped: {}", job_id, e);
                }
            }

            ManagerMessage::Shutdown => {
                tracing::info!("Shutting down job manager");
                state.shutdown();
                myself.stop(None);
            }
        }

        Ok(())
    }

    async fn handle_supervisor_evt(
        &self,
        myself: ActorRef<Self::Msg>,
        message: SupervisionEvent,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        let (cell, reason) = match message {
            SupervisionEvent::ActorTerminated(cell, _, reason) => (cell, reason),
            SupervisionEvent::ActorFailed(cell, err) => (cell, Some(err.to_string())),
            _ => return Ok(()),
        };
        if state.shutting_down {
            return Ok(());
        }

        let Some(index) = state
            .workers
            .iter()
            .position(|w| w.actor.get_id() == cell.get_id())
        else {
            return Ok(());
        };
        let slot = state.workers.remove(index);
        tracing::warn!("Worker {} stopped unexpectedly: {:?}", slot.worker_id, reason);

        // Fail whatever it was running; a late report cannot arrive.
        if let Some(generation) = slot.busy
            && let Some(job_id) = state
                .running
                .iter()
                .find(|(_, run)| run.generation == generation)
                .map(|(id, _)| *id)
        {
            state.running.remove(&job_id);
            if let Some(record) = state.store.get_mut(job_id) {
                let _ = record.fail(format!("{} stopped unexpectedly", slot.worker_id));
            }
            state.broadcast_transition(job_id, JobState::Running, Some(slot.worker_id));
        }

        spawn_worker(&myself, state).await?;
        state.dispatch();
        Ok(())
    }

    async fn post_stop(
        &self,
        _myself: ActorRef<Self::Msg>,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        state.shutdown();
        Ok(())
    }
}

async fn spawn_worker(
    myself: &ActorRef<ManagerMessage>,
    state: &mut ManagerState,
) -> Result<(), ActorProcessingErr> {
    let args = state.worker_args(myself.clone());
    let worker_id = args.worker_id.clone();
    let (actor, _handle) = Actor::spawn_linked(None, WorkerActor, args, myself.get_cell())
        .await
        .map_err(|e| ActorProcessingErr::from(format!("Failed to spawn worker: {}", e)))?;
    state.workers.push(WorkerSlot {
        worker_id,
        actor,
        busy: None,
    });
    Ok(())
}
