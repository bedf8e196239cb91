#![allow(dead_code)]

use std::collections::HashMap;
use std::error::Error;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use actors::{JobManager, TerminalHook, start_manager};
use engine::{
    EngineError, EngineFuture, EngineOutput, EngineRequest, EngineResult, FnEngine, OptimisationEngine,
};
use optimiser_core::{JobId, JobRecord, JobState, ManagerConfig};
use storage::{BackupStore, StorageConfig};
use tempfile::TempDir;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

pub type TestResult = Result<(), Box<dyn Error>>;

const WAIT_LIMIT: Duration = Duration::from_secs(5);
const POLL: Duration = Duration::from_millis(10);

/// How a gated run ends.
pub enum Verdict {
    Succeed,
    Fail(String),
}

#[derive(Default)]
struct Gates {
    waiting: HashMap<JobId, oneshot::Sender<Verdict>>,
    started: Vec<JobId>,
}

/// In-process engine whose runs finish when the test says so.
///
/// Successful runs write the first half of the input to the requested output.
#[derive(Clone)]
pub struct GateEngine {
    gates: Arc<Mutex<Gates>>,
    auto_succeed: bool,
    ignore_cancel: bool,
    panic_next: Arc<AtomicBool>,
}

impl GateEngine {
    /// Runs block until `release` is called or the job is cancelled.
    pub fn manual() -> Self {
        Self {
            gates: Arc::default(),
            auto_succeed: false,
            ignore_cancel: false,
            panic_next: Arc::default(),
        }
    }

    /// Runs succeed immediately.
    pub fn auto() -> Self {
        Self {
            auto_succeed: true,
            ..Self::manual()
        }
    }

    /// The first run panics inside the worker, later runs succeed immediately.
    pub fn panicking_once() -> Self {
        Self {
            panic_next: Arc::new(AtomicBool::new(true)),
            ..Self::auto()
        }
    }

    /// Runs block until `release`, even when cancelled.
    pub fn ignoring_cancel() -> Self {
        Self {
            ignore_cancel: true,
            ..Self::manual()
        }
    }

    pub fn engine(&self) -> Arc<dyn OptimisationEngine> {
        let gate = self.clone();
        Arc::new(FnEngine::new("gate", move |request, cancel| {
            let gate = gate.clone();
            let run: EngineFuture = Box::pin(async move { gate.run(request, cancel).await });
            run
        }))
    }

    async fn run(&self, request: EngineRequest, cancel: CancellationToken) -> EngineResult<EngineOutput> {
        if self.panic_next.swap(false, Ordering::SeqCst) {
            panic!("engine crashed on job {}", request.job_id);
        }
        let rx = {
            let mut gates = self.gates.lock().unwrap();
            let rx = if self.auto_succeed {
                None
            } else {
                let (tx, rx) = oneshot::channel();
                gates.waiting.insert(request.job_id, tx);
                Some(rx)
            };
            gates.started.push(request.job_id);
            rx
        };

        let verdict = match rx {
            None => Verdict::Succeed,
            Some(rx) if self.ignore_cancel => rx.await.unwrap_or(Verdict::Fail("gate dropped".into())),
            Some(rx) => tokio::select! {
                _ = cancel.cancelled() => return Err(EngineError::Cancelled),
                verdict = rx => verdict.unwrap_or(Verdict::Fail("gate dropped".into())),
            },
        };

        match verdict {
            Verdict::Succeed => shrink(&request).await,
            Verdict::Fail(message) => Err(EngineError::tool(message)),
        }
    }

    /// Jobs the engine has been asked to run, in call order.
    pub fn started(&self) -> Vec<JobId> {
        self.gates.lock().unwrap().started.clone()
    }

    pub async fn wait_started(&self, job_id: JobId) {
        wait_until(|| self.started().contains(&job_id)).await;
    }

    pub async fn wait_started_count(&self, count: usize) {
        wait_until(|| self.started().len() >= count).await;
    }

    /// Finish a blocked run.
    pub fn release(&self, job_id: JobId, verdict: Verdict) {
        let tx = self.gates.lock().unwrap().waiting.remove(&job_id);
        let tx = tx.unwrap_or_else(|| panic!("job {job_id} is not waiting"));
        let _ = tx.send(verdict);
    }
}

async fn shrink(request: &EngineRequest) -> EngineResult<EngineOutput> {
    let bytes = tokio::fs::read(&request.input)
        .await
        .map_err(|e| EngineError::io("reading input", e))?;
    let kept = &bytes[..bytes.len().div_ceil(2)];
    if let Some(parent) = request.output.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| EngineError::io("creating output dir", e))?;
    }
    tokio::fs::write(&request.output, kept)
        .await
        .map_err(|e| EngineError::io("writing output", e))?;
    Ok(EngineOutput {
        path: request.output.clone(),
        size: kept.len() as u64,
        original_size: bytes.len() as u64,
    })
}

/// A running manager plus everything it writes to.
pub struct Harness {
    pub manager: JobManager,
    pub engine: GateEngine,
    pub backups: BackupStore,
    pub workdir: TempDir,
    pub files: TempDir,
    terminal: Arc<Mutex<Vec<JobRecord>>>,
}

pub async fn setup(
    engine: GateEngine,
    configure: impl FnOnce(ManagerConfig) -> ManagerConfig,
) -> Result<Harness, Box<dyn Error>> {
    let workdir = tempfile::tempdir()?;
    let files = tempfile::tempdir()?;
    let backups = BackupStore::new(StorageConfig::memory()).await?;

    let terminal: Arc<Mutex<Vec<JobRecord>>> = Arc::default();
    let seen = terminal.clone();
    let hook: TerminalHook = Arc::new(move |record: &JobRecord| {
        seen.lock().unwrap().push(record.clone());
    });

    let config = configure(ManagerConfig::default().with_workdir(workdir.path()));
    let manager = start_manager(config, engine.engine(), backups.clone(), Some(hook)).await?;

    Ok(Harness {
        manager,
        engine,
        backups,
        workdir,
        files,
        terminal,
    })
}

impl Harness {
    /// Write a source file with `len` bytes of content.
    pub fn file(&self, name: &str, len: usize) -> PathBuf {
        let path = self.files.path().join(name);
        let content: Vec<u8> = (0..len).map(|i| b'a' + (i % 26) as u8).collect();
        std::fs::write(&path, content).unwrap();
        path
    }

    /// Records passed to the terminal hook so far.
    pub fn terminal(&self) -> Vec<JobRecord> {
        self.terminal.lock().unwrap().clone()
    }

    pub async fn wait_for_state(&self, job_id: JobId, state: JobState) -> JobRecord {
        let deadline = tokio::time::Instant::now() + WAIT_LIMIT;
        loop {
            let record = self.manager.get(job_id).await.unwrap();
            match record {
                Some(record) if record.state == state => return record,
                other if tokio::time::Instant::now() >= deadline => {
                    panic!("job {job_id} never reached {state}: {other:?}")
                }
                _ => tokio::time::sleep(POLL).await,
            }
        }
    }

    pub async fn wait_all_terminal(&self) {
        let deadline = tokio::time::Instant::now() + WAIT_LIMIT;
        loop {
            let jobs = self.manager.list().await.unwrap();
            if jobs.iter().all(|j| j.state.is_terminal()) {
                return;
            }
            assert!(tokio::time::Instant::now() < deadline, "jobs still active: {jobs:?}");
            tokio::time::sleep(POLL).await;
        }
    }
}

pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + WAIT_LIMIT;
    while !condition() {
        assert!(tokio::time::Instant::now() < deadline, "condition not met in time");
        tokio::time::sleep(POLL).await;
    }
}

pub async fn wait_until_path_gone(path: &Path) {
    wait_until(|| !path.exists()).await;
}
