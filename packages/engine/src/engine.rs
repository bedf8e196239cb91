//! Optimisation engine trait and the external-tool implementation.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;

use optimiser_core::{JobId, OptimiseOptions};
use tempfile::TempPath;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{EngineError, EngineResult};
use crate::format::{MediaFormat, detect_format};
use crate::plan::{StepMode, plan};
use crate::process::{ToolStatus, run_tool};
use crate::tools::ToolLocator;

/// Everything an engine needs to optimise one payload.
#[derive(Debug, Clone)]
pub struct EngineRequest {
    pub job_id: JobId,
    /// Payload to read. Never modified.
    pub input: PathBuf,
    /// Where the final result must be written.
    pub output: PathBuf,
    /// Scratch directory for intermediate files.
    pub scratch_dir: PathBuf,
    pub options: OptimiseOptions,
}

/// A finished optimisation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineOutput {
    pub path: PathBuf,
    pub size: u64,
    pub original_size: u64,
}

/// Future type for async engine runs.
pub type EngineFuture = Pin<Box<dyn Future<Output = EngineResult<EngineOutput>> + Send>>;

/// Trait for optimisation engines.
///
/// Implementations must watch `cancel` while they work and return
/// [`EngineError::Cancelled`] promptly once it fires, leaving no partial
/// output behind.
pub trait OptimisationEngine: Send + Sync + 'static {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Optimise one payload.
    fn optimise(&self, request: EngineRequest, cancel: CancellationToken) -> EngineFuture;
}

/// Engine driving external codec tools (pngquant, jpegoptim, ffmpeg, ...).
#[derive(Debug, Clone)]
pub struct ToolEngine {
    locator: Arc<ToolLocator>,
}

impl ToolEngine {
    pub fn new(locator: ToolLocator) -> Self {
        Self {
            locator: Arc::new(locator),
        }
    }

    pub fn locator(&self) -> &ToolLocator {
        &self.locator
    }
}

impl OptimisationEngine for ToolEngine {
    fn name(&self) -> &str {
        "tools"
    }

    fn optimise(&self, request: EngineRequest, cancel: CancellationToken) -> EngineFuture {
        let locator = self.locator.clone();
        Box::pin(async move { run_chain(&locator, request, cancel).await })
    }
}

async fn run_chain(
    locator: &ToolLocator,
    request: EngineRequest,
    cancel: CancellationToken,
) -> EngineResult<EngineOutput> {
    let original_size = tokio::fs::metadata(&request.input)
        .await
        .map_err(|e| EngineError::io("reading input", e))?
        .len();
    let format = detect_format(&request.input).await?;
    let steps = plan(format, &request.options);

    // Resolve every tool before doing any work.
    let programs = steps
        .iter()
        .map(|step| locator.resolve(step.tool))
        .collect::<EngineResult<Vec<_>>>()?;

    tokio::fs::create_dir_all(&request.scratch_dir)
        .await
        .map_err(|e| EngineError::io("creating scratch dir", e))?;
    if let Some(parent) = request.output.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| EngineError::io("creating output dir", e))?;
    }

    let mut current: Option<TempPath> = None;
    for (step, program) in steps.iter().zip(&programs) {
        let output = scratch_file(&request.scratch_dir, request.job_id, format)?;
        let input: &Path = current.as_deref().unwrap_or(&request.input);

        if step.mode == StepMode::InPlace {
            tokio::fs::copy(input, &output)
                .await
                .map_err(|e| EngineError::io("staging in-place step", e))?;
        }

        debug!("Job {}: running {}", request.job_id, step.tool);
        let args = step.command_args(input, &output);
        match run_tool(program, &args, step.pass_through, &cancel).await? {
            // Replacing `current` deletes the previous intermediate file.
            ToolStatus::Completed => current = Some(output),
            ToolStatus::Skipped(code) => {
                debug!("Job {}: {} made no gain (exit {})", request.job_id, step.tool, code);
            }
        }
    }

    if cancel.is_cancelled() {
        return Err(EngineError::Cancelled);
    }

    let size = match &current {
        Some(optimised) => tokio::fs::metadata(optimised)
            .await
            .map_err(|e| EngineError::io("reading output", e))?
            .len(),
        None => original_size,
    };

    let optimised = match current {
        Some(optimised) if size > 0 && size < original_size => optimised,
        _ => {
            debug!(
                "Job {}: output not smaller ({} >= {}), keeping original",
                request.job_id, size, original_size
            );
            tokio::fs::copy(&request.input, &request.output)
                .await
                .map_err(|e| EngineError::io("copying original", e))?;
            return Ok(EngineOutput {
                path: request.output,
                size: original_size,
                original_size,
            });
        }
    };

    let final_path = request.output.clone();
    tokio::task::spawn_blocking(move || optimised.persist(&final_path))
        .await
        .map_err(|e| EngineError::tool(format!("persist task failed: {e}")))?
        .map_err(|e| EngineError::io("writing output", e.error))?;

    Ok(EngineOutput {
        path: request.output,
        size,
        original_size,
    })
}

/// Temp file in the scratch dir, deleted on drop unless persisted.
fn scratch_file(dir: &Path, job_id: JobId, format: MediaFormat) -> EngineResult<TempPath> {
    let prefix = format!("{job_id}-");
    let suffix = format!(".{}", format.primary_extension());
    tempfile::Builder::new()
        .prefix(&prefix)
        .suffix(&suffix)
        .tempfile_in(dir)
        .map(|f| f.into_temp_path())
        .map_err(|e| EngineError::io("creating scratch file", e))
}

/// A simple function-based engine.
pub struct FnEngine<F>
where
    F: Fn(EngineRequest, CancellationToken) -> EngineFuture + Send + Sync + 'static,
{
    name: String,
    engine: F,
}

impl<F> FnEngine<F>
where
    F: Fn(EngineRequest, CancellationToken) -> EngineFuture + Send + Sync + 'static,
{
    /// Create a new function-based engine.
    pub fn new(name: impl Into<String>, engine: F) -> Self {
        Self {
            name: name.into(),
            engine,
        }
    }
}

impl<F> OptimisationEngine for FnEngine<F>
where
    F: Fn(EngineRequest, CancellationToken) -> EngineFuture + Send + Sync + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn optimise(&self, request: EngineRequest, cancel: CancellationToken) -> EngineFuture {
        (self.engine)(request, cancel)
    }
}
