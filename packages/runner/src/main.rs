//! Command-line front end: optimise the given files and stream manager
//! events to stdout as JSON lines.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use actors::{JobManager, ManagerError, start_manager};
use anyhow::Context;
use clap::Parser;
use engine::{ToolEngine, ToolLocator};
use optimiser_core::{JobEvent, JobId, JobState, ManagerConfig, OptimiseOptions};
use storage::BackupStore;
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "optimiser", version, about = "Optimise images and videos")]
struct Cli {
    /// Files to optimise.
    #[arg(required_unless_present = "check_tools")]
    files: Vec<PathBuf>,

    /// Trade more quality for smaller files.
    #[arg(short, long)]
    aggressive: bool,

    /// Scale dimensions by this factor before compressing. At least 0.1 and
    /// below 1.0.
    #[arg(short, long, value_name = "FACTOR")]
    downscale: Option<f32>,

    /// Jobs to run at once (overrides OPTIMISER_CONCURRENCY).
    #[arg(short = 'j', long)]
    concurrency: Option<usize>,

    /// Work directory for staged payloads and results (overrides OPTIMISER_WORKDIR).
    #[arg(long)]
    workdir: Option<PathBuf>,

    /// Directory searched for codec tools before PATH (overrides OPTIMISER_BIN_DIR).
    #[arg(long)]
    bin_dir: Option<PathBuf>,

    /// List codec tools that cannot be found and exit.
    #[arg(long)]
    check_tools: bool,
}

impl Cli {
    fn config(&self) -> anyhow::Result<ManagerConfig> {
        let mut config = ManagerConfig::from_env().context("reading OPTIMISER_* variables")?;
        if let Some(concurrency) = self.concurrency {
            config = config.with_concurrency(concurrency);
        }
        if let Some(workdir) = &self.workdir {
            config = config.with_workdir(workdir);
        }
        if self.bin_dir.is_some() {
            config.bin_dir = self.bin_dir.clone();
        }
        config.validate()?;
        Ok(config)
    }

    fn options(&self) -> anyhow::Result<OptimiseOptions> {
        let options = OptimiseOptions {
            aggressive: self.aggressive,
            downscale_factor: self.downscale,
        };
        options.validate().map_err(anyhow::Error::msg)?;
        Ok(options)
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    // stdout carries the event stream.
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = cli.config()?;
    let options = cli.options()?;

    let locator = ToolLocator::new(config.bin_dir.clone());
    let missing = locator.missing();
    if cli.check_tools {
        for tool in &missing {
            println!("missing: {tool}");
        }
        if !missing.is_empty() {
            anyhow::bail!("{} tool(s) missing", missing.len());
        }
        println!("all tools found");
        return Ok(());
    }
    for tool in &missing {
        tracing::warn!("{} not found, matching formats will fail", tool);
    }

    let backups = BackupStore::from_env().await.context("opening backup store")?;
    tracing::info!("Backups go to the {} store", backups.kind_str());
    let engine = Arc::new(ToolEngine::new(locator));
    let manager = start_manager(config, engine, backups, None).await?;

    let failed = run(&manager, &cli.files, options).await?;
    manager.shutdown().await?;

    if failed > 0 {
        anyhow::bail!("{failed} job(s) did not succeed");
    }
    Ok(())
}

/// Submit every file, print events until all jobs are terminal and return
/// how many did not succeed.
async fn run(
    manager: &JobManager,
    files: &[PathBuf],
    options: OptimiseOptions,
) -> anyhow::Result<usize> {
    let mut events = manager.subscribe();

    let mut pending: HashSet<JobId> = HashSet::new();
    let mut failed = 0;
    for path in files {
        match manager.submit_file(path, options).await {
            Ok(id) => {
                pending.insert(id);
            }
            Err(ManagerError::InvalidSource(reason)) => {
                tracing::error!("Skipping {}: {}", path.display(), reason);
                failed += 1;
            }
            Err(e) => return Err(e.into()),
        }
    }

    let mut interrupted = false;
    while !pending.is_empty() {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => {
                    tracing::debug!("{}", event.description());
                    println!("{}", serde_json::to_string(&event)?);
                    if let JobEvent::JobStateChanged { job_id, new_state, .. } = event
                        && new_state.is_terminal()
                        && pending.remove(&job_id)
                        && new_state != JobState::Succeeded
                    {
                        failed += 1;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!("Missed {} events, resyncing", skipped);
                    for job in manager.list().await? {
                        if job.state.is_terminal() && pending.remove(&job.id) && job.state != JobState::Succeeded {
                            failed += 1;
                        }
                    }
                }
                Err(RecvError::Closed) => break,
            },
            _ = tokio::signal::ctrl_c(), if !interrupted => {
                interrupted = true;
                tracing::info!("Interrupted, cancelling {} job(s)", pending.len());
                for id in &pending {
                    manager.cancel(*id).await?;
                }
            }
        }
    }

    for job in manager.list().await? {
        match (&job.state, &job.result) {
            (JobState::Succeeded, Some(output)) => tracing::info!(
                "{} -> {} ({:.1}% smaller)",
                job.source.describe(),
                output.path.display(),
                output.compression_ratio()
            ),
            _ => tracing::info!("{}: {}", job.source.describe(), job.state),
        }
    }
    Ok(failed)
}
