//! Running external tools with kill-on-cancel.

use std::ffi::OsString;
use std::io;
use std::path::Path;
use std::process::Stdio;

use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{EngineError, EngineResult};

/// Longest stderr tail kept in error messages.
const STDERR_TAIL: usize = 512;

/// How a tool run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolStatus {
    /// Exited successfully; the output was written.
    Completed,
    /// Exited with one of the step's pass-through codes and wrote nothing
    /// worth keeping.
    Skipped(i32),
}

/// Run `program` to completion, killing it as soon as `cancel` fires.
///
/// Exit codes listed in `pass_through` are reported as
/// [`ToolStatus::Skipped`] instead of an error. The child is also killed if
/// this future is dropped.
pub async fn run_tool(
    program: &Path,
    args: &[OsString],
    pass_through: &[i32],
    cancel: &CancellationToken,
) -> EngineResult<ToolStatus> {
    if cancel.is_cancelled() {
        return Err(EngineError::Cancelled);
    }

    let name = program
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| program.display().to_string());

    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => EngineError::tool(format!("{name} not found")),
            _ => EngineError::tool(format!("failed to start {name}: {e}")),
        })?;
    debug!("Started {} (pid {:?})", name, child.id());

    let stderr_reader = child.stderr.take().map(|mut stderr| {
        tokio::spawn(async move {
            let mut buf = Vec::new();
            let _ = stderr.read_to_end(&mut buf).await;
            buf
        })
    });

    tokio::select! {
        biased;

        _ = cancel.cancelled() => {
            if let Err(e) = child.kill().await {
                warn!("Failed to kill {}: {}", name, e);
            }
            if let Some(reader) = stderr_reader {
                reader.abort();
            }
            debug!("Killed {} after cancellation", name);
            Err(EngineError::Cancelled)
        }

        status = child.wait() => {
            let status = status.map_err(|e| EngineError::io("waiting for tool", e))?;
            if status.success() {
                return Ok(ToolStatus::Completed);
            }
            if let Some(code) = status.code().filter(|c| pass_through.contains(c)) {
                if let Some(reader) = stderr_reader {
                    reader.abort();
                }
                debug!("{} exited with {}, passing input through", name, code);
                return Ok(ToolStatus::Skipped(code));
            }

            let stderr = match stderr_reader {
                Some(reader) => reader.await.unwrap_or_default(),
                None => Vec::new(),
            };
            let stderr = String::from_utf8_lossy(&stderr);
            let stderr = tail(stderr.trim(), STDERR_TAIL);
            if stderr.is_empty() {
                Err(EngineError::tool(format!("{name} exited with {status}")))
            } else {
                Err(EngineError::tool(format!("{name} exited with {status}: {stderr}")))
            }
        }
    }
}

fn tail(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut start = s.len() - max;
    while !s.is_char_boundary(start) {
        start += 1;
    }
    &s[start..]
}
