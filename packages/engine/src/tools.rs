//! Locating the external codec tools.

use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{EngineError, EngineResult};

/// External programs the engine knows how to drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tool {
    Pngquant,
    Oxipng,
    Jpegoptim,
    Gifsicle,
    Cwebp,
    Ffmpeg,
}

impl Tool {
    pub const ALL: [Tool; 6] = [
        Tool::Pngquant,
        Tool::Oxipng,
        Tool::Jpegoptim,
        Tool::Gifsicle,
        Tool::Cwebp,
        Tool::Ffmpeg,
    ];

    pub fn binary_name(&self) -> &'static str {
        match self {
            Tool::Pngquant => "pngquant",
            Tool::Oxipng => "oxipng",
            Tool::Jpegoptim => "jpegoptim",
            Tool::Gifsicle => "gifsicle",
            Tool::Cwebp => "cwebp",
            Tool::Ffmpeg => "ffmpeg",
        }
    }
}

impl std::fmt::Display for Tool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.binary_name())
    }
}

/// Resolves tool binaries from a bundled directory first, then `PATH`.
#[derive(Debug, Clone, Default)]
pub struct ToolLocator {
    bin_dir: Option<PathBuf>,
    search_path: Vec<PathBuf>,
}

impl ToolLocator {
    /// Locator over `bin_dir` and the current `PATH`.
    pub fn new(bin_dir: Option<PathBuf>) -> Self {
        let search_path = std::env::var_os("PATH")
            .map(|p| std::env::split_paths(&p).collect())
            .unwrap_or_default();
        Self {
            bin_dir,
            search_path,
        }
    }

    /// Locator that only looks in the given directories.
    pub fn with_search_path(bin_dir: Option<PathBuf>, search_path: Vec<PathBuf>) -> Self {
        Self {
            bin_dir,
            search_path,
        }
    }

    pub fn resolve(&self, tool: Tool) -> EngineResult<PathBuf> {
        let name = executable_name(tool.binary_name());
        self.bin_dir
            .iter()
            .chain(self.search_path.iter())
            .map(|dir| dir.join(&name))
            .find(|candidate| is_executable(candidate))
            .inspect(|path| debug!("Resolved {} to {}", tool, path.display()))
            .ok_or_else(|| EngineError::tool(format!("{tool} not found")))
    }

    /// Tools that cannot be resolved.
    pub fn missing(&self) -> Vec<Tool> {
        Tool::ALL
            .into_iter()
            .filter(|tool| self.resolve(*tool).is_err())
            .collect()
    }
}

fn executable_name(name: &str) -> String {
    if cfg!(windows) {
        format!("{name}.exe")
    } else {
        name.to_string()
    }
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}
