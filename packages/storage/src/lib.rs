//! Backup store for the originals of optimised payloads.
//!
//! Every job's original bytes are copied here before the engine runs, so
//! "restore original" keeps working after the payload has been replaced.
//!
//! A small wrapper around `object_store`:
//! - On-disk storage by default
//! - In-memory storage for tests
//!
//! Files are streamed in both directions, so a multi-gigabyte video never
//! sits in memory as a whole.

use std::path::{Path as FsPath, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use object_store::path::Path;
use object_store::{ObjectStore, ObjectStoreExt, WriteMultipart};
use optimiser_core::JobId;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::debug;

pub const BACKEND_VAR: &str = "OPTIMISER_BACKUP_BACKEND";
pub const DIR_VAR: &str = "OPTIMISER_BACKUP_DIR";

const MANIFEST: &str = "manifest.json";

/// Size of the parts uploaded while backing up a file.
const PART_SIZE: usize = 5 * 1024 * 1024;
/// Parts in flight per backup.
const PARTS_IN_FLIGHT: usize = 2;
const READ_BUF: usize = 64 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("invalid storage config: {0}")]
    InvalidConfig(String),

    #[error("no backup for {0}")]
    NotFound(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("object_store error: {0}")]
    ObjectStore(object_store::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("backup of {job_id} is truncated: expected {expected} bytes, read {actual}")]
    Truncated {
        job_id: JobId,
        expected: u64,
        actual: u64,
    },
}

impl From<object_store::Error> for StorageError {
    fn from(err: object_store::Error) -> Self {
        match err {
            object_store::Error::NotFound { path, .. } => Self::NotFound(path),
            other => Self::ObjectStore(other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageKind {
    Filesystem,
    Memory,
}

impl StorageKind {
    pub fn as_str(self) -> &'static str {
        match self {
            StorageKind::Filesystem => "filesystem",
            StorageKind::Memory => "memory",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageConfig {
    Filesystem { root: PathBuf },
    Memory,
}

impl StorageConfig {
    pub fn memory() -> Self {
        Self::Memory
    }

    pub fn filesystem(root: impl Into<PathBuf>) -> Self {
        Self::Filesystem { root: root.into() }
    }

    pub fn default_root() -> PathBuf {
        std::env::temp_dir().join("optimiser").join("backups")
    }

    /// Build a config from environment variables.
    ///
    /// - `OPTIMISER_BACKUP_BACKEND`: `filesystem` (default) or `memory`
    /// - `OPTIMISER_BACKUP_DIR`: filesystem root (default: `$TMPDIR/optimiser/backups`)
    pub fn from_env() -> Result<Self, StorageError> {
        let backend = std::env::var(BACKEND_VAR).ok().and_then(non_empty);
        let root = || {
            std::env::var(DIR_VAR)
                .ok()
                .and_then(non_empty)
                .map(PathBuf::from)
                .unwrap_or_else(Self::default_root)
        };

        match backend.as_deref() {
            None | Some("filesystem") | Some("fs") => Ok(Self::filesystem(root())),
            Some("memory") | Some("mem") => Ok(Self::memory()),
            Some(other) => Err(StorageError::InvalidConfig(format!(
                "unsupported {BACKEND_VAR}={other} (expected filesystem|memory)"
            ))),
        }
    }
}

/// What was backed up for a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupManifest {
    pub job_id: JobId,
    pub file_name: String,
    pub size: u64,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct BackupStore {
    kind: StorageKind,
    store: Arc<dyn ObjectStore>,
}

impl std::fmt::Debug for BackupStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackupStore")
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

impl BackupStore {
    pub fn kind(&self) -> StorageKind {
        self.kind
    }

    pub fn kind_str(&self) -> &'static str {
        self.kind.as_str()
    }

    pub async fn new(cfg: StorageConfig) -> Result<Self, StorageError> {
        let (kind, store) = match cfg {
            StorageConfig::Filesystem { root } => {
                ensure_dir(&root).await?;
                let fs = object_store::local::LocalFileSystem::new_with_prefix(&root)?;
                (StorageKind::Filesystem, Arc::new(fs) as _)
            }
            StorageConfig::Memory => {
                let mem = object_store::memory::InMemory::new();
                (StorageKind::Memory, Arc::new(mem) as _)
            }
        };

        Ok(Self { kind, store })
    }

    pub async fn from_env() -> Result<Self, StorageError> {
        Self::new(StorageConfig::from_env()?).await
    }

    /// Back up the file at `source` for `job_id`, streaming it in parts.
    pub async fn backup_file(
        &self,
        job_id: JobId,
        source: &FsPath,
    ) -> Result<BackupManifest, StorageError> {
        let file_name = source
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| StorageError::InvalidConfig(format!("{} has no file name", source.display())))?;
        let mut file = tokio::fs::File::open(source).await?;

        let upload = self.store.put_multipart(&original_key(job_id)).await?;
        let mut upload = WriteMultipart::new_with_chunk_size(upload, PART_SIZE);
        let mut buf = vec![0u8; READ_BUF];
        let mut size = 0u64;
        loop {
            let read = match file.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    if let Err(abort) = upload.abort().await {
                        debug!("Failed to abort backup upload of job {}: {}", job_id, abort);
                    }
                    return Err(e.into());
                }
            };
            upload.wait_for_capacity(PARTS_IN_FLIGHT).await?;
            upload.write(&buf[..read]);
            size += read as u64;
        }
        upload.finish().await?;

        self.write_manifest(job_id, &file_name, size).await
    }

    /// Back up an in-memory payload for `job_id`.
    pub async fn backup_bytes(
        &self,
        job_id: JobId,
        file_name: &str,
        bytes: Bytes,
    ) -> Result<BackupManifest, StorageError> {
        let size = bytes.len() as u64;
        self.put(&original_key(job_id), bytes).await?;
        self.write_manifest(job_id, file_name, size).await
    }

    async fn write_manifest(
        &self,
        job_id: JobId,
        file_name: &str,
        size: u64,
    ) -> Result<BackupManifest, StorageError> {
        let manifest = BackupManifest {
            job_id,
            file_name: sanitize(file_name),
            size,
            created_at: Utc::now(),
        };
        let json = serde_json::to_vec(&manifest)?;
        self.put(&manifest_key(job_id), Bytes::from(json)).await?;
        debug!("Backed up {} bytes for job {}", manifest.size, job_id);
        Ok(manifest)
    }

    pub async fn manifest(&self, job_id: JobId) -> Result<BackupManifest, StorageError> {
        let bytes = self.get(&manifest_key(job_id)).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// The original bytes backed up for `job_id`, loaded whole.
    pub async fn original(&self, job_id: JobId) -> Result<Bytes, StorageError> {
        self.get(&original_key(job_id)).await
    }

    /// Stream the backed up original over `dest`. Returns the bytes written.
    ///
    /// The copy lands in a sibling file first, so `dest` is only replaced by
    /// a complete original.
    pub async fn restore_to(&self, job_id: JobId, dest: &FsPath) -> Result<u64, StorageError> {
        let manifest = self.manifest(job_id).await?;
        let stream = self.store.get(&original_key(job_id)).await?.into_stream();

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let partial = partial_path(dest);
        let written = match write_stream(stream, &partial).await {
            Ok(written) => written,
            Err(e) => {
                let _ = tokio::fs::remove_file(&partial).await;
                return Err(e);
            }
        };
        if written != manifest.size {
            let _ = tokio::fs::remove_file(&partial).await;
            return Err(StorageError::Truncated {
                job_id,
                expected: manifest.size,
                actual: written,
            });
        }

        tokio::fs::rename(&partial, dest).await?;
        Ok(written)
    }

    /// Drop the backup for `job_id`. Missing backups are not an error.
    pub async fn discard(&self, job_id: JobId) -> Result<(), StorageError> {
        for key in [original_key(job_id), manifest_key(job_id)] {
            match self.store.delete(&key).await {
                Ok(()) | Err(object_store::Error::NotFound { .. }) => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    pub async fn exists(&self, job_id: JobId) -> Result<bool, StorageError> {
        match self.store.head(&manifest_key(job_id)).await {
            Ok(_) => Ok(true),
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn put(&self, path: &Path, bytes: Bytes) -> Result<(), StorageError> {
        self.store
            .put(path, object_store::PutPayload::from(bytes))
            .await?;
        Ok(())
    }

    async fn get(&self, path: &Path) -> Result<Bytes, StorageError> {
        let res = self.store.get(path).await?;
        Ok(res.bytes().await?)
    }
}

async fn write_stream(
    mut stream: futures_util::stream::BoxStream<'static, object_store::Result<Bytes>>,
    path: &FsPath,
) -> Result<u64, StorageError> {
    let mut file = tokio::fs::File::create(path).await?;
    let mut written = 0u64;
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        file.write_all(&chunk).await?;
        written += chunk.len() as u64;
    }
    file.flush().await?;
    Ok(written)
}

/// Hidden sibling of `dest` used while a restore is in progress.
fn partial_path(dest: &FsPath) -> PathBuf {
    let name = dest
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "original".to_string());
    dest.with_file_name(format!(".{name}.restoring"))
}

fn original_key(job_id: JobId) -> Path {
    Path::from(format!("originals/{job_id}/original"))
}

fn manifest_key(job_id: JobId) -> Path {
    Path::from(format!("originals/{job_id}/{MANIFEST}"))
}

/// File names end up in object keys; keep them to a single path segment.
fn sanitize(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| if matches!(c, '/' | '\\') { '_' } else { c })
        .collect();
    if cleaned.trim().is_empty() {
        "original".to_string()
    } else {
        cleaned
    }
}

async fn ensure_dir(root: &FsPath) -> Result<(), StorageError> {
    tokio::fs::create_dir_all(root).await?;
    Ok(())
}

fn non_empty(s: String) -> Option<String> {
    let trimmed = s.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}
