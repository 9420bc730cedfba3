//! ChunkStore: filesystem-backed per-session chunk storage
//!
//! Chunks live under `<root>/temp/chunks/<owner>/<file_id>/chunk_<index>`.
//! Writes are atomic (temp file + fsync + rename), so a crash-free read
//! returns exactly the bytes written. A per-file async lock serializes
//! write/assemble for the same file; reads are lock-free.

use crate::error::{Error, Result};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Result of a successful assembly
#[derive(Debug, Clone)]
pub struct AssembledFile {
    pub path: PathBuf,
    pub size: u64,
}

pub struct ChunkStore {
    root: PathBuf,
    /// Per-file locks for write/assemble mutual exclusion
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl ChunkStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Directory holding one session's chunks.
    ///
    /// Both path components are validated so a hostile `file_id` or owner
    /// cannot escape the configured root.
    pub fn session_dir(&self, owner_id: &str, file_id: &str) -> Result<PathBuf> {
        validate_component(owner_id)?;
        validate_component(file_id)?;
        Ok(self
            .root
            .join("temp")
            .join("chunks")
            .join(owner_id)
            .join(file_id))
    }

    /// Create the session's chunk directory; idempotent.
    pub async fn prepare(&self, owner_id: &str, file_id: &str) -> Result<PathBuf> {
        let dir = self.session_dir(owner_id, file_id)?;
        tokio::fs::create_dir_all(&dir).await?;
        Ok(dir)
    }

    /// Atomically persist one chunk: write to `chunk_<idx>.part`, fsync,
    /// rename into place. Replaces any existing chunk at the same index.
    pub async fn write(
        &self,
        owner_id: &str,
        file_id: &str,
        index: u32,
        bytes: &[u8],
    ) -> Result<()> {
        let dir = self.session_dir(owner_id, file_id)?;
        let lock = self.file_lock(file_id).await;
        let _guard = lock.lock().await;

        tokio::fs::create_dir_all(&dir).await?;
        let part = dir.join(format!("chunk_{}.part", index));
        let target = dir.join(format!("chunk_{}", index));

        let mut file = tokio::fs::File::create(&part).await?;
        file.write_all(bytes).await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&part, &target).await?;

        debug!(owner = %owner_id, file_id = %file_id, index, size = bytes.len(), "chunk written");
        Ok(())
    }

    pub async fn exists(&self, owner_id: &str, file_id: &str, index: u32) -> Result<bool> {
        let dir = self.session_dir(owner_id, file_id)?;
        Ok(tokio::fs::try_exists(dir.join(format!("chunk_{}", index)))
            .await
            .unwrap_or(false))
    }

    /// Indices of the chunks currently on disk, sorted ascending.
    /// `.part` leftovers from interrupted writes are ignored.
    pub async fn list(&self, owner_id: &str, file_id: &str) -> Result<Vec<u32>> {
        let dir = self.session_dir(owner_id, file_id)?;
        let mut indices = Vec::new();
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(indices),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some(idx) = name
                .strip_prefix("chunk_")
                .filter(|rest| !rest.ends_with(".part"))
                .and_then(|rest| rest.parse::<u32>().ok())
            {
                indices.push(idx);
            }
        }
        indices.sort_unstable();
        Ok(indices)
    }

    pub async fn read(&self, owner_id: &str, file_id: &str, index: u32) -> Result<Vec<u8>> {
        let dir = self.session_dir(owner_id, file_id)?;
        let path = dir.join(format!("chunk_{}", index));
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(Error::NotFound(format!(
                "chunk {} of {} not on disk",
                index, file_id
            ))),
            Err(e) => Err(e.into()),
        }
    }

    /// Stream chunks in `order` into a new file at `out_path`, fsync, and
    /// verify the assembled size against `expected_size`.
    ///
    /// On size mismatch the partial output is removed and the chunks are
    /// left in place for a retry.
    pub async fn assemble(
        &self,
        owner_id: &str,
        file_id: &str,
        order: &[u32],
        out_path: &Path,
        expected_size: u64,
    ) -> Result<AssembledFile> {
        let dir = self.session_dir(owner_id, file_id)?;
        let lock = self.file_lock(file_id).await;
        let _guard = lock.lock().await;

        if let Some(parent) = out_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut out = tokio::fs::File::create(out_path).await?;
        let mut written: u64 = 0;
        for &index in order {
            let chunk = tokio::fs::read(dir.join(format!("chunk_{}", index))).await?;
            out.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        out.sync_all().await?;
        drop(out);

        if written != expected_size {
            let _ = tokio::fs::remove_file(out_path).await;
            return Err(Error::SizeMismatch {
                expected: expected_size,
                actual: written,
            });
        }

        debug!(owner = %owner_id, file_id = %file_id, size = written, path = %out_path.display(), "file assembled");
        Ok(AssembledFile {
            path: out_path.to_path_buf(),
            size: written,
        })
    }

    /// Remove all chunks and the session directory. Succeeds even when
    /// partially populated; failures are logged, never propagated.
    pub async fn purge(&self, owner_id: &str, file_id: &str) {
        let Ok(dir) = self.session_dir(owner_id, file_id) else {
            return;
        };
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => debug!(owner = %owner_id, file_id = %file_id, "chunks purged"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                warn!(owner = %owner_id, file_id = %file_id, error = %e, "chunk purge failed")
            }
        }
        self.locks.lock().await.remove(file_id);
    }

    async fn file_lock(&self, file_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        Arc::clone(
            locks
                .entry(file_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(()))),
        )
    }
}

/// Reject path components that could escape the chunk root.
fn validate_component(value: &str) -> Result<()> {
    if value.is_empty()
        || value == "."
        || value == ".."
        || value.contains('/')
        || value.contains('\\')
        || value.contains('\0')
    {
        return Err(Error::BadRequest(format!(
            "invalid path component: {:?}",
            value
        )));
    }
    Ok(())
}
