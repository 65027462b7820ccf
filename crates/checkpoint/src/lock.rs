//! Advisory lock serializing ledger updates across processes

use fs4::fs_std::FileExt;
use runtime_core::{Error, Result};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Exclusive lock on a lock file, released on drop
#[derive(Debug)]
pub struct LedgerLock {
    file: File,
    path: PathBuf,
}

impl LedgerLock {
    /// Acquire the lock without blocking the async runtime
    pub async fn acquire(path: PathBuf) -> Result<Self> {
        tokio::task::spawn_blocking(move || Self::acquire_blocking(&path))
            .await
            .map_err(|e| Error::Internal {
                message: format!("lock task failed: {}", e),
            })?
    }

    /// Block until the lock is held, creating the lock file if needed
    pub fn acquire_blocking(path: &Path) -> Result<Self> {
        let failed = |e: std::io::Error| Error::LockFailed {
            path: path.display().to_string(),
            message: e.to_string(),
        };

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(failed)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(failed)?;

        FileExt::lock_exclusive(&file).map_err(failed)?;
        debug!(path = %path.display(), "Acquired ledger lock");

        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for LedgerLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            warn!(path = %self.path.display(), error = %e, "Failed to release ledger lock");
        }
    }
}
