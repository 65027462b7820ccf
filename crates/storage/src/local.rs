//! Local filesystem storage backend

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use runtime_core::{Error, Result};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::StorageBackend;

const TEMP_SUFFIX: &str = ".tmp";

/// Files under a directory on the local filesystem
#[derive(Debug, Clone)]
pub struct LocalStorage {
    base_path: PathBuf,
}

impl LocalStorage {
    pub fn new<P: AsRef<Path>>(base_path: P) -> Self {
        Self {
            base_path: base_path.as_ref().to_path_buf(),
        }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Join `path` onto the base, rejecting absolute paths and `..`
    pub fn resolve_path(&self, path: &str) -> Result<PathBuf> {
        let relative = Path::new(path);
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
        if escapes {
            return Err(Error::Storage {
                message: format!("path {:?} escapes {:?}", path, self.base_path),
            });
        }
        Ok(self.base_path.join(relative))
    }

    /// Hidden sibling of `full_path` used while a write is in flight
    fn temp_path(full_path: &Path) -> PathBuf {
        let temp_name = format!(
            ".{}.{}{}",
            full_path.file_name().unwrap_or_default().to_string_lossy(),
            Uuid::new_v4(),
            TEMP_SUFFIX
        );
        full_path.with_file_name(temp_name)
    }

    fn is_temp_name(name: &str) -> bool {
        name.starts_with('.') && name.ends_with(TEMP_SUFFIX)
    }

    async fn write_temp(temp_path: &Path, data: &[u8]) -> Result<()> {
        let mut file = fs::File::create(temp_path)
            .await
            .map_err(|e| Error::Storage {
                message: format!("Failed to create temp file {:?}: {}", temp_path, e),
            })?;

        file.write_all(data).await.map_err(|e| Error::Storage {
            message: format!("Failed to write {:?}: {}", temp_path, e),
        })?;

        file.sync_all().await.map_err(|e| Error::Storage {
            message: format!("Failed to sync {:?}: {}", temp_path, e),
        })
    }

    /// Persist the rename itself
    async fn sync_dir(dir: &Path) {
        match fs::File::open(dir).await {
            Ok(handle) => {
                if let Err(e) = handle.sync_all().await {
                    warn!(?dir, error = %e, "Failed to sync directory");
                }
            }
            Err(e) => warn!(?dir, error = %e, "Failed to open directory for sync"),
        }
    }
}

#[async_trait]
impl StorageBackend for LocalStorage {
    #[instrument(skip(self), fields(backend = "local"))]
    async fn read(&self, path: &str) -> Result<Bytes> {
        let full_path = self.resolve_path(path)?;
        debug!(?full_path, "Reading file");

        match fs::read(&full_path).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(Error::StoragePathNotFound {
                path: full_path.display().to_string(),
            }),
            Err(e) => Err(Error::Storage {
                message: format!("Failed to read {}: {}", full_path.display(), e),
            }),
        }
    }

    #[instrument(skip(self, data), fields(backend = "local", size = data.len()))]
    async fn write(&self, path: &str, data: Bytes) -> Result<u64> {
        let full_path = self.resolve_path(path)?;
        let temp_path = Self::temp_path(&full_path);
        let size = data.len() as u64;
        let parent = full_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.base_path.clone());

        fs::create_dir_all(&parent)
            .await
            .map_err(|e| Error::Storage {
                message: format!("Failed to create directory {:?}: {}", parent, e),
            })?;

        if let Err(e) = Self::write_temp(&temp_path, &data).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(e);
        }

        if let Err(e) = fs::rename(&temp_path, &full_path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(Error::Storage {
                message: format!("Failed to rename {:?} to {:?}: {}", temp_path, full_path, e),
            });
        }
        Self::sync_dir(&parent).await;

        debug!(?full_path, size, "File written");
        Ok(size)
    }

    #[instrument(skip(self), fields(backend = "local"))]
    async fn delete(&self, path: &str) -> Result<()> {
        let full_path = self.resolve_path(path)?;
        debug!(?full_path, "Deleting file");

        match fs::remove_file(&full_path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(Error::StoragePathNotFound {
                path: full_path.display().to_string(),
            }),
            Err(e) => Err(Error::Storage {
                message: format!("Failed to delete {}: {}", full_path.display(), e),
            }),
        }
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        let full_path = self.resolve_path(path)?;
        Ok(fs::metadata(&full_path).await.is_ok())
    }

    #[instrument(skip(self), fields(backend = "local"))]
    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let search_path = self.resolve_path(prefix)?;
        let mut results = Vec::new();

        let dir_to_scan = if search_path.is_dir() {
            search_path
        } else {
            match search_path.parent() {
                Some(parent) if parent.is_dir() => parent.to_path_buf(),
                _ => return Ok(results),
            }
        };

        let mut stack = vec![dir_to_scan];
        while let Some(dir) = stack.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(_) => continue,
            };

            while let Ok(Some(entry)) = entries.next_entry().await {
                let Ok(file_type) = entry.file_type().await else {
                    continue;
                };
                let entry_path = entry.path();

                if file_type.is_dir() {
                    stack.push(entry_path);
                    continue;
                }
                if !file_type.is_file() || Self::is_temp_name(&entry.file_name().to_string_lossy()) {
                    continue;
                }
                if let Ok(relative) = entry_path.strip_prefix(&self.base_path) {
                    let relative = relative.to_string_lossy().to_string();
                    if relative.starts_with(prefix) {
                        results.push(relative);
                    }
                }
            }
        }

        results.sort();
        debug!(count = results.len(), "Listed files");
        Ok(results)
    }
}
