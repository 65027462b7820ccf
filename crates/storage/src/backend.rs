//! Storage backend trait definition

use async_trait::async_trait;
use bytes::Bytes;
use runtime_core::Result;

/// Async access to files under one root directory.
///
/// Paths are relative to the root and may not escape it.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Read a whole file.
    ///
    /// Fails with `StoragePathNotFound` if the file does not exist.
    async fn read(&self, path: &str) -> Result<Bytes>;

    /// Replace a file atomically, creating parent directories.
    ///
    /// Returns the number of bytes written.
    async fn write(&self, path: &str, data: Bytes) -> Result<u64>;

    /// Remove a file.
    ///
    /// Fails with `StoragePathNotFound` if the file does not exist.
    async fn delete(&self, path: &str) -> Result<()>;

    async fn exists(&self, path: &str) -> Result<bool>;

    /// Sorted relative paths of the regular files under `prefix`, excluding
    /// in-flight temporary files
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;
}
