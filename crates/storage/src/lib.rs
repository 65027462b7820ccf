//! Storage - artifact and ledger files of a checkpoint session
//!
//! Every write lands atomically: data goes to a hidden temporary file that is
//! synced and renamed over the target, so readers see either the old or the
//! new contents and never a partial file.
//!
//! # Example
//!
//! ```no_run
//! use storage::{StorageBackend, LocalStorage};
//! use bytes::Bytes;
//!
//! # async fn example() -> runtime_core::Result<()> {
//! let storage = LocalStorage::new("/tmp/sessions/train/2024-03-01 12:00:00");
//! storage.write("model_100.bin", Bytes::from(vec![1, 2, 3])).await?;
//! let data = storage.read("model_100.bin").await?;
//! # Ok(())
//! # }
//! ```

mod backend;
mod local;

pub use backend::StorageBackend;
pub use local::LocalStorage;
