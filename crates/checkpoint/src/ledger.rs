//! Rotating checkpoint ledger
//!
//! A session directory holds checkpoint artifacts plus `checkpoints.json`,
//! the ordered list of live artifacts (oldest first). Every ledger update
//! happens under an exclusive lock on `checkpoints.json.lock`, so several
//! processes sharing a session directory never lose each other's entries.

use bytes::Bytes;
use parking_lot::Mutex;
use runtime_core::{BincodeCodec, Codec, Error, Result, Step};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use storage::{LocalStorage, StorageBackend};
use tracing::{debug, info, instrument, warn};

use crate::discovery::{artifact_file_name, parse_artifact_step};
use crate::lock::LedgerLock;

/// Ledger file name inside a session directory
pub const LEDGER_FILE: &str = "checkpoints.json";

/// Lock file name inside a session directory
pub const LOCK_FILE: &str = "checkpoints.json.lock";

/// On-disk ledger contents
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerLog {
    /// Artifact paths relative to the session directory, oldest first
    pub checkpoints: Vec<String>,
}

impl LedgerLog {
    fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
        let mut serializer = serde_json::Serializer::with_formatter(&mut out, formatter);
        self.serialize(&mut serializer)?;
        Ok(out)
    }
}

/// Saves checkpoints into one session directory, keeping the newest `num_kept`
pub struct CheckpointLedger<C: Codec = BincodeCodec> {
    session_dir: PathBuf,
    storage: LocalStorage,
    codec: C,
    num_kept: i64,
    last_saved: Mutex<Option<Step>>,
}

impl CheckpointLedger<BincodeCodec> {
    pub fn new<P: AsRef<Path>>(session_dir: P, num_kept: i64) -> Self {
        Self::with_codec(session_dir, BincodeCodec, num_kept)
    }
}

impl<C: Codec> CheckpointLedger<C> {
    /// `num_kept <= 0` disables eviction
    pub fn with_codec<P: AsRef<Path>>(session_dir: P, codec: C, num_kept: i64) -> Self {
        let session_dir = session_dir.as_ref().to_path_buf();
        Self {
            storage: LocalStorage::new(&session_dir),
            session_dir,
            codec,
            num_kept,
            last_saved: Mutex::new(None),
        }
    }

    pub fn session_dir(&self) -> &Path {
        &self.session_dir
    }

    pub fn codec(&self) -> &C {
        &self.codec
    }

    pub fn num_kept(&self) -> i64 {
        self.num_kept
    }

    pub fn ledger_path(&self) -> PathBuf {
        self.session_dir.join(LEDGER_FILE)
    }

    pub fn lock_path(&self) -> PathBuf {
        self.session_dir.join(LOCK_FILE)
    }

    /// Artifact file name for `step`
    pub fn artifact_name(&self, step: Step) -> String {
        artifact_file_name(step, self.codec.extension())
    }

    /// Persist `blob` as the checkpoint for `step`.
    ///
    /// Saving the same step twice in a row is a no-op. Before the new artifact
    /// is written, the oldest entries are evicted until there is room for it.
    #[instrument(skip(self, blob), fields(session = %self.session_dir.display()))]
    pub async fn save<T: Serialize + ?Sized>(&self, blob: &T, step: Step) -> Result<()> {
        if *self.last_saved.lock() == Some(step) {
            debug!(step, "Checkpoint already saved for this step");
            return Ok(());
        }

        let data = Bytes::from(self.codec.encode(blob)?);
        let name = self.artifact_name(step);

        let lock = LedgerLock::acquire(self.lock_path()).await?;
        let mut log = self.read_log().await?;

        // Re-saving a step replaces its entry instead of duplicating it.
        log.checkpoints.retain(|entry| entry != &name);

        let mut evicted = Vec::new();
        while self.num_kept > 0 && log.checkpoints.len() as i64 >= self.num_kept {
            evicted.push(log.checkpoints.remove(0));
        }
        if !evicted.is_empty() {
            // Drop the entries first so the ledger never names a deleted file.
            self.write_log(&log).await?;
            for entry in &evicted {
                self.remove_artifact(entry).await?;
            }
        }

        let size = self.storage.write(&name, data).await?;
        log.checkpoints.push(name.clone());
        self.write_log(&log).await?;
        drop(lock);

        *self.last_saved.lock() = Some(step);
        info!(step, artifact = %name, size, evicted = evicted.len(), "Checkpoint saved");
        Ok(())
    }

    /// Load the checkpoint for `step`, or the newest one when `step` is `None`.
    ///
    /// Only artifacts named in the ledger can be loaded.
    #[instrument(skip(self), fields(session = %self.session_dir.display()))]
    pub async fn load<T: DeserializeOwned>(&self, step: Option<Step>) -> Result<T> {
        let name = {
            let _lock = LedgerLock::acquire(self.lock_path()).await?;
            let log = self.read_log().await?;
            match step {
                Some(step) => {
                    let name = self.artifact_name(step);
                    if !log.checkpoints.contains(&name) {
                        return Err(Error::CheckpointNotFound {
                            path: self.session_dir.join(&name).display().to_string(),
                        });
                    }
                    name
                }
                None => log.checkpoints.last().cloned().ok_or_else(|| {
                    Error::CheckpointNotFound {
                        path: self.ledger_path().display().to_string(),
                    }
                })?,
            }
        };

        let data = self.storage.read(&name).await.map_err(|e| match e {
            Error::StoragePathNotFound { path } => Error::CheckpointNotFound { path },
            other => other,
        })?;
        debug!(artifact = %name, size = data.len(), "Checkpoint loaded");
        self.codec.decode(&data)
    }

    /// Live artifact names, oldest first
    pub async fn entries(&self) -> Result<Vec<String>> {
        let _lock = LedgerLock::acquire(self.lock_path()).await?;
        Ok(self.read_log().await?.checkpoints)
    }

    /// Step of the newest live artifact
    pub async fn latest_step(&self) -> Result<Option<Step>> {
        let entries = self.entries().await?;
        Ok(entries
            .last()
            .and_then(|name| parse_artifact_step(name, self.codec.extension())))
    }

    /// Artifacts in the session directory that the ledger does not name,
    /// e.g. left behind by a crash between write and ledger update
    pub async fn orphans(&self) -> Result<Vec<String>> {
        let live = self.entries().await?;
        let extension = self.codec.extension();
        Ok(self
            .storage
            .list("model_")
            .await?
            .into_iter()
            .filter(|name| parse_artifact_step(name, extension).is_some())
            .filter(|name| !live.contains(name))
            .collect())
    }

    async fn read_log(&self) -> Result<LedgerLog> {
        match self.storage.read(LEDGER_FILE).await {
            Ok(data) => Ok(serde_json::from_slice(&data)?),
            Err(Error::StoragePathNotFound { .. }) => Ok(LedgerLog::default()),
            Err(e) => Err(e),
        }
    }

    async fn write_log(&self, log: &LedgerLog) -> Result<()> {
        self.storage
            .write(LEDGER_FILE, Bytes::from(log.to_bytes()?))
            .await?;
        Ok(())
    }

    async fn remove_artifact(&self, entry: &str) -> Result<()> {
        match self.storage.delete(entry).await {
            Ok(()) => {
                debug!(artifact = %entry, "Evicted checkpoint");
                Ok(())
            }
            Err(Error::StoragePathNotFound { .. }) => {
                warn!(artifact = %entry, "Evicted checkpoint was already missing");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}
