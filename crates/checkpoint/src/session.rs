//! Training session layout
//!
//! A session is one `<root>/<session_type>/<session_time>/` directory shared
//! by every rank of a run. The session time is chosen on rank 0 and broadcast,
//! so all ranks write into the same directory even if their clocks disagree.

use collective::CollectiveChannel;
use parking_lot::Mutex;
use runtime_core::{
    BincodeCodec, CheckpointConfig, Clock, Codec, Error, Result, Step, SESSION_TIME_FORMAT,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::discovery::resolve_restore_path;
use crate::ledger::CheckpointLedger;

/// Subdirectory holding summary event files
pub const SUMMARY_DIR: &str = "tensorboard";

/// Owns the directory and checkpoint ledger of one training session
pub struct SessionManager<C: Codec = BincodeCodec> {
    root: PathBuf,
    session_type: String,
    session_time: String,
    ledger: CheckpointLedger<C>,
    restore_step: Mutex<Option<Step>>,
}

impl SessionManager<BincodeCodec> {
    /// Start a new session; see [`SessionManager::from_session_type_with_codec`]
    pub fn from_session_type<K: Codec>(
        root: impl AsRef<Path>,
        session_type: &str,
        num_kept: i64,
        channel: &CollectiveChannel<K>,
        clock: &dyn Clock,
    ) -> Result<Self> {
        Self::from_session_type_with_codec(root, session_type, BincodeCodec, num_kept, channel, clock)
    }

    /// Reopen an existing session; see [`SessionManager::from_restore_path_with_codec`]
    pub fn from_restore_path(path: impl AsRef<Path>, num_kept: i64) -> Result<Self> {
        Self::from_restore_path_with_codec(path, BincodeCodec, num_kept)
    }

    /// Start a new session from configuration
    pub fn from_config<K: Codec>(
        config: &CheckpointConfig,
        channel: &CollectiveChannel<K>,
        clock: &dyn Clock,
    ) -> Result<Self> {
        Self::from_session_type(
            &config.root,
            &config.session_type,
            config.num_kept,
            channel,
            clock,
        )
    }
}

impl<C: Codec> SessionManager<C> {
    pub fn new(
        root: impl AsRef<Path>,
        session_type: &str,
        session_time: &str,
        codec: C,
        num_kept: i64,
    ) -> Result<Self> {
        validate_segment("session type", session_type)?;
        validate_segment("session time", session_time)?;

        let root = root.as_ref().to_path_buf();
        let session_dir = root.join(session_type).join(session_time);
        Ok(Self {
            ledger: CheckpointLedger::with_codec(session_dir, codec, num_kept),
            root,
            session_type: session_type.to_string(),
            session_time: session_time.to_string(),
            restore_step: Mutex::new(None),
        })
    }

    /// Start a new session stamped with rank 0's current time.
    ///
    /// Collective: every rank must call this.
    pub fn from_session_type_with_codec<K: Codec>(
        root: impl AsRef<Path>,
        session_type: &str,
        codec: C,
        num_kept: i64,
        channel: &CollectiveChannel<K>,
        clock: &dyn Clock,
    ) -> Result<Self> {
        validate_segment("session type", session_type)?;
        let session_time = channel.broadcast(clock.now(SESSION_TIME_FORMAT), 0)?;
        let session = Self::new(root, session_type, &session_time, codec, num_kept)?;

        info!(
            session = %session.current_session_path().display(),
            "Starting new session"
        );
        Ok(session)
    }

    /// Reopen the session a restore path points into.
    ///
    /// The path may name an artifact, a session directory, or a session type
    /// directory; in the last case the most recent session holding a
    /// checkpoint is used. The first [`SessionManager::load`] without an
    /// explicit step returns the discovered checkpoint.
    pub fn from_restore_path_with_codec(
        path: impl AsRef<Path>,
        codec: C,
        num_kept: i64,
    ) -> Result<Self> {
        let point = resolve_restore_path(path.as_ref(), codec.extension())?;
        let session = Self::new(
            &point.root,
            &point.session_type,
            &point.session_time,
            codec,
            num_kept,
        )?;
        *session.restore_step.lock() = Some(point.step);

        info!(
            session = %session.current_session_path().display(),
            step = point.step,
            "Restoring session"
        );
        Ok(session)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn session_type(&self) -> &str {
        &self.session_type
    }

    pub fn session_time(&self) -> &str {
        &self.session_time
    }

    /// `<root>/<session_type>/<session_time>`
    pub fn current_session_path(&self) -> &Path {
        self.ledger.session_dir()
    }

    pub fn ledger(&self) -> &CheckpointLedger<C> {
        &self.ledger
    }

    /// Step discovered by a restore path and not yet consumed by a load
    pub fn restore_step(&self) -> Option<Step> {
        *self.restore_step.lock()
    }

    /// Create the session directory on each node's local master, then wait
    /// for every rank.
    pub fn make_session_path<K: Codec>(&self, channel: &CollectiveChannel<K>) -> Result<PathBuf> {
        let path = self.current_session_path().to_path_buf();
        if channel.context().is_local_master() {
            std::fs::create_dir_all(&path).map_err(|e| Error::Storage {
                message: format!("Failed to create session directory {:?}: {}", path, e),
            })?;
            debug!(path = %path.display(), "Created session directory");
        }
        channel.barrier()?;
        Ok(path)
    }

    /// Per-rank log file path stamped with rank 0's current time.
    ///
    /// Collective: every rank must call this.
    pub fn log_path<K: Codec>(
        &self,
        name: &str,
        channel: &CollectiveChannel<K>,
        clock: &dyn Clock,
    ) -> Result<PathBuf> {
        let log_time = channel.broadcast(clock.now(SESSION_TIME_FORMAT), 0)?;
        let file_name = if channel.context().is_distributed() {
            format!("{}_{}_{}.log", name, channel.context().rank()?, log_time)
        } else {
            format!("{}_{}.log", name, log_time)
        };
        Ok(self.current_session_path().join(file_name))
    }

    /// Directory for summary event files
    pub fn summary_path(&self) -> PathBuf {
        self.current_session_path().join(SUMMARY_DIR)
    }

    /// Save a checkpoint into this session
    pub async fn save<T: Serialize + ?Sized>(&self, blob: &T, step: Step) -> Result<()> {
        self.ledger.save(blob, step).await
    }

    /// Load a checkpoint from this session.
    ///
    /// Without an explicit step, a pending restore step is used (once), and
    /// after that the newest checkpoint.
    pub async fn load<T: DeserializeOwned>(&self, step: Option<Step>) -> Result<T> {
        let step = match step {
            Some(step) => Some(step),
            None => self.restore_step.lock().take(),
        };
        self.ledger.load(step).await
    }
}

fn validate_segment(what: &str, value: &str) -> Result<()> {
    if value.is_empty() || value == "." || value == ".." || value.contains(['/', '\\']) {
        return Err(Error::InvalidConfig {
            message: format!("{} must be a single path segment, got {:?}", what, value),
        });
    }
    Ok(())
}
