//! Runtime configuration types

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::{Error, Result};

/// Main runtime configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Process group settings
    pub group: GroupConfig,

    /// Metric store settings
    pub metrics: MetricsConfig,

    /// Checkpoint settings
    pub checkpoint: CheckpointConfig,
}

impl RuntimeConfig {
    /// Parse a configuration from JSON, filling missing fields with defaults
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Read a JSON configuration file
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let config = Self::from_json_str(&content)?;
        debug!(path = %path.display(), "Loaded runtime configuration");
        Ok(config)
    }

    /// Check cross-field constraints
    pub fn validate(&self) -> Result<()> {
        if self.metrics.default_window == 0 {
            return Err(Error::InvalidConfig {
                message: "metrics.default_window must be at least 1".to_string(),
            });
        }

        let session_type = &self.checkpoint.session_type;
        if session_type.is_empty() || session_type.contains(['/', '\\']) {
            return Err(Error::InvalidConfig {
                message: format!(
                    "checkpoint.session_type must be a single path segment, got {:?}",
                    session_type
                ),
            });
        }

        Ok(())
    }
}

/// Process group configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GroupConfig {
    /// Run as a real multi-rank group; when false every collective is a no-op
    pub enabled: bool,

    /// Explicit local rank, overriding `LOCAL_RANK`
    pub local_rank: Option<usize>,

    /// Name of the collective backend
    pub backend: String,
}

impl Default for GroupConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            local_rank: None,
            backend: "local".to_string(),
        }
    }
}

/// Metric store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Number of steps retained per metric when no window is given
    pub default_window: usize,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { default_window: 1 }
    }
}

/// Checkpoint configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointConfig {
    /// Root directory holding `<session_type>/<session_time>/` trees
    pub root: PathBuf,

    /// Session type, e.g. "train" or "finetune"
    pub session_type: String,

    /// Number of checkpoints to keep (zero or negative keeps everything)
    pub num_kept: i64,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("./sessions"),
            session_type: "train".to_string(),
            num_kept: 20,
        }
    }
}
