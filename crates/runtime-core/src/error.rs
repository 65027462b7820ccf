//! Error types for lockstep training ranks

use thiserror::Error;

/// Result type alias using the runtime Error
pub type Result<T> = std::result::Result<T, Error>;

/// Coarse classification of an [`Error`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Misuse of the API; a bug in the caller
    Programmer,

    /// Steps submitted out of order
    Ordering,

    /// A requested metric step, checkpoint or path does not exist
    NotFound,

    /// The collective transport failed; group membership is lost
    Collective,

    /// Filesystem, lock or serialization failure
    Storage,

    /// Invariant broken inside this crate
    Internal,
}

/// Core error type for lockstep training ranks
#[derive(Error, Debug)]
pub enum Error {
    // Process group errors
    #[error("Process group is already activated")]
    AlreadyActivated,

    #[error("Process group is not activated (while calling {operation})")]
    NotActivated { operation: String },

    #[error("Distributed mode is not enabled (while calling {operation})")]
    NotEnabled { operation: String },

    #[error("Communication group {group} is not registered")]
    UnregisteredGroup { group: u64 },

    #[error("Unknown source rank {source_rank} (current rank {rank})")]
    RankMismatch { source_rank: usize, rank: usize },

    // Metric errors
    #[error("Different storage settings were found for metric {name}: {detail}")]
    ConfigConflict { name: String, detail: String },

    #[error("Metric {name} requires count to be supplied consistently")]
    InconsistentCount { name: String },

    #[error("Cannot record step {step} for metric {name}: last recorded step is {last}")]
    OutOfOrderStep { name: String, step: u64, last: u64 },

    #[error("Step {step} of metric {name} not found")]
    StepNotFound { name: String, step: String },

    #[error("Metric not found: {name}")]
    MetricNotFound { name: String },

    // Numeric errors
    #[error("Unsupported value type: {kind}")]
    UnsupportedType { kind: String },

    #[error("Shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("Integer overflow in {context}")]
    NumericOverflow { context: String },

    // Checkpoint errors
    #[error("Checkpoint not found: {path}")]
    CheckpointNotFound { path: String },

    #[error("Invalid restore path {path}: {reason}")]
    InvalidRestorePath { path: String, reason: String },

    #[error("Failed to lock {path}: {message}")]
    LockFailed { path: String, message: String },

    // Storage errors
    #[error("Storage error: {message}")]
    Storage { message: String },

    #[error("Storage path not found: {path}")]
    StoragePathNotFound { path: String },

    // Collective errors
    #[error("Collective {operation} failed: {message}")]
    Collective { operation: String, message: String },

    // Configuration errors
    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    // Internal errors
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl Error {
    /// Classify this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::AlreadyActivated
            | Error::NotActivated { .. }
            | Error::NotEnabled { .. }
            | Error::UnregisteredGroup { .. }
            | Error::RankMismatch { .. }
            | Error::ConfigConflict { .. }
            | Error::InconsistentCount { .. }
            | Error::UnsupportedType { .. }
            | Error::ShapeMismatch { .. }
            | Error::NumericOverflow { .. }
            | Error::InvalidRestorePath { .. }
            | Error::InvalidConfig { .. } => ErrorKind::Programmer,

            Error::OutOfOrderStep { .. } => ErrorKind::Ordering,

            Error::StepNotFound { .. }
            | Error::MetricNotFound { .. }
            | Error::CheckpointNotFound { .. }
            | Error::StoragePathNotFound { .. } => ErrorKind::NotFound,

            Error::Collective { .. } => ErrorKind::Collective,

            Error::LockFailed { .. }
            | Error::Storage { .. }
            | Error::Io(_)
            | Error::Serialization(_) => ErrorKind::Storage,

            Error::Internal { .. } => ErrorKind::Internal,
        }
    }

    /// Returns true if the caller may reasonably recover, e.g. by training from scratch
    pub fn is_recoverable(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }

    /// Returns true if this error indicates a fatal condition
    pub fn is_fatal(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Programmer | ErrorKind::Ordering | ErrorKind::Collective | ErrorKind::Internal
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_recoverable() {
        let err = Error::CheckpointNotFound {
            path: "model_3.bin".to_string(),
        };
        assert!(err.is_recoverable());
        assert!(!err.is_fatal());

        let err = Error::OutOfOrderStep {
            name: "loss".to_string(),
            step: 1,
            last: 2,
        };
        assert!(!err.is_recoverable());
        assert_eq!(err.kind(), ErrorKind::Ordering);
    }

    #[test]
    fn test_error_fatal() {
        assert!(Error::AlreadyActivated.is_fatal());

        let err = Error::Collective {
            operation: "barrier".to_string(),
            message: "peer vanished".to_string(),
        };
        assert!(err.is_fatal());

        let err = Error::Storage {
            message: "disk full".to_string(),
        };
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_error_message_carries_context() {
        let err = Error::StepNotFound {
            name: "train/loss".to_string(),
            step: "7".to_string(),
        };
        let message = err.to_string();
        assert!(message.contains("train/loss"));
        assert!(message.contains('7'));
    }
}
