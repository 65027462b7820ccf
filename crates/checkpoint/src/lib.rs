//! Checkpoint - rotating checkpoint ledger and session management
//!
//! Provides:
//! - Locked, crash-safe `checkpoints.json` ledger with bounded retention
//! - Session directories shared by every rank of a run
//! - Restore path discovery

pub mod discovery;
pub mod ledger;
pub mod lock;
pub mod session;

pub use discovery::{resolve_restore_path, RestorePoint};
pub use ledger::{CheckpointLedger, LedgerLog, LEDGER_FILE, LOCK_FILE};
pub use lock::LedgerLock;
pub use session::{SessionManager, SUMMARY_DIR};
