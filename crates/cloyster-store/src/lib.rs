//! State directory and run log persistence for Cloyster.
//!
//! This crate provides the storage layer: `StateLayout` for the state
//! directory structure (run logs, run lock) and `RunLogStore`, which persists
//! one `RunLog` per orchestrator invocation. Every append rewrites the log
//! atomically so a crash never leaves a step applied but unrecorded.

pub mod layout;
pub mod runlog;

pub use layout::{is_valid_run_id, StateLayout};
pub use runlog::{AbortCause, InFlight, LogEntry, RunLog, RunLogStore, RunStatus, StepFailure};

use std::path::Path;
use thiserror::Error;

/// Fsync a directory so that a preceding `rename()` is durable.
pub(crate) fn fsync_dir(dir: &Path) -> Result<(), std::io::Error> {
    let f = std::fs::File::open(dir)?;
    f.sync_all()
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("state I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("run not found: {0}")]
    RunNotFound(String),
    #[error("invalid run id '{0}': expected YYYYMMDDHHMMSSmmm-xxxxxxxx")]
    InvalidRunId(String),
    #[error("no runs recorded in {0}")]
    NoRuns(String),
}
