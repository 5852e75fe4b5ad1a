//! Run planning and orchestration for Cloyster.
//!
//! This crate ties together plan parsing, run log persistence and the host
//! backends into the `Orchestrator`: it orders steps with the `StepRegistry`,
//! applies them one by one with retry on transient bus failures, and unwinds
//! everything it applied, in reverse, when a step fails or the operator
//! interrupts the run. A file lock keeps runs on one host strictly serial.

pub mod concurrency;
pub mod executor;
pub mod journal;
pub mod orchestrator;
pub mod registry;
pub mod retry;

pub use concurrency::{install_signal_handler, CancelToken, RunLock};
pub use executor::{StepExecutor, StepPreview};
pub use journal::RunJournal;
pub use orchestrator::{Orchestrator, RunOptions, RunReport};
pub use registry::{RunPlan, Step, StepRegistry};
pub use retry::RetryPolicy;

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("plan error: {0}")]
    Plan(#[from] cloyster_schema::PlanError),
    #[error("store error: {0}")]
    Store(#[from] cloyster_store::StoreError),
    #[error("host error: {0}")]
    Host(#[from] cloyster_host::HostError),
    #[error("plan error: duplicate step '{0}'")]
    DuplicateStep(String),
    #[error("plan error: steps '{first}' and '{second}' both mount {}", target.display())]
    DuplicateMountTarget {
        first: String,
        second: String,
        target: PathBuf,
    },
    #[error("plan error: step '{step}' depends on unknown step '{dependency}'")]
    UnknownDependency { step: String, dependency: String },
    #[error("plan error: dependency cycle among steps: {}", .0.join(", "))]
    Cycle(Vec<String>),
    #[error("plan error: cannot skip unknown step '{0}'")]
    UnknownStep(String),
    #[error("run lock: another run holds {}", .0.display())]
    RunLocked(PathBuf),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CoreError {
    /// Errors caught before anything on the host was touched.
    pub fn is_planning(&self) -> bool {
        matches!(
            self,
            CoreError::Plan(_)
                | CoreError::DuplicateStep(_)
                | CoreError::DuplicateMountTarget { .. }
                | CoreError::UnknownDependency { .. }
                | CoreError::Cycle(_)
                | CoreError::UnknownStep(_)
        )
    }
}
