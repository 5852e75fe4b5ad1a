//! Plan files, step actions, outcomes, and settings for Cloyster.
//!
//! This crate defines the schema layer: the TOML plan file (`PlanFile`) that
//! lists the configuration steps for a head node, the typed step actions
//! (`MountSpec`, `ServiceUnit`), the outcome types recorded for every step
//! (`StepResult`, `Change`, `Failure`), and the orchestrator `Settings` file.

pub mod action;
pub mod outcome;
pub mod plan;
pub mod settings;

pub use action::{normalize_unit_name, MountSpec, Refresh, ServiceUnit, StepAction};
pub use outcome::{Change, Failure, FailureKind, StepResult, UnitOp};
pub use plan::{parse_plan_file, parse_plan_str, PlanError, PlanFile, StepSpec, PLAN_VERSION};
pub use settings::{
    BusSettings, RetrySettings, Settings, SettingsError, DEFAULT_SETTINGS_PATH, DEFAULT_STATE_DIR,
};
