pub mod completions;
pub mod doctor;
pub mod log;
pub mod man_pages;
pub mod plan;
pub mod rollback;
pub mod run;

use cloyster_core::{CancelToken, Orchestrator, RetryPolicy, StepRegistry};
use cloyster_host::{select_backend, HostBackends};
use cloyster_schema::{parse_plan_file, Settings};
use cloyster_store::{AbortCause, RunStatus, StateLayout};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

pub const EXIT_SUCCESS: u8 = 0;
pub const EXIT_FAILURE: u8 = 1;
pub const EXIT_PLAN_ERROR: u8 = 2;
pub const EXIT_RUN_LOCKED: u8 = 3;
pub const EXIT_ABORTED: u8 = 4;
pub const EXIT_CANCELLED: u8 = 5;

/// Settings and paths shared by every command that touches the host.
pub struct Context {
    pub settings: Settings,
    pub state_dir: PathBuf,
    pub json: bool,
}

impl Context {
    pub fn load(config: &Path, state_dir: Option<&Path>, json: bool) -> Result<Self, String> {
        let settings =
            Settings::load_or_default(config).map_err(|e| format!("config error: {e}"))?;
        let state_dir = settings.resolve_state_dir(state_dir);
        debug!(
            "settings from {}, state in {}, backend {}",
            config.display(),
            state_dir.display(),
            settings.backend
        );
        Ok(Self {
            settings,
            state_dir,
            json,
        })
    }

    pub fn layout(&self) -> StateLayout {
        StateLayout::new(&self.state_dir)
    }

    pub fn backends(&self) -> Result<HostBackends, String> {
        select_backend(&self.settings.backend, &self.settings)
            .map_err(|e| format!("config error: {e}"))
    }

    pub fn orchestrator(&self) -> Result<Orchestrator, String> {
        let backends = self.backends()?;
        Ok(Orchestrator::new(
            self.layout(),
            &backends,
            RetryPolicy::from_settings(&self.settings.retry),
        )
        .with_cancel_token(CancelToken::from_signals()))
    }
}

pub fn load_registry(plan: &Path) -> Result<StepRegistry, String> {
    let file = parse_plan_file(plan).map_err(|e| format!("plan error: {e}"))?;
    StepRegistry::from_plan_file(&file).map_err(|e| e.to_string())
}

/// Exit code for an error message, keyed on its prefix.
pub fn error_exit_code(msg: &str) -> u8 {
    if msg.starts_with("plan error:") || msg.starts_with("config error:") {
        EXIT_PLAN_ERROR
    } else if msg.starts_with("run lock:") {
        EXIT_RUN_LOCKED
    } else {
        EXIT_FAILURE
    }
}

/// Exit code for the final status of a run.
pub fn status_exit_code(status: RunStatus) -> u8 {
    match status {
        RunStatus::Completed | RunStatus::Aborted(AbortCause::Operator) => EXIT_SUCCESS,
        RunStatus::Aborted(AbortCause::Failure) => EXIT_ABORTED,
        RunStatus::Aborted(AbortCause::Cancelled) => EXIT_CANCELLED,
        RunStatus::NotStarted | RunStatus::Running => EXIT_FAILURE,
    }
}

pub fn json_pretty(value: &impl serde::Serialize) -> Result<String, String> {
    serde_json::to_string_pretty(value).map_err(|e| format!("JSON serialization failed: {e}"))
}

pub fn spinner(msg: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::with_template("{spinner:.cyan} {msg}") {
        pb.set_style(style.tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]));
    }
    pb.set_message(msg.to_owned());
    pb.enable_steady_tick(Duration::from_millis(80));
    pb
}

pub fn spin_ok(pb: &ProgressBar, msg: &str) {
    finish(pb, &format!("✓ {msg}"));
}

pub fn spin_fail(pb: &ProgressBar, msg: &str) {
    finish(pb, &format!("✗ {msg}"));
}

fn finish(pb: &ProgressBar, msg: &str) {
    if let Ok(style) = ProgressStyle::with_template("{msg}") {
        pb.set_style(style);
    }
    pb.finish_with_message(msg.to_owned());
}

pub fn colorize_status(status: RunStatus) -> String {
    use console::Style;
    let text = status.to_string();
    match status {
        RunStatus::Completed => Style::new().green().apply_to(text).to_string(),
        RunStatus::Running => Style::new().cyan().bold().apply_to(text).to_string(),
        RunStatus::Aborted(AbortCause::Failure) => Style::new().red().apply_to(text).to_string(),
        RunStatus::Aborted(_) => Style::new().yellow().apply_to(text).to_string(),
        RunStatus::NotStarted => Style::new().dim().apply_to(text).to_string(),
    }
}
