use crate::layout::StateLayout;
use crate::StoreError;
use cloyster_schema::{Change, Failure, StepAction, StepResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::io::Write;
use tempfile::NamedTempFile;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AbortCause {
    /// A step failed.
    Failure,
    /// The operator interrupted the run.
    Cancelled,
    /// The run was unwound by an explicit rollback invocation.
    Operator,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    NotStarted,
    Running,
    Completed,
    Aborted(AbortCause),
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunStatus::NotStarted => write!(f, "not started"),
            RunStatus::Running => write!(f, "running"),
            RunStatus::Completed => write!(f, "completed"),
            RunStatus::Aborted(AbortCause::Failure) => write!(f, "aborted (failure)"),
            RunStatus::Aborted(AbortCause::Cancelled) => write!(f, "aborted (cancelled)"),
            RunStatus::Aborted(AbortCause::Operator) => write!(f, "aborted (rolled back)"),
        }
    }
}

/// A step whose action has started but whose result is not yet recorded.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InFlight {
    pub step: String,
    pub action: StepAction,
    pub since: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StepFailure {
    pub step: String,
    pub failure: Failure,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LogEntry {
    pub step: String,
    pub result: StepResult,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<StepAction>,
    pub at: String,
}

/// Persisted record of one orchestrator invocation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunLog {
    pub run_id: String,
    pub started_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<String>,
    pub status: RunStatus,
    /// Step ids in plan order.
    pub plan: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_flight: Option<InFlight>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<StepFailure>,
    #[serde(default)]
    pub entries: Vec<LogEntry>,
}

impl RunLog {
    pub fn new(run_id: &str, plan: Vec<String>) -> Self {
        Self {
            run_id: run_id.to_owned(),
            started_at: chrono::Utc::now().to_rfc3339(),
            finished_at: None,
            status: RunStatus::NotStarted,
            plan,
            in_flight: None,
            failure: None,
            entries: Vec::new(),
        }
    }

    /// Append a result. Clears the in-flight marker if it names the same step.
    pub fn push(&mut self, step: &str, result: StepResult, action: Option<StepAction>) {
        if self.in_flight.as_ref().is_some_and(|f| f.step == step) {
            self.in_flight = None;
        }
        self.entries.push(LogEntry {
            step: step.to_owned(),
            result,
            action,
            at: chrono::Utc::now().to_rfc3339(),
        });
    }

    pub fn last_result(&self, step: &str) -> Option<&StepResult> {
        self.entries
            .iter()
            .rev()
            .find(|e| e.step == step)
            .map(|e| &e.result)
    }

    /// Applied entries that have not been rolled back yet, in the order they
    /// were applied. A step whose last rollback failed is still outstanding.
    pub fn outstanding(&self) -> Vec<(&LogEntry, &Change)> {
        self.entries
            .iter()
            .filter_map(|entry| match &entry.result {
                StepResult::Applied(change) => Some((entry, change)),
                _ => None,
            })
            .filter(|(entry, _)| {
                matches!(
                    self.last_result(&entry.step),
                    Some(StepResult::Applied(_) | StepResult::RollbackFailed(_))
                )
            })
            .collect()
    }

    /// Compact `step:Result` rendering of the entries, in order.
    pub fn trail(&self) -> Vec<String> {
        self.entries
            .iter()
            .map(|e| format!("{}:{}", e.step, e.result))
            .collect()
    }
}

/// Persists run logs under `<state>/runs`.
///
/// The orchestrator creates a log before its first step and saves it after
/// every state change; each save replaces the file atomically.
pub struct RunLogStore {
    layout: StateLayout,
}

impl RunLogStore {
    pub fn new(layout: &StateLayout) -> Self {
        Self {
            layout: layout.clone(),
        }
    }

    pub fn initialize(&self) -> Result<(), StoreError> {
        self.layout.initialize()
    }

    /// Create and persist a fresh run log for the given plan order.
    pub fn create(&self, plan: Vec<String>) -> Result<RunLog, StoreError> {
        let now = chrono::Utc::now();
        let seed = format!("{}:{}:{}", now.to_rfc3339(), std::process::id(), plan.join(","));
        let run_id = format!(
            "{}-{}",
            now.format("%Y%m%d%H%M%S%3f"),
            &blake3::hash(seed.as_bytes()).to_hex()[..8]
        );
        let log = RunLog::new(&run_id, plan);
        self.save(&log)?;
        debug!("run log created: {run_id}");
        Ok(log)
    }

    pub fn save(&self, log: &RunLog) -> Result<(), StoreError> {
        let runs_dir = self.layout.runs_dir();
        fs::create_dir_all(&runs_dir)?;
        let content = serde_json::to_string_pretty(log)?;
        let mut tmp = NamedTempFile::new_in(&runs_dir)?;
        tmp.write_all(content.as_bytes())?;
        tmp.as_file().sync_all()?;
        tmp.persist(self.layout.run_path(&log.run_id))
            .map_err(|e| StoreError::Io(e.error))?;
        crate::fsync_dir(&runs_dir)?;
        Ok(())
    }

    pub fn load(&self, run_id: &str) -> Result<RunLog, StoreError> {
        if !crate::is_valid_run_id(run_id) {
            return Err(StoreError::InvalidRunId(run_id.to_owned()));
        }
        let path = self.layout.run_path(run_id);
        if !path.exists() {
            return Err(StoreError::RunNotFound(run_id.to_owned()));
        }
        let content = fs::read_to_string(&path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// All readable run logs, oldest first. Unreadable files are skipped
    /// with a warning and left in place for inspection.
    pub fn list(&self) -> Result<Vec<RunLog>, StoreError> {
        let runs_dir = self.layout.runs_dir();
        if !runs_dir.exists() {
            return Ok(Vec::new());
        }
        let mut logs = Vec::new();
        for dir_entry in fs::read_dir(&runs_dir)? {
            let path = dir_entry?.path();
            if !path.extension().is_some_and(|e| e == "json") {
                continue;
            }
            match fs::read_to_string(&path) {
                Ok(content) => match serde_json::from_str::<RunLog>(&content) {
                    Ok(log) => logs.push(log),
                    Err(e) => warn!("corrupt run log {}: {e}", path.display()),
                },
                Err(e) => warn!("unreadable run log {}: {e}", path.display()),
            }
        }
        logs.sort_by(|a, b| {
            a.started_at
                .cmp(&b.started_at)
                .then_with(|| a.run_id.cmp(&b.run_id))
        });
        Ok(logs)
    }

    pub fn latest(&self) -> Result<RunLog, StoreError> {
        self.list()?
            .pop()
            .ok_or_else(|| StoreError::NoRuns(self.layout.root().display().to_string()))
    }
}
