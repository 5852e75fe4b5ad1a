use crate::registry::Step;
use crate::retry::RetryPolicy;
use cloyster_host::{HostBackends, HostError, MountManager, MountStatus, ServiceController};
use cloyster_schema::{Change, ServiceUnit, StepAction, UnitOp};
use serde::Serialize;
use std::fmt;
use tracing::warn;

/// What applying a step would do, as far as the host can tell right now.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PreviewOutcome {
    WouldMount,
    AlreadyMounted,
    Conflict { observed: String },
    WouldIssue { ops: Vec<UnitOp>, daemon_reload: bool },
    InDesiredState,
    Skipped,
    Unknown { error: String },
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct StepPreview {
    pub step: String,
    pub action: StepAction,
    #[serde(flatten)]
    pub outcome: PreviewOutcome,
}

impl StepPreview {
    pub fn skipped(step: &Step) -> Self {
        Self {
            step: step.id.clone(),
            action: step.action.clone(),
            outcome: PreviewOutcome::Skipped,
        }
    }

    /// Whether applying the step would fail for certain.
    pub fn is_blocking(&self) -> bool {
        matches!(self.outcome, PreviewOutcome::Conflict { .. })
    }
}

impl fmt::Display for StepPreview {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: ", self.step)?;
        match (&self.outcome, &self.action) {
            (PreviewOutcome::WouldMount, StepAction::Mount(spec)) => {
                write!(f, "would mount {spec}")
            }
            (PreviewOutcome::AlreadyMounted, StepAction::Mount(spec)) => {
                write!(f, "{} already mounted", spec.target.display())
            }
            (PreviewOutcome::Conflict { observed }, StepAction::Mount(spec)) => write!(
                f,
                "conflict: {} already holds {observed}",
                spec.target.display()
            ),
            (PreviewOutcome::WouldIssue { ops, daemon_reload }, StepAction::Service(unit)) => {
                let mut parts: Vec<String> = Vec::new();
                if *daemon_reload {
                    parts.push("daemon-reload".to_owned());
                }
                parts.extend(ops.iter().map(ToString::to_string));
                write!(f, "would {} {}", parts.join(", "), unit.unit_name())
            }
            (PreviewOutcome::InDesiredState, StepAction::Service(unit)) => {
                write!(f, "{} already in desired state", unit.unit_name())
            }
            (PreviewOutcome::Skipped, action) => write!(f, "skipped ({action})"),
            (PreviewOutcome::Unknown { error }, _) => write!(f, "cannot determine: {error}"),
            (_, action) => write!(f, "{action}"),
        }
    }
}

/// Runs step actions against the host backends, retrying transient failures.
pub struct StepExecutor {
    mounts: MountManager,
    services: ServiceController,
    retry: RetryPolicy,
}

impl StepExecutor {
    pub fn new(backends: &HostBackends, retry: RetryPolicy) -> Self {
        Self {
            mounts: backends.mount_manager(),
            services: backends.service_controller(),
            retry,
        }
    }

    pub fn apply(&self, step: &str, action: &StepAction) -> Result<Change, HostError> {
        match action {
            StepAction::Mount(spec) => self.with_retry(step, || self.mounts.mount(spec)),
            StepAction::Service(unit) => self.reconcile(step, unit),
        }
    }

    /// Reconcile with retries. An attempt that lost the reply to an op may
    /// still have changed the unit, and the next attempt no longer sees that
    /// op in its delta, so lost ops are folded into the recorded change.
    fn reconcile(&self, step: &str, unit: &ServiceUnit) -> Result<Change, HostError> {
        let mut uncertain = Vec::new();
        let result = self.with_retry(step, || {
            self.services.reconcile_tracked(unit, &mut uncertain)
        });
        match result {
            Ok(Change::Service { ops }) => Ok(Change::Service {
                ops: merge_ops(ops, &uncertain),
            }),
            Ok(other) => Ok(other),
            Err(e) => {
                if !uncertain.is_empty() {
                    if let Err(revert_err) = self.services.revert(unit, &uncertain) {
                        warn!(
                            "{step}: could not undo {} after lost replies: {revert_err}",
                            unit.unit_name()
                        );
                    }
                }
                Err(e)
            }
        }
    }

    /// Undo exactly what `change` says apply did.
    pub fn rollback(
        &self,
        step: &str,
        action: &StepAction,
        change: &Change,
    ) -> Result<(), HostError> {
        if change.is_noop() {
            return Ok(());
        }
        self.with_retry(step, || match (action, change) {
            (StepAction::Mount(spec), change) => self.mounts.revert(spec, change),
            (StepAction::Service(unit), Change::Service { ops }) => {
                self.services.revert(unit, ops)
            }
            (StepAction::Service(unit), Change::Mount { .. }) => Err(HostError::Backend(format!(
                "recorded change for {} is not a service change",
                unit.unit_name()
            ))),
        })
    }

    /// The largest change applying `action` could have made. Used for steps
    /// that were interrupted before their outcome was recorded.
    pub fn assumed_change(action: &StepAction) -> Change {
        match action {
            StepAction::Mount(_) => Change::Mount { mounted: true },
            StepAction::Service(unit) => Change::Service {
                ops: desired_ops(unit),
            },
        }
    }

    /// Read-only look at what [`apply`](Self::apply) would do.
    pub fn preview(&self, step: &Step) -> StepPreview {
        let outcome = match &step.action {
            StepAction::Mount(spec) => match self.mounts.inspect(spec) {
                Ok(MountStatus::Absent) => PreviewOutcome::WouldMount,
                Ok(MountStatus::Matching) => PreviewOutcome::AlreadyMounted,
                Ok(MountStatus::Conflicting(observed)) => PreviewOutcome::Conflict {
                    observed: observed.to_string(),
                },
                Err(e) => PreviewOutcome::Unknown {
                    error: e.to_string(),
                },
            },
            StepAction::Service(unit) => match self.services.diff(unit) {
                Ok(ops) if ops.is_empty() && !unit.daemon_reload => PreviewOutcome::InDesiredState,
                Ok(ops) => PreviewOutcome::WouldIssue {
                    ops,
                    daemon_reload: unit.daemon_reload,
                },
                Err(e) => PreviewOutcome::Unknown {
                    error: e.to_string(),
                },
            },
        };
        StepPreview {
            step: step.id.clone(),
            action: step.action.clone(),
            outcome,
        }
    }

    fn with_retry<T>(
        &self,
        step: &str,
        mut op: impl FnMut() -> Result<T, HostError>,
    ) -> Result<T, HostError> {
        let mut attempt = 1;
        loop {
            match op() {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && self.retry.allows(attempt) => {
                    let delay = self.retry.backoff(attempt);
                    warn!(
                        "{step}: {e}; retrying in {}ms (attempt {}/{})",
                        delay.as_millis(),
                        attempt + 1,
                        self.retry.max_attempts
                    );
                    std::thread::sleep(delay);
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

fn merge_ops(mut ops: Vec<UnitOp>, uncertain: &[UnitOp]) -> Vec<UnitOp> {
    for op in uncertain {
        if !ops.contains(op) {
            ops.push(*op);
        }
    }
    ops.sort_by_key(|op| op.rank());
    ops
}

fn desired_ops(unit: &ServiceUnit) -> Vec<UnitOp> {
    let mut ops = Vec::new();
    if unit.enabled == Some(true) {
        ops.push(UnitOp::Enable);
    }
    match unit.active {
        Some(true) => ops.push(UnitOp::Start),
        Some(false) => ops.push(UnitOp::Stop),
        None => {}
    }
    if unit.enabled == Some(false) {
        ops.push(UnitOp::Disable);
    }
    ops
}
