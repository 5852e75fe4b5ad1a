use crate::concurrency::{CancelToken, RunLock};
use crate::executor::{StepExecutor, StepPreview};
use crate::journal::RunJournal;
use crate::registry::{RunPlan, Step, StepRegistry};
use crate::retry::RetryPolicy;
use crate::CoreError;
use cloyster_host::HostBackends;
use cloyster_schema::{Change, Failure, FailureKind, StepAction, StepResult};
use cloyster_store::{AbortCause, RunLog, RunLogStore, RunStatus, StateLayout};
use serde::Serialize;
use std::collections::BTreeSet;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Steps recorded as Skipped and treated as satisfied.
    pub skip: BTreeSet<String>,
}

impl RunOptions {
    pub fn with_skipped(mut self, ids: &[&str]) -> Self {
        self.skip.extend(ids.iter().map(|s| (*s).to_owned()));
        self
    }
}

/// Outcome of a run or a rollback, as shown to the operator.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct RunReport {
    pub run_id: String,
    pub status: RunStatus,
    pub failed_step: Option<String>,
    pub failure: Option<Failure>,
    /// False if any rollback in this invocation failed.
    pub rollback_clean: bool,
    pub trail: Vec<String>,
}

impl RunReport {
    fn from_log(log: &RunLog, rollback_clean: bool) -> Self {
        Self {
            run_id: log.run_id.clone(),
            status: log.status,
            failed_step: log.failure.as_ref().map(|f| f.step.clone()),
            failure: log.failure.as_ref().map(|f| f.failure.clone()),
            rollback_clean,
            trail: log.trail(),
        }
    }
}

/// Drives a plan against the host and unwinds it on failure.
///
/// Steps run strictly in plan order on the calling thread. After the first
/// failed step, or once cancellation is observed at a step boundary, no
/// further step is attempted; every step applied so far is rolled back in
/// reverse order and the run ends `Aborted`.
pub struct Orchestrator {
    layout: StateLayout,
    executor: StepExecutor,
    cancel: CancelToken,
}

impl Orchestrator {
    pub fn new(layout: StateLayout, backends: &HostBackends, retry: RetryPolicy) -> Self {
        Self {
            layout,
            executor: StepExecutor::new(backends, retry),
            cancel: CancelToken::new(),
        }
    }

    #[must_use]
    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn layout(&self) -> &StateLayout {
        &self.layout
    }

    pub fn run(
        &self,
        registry: &StepRegistry,
        options: &RunOptions,
    ) -> Result<RunReport, CoreError> {
        let plan = self.checked_plan(registry, options)?;
        let _lock = RunLock::acquire(&self.layout.lock_file())?;

        let store = RunLogStore::new(&self.layout);
        store.initialize()?;
        let mut journal = RunJournal::begin(store, plan.ids())?;
        info!("run {} started: {} steps", journal.run_id(), plan.len());

        let total = plan.len();
        let mut applied: Vec<(&Step, Change)> = Vec::new();
        let mut failed: Option<(&Step, Failure)> = None;
        let mut cause = None;

        for (n, step) in plan.steps().iter().enumerate() {
            if self.cancel.is_cancelled() {
                warn!("cancellation requested; not starting '{}'", step.id);
                cause = Some(AbortCause::Cancelled);
                break;
            }
            if options.skip.contains(&step.id) {
                info!("[{}/{total}] {}: skipped", n + 1, step.id);
                journal.record(&step.id, StepResult::Skipped, None)?;
                continue;
            }

            info!("[{}/{total}] {}: {}", n + 1, step.id, step.action);
            journal.mark_in_flight(step)?;
            match self.executor.apply(&step.id, &step.action) {
                Ok(change) => {
                    info!("{}: {change}", step.id);
                    journal.record(
                        &step.id,
                        StepResult::Applied(change.clone()),
                        Some(&step.action),
                    )?;
                    applied.push((step, change));
                }
                Err(e) => {
                    error!("{} failed: {e}", step.id);
                    let failure = e.to_failure();
                    journal.record_failure(&step.id, &failure)?;
                    failed = Some((step, failure));
                    cause = Some(AbortCause::Failure);
                    break;
                }
            }
        }

        let mut rollback_clean = true;
        if cause.is_some() && !applied.is_empty() {
            info!("rolling back {} applied steps", applied.len());
            for (step, change) in applied.iter().rev() {
                rollback_clean &= self.unwind(&mut journal, &step.id, &step.action, change)?;
            }
        }

        if let Some((step, failure)) = failed {
            journal.record(&step.id, StepResult::Failed(failure), Some(&step.action))?;
        }

        let status = match cause {
            Some(cause) => RunStatus::Aborted(cause),
            None => RunStatus::Completed,
        };
        journal.finish(status)?;
        info!("run {} {status}", journal.run_id());
        Ok(RunReport::from_log(journal.log(), rollback_clean))
    }

    /// What [`run`](Self::run) would do, without touching the host or the
    /// state directory.
    pub fn preview(
        &self,
        registry: &StepRegistry,
        options: &RunOptions,
    ) -> Result<Vec<StepPreview>, CoreError> {
        let plan = self.checked_plan(registry, options)?;
        Ok(plan
            .steps()
            .iter()
            .map(|step| {
                if options.skip.contains(&step.id) {
                    StepPreview::skipped(step)
                } else {
                    self.executor.preview(step)
                }
            })
            .collect())
    }

    /// Unwind a recorded run: every step still applied, and the step that
    /// was in flight when the run stopped, is rolled back in reverse order.
    /// With no `run_id`, the most recent run is used.
    pub fn rollback_run(&self, run_id: Option<&str>) -> Result<RunReport, CoreError> {
        let _lock = RunLock::acquire(&self.layout.lock_file())?;
        let store = RunLogStore::new(&self.layout);
        let log = match run_id {
            Some(id) => store.load(id)?,
            None => store.latest()?,
        };
        let previous = log.status;

        let mut targets: Vec<(String, Option<StepAction>, Change)> = log
            .outstanding()
            .into_iter()
            .map(|(entry, change)| (entry.step.clone(), entry.action.clone(), change.clone()))
            .collect();
        if let Some(in_flight) = &log.in_flight {
            warn!(
                "{} was in flight when run {} stopped; assuming it was applied",
                in_flight.step, log.run_id
            );
            targets.push((
                in_flight.step.clone(),
                Some(in_flight.action.clone()),
                StepExecutor::assumed_change(&in_flight.action),
            ));
        }

        let mut journal = RunJournal::resume(store, log);
        if targets.is_empty() {
            info!("run {}: nothing to roll back", journal.run_id());
            return Ok(RunReport::from_log(journal.log(), true));
        }

        info!(
            "rolling back {} steps of run {}",
            targets.len(),
            journal.run_id()
        );
        let mut rollback_clean = true;
        for (step, action, change) in targets.iter().rev() {
            match action {
                Some(action) => {
                    rollback_clean &= self.unwind(&mut journal, step, action, change)?;
                }
                None => {
                    error!("{step}: no recorded action, cannot roll back");
                    journal.record(
                        step,
                        StepResult::RollbackFailed(Failure::new(
                            FailureKind::Os,
                            "run log has no action recorded for this step",
                        )),
                        None,
                    )?;
                    rollback_clean = false;
                }
            }
        }

        let status = match previous {
            RunStatus::Aborted(cause) => RunStatus::Aborted(cause),
            _ => RunStatus::Aborted(AbortCause::Operator),
        };
        journal.finish(status)?;
        Ok(RunReport::from_log(journal.log(), rollback_clean))
    }

    fn checked_plan(
        &self,
        registry: &StepRegistry,
        options: &RunOptions,
    ) -> Result<RunPlan, CoreError> {
        let plan = registry.plan()?;
        if let Some(unknown) = options.skip.iter().find(|id| plan.get(id).is_none()) {
            return Err(CoreError::UnknownStep(unknown.clone()));
        }
        Ok(plan)
    }

    /// Roll back one step and record the result. Returns whether it worked;
    /// a failed rollback never stops the unwind.
    fn unwind(
        &self,
        journal: &mut RunJournal,
        step: &str,
        action: &StepAction,
        change: &Change,
    ) -> Result<bool, CoreError> {
        match self.executor.rollback(step, action, change) {
            Ok(()) => {
                info!("{step}: rolled back");
                journal.record(step, StepResult::RolledBack, Some(action))?;
                Ok(true)
            }
            Err(e) => {
                error!("{step}: rollback failed: {e}");
                journal.record(step, StepResult::RollbackFailed(e.to_failure()), Some(action))?;
                Ok(false)
            }
        }
    }
}
