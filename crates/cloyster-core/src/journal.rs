use crate::registry::Step;
use crate::CoreError;
use cloyster_schema::{Failure, StepAction, StepResult};
use cloyster_store::{InFlight, RunLog, RunLogStore, RunStatus, StepFailure};
use tracing::debug;

/// A run log that is persisted after every change.
///
/// Intent is written before the host is touched (`mark_in_flight`) and the
/// outcome right after, so whatever happened to the host is on disk before
/// the orchestrator moves on.
pub struct RunJournal {
    store: RunLogStore,
    log: RunLog,
}

impl RunJournal {
    /// Create the log for a new run and mark it running.
    pub fn begin(store: RunLogStore, plan: Vec<String>) -> Result<Self, CoreError> {
        let mut log = store.create(plan)?;
        log.status = RunStatus::Running;
        store.save(&log)?;
        Ok(Self { store, log })
    }

    /// Continue writing to a log loaded from disk.
    pub fn resume(store: RunLogStore, log: RunLog) -> Self {
        Self { store, log }
    }

    pub fn run_id(&self) -> &str {
        &self.log.run_id
    }

    pub fn log(&self) -> &RunLog {
        &self.log
    }

    pub fn into_log(self) -> RunLog {
        self.log
    }

    pub fn mark_in_flight(&mut self, step: &Step) -> Result<(), CoreError> {
        self.log.in_flight = Some(InFlight {
            step: step.id.clone(),
            action: step.action.clone(),
            since: chrono::Utc::now().to_rfc3339(),
        });
        self.save()
    }

    pub fn record(
        &mut self,
        step: &str,
        result: StepResult,
        action: Option<&StepAction>,
    ) -> Result<(), CoreError> {
        debug!("{}: {step} -> {result}", self.log.run_id);
        self.log.push(step, result, action.cloned());
        self.save()
    }

    /// Record the step that stopped the run. A failed step has left nothing
    /// behind, so it is no longer in flight.
    pub fn record_failure(&mut self, step: &str, failure: &Failure) -> Result<(), CoreError> {
        self.log.in_flight = None;
        self.log.failure = Some(StepFailure {
            step: step.to_owned(),
            failure: failure.clone(),
        });
        self.save()
    }

    pub fn finish(&mut self, status: RunStatus) -> Result<(), CoreError> {
        self.log.status = status;
        self.log.finished_at = Some(chrono::Utc::now().to_rfc3339());
        self.save()
    }

    fn save(&self) -> Result<(), CoreError> {
        self.store.save(&self.log)?;
        Ok(())
    }
}
