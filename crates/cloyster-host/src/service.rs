use crate::HostError;
use cloyster_schema::{Change, ServiceUnit, UnitOp};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Unit file states systemd reports for units that start at boot, or that
/// cannot be toggled and are therefore as enabled as they will ever get.
const ENABLED_FILE_STATES: &[&str] = &[
    "enabled",
    "enabled-runtime",
    "static",
    "indirect",
    "generated",
    "alias",
];

/// File states that `DisableUnitFiles` cannot change.
const FIXED_FILE_STATES: &[&str] = &["static", "indirect", "generated"];

/// Snapshot of a unit as reported by systemd.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct UnitState {
    pub load_state: String,
    pub active_state: String,
    pub file_state: String,
}

impl UnitState {
    pub fn is_loaded(&self) -> bool {
        self.load_state != "not-found"
    }

    pub fn is_enabled(&self) -> bool {
        ENABLED_FILE_STATES.contains(&self.file_state.as_str())
    }

    pub fn is_active(&self) -> bool {
        matches!(
            self.active_state.as_str(),
            "active" | "activating" | "reloading"
        )
    }

    fn is_fixed(&self) -> bool {
        FIXED_FILE_STATES.contains(&self.file_state.as_str())
    }
}

/// Access to the systemd manager.
///
/// Every method takes a fully qualified unit name. Implementations map a
/// dead or silent bus to [`HostError::Unreachable`], errors systemd returns
/// to [`HostError::Rejected`], and unknown units to [`HostError::NoSuchUnit`].
pub trait SystemdBus: Send + Sync {
    fn name(&self) -> &str;

    fn unit_state(&self, unit: &str) -> Result<UnitState, HostError>;

    fn start(&self, unit: &str) -> Result<(), HostError>;

    fn stop(&self, unit: &str) -> Result<(), HostError>;

    fn enable(&self, unit: &str) -> Result<(), HostError>;

    fn disable(&self, unit: &str) -> Result<(), HostError>;

    /// Ask a running unit to re-read its configuration (`ReloadUnit`).
    fn reload(&self, unit: &str) -> Result<(), HostError>;

    fn restart(&self, unit: &str) -> Result<(), HostError>;

    fn reload_daemon(&self) -> Result<(), HostError>;
}

/// Brings systemd units to a desired state by issuing only the missing
/// operations.
#[derive(Clone)]
pub struct ServiceController {
    bus: Arc<dyn SystemdBus>,
}

impl ServiceController {
    pub fn new(bus: Arc<dyn SystemdBus>) -> Self {
        Self { bus }
    }

    pub fn backend_name(&self) -> &str {
        self.bus.name()
    }

    pub fn state(&self, unit: &ServiceUnit) -> Result<UnitState, HostError> {
        let name = unit.unit_name();
        let state = self.bus.unit_state(&name)?;
        if !state.is_loaded() {
            return Err(HostError::NoSuchUnit(name));
        }
        Ok(state)
    }

    /// Operations [`reconcile`](Self::reconcile) would issue right now.
    pub fn diff(&self, unit: &ServiceUnit) -> Result<Vec<UnitOp>, HostError> {
        let state = self.state(unit)?;
        Ok(delta(unit, &state))
    }

    /// Reconcile `unit` and report the operations issued.
    ///
    /// If an operation fails, the ones already issued are reverted before
    /// the error is returned, so a failed reconcile leaves nothing to undo.
    pub fn reconcile(&self, unit: &ServiceUnit) -> Result<Change, HostError> {
        self.reconcile_tracked(unit, &mut Vec::new())
    }

    /// [`reconcile`](Self::reconcile), noting in `uncertain` every operation
    /// whose reply was lost. Systemd may have carried such an operation out,
    /// so callers that retry must count it as issued.
    pub fn reconcile_tracked(
        &self,
        unit: &ServiceUnit,
        uncertain: &mut Vec<UnitOp>,
    ) -> Result<Change, HostError> {
        let name = unit.unit_name();
        if unit.daemon_reload {
            debug!("reloading systemd manager configuration");
            self.bus.reload_daemon()?;
        }

        let ops = self.diff(unit)?;
        if ops.is_empty() {
            debug!("{name} already in desired state");
            return Ok(Change::Service { ops });
        }

        for (done, op) in ops.iter().enumerate() {
            info!("{op} {name}");
            if let Err(e) = self.issue(&name, *op) {
                if e.is_transient() && !uncertain.contains(op) {
                    uncertain.push(*op);
                }
                if done > 0 {
                    if let Err(revert_err) = self.revert(unit, &ops[..done]) {
                        warn!("partial reconcile of {name} not fully reverted: {revert_err}");
                    }
                }
                return Err(e);
            }
        }
        Ok(Change::Service { ops })
    }

    /// Undo `ops` by issuing their inverses in reverse order.
    ///
    /// Every inverse is attempted; the first error is returned.
    pub fn revert(&self, unit: &ServiceUnit, ops: &[UnitOp]) -> Result<(), HostError> {
        let name = unit.unit_name();
        let mut first_error = None;
        for inverse in ops.iter().rev().filter_map(|op| op.inverse()) {
            info!("{inverse} {name} (revert)");
            if let Err(e) = self.issue(&name, inverse) {
                warn!("failed to {inverse} {name}: {e}");
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn issue(&self, unit: &str, op: UnitOp) -> Result<(), HostError> {
        match op {
            UnitOp::Enable => self.bus.enable(unit),
            UnitOp::Disable => self.bus.disable(unit),
            UnitOp::Start => self.bus.start(unit),
            UnitOp::Stop => self.bus.stop(unit),
            UnitOp::Reload => self.bus.reload(unit),
            UnitOp::Restart => self.bus.restart(unit),
        }
    }
}

/// Enable comes before start and stop before disable, so a unit is never
/// running while its enablement is in flux in the wrong direction. A
/// refresh only applies to a unit that was already running; one started
/// here comes up with its current configuration anyway.
fn delta(unit: &ServiceUnit, state: &UnitState) -> Vec<UnitOp> {
    let mut ops = Vec::new();
    if unit.enabled == Some(true) && !state.is_enabled() {
        ops.push(UnitOp::Enable);
    }
    match unit.active {
        Some(true) if !state.is_active() => ops.push(UnitOp::Start),
        Some(false) if state.is_active() => ops.push(UnitOp::Stop),
        _ => {}
    }
    if let Some(refresh) = unit.refresh {
        if state.is_active() && unit.active != Some(false) {
            ops.push(refresh.op());
        }
    }
    if unit.enabled == Some(false) && state.is_enabled() {
        if state.is_fixed() {
            warn!(
                "{} is {} and cannot be disabled",
                unit.unit_name(),
                state.file_state
            );
        } else {
            ops.push(UnitOp::Disable);
        }
    }
    ops
}
