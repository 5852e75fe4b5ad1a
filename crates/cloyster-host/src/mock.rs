//! In-memory host backends for tests and dry environments.

use crate::mount::{MountEntry, MountTable};
use crate::service::{SystemdBus, UnitState};
use crate::HostError;
use cloyster_schema::{MountSpec, UnitOp};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

fn lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>, HostError> {
    mutex
        .lock()
        .map_err(|e| HostError::Backend(format!("mutex poisoned: {e}")))
}

#[derive(Default)]
pub struct MockMountTable {
    entries: Mutex<Vec<MountEntry>>,
    failing: Mutex<HashSet<PathBuf>>,
    mount_calls: AtomicUsize,
    unmount_calls: AtomicUsize,
}

impl MockMountTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pretend `entry` was mounted before this process started.
    pub fn preload(&self, entry: MountEntry) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.push(entry);
        }
    }

    /// Make every mount and unmount of `target` fail.
    pub fn fail_mount(&self, target: &Path) {
        if let Ok(mut failing) = self.failing.lock() {
            failing.insert(target.to_path_buf());
        }
    }

    pub fn clear_failures(&self) {
        if let Ok(mut failing) = self.failing.lock() {
            failing.clear();
        }
    }

    pub fn mount_calls(&self) -> usize {
        self.mount_calls.load(Ordering::SeqCst)
    }

    pub fn unmount_calls(&self) -> usize {
        self.unmount_calls.load(Ordering::SeqCst)
    }

    pub fn mounted_targets(&self) -> Vec<PathBuf> {
        self.entries
            .lock()
            .map(|entries| entries.iter().map(|e| e.target.clone()).collect())
            .unwrap_or_default()
    }

    fn is_failing(&self, target: &Path) -> Result<bool, HostError> {
        Ok(lock(&self.failing)?.contains(target))
    }
}

impl MountTable for MockMountTable {
    fn name(&self) -> &str {
        "mock"
    }

    fn find(&self, target: &Path) -> Result<Option<MountEntry>, HostError> {
        Ok(lock(&self.entries)?
            .iter()
            .rev()
            .find(|e| e.target == target)
            .cloned())
    }

    fn mount(&self, spec: &MountSpec) -> Result<(), HostError> {
        self.mount_calls.fetch_add(1, Ordering::SeqCst);
        if self.is_failing(&spec.target)? {
            return Err(HostError::MountFailed {
                target: spec.target.clone(),
                reason: "mount: special device does not exist".to_owned(),
            });
        }
        lock(&self.entries)?.push(MountEntry::from_spec(spec));
        Ok(())
    }

    fn unmount(&self, target: &Path) -> Result<(), HostError> {
        self.unmount_calls.fetch_add(1, Ordering::SeqCst);
        if self.is_failing(target)? {
            return Err(HostError::UnmountFailed {
                target: target.to_path_buf(),
                reason: "umount: target is busy".to_owned(),
            });
        }
        let mut entries = lock(&self.entries)?;
        match entries.iter().rposition(|e| e.target == target) {
            Some(idx) => {
                entries.remove(idx);
                Ok(())
            }
            None => Err(HostError::UnmountFailed {
                target: target.to_path_buf(),
                reason: "umount: not mounted".to_owned(),
            }),
        }
    }
}

/// Failure a [`MockSystemd`] can be scripted to return.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockFailure {
    Unreachable,
    Rejected,
    NoSuchUnit,
    /// The operation takes effect but the caller sees a timeout.
    LostReply,
}

impl MockFailure {
    fn to_error(self, unit: &str, op: UnitOp) -> HostError {
        match self {
            MockFailure::Unreachable | MockFailure::LostReply => {
                HostError::Unreachable(format!("{op} {unit}: method call timed out"))
            }
            MockFailure::Rejected => HostError::Rejected {
                unit: unit.to_owned(),
                op: op.to_string(),
                reason: "org.freedesktop.systemd1.UnitMasked".to_owned(),
            },
            MockFailure::NoSuchUnit => HostError::NoSuchUnit(unit.to_owned()),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct MockUnit {
    enabled: bool,
    active: bool,
}

#[derive(Default)]
pub struct MockSystemd {
    units: Mutex<HashMap<String, MockUnit>>,
    journal: Mutex<Vec<(UnitOp, String)>>,
    scripted: Mutex<HashMap<(UnitOp, String), (MockFailure, usize)>>,
    reloads: AtomicUsize,
    lenient: bool,
}

impl MockSystemd {
    pub fn new() -> Self {
        Self::default()
    }

    /// A bus on which every unit exists, initially disabled and inactive.
    pub fn lenient() -> Self {
        Self {
            lenient: true,
            ..Self::default()
        }
    }

    pub fn add_unit(&self, unit: &str, enabled: bool, active: bool) {
        if let Ok(mut units) = self.units.lock() {
            units.insert(unit.to_owned(), MockUnit { enabled, active });
        }
    }

    /// Fail the next `times` calls of `op` on `unit`.
    pub fn fail_times(&self, op: UnitOp, unit: &str, failure: MockFailure, times: usize) {
        if let Ok(mut scripted) = self.scripted.lock() {
            scripted.insert((op, unit.to_owned()), (failure, times));
        }
    }

    /// Every operation that reached a unit, in call order, successful or not.
    pub fn journal(&self) -> Vec<(UnitOp, String)> {
        self.journal
            .lock()
            .map(|j| j.clone())
            .unwrap_or_default()
    }

    pub fn count(&self, op: UnitOp) -> usize {
        self.journal().iter().filter(|(o, _)| *o == op).count()
    }

    pub fn reloads(&self) -> usize {
        self.reloads.load(Ordering::SeqCst)
    }

    fn apply(&self, unit: &str, op: UnitOp) -> Result<(), HostError> {
        lock(&self.journal)?.push((op, unit.to_owned()));

        let failure = {
            let mut scripted = lock(&self.scripted)?;
            match scripted.get_mut(&(op, unit.to_owned())) {
                Some((failure, remaining)) if *remaining > 0 => {
                    *remaining -= 1;
                    Some(*failure)
                }
                _ => None,
            }
        };
        if let Some(failure) = failure.filter(|f| *f != MockFailure::LostReply) {
            return Err(failure.to_error(unit, op));
        }

        let mut units = lock(&self.units)?;
        if self.lenient {
            units.entry(unit.to_owned()).or_default();
        }
        let state = units
            .get_mut(unit)
            .ok_or_else(|| HostError::NoSuchUnit(unit.to_owned()))?;
        match op {
            UnitOp::Enable => state.enabled = true,
            UnitOp::Disable => state.enabled = false,
            UnitOp::Start | UnitOp::Restart => state.active = true,
            UnitOp::Stop => state.active = false,
            UnitOp::Reload if !state.active => {
                return Err(HostError::Rejected {
                    unit: unit.to_owned(),
                    op: op.to_string(),
                    reason: "org.freedesktop.systemd1.UnitInactive".to_owned(),
                });
            }
            UnitOp::Reload => {}
        }

        match failure {
            Some(lost) => Err(lost.to_error(unit, op)),
            None => Ok(()),
        }
    }
}

impl SystemdBus for MockSystemd {
    fn name(&self) -> &str {
        "mock"
    }

    fn unit_state(&self, unit: &str) -> Result<UnitState, HostError> {
        let units = lock(&self.units)?;
        let known = units
            .get(unit)
            .copied()
            .or_else(|| self.lenient.then(MockUnit::default));
        Ok(match known {
            Some(u) => UnitState {
                load_state: "loaded".to_owned(),
                active_state: if u.active { "active" } else { "inactive" }.to_owned(),
                file_state: if u.enabled { "enabled" } else { "disabled" }.to_owned(),
            },
            None => UnitState {
                load_state: "not-found".to_owned(),
                active_state: "inactive".to_owned(),
                file_state: String::new(),
            },
        })
    }

    fn start(&self, unit: &str) -> Result<(), HostError> {
        self.apply(unit, UnitOp::Start)
    }

    fn stop(&self, unit: &str) -> Result<(), HostError> {
        self.apply(unit, UnitOp::Stop)
    }

    fn enable(&self, unit: &str) -> Result<(), HostError> {
        self.apply(unit, UnitOp::Enable)
    }

    fn disable(&self, unit: &str) -> Result<(), HostError> {
        self.apply(unit, UnitOp::Disable)
    }

    fn reload(&self, unit: &str) -> Result<(), HostError> {
        self.apply(unit, UnitOp::Reload)
    }

    fn restart(&self, unit: &str) -> Result<(), HostError> {
        self.apply(unit, UnitOp::Restart)
    }

    fn reload_daemon(&self) -> Result<(), HostError> {
        self.reloads.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
