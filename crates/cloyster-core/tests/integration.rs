use cloyster_core::{
    CancelToken, CoreError, Orchestrator, RetryPolicy, RunLock, RunOptions, Step, StepRegistry,
};
use cloyster_host::mock::{MockFailure, MockMountTable, MockSystemd};
use cloyster_host::{HostBackends, HostError, MountEntry, MountTable, SystemdBus, UnitState};
use cloyster_schema::{
    parse_plan_str, Change, FailureKind, MountSpec, ServiceUnit, StepAction, StepResult, UnitOp,
};
use cloyster_store::{AbortCause, InFlight, RunLogStore, RunStatus, StateLayout};
use std::path::Path;
use std::sync::Arc;

struct Host {
    state: tempfile::TempDir,
    table: Arc<MockMountTable>,
    bus: Arc<MockSystemd>,
}

impl Host {
    fn new() -> Self {
        Self {
            state: tempfile::tempdir().unwrap(),
            table: Arc::new(MockMountTable::new()),
            bus: Arc::new(MockSystemd::new()),
        }
    }

    fn layout(&self) -> StateLayout {
        StateLayout::new(self.state.path())
    }

    fn backends(&self) -> HostBackends {
        HostBackends::new(self.table.clone(), self.bus.clone())
    }

    fn orchestrator(&self) -> Orchestrator {
        Orchestrator::new(self.layout(), &self.backends(), RetryPolicy::immediate(4))
    }

    fn runs(&self) -> RunLogStore {
        RunLogStore::new(&self.layout())
    }
}

fn registry(steps: Vec<Step>) -> StepRegistry {
    let mut registry = StepRegistry::new();
    for step in steps {
        registry.register(step).unwrap();
    }
    registry
}

fn data_mount() -> MountSpec {
    MountSpec::new("/dev/vg0/data", "/data", "xfs").with_options(&["noatime"])
}

/// A: mount, B: service that systemd rejects, C: independent of B.
fn canonical_registry() -> StepRegistry {
    registry(vec![
        Step::new("A", data_mount()),
        Step::new("B", ServiceUnit::new("nfs-server").enabled(true).active(true)).after(&["A"]),
        Step::new("C", ServiceUnit::new("rpc-statd").active(true)).after(&["A"]),
    ])
}

#[test]
fn failed_step_unwinds_applied_steps() {
    let host = Host::new();
    host.bus.add_unit("nfs-server.service", true, false);
    host.bus.add_unit("rpc-statd.service", false, false);
    host.bus
        .fail_times(UnitOp::Start, "nfs-server.service", MockFailure::Rejected, 1);

    let report = host
        .orchestrator()
        .run(&canonical_registry(), &RunOptions::default())
        .unwrap();

    assert_eq!(report.status, RunStatus::Aborted(AbortCause::Failure));
    assert_eq!(
        report.trail,
        vec!["A:Applied", "A:RolledBack", "B:Failed(Rejected)"]
    );
    assert_eq!(report.failed_step.as_deref(), Some("B"));
    assert_eq!(report.failure.unwrap().kind, FailureKind::Rejected);
    assert!(report.rollback_clean);

    // C was ready once A applied, but nothing runs after a failure.
    assert_eq!(host.bus.count(UnitOp::Start), 1);
    assert!(host
        .bus
        .journal()
        .iter()
        .all(|(_, unit)| unit != "rpc-statd.service"));
    assert!(!host.bus.unit_state("rpc-statd.service").unwrap().is_active());
    assert!(host.table.find_target("/data").is_none());

    let log = host.runs().load(&report.run_id).unwrap();
    assert_eq!(log.status, RunStatus::Aborted(AbortCause::Failure));
    assert!(log.in_flight.is_none());
    assert!(log.last_result("C").is_none());
    assert_eq!(log.plan, vec!["A", "B", "C"]);
}

#[test]
fn cycle_is_reported_before_any_mutation() {
    let host = Host::new();
    let reg = registry(vec![
        Step::new("A", data_mount()).after(&["B"]),
        Step::new("B", ServiceUnit::new("nfs-server").active(true)).after(&["A"]),
    ]);

    let err = host.orchestrator().run(&reg, &RunOptions::default()).unwrap_err();
    assert!(matches!(err, CoreError::Cycle(ref steps) if steps == &["A", "B"]));
    assert!(err.is_planning());
    assert_eq!(host.table.mount_calls(), 0);
    assert!(host.runs().list().unwrap().is_empty());
}

#[test]
fn second_run_changes_nothing() {
    let host = Host::new();
    host.bus.add_unit("nfs-server.service", false, false);
    let reg = registry(vec![
        Step::new("data", data_mount()),
        Step::new("nfs", ServiceUnit::new("nfs-server").enabled(true).active(true))
            .after(&["data"]),
    ]);
    let orchestrator = host.orchestrator();

    let first = orchestrator.run(&reg, &RunOptions::default()).unwrap();
    let second = orchestrator.run(&reg, &RunOptions::default()).unwrap();
    assert_eq!(first.status, RunStatus::Completed);
    assert_eq!(second.status, RunStatus::Completed);
    assert_ne!(first.run_id, second.run_id);

    assert_eq!(host.table.mount_calls(), 1);
    assert_eq!(host.bus.journal().len(), 2);

    let log = host.runs().load(&second.run_id).unwrap();
    assert_eq!(
        log.last_result("data"),
        Some(&StepResult::Applied(Change::Mount { mounted: false }))
    );
    assert_eq!(
        log.last_result("nfs"),
        Some(&StepResult::Applied(Change::Service { ops: vec![] }))
    );
}

#[test]
fn conflicting_mount_aborts_without_retry() {
    let host = Host::new();
    host.table.preload(MountEntry::from_spec(&MountSpec::new(
        "/dev/sdz9",
        "/data",
        "ext4",
    )));
    let reg = registry(vec![Step::new("data", data_mount())]);

    let report = host.orchestrator().run(&reg, &RunOptions::default()).unwrap();
    assert_eq!(report.trail, vec!["data:Failed(Conflict)"]);
    assert_eq!(host.table.mount_calls(), 0);
    assert_eq!(host.table.find_target("/data").unwrap().fstype, "ext4");
}

#[test]
fn unreachable_bus_is_retried_then_succeeds() {
    let host = Host::new();
    host.bus.add_unit("slurmctld.service", true, false);
    host.bus.fail_times(
        UnitOp::Start,
        "slurmctld.service",
        MockFailure::Unreachable,
        2,
    );
    let reg = registry(vec![Step::new(
        "slurm",
        ServiceUnit::new("slurmctld").active(true),
    )]);

    let report = host.orchestrator().run(&reg, &RunOptions::default()).unwrap();
    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(host.bus.count(UnitOp::Start), 3);
}

#[test]
fn exhausted_retries_fail_as_unreachable() {
    let host = Host::new();
    host.bus.add_unit("slurmctld.service", true, false);
    host.bus.fail_times(
        UnitOp::Start,
        "slurmctld.service",
        MockFailure::Unreachable,
        100,
    );
    let reg = registry(vec![Step::new(
        "slurm",
        ServiceUnit::new("slurmctld").active(true),
    )]);

    let report = host.orchestrator().run(&reg, &RunOptions::default()).unwrap();
    assert_eq!(report.trail, vec!["slurm:Failed(Unreachable)"]);
    assert_eq!(host.bus.count(UnitOp::Start), 4);
}

#[test]
fn failed_rollback_does_not_block_earlier_rollbacks() {
    let host = Host::new();
    host.bus.add_unit("nfs-server.service", false, false);
    host.bus.add_unit("dhcpd.service", false, false);
    host.bus
        .fail_times(UnitOp::Stop, "nfs-server.service", MockFailure::Rejected, 1);
    host.bus
        .fail_times(UnitOp::Start, "dhcpd.service", MockFailure::Rejected, 1);
    let reg = registry(vec![
        Step::new("data", data_mount()),
        Step::new("nfs", ServiceUnit::new("nfs-server").active(true)),
        Step::new("dhcp", ServiceUnit::new("dhcpd").active(true)),
    ]);

    let report = host.orchestrator().run(&reg, &RunOptions::default()).unwrap();
    assert_eq!(
        report.trail,
        vec![
            "data:Applied",
            "nfs:Applied",
            "nfs:RollbackFailed(Rejected)",
            "data:RolledBack",
            "dhcp:Failed(Rejected)"
        ]
    );
    assert!(!report.rollback_clean);
    assert!(host.table.find_target("/data").is_none());

    // A later rollback invocation retries what is still applied.
    let retry = host.orchestrator().rollback_run(None).unwrap();
    assert!(retry.rollback_clean);
    assert_eq!(retry.trail.last().map(String::as_str), Some("nfs:RolledBack"));
    assert!(!host.bus.unit_state("nfs-server.service").unwrap().is_active());
}

/// Trips the cancel token when a given unit is started, like an operator
/// pressing Ctrl-C while that step runs.
struct CancellingBus {
    inner: Arc<MockSystemd>,
    token: CancelToken,
    trigger: String,
}

impl SystemdBus for CancellingBus {
    fn name(&self) -> &str {
        "cancelling"
    }

    fn unit_state(&self, unit: &str) -> Result<UnitState, HostError> {
        self.inner.unit_state(unit)
    }

    fn start(&self, unit: &str) -> Result<(), HostError> {
        if unit == self.trigger {
            self.token.cancel();
        }
        self.inner.start(unit)
    }

    fn stop(&self, unit: &str) -> Result<(), HostError> {
        self.inner.stop(unit)
    }

    fn enable(&self, unit: &str) -> Result<(), HostError> {
        self.inner.enable(unit)
    }

    fn disable(&self, unit: &str) -> Result<(), HostError> {
        self.inner.disable(unit)
    }

    fn reload(&self, unit: &str) -> Result<(), HostError> {
        self.inner.reload(unit)
    }

    fn restart(&self, unit: &str) -> Result<(), HostError> {
        self.inner.restart(unit)
    }

    fn reload_daemon(&self) -> Result<(), HostError> {
        self.inner.reload_daemon()
    }
}

#[test]
fn cancellation_stops_at_step_boundary_and_rolls_back() {
    let host = Host::new();
    host.bus.add_unit("nfs-server.service", false, false);
    host.bus.add_unit("rpc-statd.service", false, false);
    let token = CancelToken::new();
    let bus = Arc::new(CancellingBus {
        inner: host.bus.clone(),
        token: token.clone(),
        trigger: "nfs-server.service".to_owned(),
    });
    let backends = HostBackends::new(host.table.clone(), bus);
    let orchestrator = Orchestrator::new(host.layout(), &backends, RetryPolicy::immediate(1))
        .with_cancel_token(token);

    let report = orchestrator
        .run(&canonical_registry(), &RunOptions::default())
        .unwrap();

    // B finishes because cancellation is only honoured between steps.
    assert_eq!(report.status, RunStatus::Aborted(AbortCause::Cancelled));
    assert_eq!(
        report.trail,
        vec!["A:Applied", "B:Applied", "B:RolledBack", "A:RolledBack"]
    );
    assert!(report.failed_step.is_none());
    assert!(!host.bus.unit_state("rpc-statd.service").unwrap().is_active());
    assert!(!host.bus.unit_state("nfs-server.service").unwrap().is_active());
    assert!(!host.bus.unit_state("nfs-server.service").unwrap().is_enabled());
}

#[test]
fn enable_with_lost_reply_is_still_rolled_back() {
    let host = Host::new();
    host.bus.add_unit("munge.service", false, false);
    host.bus.add_unit("slurmctld.service", true, false);
    host.bus
        .fail_times(UnitOp::Enable, "munge.service", MockFailure::LostReply, 1);
    host.bus
        .fail_times(UnitOp::Start, "slurmctld.service", MockFailure::Rejected, 1);
    let reg = registry(vec![
        Step::new("munge", ServiceUnit::new("munge").enabled(true).active(true)),
        Step::new("slurm", ServiceUnit::new("slurmctld").active(true)).after(&["munge"]),
    ]);

    let report = host.orchestrator().run(&reg, &RunOptions::default()).unwrap();
    assert_eq!(
        report.trail,
        vec!["munge:Applied", "munge:RolledBack", "slurm:Failed(Rejected)"]
    );
    assert!(report.rollback_clean);
    let munge = host.bus.unit_state("munge.service").unwrap();
    assert!(!munge.is_enabled());
    assert!(!munge.is_active());

    let log = host.runs().load(&report.run_id).unwrap();
    assert_eq!(
        log.entries[0].result,
        StepResult::Applied(Change::Service {
            ops: vec![UnitOp::Enable, UnitOp::Start]
        })
    );
}

/// Records new mounts the way the kernel lists them: tmpfs sizes in
/// kibibytes, and optionally a device node in place of the source.
struct KernelTable {
    inner: MockMountTable,
    rewrite_source: bool,
}

impl MountTable for KernelTable {
    fn name(&self) -> &str {
        "kernel"
    }

    fn find(&self, target: &Path) -> Result<Option<MountEntry>, HostError> {
        self.inner.find(target)
    }

    fn mount(&self, spec: &MountSpec) -> Result<(), HostError> {
        let mut entry = MountEntry::from_spec(spec);
        if self.rewrite_source {
            entry.source = "/dev/cloyster-test-loop7".to_owned();
        }
        entry.options = spec
            .options
            .iter()
            .map(|o| o.replace("size=1G", "size=1048576k"))
            .chain(["rw".to_owned(), "relatime".to_owned()])
            .collect();
        self.inner.preload(entry);
        Ok(())
    }

    fn unmount(&self, target: &Path) -> Result<(), HostError> {
        self.inner.unmount(target)
    }
}

fn scratch_host(rewrite_source: bool) -> (Host, Arc<KernelTable>, Orchestrator) {
    let host = Host::new();
    let table = Arc::new(KernelTable {
        inner: MockMountTable::new(),
        rewrite_source,
    });
    let backends = HostBackends::new(table.clone(), host.bus.clone());
    let orchestrator = Orchestrator::new(host.layout(), &backends, RetryPolicy::immediate(2));
    (host, table, orchestrator)
}

fn scratch_registry() -> StepRegistry {
    registry(vec![Step::new(
        "scratch",
        MountSpec::new("/dev/vg0/scratch", "/scratch", "tmpfs").with_options(&["size=1G"]),
    )])
}

#[test]
fn kernel_rewritten_options_still_verify() {
    let (host, table, orchestrator) = scratch_host(false);

    let first = orchestrator.run(&scratch_registry(), &RunOptions::default()).unwrap();
    assert_eq!(first.status, RunStatus::Completed);
    let second = orchestrator.run(&scratch_registry(), &RunOptions::default()).unwrap();
    assert_eq!(second.trail, vec!["scratch:Applied"]);

    let log = host.runs().load(&second.run_id).unwrap();
    assert_eq!(
        log.last_result("scratch"),
        Some(&StepResult::Applied(Change::Mount { mounted: false }))
    );
    assert!(table.find(Path::new("/scratch")).unwrap().is_some());
}

#[test]
fn unverified_mount_leaves_nothing_behind() {
    let (host, table, orchestrator) = scratch_host(true);

    let report = orchestrator.run(&scratch_registry(), &RunOptions::default()).unwrap();
    assert_eq!(report.trail, vec!["scratch:Failed(Os)"]);
    assert!(table.find(Path::new("/scratch")).unwrap().is_none());

    let log = host.runs().load(&report.run_id).unwrap();
    assert!(log.outstanding().is_empty());
    assert!(log.in_flight.is_none());

    // A retry fails the same way instead of tripping over a leftover mount.
    let again = orchestrator.run(&scratch_registry(), &RunOptions::default()).unwrap();
    assert_eq!(again.trail, vec!["scratch:Failed(Os)"]);
    assert!(table.find(Path::new("/scratch")).unwrap().is_none());
}

#[test]
fn concurrent_run_fails_fast() {
    let host = Host::new();
    let _held = RunLock::acquire(&host.layout().lock_file()).unwrap();
    let reg = registry(vec![Step::new("data", data_mount())]);

    let err = host.orchestrator().run(&reg, &RunOptions::default()).unwrap_err();
    assert!(matches!(err, CoreError::RunLocked(_)));
    assert!(err.to_string().starts_with("run lock:"));
    assert_eq!(host.table.mount_calls(), 0);
}

#[test]
fn lock_is_released_after_run() {
    let host = Host::new();
    let reg = registry(vec![Step::new("data", data_mount())]);
    host.orchestrator().run(&reg, &RunOptions::default()).unwrap();
    assert!(RunLock::try_acquire(&host.layout().lock_file())
        .unwrap()
        .is_some());
}

#[test]
fn rollback_run_unwinds_completed_run_in_reverse() {
    let host = Host::new();
    host.bus.add_unit("nfs-server.service", false, false);
    let reg = registry(vec![
        Step::new("data", data_mount()),
        Step::new("nfs", ServiceUnit::new("nfs-server").enabled(true).active(true))
            .after(&["data"]),
    ]);
    let orchestrator = host.orchestrator();
    let run = orchestrator.run(&reg, &RunOptions::default()).unwrap();

    let report = orchestrator.rollback_run(Some(&run.run_id)).unwrap();
    assert_eq!(report.status, RunStatus::Aborted(AbortCause::Operator));
    assert_eq!(
        report.trail,
        vec!["data:Applied", "nfs:Applied", "nfs:RolledBack", "data:RolledBack"]
    );
    assert!(host.table.find_target("/data").is_none());
    let state = host.bus.unit_state("nfs-server.service").unwrap();
    assert!(!state.is_active());
    assert!(!state.is_enabled());

    let again = orchestrator.rollback_run(None).unwrap();
    assert_eq!(again.trail.len(), 4);
}

#[test]
fn rollback_run_unwinds_step_left_in_flight() {
    let host = Host::new();
    let layout = host.layout();
    let store = host.runs();
    store.initialize().unwrap();

    // A crash right after the mount happened but before it was recorded.
    let spec = data_mount();
    host.table.preload(MountEntry::from_spec(&spec));
    let mut log = store.create(vec!["data".to_owned()]).unwrap();
    log.status = RunStatus::Running;
    log.in_flight = Some(InFlight {
        step: "data".to_owned(),
        action: StepAction::Mount(spec),
        since: "2026-01-01T00:00:00+00:00".to_owned(),
    });
    store.save(&log).unwrap();

    let report = host.orchestrator().rollback_run(None).unwrap();
    assert_eq!(report.trail, vec!["data:RolledBack"]);
    assert!(host.table.find_target("/data").is_none());

    let log = RunLogStore::new(&layout).load(&report.run_id).unwrap();
    assert!(log.in_flight.is_none());
    assert_eq!(log.status, RunStatus::Aborted(AbortCause::Operator));
}

#[test]
fn rollback_without_runs_is_an_error() {
    let host = Host::new();
    let err = host.orchestrator().rollback_run(None).unwrap_err();
    assert!(matches!(err, CoreError::Store(_)));
}

#[test]
fn plan_file_runs_end_to_end() {
    let host = Host::new();
    host.bus.add_unit("nfs-server.service", false, false);
    host.bus.add_unit("firewalld.service", true, true);
    let plan = parse_plan_str(
        r#"
plan_version = 1

[[step]]
id = "nfs"
kind = "service"
unit = "nfs-server"
enabled = true
active = true
depends_on = ["data"]

[[step]]
id = "data"
kind = "mount"
source = "/dev/vg0/data"
target = "/data"
fstype = "xfs"
options = ["noatime"]

[[step]]
id = "firewall-off"
kind = "service"
unit = "firewalld"
enabled = false
active = false
"#,
    )
    .unwrap();
    let reg = StepRegistry::from_plan_file(&plan).unwrap();

    let previews = host
        .orchestrator()
        .preview(&reg, &RunOptions::default())
        .unwrap();
    let rendered: Vec<String> = previews.iter().map(ToString::to_string).collect();
    assert_eq!(
        rendered,
        vec![
            "data: would mount /dev/vg0/data on /data type xfs (noatime)",
            "nfs: would enable, start nfs-server.service",
            "firewall-off: would stop, disable firewalld.service",
        ]
    );
    assert!(host.runs().list().unwrap().is_empty());

    let report = host.orchestrator().run(&reg, &RunOptions::default()).unwrap();
    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(
        report.trail,
        vec!["data:Applied", "nfs:Applied", "firewall-off:Applied"]
    );
    let firewall = host.bus.unit_state("firewalld.service").unwrap();
    assert!(!firewall.is_active());
    assert!(!firewall.is_enabled());
}

trait FindTarget {
    fn find_target(&self, target: &str) -> Option<MountEntry>;
}

impl FindTarget for MockMountTable {
    fn find_target(&self, target: &str) -> Option<MountEntry> {
        MountTable::find(self, Path::new(target)).unwrap()
    }
}
