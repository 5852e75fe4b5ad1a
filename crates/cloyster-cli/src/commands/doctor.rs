use super::{json_pretty, Context, EXIT_FAILURE, EXIT_SUCCESS};
use cloyster_core::RunLock;
use cloyster_host::HostBackends;
use cloyster_store::{RunLogStore, RunStatus, StateLayout};
use std::path::Path;

pub fn run(ctx: &Context) -> Result<u8, String> {
    let mut checks: Vec<Check> = Vec::new();
    let mut all_pass = true;

    checks.push(Check::info(
        "settings",
        &format!(
            "Backend '{}', state directory {}",
            ctx.settings.backend,
            ctx.state_dir.display()
        ),
    ));

    match ctx.backends() {
        Ok(backends) if backends.name() == "mock" => checks.push(Check::info(
            "backend",
            "Mock backend selected; host checks skipped",
        )),
        Ok(backends) => {
            check_privileges(&mut checks);
            check_host(&backends, &mut checks, &mut all_pass);
        }
        Err(e) => {
            all_pass = false;
            checks.push(Check::fail("backend", &e));
        }
    }

    let layout = ctx.layout();
    if layout.runs_dir().exists() {
        checks.push(Check::pass("state_dir", "State directory exists"));
        check_state(&layout, &mut checks, &mut all_pass);
        check_disk_space(&ctx.state_dir, &mut checks);
    } else {
        checks.push(Check::info(
            "state_dir",
            "State directory not initialized (will be created on first run)",
        ));
    }

    print_results(&checks, all_pass, ctx.json)
}

fn check_privileges(checks: &mut Vec<Check>) {
    // SAFETY: geteuid has no preconditions and cannot fail.
    #[allow(unsafe_code, clippy::undocumented_unsafe_blocks)]
    let euid = unsafe { libc::geteuid() };
    if euid == 0 {
        checks.push(Check::pass("privileges", "Running as root"));
    } else {
        checks.push(Check::warn(
            "privileges",
            &format!("Running as uid {euid}; mounting and unit changes need root"),
        ));
    }
}

fn check_host(backends: &HostBackends, checks: &mut Vec<Check>, all_pass: &mut bool) {
    match backends.mounts.find(Path::new("/")) {
        Ok(Some(root)) => checks.push(Check::pass(
            "mount_table",
            &format!("Mount table readable (/ is {} {})", root.fstype, root.source),
        )),
        Ok(None) => checks.push(Check::warn(
            "mount_table",
            "Mount table readable but lists no root filesystem",
        )),
        Err(e) => {
            *all_pass = false;
            checks.push(Check::fail(
                "mount_table",
                &format!("Cannot read mount table: {e}"),
            ));
        }
    }

    match backends.bus.unit_state("-.mount") {
        Ok(state) if state.is_loaded() => {
            checks.push(Check::pass("systemd_bus", "systemd reachable on the system bus"));
        }
        Ok(state) => checks.push(Check::warn(
            "systemd_bus",
            &format!("systemd reachable but -.mount is {}", state.load_state),
        )),
        Err(e) => {
            *all_pass = false;
            checks.push(Check::fail(
                "systemd_bus",
                &format!("Cannot reach systemd: {e}"),
            ));
        }
    }
}

fn check_state(layout: &StateLayout, checks: &mut Vec<Check>, all_pass: &mut bool) {
    // Lock
    match RunLock::try_acquire(&layout.lock_file()) {
        Ok(Some(_)) => checks.push(Check::pass("run_lock", "Run lock is free")),
        Ok(None) => checks.push(Check::warn(
            "run_lock",
            "Run lock is held by another process",
        )),
        Err(e) => {
            *all_pass = false;
            checks.push(Check::fail(
                "run_lock",
                &format!("Cannot check run lock: {e}"),
            ));
        }
    }

    // Last run
    let store = RunLogStore::new(layout);
    match store.list() {
        Ok(logs) => match logs.last() {
            None => checks.push(Check::info("last_run", "No runs recorded")),
            Some(log) => {
                let applied = log.outstanding().len() + usize::from(log.in_flight.is_some());
                if log.status != RunStatus::Completed && applied > 0 {
                    checks.push(Check::warn(
                        "last_run",
                        &format!(
                            "Run {} is {} with {applied} step(s) still applied (see 'cloyster rollback {}')",
                            log.run_id, log.status, log.run_id
                        ),
                    ));
                } else {
                    checks.push(Check::info(
                        "last_run",
                        &format!(
                            "{} runs recorded; last {} is {}",
                            logs.len(),
                            log.run_id,
                            log.status
                        ),
                    ));
                }
            }
        },
        Err(e) => checks.push(Check::warn(
            "last_run",
            &format!("Cannot list runs: {e}"),
        )),
    }
}

fn print_results(checks: &[Check], all_pass: bool, json_output: bool) -> Result<u8, String> {
    if json_output {
        let json = serde_json::json!({
            "healthy": all_pass,
            "checks": checks.iter().map(|c| serde_json::json!({
                "name": c.name,
                "status": c.status,
                "message": c.message,
            })).collect::<Vec<_>>(),
        });
        println!("{}", json_pretty(&json)?);
    } else {
        println!("Cloyster Doctor\n");
        for check in checks {
            let icon = match check.status {
                "pass" => "✓",
                "fail" => "✗",
                "warn" => "⚠",
                _ => "ℹ",
            };
            println!("  {icon} {}", check.message);
        }
        println!();
        if all_pass {
            println!("All checks passed.");
        } else {
            println!("Some checks failed. See above for details.");
        }
    }
    Ok(if all_pass { EXIT_SUCCESS } else { EXIT_FAILURE })
}

struct Check {
    name: &'static str,
    status: &'static str,
    message: String,
}

impl Check {
    fn new(name: &'static str, status: &'static str, message: &str) -> Self {
        Self {
            name,
            status,
            message: message.to_owned(),
        }
    }

    fn pass(name: &'static str, message: &str) -> Self {
        Self::new(name, "pass", message)
    }

    fn fail(name: &'static str, message: &str) -> Self {
        Self::new(name, "fail", message)
    }

    fn warn(name: &'static str, message: &str) -> Self {
        Self::new(name, "warn", message)
    }

    fn info(name: &'static str, message: &str) -> Self {
        Self::new(name, "info", message)
    }
}

fn check_disk_space(state_dir: &Path, checks: &mut Vec<Check>) {
    let Ok(c_path) = std::ffi::CString::new(state_dir.to_string_lossy().as_bytes()) else {
        return;
    };

    // SAFETY: zeroed statvfs is a valid initial state for the struct.
    #[allow(unsafe_code, clippy::undocumented_unsafe_blocks)]
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    // SAFETY: valid NUL-terminated path and a zeroed output struct that is
    // only read after the call succeeds.
    #[allow(unsafe_code, clippy::undocumented_unsafe_blocks)]
    let ret = unsafe { libc::statvfs(c_path.as_ptr(), &raw mut stat) };
    if ret != 0 {
        return;
    }

    #[allow(clippy::unnecessary_cast)]
    let avail_mb = (stat.f_bavail as u64 * stat.f_frsize as u64) / (1024 * 1024);
    if avail_mb < 16 {
        checks.push(Check::fail(
            "disk_space",
            &format!("Low disk space for run logs: {avail_mb} MB available"),
        ));
    } else {
        checks.push(Check::pass(
            "disk_space",
            &format!("Disk space: {avail_mb} MB available"),
        ));
    }
}
