//! systemd over the system bus.
//!
//! Blocking zbus proxies for `org.freedesktop.systemd1.Manager` and
//! `org.freedesktop.systemd1.Unit`. Every call carries an explicit method
//! timeout so a hung manager surfaces as [`HostError::Unreachable`] instead
//! of stalling the run.

use crate::service::{SystemdBus, UnitState};
use crate::HostError;
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, warn};
use zbus::blocking::Connection;
use zbus::proxy;
use zbus::proxy::CacheProperties;
use zbus::zvariant::OwnedObjectPath;

const JOB_MODE: &str = "replace";

#[proxy(
    interface = "org.freedesktop.systemd1.Manager",
    default_service = "org.freedesktop.systemd1",
    default_path = "/org/freedesktop/systemd1"
)]
trait Manager {
    fn load_unit(&self, name: &str) -> zbus::Result<OwnedObjectPath>;

    fn get_unit_file_state(&self, file: &str) -> zbus::Result<String>;

    fn start_unit(&self, name: &str, mode: &str) -> zbus::Result<OwnedObjectPath>;

    fn stop_unit(&self, name: &str, mode: &str) -> zbus::Result<OwnedObjectPath>;

    fn reload_unit(&self, name: &str, mode: &str) -> zbus::Result<OwnedObjectPath>;

    fn restart_unit(&self, name: &str, mode: &str) -> zbus::Result<OwnedObjectPath>;

    fn enable_unit_files(
        &self,
        files: &[&str],
        runtime: bool,
        force: bool,
    ) -> zbus::Result<(bool, Vec<(String, String, String)>)>;

    fn disable_unit_files(
        &self,
        files: &[&str],
        runtime: bool,
    ) -> zbus::Result<Vec<(String, String, String)>>;

    fn reload(&self) -> zbus::Result<()>;
}

#[proxy(
    interface = "org.freedesktop.systemd1.Unit",
    default_service = "org.freedesktop.systemd1"
)]
trait Unit {
    #[zbus(property)]
    fn load_state(&self) -> zbus::Result<String>;

    #[zbus(property)]
    fn active_state(&self) -> zbus::Result<String>;
}

/// Live systemd backend on the system bus.
///
/// The connection is opened on first use and dropped again once it turns
/// out to be unreachable, so a restarted bus is picked up by the next retry.
pub struct ZbusSystemd {
    timeout: Duration,
    connection: Mutex<Option<Connection>>,
}

impl ZbusSystemd {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            connection: Mutex::new(None),
        }
    }

    fn connection(&self) -> Result<Connection, HostError> {
        let mut guard = self
            .connection
            .lock()
            .map_err(|e| HostError::Backend(format!("mutex poisoned: {e}")))?;
        if let Some(conn) = guard.as_ref() {
            return Ok(conn.clone());
        }
        debug!("connecting to the system bus");
        let conn = zbus::blocking::connection::Builder::system()
            .and_then(|b| b.method_timeout(self.timeout).build())
            .map_err(|e| HostError::Unreachable(format!("system bus: {e}")))?;
        *guard = Some(conn.clone());
        Ok(conn)
    }

    fn forget_connection(&self) {
        if let Ok(mut guard) = self.connection.lock() {
            *guard = None;
        }
    }

    fn manager(&self, conn: &Connection) -> Result<ManagerProxyBlocking<'static>, HostError> {
        ManagerProxyBlocking::builder(conn)
            .cache_properties(CacheProperties::No)
            .build()
            .map_err(|e| classify("", "connect", e))
    }

    /// Run `call` against the manager; the lock is only held while the
    /// connection handle is cloned.
    fn with_manager<T>(
        &self,
        unit: &str,
        op: &str,
        call: impl FnOnce(&ManagerProxyBlocking<'static>) -> zbus::Result<T>,
    ) -> Result<T, HostError> {
        let conn = self.connection()?;
        let manager = self.manager(&conn)?;
        call(&manager).map_err(|e| self.classify_and_reset(unit, op, e))
    }

    /// The unit file change is already on disk once EnableUnitFiles or
    /// DisableUnitFiles returns, so the op counts as done even if the
    /// manager reload that follows fails. The next reload picks it up.
    fn reload_after_unit_files(&self, unit: &str, op: &str) {
        if let Err(e) = self.reload_daemon() {
            warn!("{op} {unit} done, but reloading the manager failed: {e}");
        }
    }

    fn classify_and_reset(&self, unit: &str, op: &str, err: zbus::Error) -> HostError {
        let classified = classify(unit, op, err);
        if classified.is_transient() {
            self.forget_connection();
        }
        classified
    }
}

impl SystemdBus for ZbusSystemd {
    fn name(&self) -> &str {
        "host"
    }

    fn unit_state(&self, unit: &str) -> Result<UnitState, HostError> {
        let conn = self.connection()?;
        let manager = self.manager(&conn)?;

        let path = manager
            .load_unit(unit)
            .map_err(|e| self.classify_and_reset(unit, "load", e))?;
        let proxy = UnitProxyBlocking::builder(&conn)
            .path(path)
            .and_then(|b| b.cache_properties(CacheProperties::No).build())
            .map_err(|e| self.classify_and_reset(unit, "load", e))?;

        let load_state = proxy
            .load_state()
            .map_err(|e| self.classify_and_reset(unit, "query", e))?;
        if load_state == "not-found" {
            return Ok(UnitState {
                load_state,
                active_state: "inactive".to_owned(),
                file_state: String::new(),
            });
        }
        let active_state = proxy
            .active_state()
            .map_err(|e| self.classify_and_reset(unit, "query", e))?;
        let file_state = manager
            .get_unit_file_state(unit)
            .map_err(|e| self.classify_and_reset(unit, "query", e))?;

        Ok(UnitState {
            load_state,
            active_state,
            file_state,
        })
    }

    fn start(&self, unit: &str) -> Result<(), HostError> {
        self.with_manager(unit, "start", |m| m.start_unit(unit, JOB_MODE))
            .map(|job| debug!("start job {}", job.as_str()))
    }

    fn stop(&self, unit: &str) -> Result<(), HostError> {
        self.with_manager(unit, "stop", |m| m.stop_unit(unit, JOB_MODE))
            .map(|job| debug!("stop job {}", job.as_str()))
    }

    fn enable(&self, unit: &str) -> Result<(), HostError> {
        self.with_manager(unit, "enable", |m| m.enable_unit_files(&[unit], false, true))?;
        self.reload_after_unit_files(unit, "enable");
        Ok(())
    }

    fn disable(&self, unit: &str) -> Result<(), HostError> {
        self.with_manager(unit, "disable", |m| m.disable_unit_files(&[unit], false))?;
        self.reload_after_unit_files(unit, "disable");
        Ok(())
    }

    fn reload(&self, unit: &str) -> Result<(), HostError> {
        self.with_manager(unit, "reload", |m| m.reload_unit(unit, JOB_MODE))
            .map(|job| debug!("reload job {}", job.as_str()))
    }

    fn restart(&self, unit: &str) -> Result<(), HostError> {
        self.with_manager(unit, "restart", |m| m.restart_unit(unit, JOB_MODE))
            .map(|job| debug!("restart job {}", job.as_str()))
    }

    fn reload_daemon(&self) -> Result<(), HostError> {
        self.with_manager("", "reload", |m| m.reload())
    }
}

/// Map a bus error onto the failure taxonomy.
pub fn classify(unit: &str, op: &str, err: zbus::Error) -> HostError {
    match err {
        zbus::Error::MethodError(name, description, _) => {
            classify_error_name(unit, op, name.as_str(), description.unwrap_or_default())
        }
        zbus::Error::FDO(fdo) => classify_fdo(unit, op, *fdo),
        zbus::Error::InputOutput(e) => HostError::Unreachable(e.to_string()),
        zbus::Error::Address(e) | zbus::Error::Handshake(e) => HostError::Unreachable(e),
        other => HostError::Backend(other.to_string()),
    }
}

fn classify_fdo(unit: &str, op: &str, err: zbus::fdo::Error) -> HostError {
    match err {
        zbus::fdo::Error::ZBus(inner) => classify(unit, op, inner),
        zbus::fdo::Error::Timeout(msg)
        | zbus::fdo::Error::TimedOut(msg)
        | zbus::fdo::Error::NoReply(msg)
        | zbus::fdo::Error::ServiceUnknown(msg)
        | zbus::fdo::Error::Disconnected(msg)
        | zbus::fdo::Error::NoServer(msg) => HostError::Unreachable(msg),
        other => HostError::Rejected {
            unit: unit.to_owned(),
            op: op.to_owned(),
            reason: other.to_string(),
        },
    }
}

fn classify_error_name(unit: &str, op: &str, name: &str, description: String) -> HostError {
    match name {
        "org.freedesktop.systemd1.NoSuchUnit" => HostError::NoSuchUnit(unit.to_owned()),
        "org.freedesktop.DBus.Error.Timeout"
        | "org.freedesktop.DBus.Error.TimedOut"
        | "org.freedesktop.DBus.Error.NoReply"
        | "org.freedesktop.DBus.Error.ServiceUnknown"
        | "org.freedesktop.DBus.Error.Disconnected"
        | "org.freedesktop.DBus.Error.NoServer" => {
            HostError::Unreachable(format!("{name}: {description}"))
        }
        _ => HostError::Rejected {
            unit: unit.to_owned(),
            op: op.to_owned(),
            reason: if description.is_empty() {
                name.to_owned()
            } else {
                format!("{name}: {description}")
            },
        },
    }
}
