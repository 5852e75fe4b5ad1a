use crate::dbus::ZbusSystemd;
use crate::mock::{MockMountTable, MockSystemd};
use crate::mount::MountTable;
use crate::mount_table::HostMountTable;
use crate::service::SystemdBus;
use crate::{HostError, MountManager, ServiceController};
use cloyster_schema::Settings;
use std::sync::Arc;
use std::time::Duration;

/// The pair of backends a run talks to.
#[derive(Clone)]
pub struct HostBackends {
    pub mounts: Arc<dyn MountTable>,
    pub bus: Arc<dyn SystemdBus>,
}

impl HostBackends {
    pub fn new(mounts: Arc<dyn MountTable>, bus: Arc<dyn SystemdBus>) -> Self {
        Self { mounts, bus }
    }

    pub fn mock() -> Self {
        Self::new(
            Arc::new(MockMountTable::new()),
            Arc::new(MockSystemd::lenient()),
        )
    }

    pub fn name(&self) -> &str {
        self.mounts.name()
    }

    pub fn mount_manager(&self) -> MountManager {
        MountManager::new(Arc::clone(&self.mounts))
    }

    pub fn service_controller(&self) -> ServiceController {
        ServiceController::new(Arc::clone(&self.bus))
    }
}

pub fn select_backend(name: &str, settings: &Settings) -> Result<HostBackends, HostError> {
    match name {
        "host" => Ok(HostBackends::new(
            Arc::new(HostMountTable::new()),
            Arc::new(ZbusSystemd::new(Duration::from_millis(
                settings.bus.timeout_ms,
            ))),
        )),
        "mock" => Ok(HostBackends::mock()),
        other => Err(HostError::BackendUnavailable(other.to_owned())),
    }
}
