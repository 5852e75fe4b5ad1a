//! Host backends for Cloyster steps.
//!
//! This crate implements the layer that touches the machine: the
//! `MountManager` (idempotent mount/unmount over a pluggable `MountTable`)
//! and the `ServiceController` (systemd unit reconciliation over a pluggable
//! `SystemdBus`). Live backends read `/proc/self/mounts`, shell out to
//! `mount(8)`, and talk to systemd over the system bus with zbus; the mock
//! backends keep everything in memory for tests and dry environments.

pub mod backend;
pub mod dbus;
pub mod mock;
pub mod mount;
pub mod mount_table;
pub mod service;

pub use backend::{select_backend, HostBackends};
pub use dbus::ZbusSystemd;
pub use mount::{MountEntry, MountManager, MountStatus, MountTable};
pub use mount_table::HostMountTable;
pub use service::{ServiceController, SystemdBus, UnitState};

use cloyster_schema::{Failure, FailureKind};
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HostError {
    #[error("host I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("mount conflict at {}: found {observed}, requested {requested}", target.display())]
    Conflict {
        target: PathBuf,
        observed: String,
        requested: String,
    },
    #[error("mount of {} failed: {reason}", target.display())]
    MountFailed { target: PathBuf, reason: String },
    #[error("unmount of {} failed: {reason}", target.display())]
    UnmountFailed { target: PathBuf, reason: String },
    #[error("control bus unreachable: {0}")]
    Unreachable(String),
    #[error("systemd rejected {op} of {unit}: {reason}")]
    Rejected {
        unit: String,
        op: String,
        reason: String,
    },
    #[error("no such unit: {0}")]
    NoSuchUnit(String),
    #[error("host backend '{0}' is not available")]
    BackendUnavailable(String),
    #[error("host backend error: {0}")]
    Backend(String),
}

impl HostError {
    pub fn kind(&self) -> FailureKind {
        match self {
            HostError::Conflict { .. } => FailureKind::Conflict,
            HostError::Unreachable(_) => FailureKind::Unreachable,
            HostError::Rejected { .. } => FailureKind::Rejected,
            HostError::NoSuchUnit(_) => FailureKind::NoSuchUnit,
            HostError::Io(_)
            | HostError::MountFailed { .. }
            | HostError::UnmountFailed { .. }
            | HostError::BackendUnavailable(_)
            | HostError::Backend(_) => FailureKind::Os,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind().is_transient()
    }

    pub fn to_failure(&self) -> Failure {
        Failure::new(self.kind(), self.to_string())
    }
}
