use crate::outcome::UnitOp;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

const UNIT_SUFFIXES: &[&str] = &[
    ".service",
    ".socket",
    ".target",
    ".mount",
    ".automount",
    ".timer",
    ".path",
    ".slice",
    ".scope",
    ".swap",
    ".device",
];

/// A filesystem that must be mounted at `target`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MountSpec {
    pub source: String,
    pub target: PathBuf,
    pub fstype: String,
    #[serde(default)]
    pub options: Vec<String>,
}

impl MountSpec {
    pub fn new(source: &str, target: impl Into<PathBuf>, fstype: &str) -> Self {
        Self {
            source: source.to_owned(),
            target: target.into(),
            fstype: fstype.to_owned(),
            options: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_options(mut self, options: &[&str]) -> Self {
        self.options = options.iter().map(|o| (*o).to_owned()).collect();
        self
    }

    pub fn is_bind(&self) -> bool {
        self.options.iter().any(|o| o == "bind" || o == "rbind")
    }

    /// Options as passed to `mount -o`.
    pub fn options_string(&self) -> String {
        if self.options.is_empty() {
            "defaults".to_owned()
        } else {
            self.options.join(",")
        }
    }
}

impl fmt::Display for MountSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} on {} type {} ({})",
            self.source,
            self.target.display(),
            self.fstype,
            self.options_string()
        )
    }
}

/// How a unit that is already running picks up new configuration.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Refresh {
    /// `ReloadUnit`: the service re-reads its configuration in place.
    Reload,
    /// `RestartUnit`: stop and start again.
    Restart,
}

impl Refresh {
    pub fn op(self) -> UnitOp {
        match self {
            Refresh::Reload => UnitOp::Reload,
            Refresh::Restart => UnitOp::Restart,
        }
    }
}

/// Desired state of a systemd unit. `None` fields are left as found.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServiceUnit {
    #[serde(rename = "unit")]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active: Option<bool>,
    #[serde(default)]
    pub daemon_reload: bool,
    /// Refresh the unit on every run in which it is found running.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh: Option<Refresh>,
}

impl ServiceUnit {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            enabled: None,
            active: None,
            daemon_reload: false,
            refresh: None,
        }
    }

    #[must_use]
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = Some(enabled);
        self
    }

    #[must_use]
    pub fn active(mut self, active: bool) -> Self {
        self.active = Some(active);
        self
    }

    #[must_use]
    pub fn refresh(mut self, refresh: Refresh) -> Self {
        self.refresh = Some(refresh);
        self
    }

    /// Full unit name as systemd knows it (`nfs-server` -> `nfs-server.service`).
    pub fn unit_name(&self) -> String {
        normalize_unit_name(&self.name)
    }
}

impl fmt::Display for ServiceUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut wants = Vec::new();
        match self.enabled {
            Some(true) => wants.push("enabled"),
            Some(false) => wants.push("disabled"),
            None => {}
        }
        match self.active {
            Some(true) => wants.push("active"),
            Some(false) => wants.push("inactive"),
            None => {}
        }
        match self.refresh {
            Some(Refresh::Reload) => wants.push("reloaded"),
            Some(Refresh::Restart) => wants.push("restarted"),
            None => {}
        }
        if wants.is_empty() {
            write!(f, "{}", self.unit_name())
        } else {
            write!(f, "{} ({})", self.unit_name(), wants.join(", "))
        }
    }
}

pub fn normalize_unit_name(name: &str) -> String {
    let name = name.trim();
    if UNIT_SUFFIXES.iter().any(|s| name.ends_with(s)) {
        name.to_owned()
    } else {
        format!("{name}.service")
    }
}

/// What a step does to the host.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum StepAction {
    Mount(MountSpec),
    Service(ServiceUnit),
}

impl StepAction {
    pub fn kind(&self) -> &'static str {
        match self {
            StepAction::Mount(_) => "mount",
            StepAction::Service(_) => "service",
        }
    }
}

impl From<MountSpec> for StepAction {
    fn from(spec: MountSpec) -> Self {
        StepAction::Mount(spec)
    }
}

impl From<ServiceUnit> for StepAction {
    fn from(unit: ServiceUnit) -> Self {
        StepAction::Service(unit)
    }
}

impl fmt::Display for StepAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepAction::Mount(spec) => write!(f, "mount {spec}"),
            StepAction::Service(unit) => write!(f, "service {unit}"),
        }
    }
}
