use crate::action::StepAction;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use thiserror::Error;

/// Plan file format version understood by this build.
pub const PLAN_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum PlanError {
    #[error("failed to read plan file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse plan file: {0}")]
    ParseToml(#[from] toml::de::Error),
    #[error("unsupported plan_version: {0}, expected {PLAN_VERSION}")]
    UnsupportedVersion(u32),
    #[error("plan declares no steps")]
    Empty,
    #[error("step id must not be empty")]
    EmptyStepId,
    #[error("invalid step id '{0}': ids may not contain whitespace")]
    InvalidStepId(String),
    #[error("step '{step}': mount target must be an absolute path, got '{target}'")]
    RelativeMountTarget { step: String, target: String },
    #[error("step '{step}': mount {field} must not be empty")]
    EmptyMountField { step: String, field: &'static str },
    #[error("step '{0}': unit name must not be empty")]
    EmptyUnitName(String),
    #[error("step '{0}': service step declares no desired state (set enabled, active, refresh or daemon_reload)")]
    NoDesiredState(String),
    #[error("step '{step}': unknown key '{key}'")]
    UnknownStepKey { step: String, key: String },
}

const COMMON_STEP_KEYS: &[&str] = &["id", "kind", "depends_on"];
const MOUNT_STEP_KEYS: &[&str] = &["source", "target", "fstype", "options"];
const SERVICE_STEP_KEYS: &[&str] = &["unit", "enabled", "active", "daemon_reload", "refresh"];

/// One `[[step]]` table of a plan file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StepSpec {
    pub id: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(flatten)]
    pub action: StepAction,
}

/// A provisioning plan: the ordered list of configuration steps for a host.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct PlanFile {
    pub plan_version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, rename = "step")]
    pub steps: Vec<StepSpec>,
}

impl PlanFile {
    /// Structural validation of individual steps. Cross-step checks
    /// (duplicates, dependencies, cycles) belong to the step registry.
    pub fn validate(&self) -> Result<(), PlanError> {
        if self.plan_version != PLAN_VERSION {
            return Err(PlanError::UnsupportedVersion(self.plan_version));
        }
        if self.steps.is_empty() {
            return Err(PlanError::Empty);
        }
        for step in &self.steps {
            validate_step(step)?;
        }
        Ok(())
    }

    pub fn step_ids(&self) -> HashSet<&str> {
        self.steps.iter().map(|s| s.id.as_str()).collect()
    }
}

fn validate_step(step: &StepSpec) -> Result<(), PlanError> {
    if step.id.is_empty() {
        return Err(PlanError::EmptyStepId);
    }
    if step.id.chars().any(char::is_whitespace) {
        return Err(PlanError::InvalidStepId(step.id.clone()));
    }
    match &step.action {
        StepAction::Mount(spec) => {
            if !spec.target.is_absolute() {
                return Err(PlanError::RelativeMountTarget {
                    step: step.id.clone(),
                    target: spec.target.display().to_string(),
                });
            }
            if spec.source.trim().is_empty() {
                return Err(PlanError::EmptyMountField {
                    step: step.id.clone(),
                    field: "source",
                });
            }
            if spec.fstype.trim().is_empty() {
                return Err(PlanError::EmptyMountField {
                    step: step.id.clone(),
                    field: "fstype",
                });
            }
        }
        StepAction::Service(unit) => {
            if unit.name.trim().is_empty() {
                return Err(PlanError::EmptyUnitName(step.id.clone()));
            }
            if unit.enabled.is_none()
                && unit.active.is_none()
                && unit.refresh.is_none()
                && !unit.daemon_reload
            {
                return Err(PlanError::NoDesiredState(step.id.clone()));
            }
        }
    }
    Ok(())
}

/// Step tables are flattened into their action, which makes serde accept
/// any key. Check them by kind so a typo such as `enable = true` is an
/// error instead of a silently dropped desired state. Steps with a missing
/// or unknown kind are left for deserialization to report.
fn check_step_keys(raw: &toml::Table) -> Result<(), PlanError> {
    let Some(steps) = raw.get("step").and_then(toml::Value::as_array) else {
        return Ok(());
    };
    for table in steps.iter().filter_map(toml::Value::as_table) {
        let kind_keys = match table.get("kind").and_then(toml::Value::as_str) {
            Some("mount") => MOUNT_STEP_KEYS,
            Some("service") => SERVICE_STEP_KEYS,
            _ => continue,
        };
        let unknown = table.keys().find(|key| {
            !COMMON_STEP_KEYS.contains(&key.as_str()) && !kind_keys.contains(&key.as_str())
        });
        if let Some(key) = unknown {
            let step = table
                .get("id")
                .and_then(toml::Value::as_str)
                .unwrap_or("<unnamed>");
            return Err(PlanError::UnknownStepKey {
                step: step.to_owned(),
                key: key.clone(),
            });
        }
    }
    Ok(())
}

pub fn parse_plan_str(input: &str) -> Result<PlanFile, PlanError> {
    let raw: toml::Table = toml::from_str(input)?;
    check_step_keys(&raw)?;
    let plan: PlanFile = toml::Value::Table(raw).try_into()?;
    plan.validate()?;
    Ok(plan)
}

pub fn parse_plan_file(path: impl AsRef<Path>) -> Result<PlanFile, PlanError> {
    let content = fs::read_to_string(path)?;
    parse_plan_str(&content)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{MountSpec, ServiceUnit};
    use std::path::PathBuf;

    const HEADNODE_PLAN: &str = r#"
plan_version = 1
description = "head node services"

[[step]]
id = "data"
kind = "mount"
source = "/dev/vg0/data"
target = "/data"
fstype = "xfs"
options = ["noatime"]

[[step]]
id = "nfs"
kind = "service"
depends_on = ["data"]
unit = "nfs-server"
enabled = true
active = true

[[step]]
id = "firewall-off"
kind = "service"
unit = "firewalld.service"
active = false
"#;

    #[test]
    fn parses_full_plan() {
        let plan = parse_plan_str(HEADNODE_PLAN).expect("should parse");
        assert_eq!(plan.plan_version, 1);
        assert_eq!(plan.steps.len(), 3);
        assert_eq!(
            plan.steps[0].action,
            StepAction::Mount(MountSpec {
                source: "/dev/vg0/data".to_owned(),
                target: PathBuf::from("/data"),
                fstype: "xfs".to_owned(),
                options: vec!["noatime".to_owned()],
            })
        );
        assert_eq!(plan.steps[1].depends_on, vec!["data".to_owned()]);
        assert_eq!(
            plan.steps[1].action,
            StepAction::Service(ServiceUnit::new("nfs-server").enabled(true).active(true))
        );
        let StepAction::Service(unit) = &plan.steps[2].action else {
            panic!("expected service step");
        };
        assert_eq!(unit.enabled, None);
        assert_eq!(unit.active, Some(false));
    }

    #[test]
    fn rejects_unknown_version() {
        let input = r#"
plan_version = 7
[[step]]
id = "a"
kind = "service"
unit = "sshd"
enabled = true
"#;
        assert!(matches!(
            parse_plan_str(input),
            Err(PlanError::UnsupportedVersion(7))
        ));
    }

    #[test]
    fn rejects_empty_plan() {
        assert!(matches!(
            parse_plan_str("plan_version = 1\n"),
            Err(PlanError::Empty)
        ));
    }

    #[test]
    fn rejects_unknown_kind() {
        let input = r#"
plan_version = 1
[[step]]
id = "a"
kind = "package"
name = "vim"
"#;
        assert!(matches!(parse_plan_str(input), Err(PlanError::ParseToml(_))));
    }

    #[test]
    fn rejects_relative_mount_target() {
        let input = r#"
plan_version = 1
[[step]]
id = "scratch"
kind = "mount"
source = "tmpfs"
target = "scratch"
fstype = "tmpfs"
"#;
        assert!(matches!(
            parse_plan_str(input),
            Err(PlanError::RelativeMountTarget { .. })
        ));
    }

    #[test]
    fn rejects_service_without_desired_state() {
        let input = r#"
plan_version = 1
[[step]]
id = "noop"
kind = "service"
unit = "sshd"
"#;
        assert!(matches!(
            parse_plan_str(input),
            Err(PlanError::NoDesiredState(id)) if id == "noop"
        ));
    }

    #[test]
    fn rejects_misspelled_service_key() {
        let input = r#"
plan_version = 1
[[step]]
id = "nfs"
kind = "service"
unit = "nfs-server"
active = true
enable = true
"#;
        assert!(matches!(
            parse_plan_str(input),
            Err(PlanError::UnknownStepKey { step, key }) if step == "nfs" && key == "enable"
        ));
    }

    #[test]
    fn rejects_keys_of_the_other_kind() {
        let input = r#"
plan_version = 1
[[step]]
id = "data"
kind = "mount"
source = "/dev/sdb1"
target = "/data"
fstype = "xfs"
active = true
"#;
        assert!(matches!(
            parse_plan_str(input),
            Err(PlanError::UnknownStepKey { key, .. }) if key == "active"
        ));
    }

    #[test]
    fn rejects_unknown_top_level_key() {
        let input = r#"
plan_version = 1
descripton = "typo"
[[step]]
id = "a"
kind = "service"
unit = "sshd"
enabled = true
"#;
        assert!(matches!(parse_plan_str(input), Err(PlanError::ParseToml(_))));
    }

    #[test]
    fn refresh_alone_is_a_desired_state() {
        let input = r#"
plan_version = 1
[[step]]
id = "named"
kind = "service"
unit = "named"
refresh = "reload"
"#;
        let plan = parse_plan_str(input).unwrap();
        let StepAction::Service(unit) = &plan.steps[0].action else {
            panic!("expected service step");
        };
        assert_eq!(unit.refresh, Some(crate::action::Refresh::Reload));
    }

    #[test]
    fn rejects_whitespace_in_id() {
        let input = r#"
plan_version = 1
[[step]]
id = "two words"
kind = "service"
unit = "sshd"
enabled = true
"#;
        assert!(matches!(
            parse_plan_str(input),
            Err(PlanError::InvalidStepId(_))
        ));
    }

    #[test]
    fn parse_plan_file_reads_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("headnode.toml");
        fs::write(&path, HEADNODE_PLAN).unwrap();
        let plan = parse_plan_file(&path).unwrap();
        assert_eq!(plan.step_ids().len(), 3);
    }

    #[test]
    fn missing_plan_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            parse_plan_file(dir.path().join("absent.toml")),
            Err(PlanError::Io(_))
        ));
    }
}
