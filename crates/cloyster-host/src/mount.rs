use crate::HostError;
use cloyster_schema::{Change, MountSpec};
use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Options that only steer mount(8) or fstab processing and never show up
/// in the kernel mount table.
const USERSPACE_OPTIONS: &[&str] = &[
    "defaults", "auto", "noauto", "nofail", "_netdev", "user", "nouser", "users", "owner",
    "group", "bg", "fg",
];

/// One line of the live mount table.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct MountEntry {
    pub source: String,
    pub target: PathBuf,
    pub fstype: String,
    pub options: Vec<String>,
}

impl MountEntry {
    pub fn from_spec(spec: &MountSpec) -> Self {
        Self {
            source: spec.source.clone(),
            target: spec.target.clone(),
            fstype: spec.fstype.clone(),
            options: spec.options.clone(),
        }
    }

    /// Whether this mounted filesystem is what `spec` asks for.
    ///
    /// The kernel expands option lists, so every requested option must be
    /// present but extra observed options are fine. Bind mounts report the
    /// backing device as source, so they match on target alone.
    pub fn satisfies(&self, spec: &MountSpec) -> bool {
        if !same_target(&self.target, &spec.target) {
            return false;
        }
        if spec.is_bind() {
            return true;
        }
        if !source_matches(&self.source, &spec.source) {
            return false;
        }
        if spec.fstype != "auto" && self.fstype != spec.fstype {
            return false;
        }
        spec.options
            .iter()
            .filter(|o| !is_userspace_option(o))
            .all(|o| self.options.iter().any(|have| option_matches(have, o)))
    }
}

impl fmt::Display for MountEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} on {} type {} ({})",
            self.source,
            self.target.display(),
            self.fstype,
            self.options.join(",")
        )
    }
}

fn is_userspace_option(option: &str) -> bool {
    USERSPACE_OPTIONS.contains(&option)
        || option.starts_with("x-")
        || option.starts_with("comment=")
}

/// Source tags mount(8) resolves through udev links.
const SOURCE_TAGS: &[(&str, &str)] = &[
    ("UUID=", "/dev/disk/by-uuid"),
    ("LABEL=", "/dev/disk/by-label"),
    ("PARTUUID=", "/dev/disk/by-partuuid"),
    ("PARTLABEL=", "/dev/disk/by-partlabel"),
];

/// The mount table lists canonical paths, so a symlinked target in the
/// plan still names the same mount point.
fn same_target(observed: &Path, requested: &Path) -> bool {
    observed == requested || std::fs::canonicalize(requested).is_ok_and(|p| p == observed)
}

fn source_matches(observed: &str, requested: &str) -> bool {
    if observed == requested {
        return true;
    }
    let device = SOURCE_TAGS
        .iter()
        .find_map(|(tag, dir)| requested.strip_prefix(tag).map(|v| Path::new(dir).join(v)));
    let device = match device {
        Some(device) => device,
        // /dev/disk/by-*/ links and LVM paths resolve to the node the kernel reports.
        None if requested.starts_with('/') => PathBuf::from(requested),
        None => return false,
    };
    let Ok(resolved) = std::fs::canonicalize(device) else {
        return false;
    };
    Path::new(observed) == resolved
        || std::fs::canonicalize(observed).is_ok_and(|node| node == resolved)
}

/// `size=1G` comes back from the kernel as `size=1048576k`; sizes compare
/// by value and percentages only by key.
fn option_matches(observed: &str, requested: &str) -> bool {
    if observed == requested {
        return true;
    }
    let (Some((have_key, have)), Some((want_key, want))) =
        (observed.split_once('='), requested.split_once('='))
    else {
        return false;
    };
    if have_key != want_key {
        return false;
    }
    if want.ends_with('%') {
        return true;
    }
    matches!((parse_size(have), parse_size(want)), (Some(a), Some(b)) if a == b)
}

/// Byte count of a mount option size such as `512m` or `1048576k`.
fn parse_size(value: &str) -> Option<u64> {
    let split = value
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(value.len());
    let (digits, unit) = value.split_at(split);
    let count: u64 = digits.parse().ok()?;
    let shift = match unit {
        "" => 0,
        "k" | "K" => 10,
        "m" | "M" => 20,
        "g" | "G" => 30,
        "t" | "T" => 40,
        _ => return None,
    };
    count.checked_mul(1 << shift)
}

/// Access to the mount table of the host.
///
/// Implementations must read live state on every call; callers rely on
/// `find` reflecting changes made by other processes.
pub trait MountTable: Send + Sync {
    fn name(&self) -> &str;

    /// The topmost filesystem mounted at `target`, if any.
    fn find(&self, target: &Path) -> Result<Option<MountEntry>, HostError>;

    fn mount(&self, spec: &MountSpec) -> Result<(), HostError>;

    fn unmount(&self, target: &Path) -> Result<(), HostError>;
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "status", content = "observed", rename_all = "snake_case")]
pub enum MountStatus {
    Absent,
    Matching,
    Conflicting(MountEntry),
}

/// Idempotent mount operations keyed by mount point.
#[derive(Clone)]
pub struct MountManager {
    table: Arc<dyn MountTable>,
}

impl MountManager {
    pub fn new(table: Arc<dyn MountTable>) -> Self {
        Self { table }
    }

    pub fn backend_name(&self) -> &str {
        self.table.name()
    }

    /// Compare the live table against `spec` without touching it.
    pub fn inspect(&self, spec: &MountSpec) -> Result<MountStatus, HostError> {
        Ok(match self.table.find(&spec.target)? {
            None => MountStatus::Absent,
            Some(entry) if entry.satisfies(spec) => MountStatus::Matching,
            Some(entry) => MountStatus::Conflicting(entry),
        })
    }

    /// Make sure `spec` is mounted. A matching mount is left alone; a
    /// different filesystem at the same target is a conflict and is never
    /// replaced.
    pub fn mount(&self, spec: &MountSpec) -> Result<Change, HostError> {
        match self.inspect(spec)? {
            MountStatus::Matching => {
                debug!("{} already mounted as requested", spec.target.display());
                return Ok(Change::Mount { mounted: false });
            }
            MountStatus::Conflicting(observed) => {
                return Err(HostError::Conflict {
                    target: spec.target.clone(),
                    observed: observed.to_string(),
                    requested: spec.to_string(),
                });
            }
            MountStatus::Absent => {}
        }

        info!("mounting {spec}");
        self.table.mount(spec)?;

        let reason = match self.inspect(spec) {
            Ok(MountStatus::Matching) => return Ok(Change::Mount { mounted: true }),
            Ok(MountStatus::Conflicting(observed)) => {
                format!("mount table shows {observed} instead of the requested filesystem")
            }
            Ok(MountStatus::Absent) => "mount(8) succeeded but nothing is mounted".to_owned(),
            Err(e) => format!("cannot verify the new mount: {e}"),
        };
        // The target was empty before, so whatever is there now is ours.
        warn!("{}: {reason}; unmounting it again", spec.target.display());
        if let Err(e) = self.unmount(&spec.target) {
            error!(
                "{} stays mounted after a failed verification: {e}",
                spec.target.display()
            );
            return Err(HostError::MountFailed {
                target: spec.target.clone(),
                reason: format!("{reason}; unmounting it again failed: {e}"),
            });
        }
        Err(HostError::MountFailed {
            target: spec.target.clone(),
            reason,
        })
    }

    /// Unmount whatever is at `target`. Returns `false` if nothing was mounted.
    pub fn unmount(&self, target: &Path) -> Result<bool, HostError> {
        if self.table.find(target)?.is_none() {
            debug!("{} not mounted, nothing to unmount", target.display());
            return Ok(false);
        }
        info!("unmounting {}", target.display());
        self.table.unmount(target)?;
        Ok(true)
    }

    /// Undo a previous [`mount`](Self::mount). Only a mount this process made
    /// is removed, and only while it still matches `spec`.
    pub fn revert(&self, spec: &MountSpec, change: &Change) -> Result<(), HostError> {
        if !matches!(change, Change::Mount { mounted: true }) {
            return Ok(());
        }
        match self.inspect(spec)? {
            MountStatus::Absent => Ok(()),
            MountStatus::Matching => self.unmount(&spec.target).map(|_| ()),
            MountStatus::Conflicting(observed) => {
                warn!(
                    "{} now holds {observed}; leaving it in place",
                    spec.target.display()
                );
                Ok(())
            }
        }
    }
}
