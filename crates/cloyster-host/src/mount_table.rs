use crate::mount::{MountEntry, MountTable};
use crate::HostError;
use cloyster_schema::MountSpec;
use std::ffi::OsStr;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use tracing::debug;

const PROC_MOUNTS: &str = "/proc/self/mounts";

/// The live kernel mount table, changed through mount(8) and umount(8).
pub struct HostMountTable {
    mounts_path: PathBuf,
}

impl Default for HostMountTable {
    fn default() -> Self {
        Self {
            mounts_path: PathBuf::from(PROC_MOUNTS),
        }
    }
}

impl HostMountTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read mounts from another file in `/proc/mounts` format.
    pub fn with_mounts_path(path: impl Into<PathBuf>) -> Self {
        Self {
            mounts_path: path.into(),
        }
    }

    pub fn entries(&self) -> Result<Vec<MountEntry>, HostError> {
        let content = std::fs::read_to_string(&self.mounts_path)?;
        Ok(parse_mounts(&content))
    }
}

impl MountTable for HostMountTable {
    fn name(&self) -> &str {
        "host"
    }

    fn find(&self, target: &Path) -> Result<Option<MountEntry>, HostError> {
        let wanted = match std::fs::canonicalize(target) {
            Ok(p) => p,
            Err(_) => target.to_path_buf(),
        };
        // Later lines are stacked on top of earlier ones.
        Ok(self
            .entries()?
            .into_iter()
            .rev()
            .find(|e| e.target == wanted))
    }

    fn mount(&self, spec: &MountSpec) -> Result<(), HostError> {
        if !spec.is_bind() || Path::new(&spec.source).is_dir() {
            std::fs::create_dir_all(&spec.target)?;
        }
        let options = spec.options_string();
        debug!("mount -t {} -o {options} {}", spec.fstype, spec.source);
        let output = detached("mount")
            .arg("-t")
            .arg(&spec.fstype)
            .arg("-o")
            .arg(&options)
            .arg(&spec.source)
            .arg(&spec.target)
            .output()
            .map_err(|e| HostError::MountFailed {
                target: spec.target.clone(),
                reason: format!("failed to run mount: {e}"),
            })?;
        if !output.status.success() {
            return Err(HostError::MountFailed {
                target: spec.target.clone(),
                reason: failure_reason(&output),
            });
        }
        Ok(())
    }

    fn unmount(&self, target: &Path) -> Result<(), HostError> {
        debug!("umount {}", target.display());
        let output = detached("umount")
            .arg(target)
            .output()
            .map_err(|e| HostError::UnmountFailed {
                target: target.to_path_buf(),
                reason: format!("failed to run umount: {e}"),
            })?;
        if !output.status.success() {
            return Err(HostError::UnmountFailed {
                target: target.to_path_buf(),
                reason: failure_reason(&output),
            });
        }
        Ok(())
    }
}

/// A command in its own process group, so a terminal Ctrl-C aimed at the
/// orchestrator does not kill a mount that is already in flight.
fn detached(program: impl AsRef<OsStr>) -> Command {
    let mut cmd = Command::new(program);
    cmd.process_group(0);
    cmd
}

fn failure_reason(output: &Output) -> String {
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_owned();
    if stderr.is_empty() {
        format!("exited with {}", output.status)
    } else {
        stderr
    }
}

/// Parse `/proc/mounts` content. Malformed lines are skipped.
pub fn parse_mounts(content: &str) -> Vec<MountEntry> {
    content
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let source = fields.next()?;
            let target = fields.next()?;
            let fstype = fields.next()?;
            let options = fields.next()?;
            Some(MountEntry {
                source: unescape(source),
                target: PathBuf::from(unescape(target)),
                fstype: fstype.to_owned(),
                options: options.split(',').map(str::to_owned).collect(),
            })
        })
        .collect()
}

/// Decode the octal escapes the kernel uses for space, tab, newline and
/// backslash in mount fields.
fn unescape(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() {
            let decoded = std::str::from_utf8(&bytes[i + 1..i + 4])
                .ok()
                .and_then(|digits| u8::from_str_radix(digits, 8).ok());
            if let Some(value) = decoded {
                out.push(value);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}
