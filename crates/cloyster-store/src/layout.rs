use crate::StoreError;
use std::fs;
use std::path::{Path, PathBuf};

/// Directory layout of the Cloyster state directory.
///
/// ```text
/// <root>/run.lock        exclusive lock held for the duration of a run
/// <root>/runs/<id>.json  one run log per invocation
/// ```
#[derive(Debug, Clone)]
pub struct StateLayout {
    root: PathBuf,
}

impl StateLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[inline]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[inline]
    pub fn runs_dir(&self) -> PathBuf {
        self.root.join("runs")
    }

    #[inline]
    pub fn run_path(&self, run_id: &str) -> PathBuf {
        self.runs_dir().join(format!("{run_id}.json"))
    }

    #[inline]
    pub fn lock_file(&self) -> PathBuf {
        self.root.join("run.lock")
    }

    pub fn initialize(&self) -> Result<(), StoreError> {
        fs::create_dir_all(self.runs_dir())?;
        Ok(())
    }
}

/// Whether `run_id` has the `YYYYMMDDHHMMSSmmm-xxxxxxxx` shape of ids
/// handed out by [`RunLogStore::create`](crate::RunLogStore::create).
pub fn is_valid_run_id(run_id: &str) -> bool {
    let Some((stamp, hash)) = run_id.split_once('-') else {
        return false;
    };
    stamp.len() == 17
        && stamp.bytes().all(|b| b.is_ascii_digit())
        && hash.len() == 8
        && hash.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_paths_are_correct() {
        let layout = StateLayout::new("/var/lib/cloyster");
        assert_eq!(layout.runs_dir(), PathBuf::from("/var/lib/cloyster/runs"));
        assert_eq!(
            layout.run_path("20260101000000000-deadbeef"),
            PathBuf::from("/var/lib/cloyster/runs/20260101000000000-deadbeef.json")
        );
        assert_eq!(layout.lock_file(), PathBuf::from("/var/lib/cloyster/run.lock"));
    }

    #[test]
    fn run_id_shape() {
        assert!(is_valid_run_id("20260101000000000-deadbeef"));
        assert!(!is_valid_run_id("../../etc/passwd"));
        assert!(!is_valid_run_id("20260101000000000-../x"));
        assert!(!is_valid_run_id("20260101000000000-DEADBEEF"));
        assert!(!is_valid_run_id("2026-deadbeef"));
        assert!(!is_valid_run_id(""));
    }

    #[test]
    fn initialize_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let layout = StateLayout::new(dir.path());
        layout.initialize().unwrap();
        layout.initialize().unwrap();
        assert!(layout.runs_dir().is_dir());
    }
}
