use crate::CoreError;
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Exclusive lock on the state directory, held for the duration of a run.
/// Released when dropped.
pub struct RunLock {
    lock_file: File,
}

impl RunLock {
    /// Take the lock or fail immediately with [`CoreError::RunLocked`].
    pub fn acquire(lock_path: &Path) -> Result<Self, CoreError> {
        match Self::try_acquire(lock_path)? {
            Some(lock) => Ok(lock),
            None => Err(CoreError::RunLocked(lock_path.to_path_buf())),
        }
    }

    pub fn try_acquire(lock_path: &Path) -> Result<Option<Self>, CoreError> {
        if let Some(parent) = lock_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(lock_path)?;

        match file.try_lock_exclusive() {
            Ok(()) => {
                debug!("run lock acquired: {}", lock_path.display());
                Ok(Some(Self { lock_file: file }))
            }
            Err(_) => Ok(None),
        }
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        let _ = self.lock_file.unlock();
    }
}

static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);

/// Shared cancellation flag, checked by the orchestrator between steps.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    follow_signals: bool,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// A token that also trips once SIGINT or SIGTERM arrived; see
    /// [`install_signal_handler`].
    pub fn from_signals() -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            follow_signals: true,
        }
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
            || (self.follow_signals && SHUTDOWN_REQUESTED.load(Ordering::SeqCst))
    }
}

/// Route SIGINT and SIGTERM to a graceful stop at the next step boundary.
/// A second signal exits the process immediately.
pub fn install_signal_handler() {
    let _ = ctrlc::set_handler(move || {
        if SHUTDOWN_REQUESTED.load(Ordering::SeqCst) {
            std::process::exit(130);
        }
        SHUTDOWN_REQUESTED.store(true, Ordering::SeqCst);
        eprintln!("\ncancel requested, stopping after the current step and rolling back...");
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_acquire_and_release() {
        let dir = tempfile::tempdir().unwrap();
        let lock_path = dir.path().join("state").join("run.lock");

        {
            let _lock = RunLock::acquire(&lock_path).unwrap();
            assert!(lock_path.exists());
        }
        assert!(RunLock::try_acquire(&lock_path).unwrap().is_some());
    }

    #[test]
    fn second_acquire_fails_fast() {
        let dir = tempfile::tempdir().unwrap();
        let lock_path = dir.path().join("run.lock");

        let _lock = RunLock::acquire(&lock_path).unwrap();
        assert!(RunLock::try_acquire(&lock_path).unwrap().is_none());
        assert!(matches!(
            RunLock::acquire(&lock_path),
            Err(CoreError::RunLocked(p)) if p == lock_path
        ));
    }

    #[test]
    fn cancel_is_shared_between_clones() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(!clone.is_cancelled());
        token.cancel();
        assert!(clone.is_cancelled());
    }
}
