//! Advisory per-project locking (§4.1).
//!
//! A single exclusive advisory lock file at `.anima/.lock` serializes all
//! writes within one project across threads and processes. Reads never take
//! the lock; only the read-modify-write sequence inside
//! `PersistenceStore::with_project_lock` does.

use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use crate::error::{AnimaError, Result};

/// A held exclusive lock on a project's `.anima/.lock` file. The lock is
/// released when this guard drops.
pub struct ProjectLockGuard {
    file: File,
    path: PathBuf,
}

impl Drop for ProjectLockGuard {
    fn drop(&mut self) {
        let _ = fs2::FileExt::unlock(&self.file);
    }
}

/// Handle to a project's lock file. Cheap to clone logically (it's really
/// just a path); acquiring blocks the calling thread.
#[derive(Debug, Clone)]
pub struct ProjectLock {
    path: PathBuf,
}

impl ProjectLock {
    /// `anima_dir` is the project's `.anima` directory.
    pub fn new(anima_dir: &Path) -> Self {
        Self {
            path: anima_dir.join(".lock"),
        }
    }

    /// Acquire the exclusive lock, blocking the current thread. Intended to
    /// be called via `tokio::task::spawn_blocking` from async contexts.
    pub fn acquire_blocking(&self) -> Result<ProjectLockGuard> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(&self.path)
            .map_err(|source| AnimaError::PersistenceIo {
                path: self.path.display().to_string(),
                source,
            })?;
        file.lock_exclusive().map_err(|source| AnimaError::PersistenceIo {
            path: self.path.display().to_string(),
            source,
        })?;
        Ok(ProjectLockGuard {
            file,
            path: self.path.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_creates_lock_file_and_releases_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let lock = ProjectLock::new(dir.path());
        {
            let _guard = lock.acquire_blocking().unwrap();
            assert!(dir.path().join(".lock").exists());
        }
        // Reacquiring after drop must not block.
        let _guard2 = lock.acquire_blocking().unwrap();
    }

    #[test]
    fn second_exclusive_attempt_from_same_process_blocks_until_drop() {
        let dir = tempfile::tempdir().unwrap();
        let lock = ProjectLock::new(dir.path());
        let guard = lock.acquire_blocking().unwrap();

        // try_lock via a second independent file handle should fail while held.
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(&lock.path)
            .unwrap();
        assert!(file.try_lock_exclusive().is_err());

        drop(guard);
        assert!(file.try_lock_exclusive().is_ok());
    }
}
