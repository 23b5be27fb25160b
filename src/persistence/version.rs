//! Opaque version tokens for optimistic concurrency (§4.1).
//!
//! A token is a surrogate for file content identity: modification time plus
//! byte length. It is cheap to compute, never parsed by callers, and only
//! ever compared for equality against a token read moments earlier.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{AnimaError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Version {
    mtime_nanos: i128,
    len: u64,
}

impl Version {
    /// The token for a file that does not yet exist.
    pub fn absent() -> Self {
        Self {
            mtime_nanos: -1,
            len: 0,
        }
    }

    /// Read the current token for a path. Returns `absent()` if the file
    /// does not exist.
    pub fn of_path(path: &Path) -> Result<Self> {
        match std::fs::metadata(path) {
            Ok(meta) => {
                let mtime_nanos = meta
                    .modified()
                    .ok()
                    .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                    .map(|d| d.as_nanos() as i128)
                    .unwrap_or(0);
                Ok(Self {
                    mtime_nanos,
                    len: meta.len(),
                })
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::absent()),
            Err(source) => Err(AnimaError::PersistenceIo {
                path: path.display().to_string(),
                source,
            }),
        }
    }

    pub fn is_absent(&self) -> bool {
        self.mtime_nanos < 0
    }

    /// Build a token from a plain counter, for stores that don't back onto
    /// a real filesystem (e.g. the in-memory test double).
    pub fn from_counter(n: u64) -> Self {
        Self {
            mtime_nanos: n as i128,
            len: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn absent_file_yields_absent_token() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nope.json");
        let version = Version::of_path(&path).unwrap();
        assert!(version.is_absent());
    }

    #[test]
    fn writing_different_content_changes_token() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f.json");
        std::fs::write(&path, b"{}").unwrap();
        let v1 = Version::of_path(&path).unwrap();

        std::thread::sleep(std::time::Duration::from_millis(5));
        let mut file = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
        file.write_all(b"{\"a\":1}").unwrap();
        drop(file);
        let v2 = Version::of_path(&path).unwrap();

        assert_ne!(v1, v2);
    }

    #[test]
    fn same_content_same_len_same_mtime_is_equal_token() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f.json");
        std::fs::write(&path, b"{}").unwrap();
        let v1 = Version::of_path(&path).unwrap();
        let v2 = Version::of_path(&path).unwrap();
        assert_eq!(v1, v2);
    }
}
