//! Shared error taxonomy
//!
//! Every fallible operation in the core eventually resolves to one of these
//! kinds. The kind determines how the caller recovers (§7): some are retried
//! locally, some suspend a project, some are fatal to a milestone.

use thiserror::Error;

/// Uniform error kind carried by every core subsystem.
#[derive(Debug, Error)]
pub enum AnimaError {
    /// Non-zero exit, dead session, or timeout for a single round.
    /// Recovered locally by incrementing the rejection counter.
    #[error("agent round failed: {0}")]
    TransientAgent(String),

    /// Rate-limit or quota exhaustion. Recovered by suspending into
    /// `rate_limited` with a timer.
    #[error("quota signal: {0}")]
    Quota(String),

    /// Optimistic-concurrency conflict on a state write.
    /// Recovered by re-reading and reapplying.
    #[error("stale version token for {path}")]
    PersistenceStale {
        /// Path of the file whose version token was stale.
        path: String,
    },

    /// Disk full, permission denied, lock unavailable.
    /// Surfaced to the Supervisor; the project is forced to `paused`.
    #[error("persistence I/O error on {path}: {source}")]
    PersistenceIo {
        /// Path the failing I/O operation targeted.
        path: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// A version-control command exited non-zero.
    #[error("version control command failed: {command} (exit {exit_code:?}): {stderr}")]
    VersionControl {
        /// The command line that failed, for diagnostics.
        command: String,
        /// Process exit code, if the process actually ran and exited.
        exit_code: Option<i32>,
        /// Captured standard error.
        stderr: String,
    },

    /// Malformed JSON on disk. The offending file is quarantined.
    #[error("corrupt state file {path}: {reason}")]
    CorruptState {
        /// Path of the quarantined file.
        path: String,
        /// Parse failure reason.
        reason: String,
    },

    /// Unreachable invariant violation (e.g. missing `baseCommit` on resume).
    /// The engine rolls back and fails the milestone.
    #[error("fatal engine invariant violated: {0}")]
    FatalEngine(String),
}

impl AnimaError {
    /// Stable machine-readable kind, used as the event-bus error tag (§7).
    pub fn kind(&self) -> &'static str {
        match self {
            AnimaError::TransientAgent(_) => "transient_agent",
            AnimaError::Quota(_) => "quota",
            AnimaError::PersistenceStale { .. } => "persistence_stale",
            AnimaError::PersistenceIo { .. } => "persistence_io",
            AnimaError::VersionControl { .. } => "version_control",
            AnimaError::CorruptState { .. } => "corrupt_state",
            AnimaError::FatalEngine(_) => "fatal_engine",
        }
    }
}

pub type Result<T> = std::result::Result<T, AnimaError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_is_stable_per_variant() {
        assert_eq!(AnimaError::TransientAgent("x".into()).kind(), "transient_agent");
        assert_eq!(AnimaError::Quota("x".into()).kind(), "quota");
        assert_eq!(
            AnimaError::PersistenceStale { path: "p".into() }.kind(),
            "persistence_stale"
        );
        assert_eq!(AnimaError::FatalEngine("x".into()).kind(), "fatal_engine");
    }
}
