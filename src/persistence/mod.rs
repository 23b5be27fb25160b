//! On-disk project state: the `.anima/` directory tree (§3, §4.1).

pub mod lock;
pub mod models;
pub mod store;
pub mod version;

pub use lock::{ProjectLock, ProjectLockGuard};
pub use models::{
    AppConfig, InboxItem, InboxItemType, InboxPriority, InboxSource, InboxStatus, Milestone,
    MilestoneOrder, MilestoneStatus, ProjectConfig, ProjectRegistration, ProjectState, ProjectStatus,
    WakeSchedule,
};
pub use store::{FsPersistenceStore, LockGuard, MockPersistenceStore, PersistenceStore, Versioned};
pub use version::Version;

use std::path::{Path, PathBuf};

/// The `.anima` directory that lives at the root of a registered project.
pub fn anima_dir(project_path: &Path) -> PathBuf {
    project_path.join(".anima")
}
