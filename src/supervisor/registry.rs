//! In-memory handle to one registered, running project (§4, §4.8).

use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

use crate::iteration::EngineSignal;
use crate::persistence::{PersistenceStore, ProjectStatus};
use crate::scheduler::SchedulerSignal;

/// Everything the Supervisor needs to route control signals and query
/// status for one registered project, without re-reading the registry file.
pub struct ProjectHandle {
    pub id: Uuid,
    pub path: PathBuf,
    pub display_name: String,
    pub store: Arc<dyn PersistenceStore>,
    pub scheduler_tx: mpsc::Sender<SchedulerSignal>,
    /// Set by the Wake Scheduler while an Iteration Engine is actively
    /// running a milestone; `None` otherwise. Lets milestone-specific
    /// control signals (approve/reject/guidance) reach the engine without
    /// the scheduler having to parse them.
    pub current_engine_tx: Arc<Mutex<Option<mpsc::Sender<EngineSignal>>>>,
    pub scheduler_task: tokio::task::JoinHandle<()>,
}

impl Drop for ProjectHandle {
    fn drop(&mut self) {
        self.scheduler_task.abort();
    }
}

/// Point-in-time view of a project returned by `getProjectSnapshot` /
/// `listProjects`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectSnapshot {
    pub id: Uuid,
    pub path: PathBuf,
    pub display_name: String,
    pub status: ProjectStatus,
    pub current_milestone_id: Option<Uuid>,
}
