//! The process-wide Supervisor singleton.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{broadcast, mpsc, RwLock};
use tracing::{info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::AnimaError;
use crate::events::{AnimaEvent, EventBus, EventKind};
use crate::iteration::{EngineSignal, IterationEngine};
use crate::logging::ProjectLogLayer;
use crate::persistence::{
    self, AppConfig, FsPersistenceStore, PersistenceStore, ProjectRegistration, ProjectState, ProjectStatus,
};
use crate::scheduler::{SchedulerSignal, WakeScheduler};
use crate::supervisor::registry::{ProjectHandle, ProjectSnapshot};

/// Errors the control API surfaces as HTTP status codes.
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("project {0} is not registered")]
    ProjectNotFound(Uuid),
    #[error("milestone {0} is not awaiting_review")]
    NotAwaitingReview(Uuid),
    #[error("no milestone is currently in progress for project {0}")]
    NoActiveMilestone(Uuid),
    #[error(transparent)]
    Core(#[from] AnimaError),
}

/// Owns every registered project's running Wake Scheduler and the
/// process-wide event bus. The only process-wide singleton (§5).
pub struct Supervisor {
    app_config_path: PathBuf,
    projects: RwLock<HashMap<Uuid, ProjectHandle>>,
    events: EventBus,
    clock: Arc<dyn Clock>,
    project_logs: ProjectLogLayer,
}

impl Supervisor {
    pub fn new(app_config_dir: PathBuf, clock: Arc<dyn Clock>, project_logs: ProjectLogLayer) -> Self {
        Self {
            app_config_path: app_config_dir.join("config.json"),
            projects: RwLock::new(HashMap::new()),
            events: EventBus::default(),
            clock,
            project_logs,
        }
    }

    pub fn events(&self) -> EventBus {
        self.events.clone()
    }

    pub fn subscribe_all(&self) -> broadcast::Receiver<AnimaEvent> {
        self.events.subscribe()
    }

    fn read_app_config(&self) -> AppConfig {
        std::fs::read(&self.app_config_path)
            .ok()
            .and_then(|bytes| serde_json::from_slice(&bytes).ok())
            .unwrap_or_default()
    }

    fn write_app_config(&self, config: &AppConfig) -> Result<(), ControlError> {
        if let Some(dir) = self.app_config_path.parent() {
            std::fs::create_dir_all(dir).map_err(|source| {
                ControlError::Core(AnimaError::PersistenceIo {
                    path: dir.display().to_string(),
                    source,
                })
            })?;
        }
        let bytes = serde_json::to_vec_pretty(config).map_err(|e| {
            ControlError::Core(AnimaError::CorruptState {
                path: self.app_config_path.display().to_string(),
                reason: e.to_string(),
            })
        })?;
        std::fs::write(&self.app_config_path, bytes).map_err(|source| {
            ControlError::Core(AnimaError::PersistenceIo {
                path: self.app_config_path.display().to_string(),
                source,
            })
        })
    }

    /// `registerProject`: adds a project to the app-level registry and
    /// starts its Wake Scheduler. Creates `.anima/state.json` with the
    /// `sleeping` default if this is the project's first registration.
    pub async fn register_project(&self, path: PathBuf, display_name: String) -> Result<Uuid, ControlError> {
        let registration = ProjectRegistration::new(path.clone(), display_name.clone());
        let id = registration.id;

        let mut app_config = self.read_app_config();
        app_config.projects.push(registration);
        self.write_app_config(&app_config)?;

        self.start_project(id, path, display_name).await?;
        Ok(id)
    }

    async fn start_project(&self, id: Uuid, path: PathBuf, display_name: String) -> Result<(), ControlError> {
        let anima_dir = persistence::anima_dir(&path);
        std::fs::create_dir_all(&anima_dir).map_err(|source| {
            ControlError::Core(AnimaError::PersistenceIo {
                path: anima_dir.display().to_string(),
                source,
            })
        })?;

        if let Err(e) = self.project_logs.register_project(id, &anima_dir) {
            warn!(project_id = %id, error = %e, "failed to open per-project log file; continuing without it");
        }

        let store: Arc<dyn PersistenceStore> = Arc::new(FsPersistenceStore::new(anima_dir.clone()));

        let state_path = anima_dir.join("state.json");
        if !state_path.exists() {
            let fresh = ProjectState::fresh();
            let bytes = serde_json::to_vec_pretty(&fresh).unwrap();
            std::fs::write(&state_path, bytes).map_err(|source| {
                ControlError::Core(AnimaError::PersistenceIo {
                    path: state_path.display().to_string(),
                    source,
                })
            })?;
        }

        let engine = Arc::new(IterationEngine {
            store: store.clone(),
            clock: self.clock.clone(),
            events: self.events.clone(),
            project_id: id,
            project_root: path.clone(),
            anima_dir,
        });

        let scheduler = WakeScheduler::new(store.clone(), self.clock.clone(), self.events.clone(), id, engine);
        let current_engine_tx = scheduler.current_engine_tx();

        let (scheduler_tx, scheduler_rx) = mpsc::channel::<SchedulerSignal>(8);
        let scheduler_task = tokio::spawn(async move {
            scheduler.run(scheduler_rx).await;
        });

        let handle = ProjectHandle {
            id,
            path,
            display_name,
            store,
            scheduler_tx,
            current_engine_tx,
            scheduler_task,
        };
        self.projects.write().await.insert(id, handle);
        Ok(())
    }

    /// `removeProject`: stops the scheduler, drops the in-memory handle.
    /// The on-disk `.anima/` tree is left untouched.
    pub async fn remove_project(&self, id: Uuid) -> Result<(), ControlError> {
        let mut guard = self.projects.write().await;
        guard.remove(&id).ok_or(ControlError::ProjectNotFound(id))?;
        drop(guard);

        self.project_logs.remove_project(id);

        let mut app_config = self.read_app_config();
        app_config.projects.retain(|p| p.id != id);
        self.write_app_config(&app_config)?;
        Ok(())
    }

    pub async fn list_projects(&self) -> Vec<ProjectSnapshot> {
        let guard = self.projects.read().await;
        let mut out = Vec::with_capacity(guard.len());
        for handle in guard.values() {
            out.push(self.snapshot_of(handle).await);
        }
        out
    }

    pub async fn get_snapshot(&self, id: Uuid) -> Result<ProjectSnapshot, ControlError> {
        let guard = self.projects.read().await;
        let handle = guard.get(&id).ok_or(ControlError::ProjectNotFound(id))?;
        Ok(self.snapshot_of(handle).await)
    }

    async fn snapshot_of(&self, handle: &ProjectHandle) -> ProjectSnapshot {
        let (status, current_milestone_id) = match handle.store.read_project_state().await {
            Ok(versioned) => (versioned.value.status, versioned.value.current_milestone_id),
            Err(_) => (ProjectStatus::Sleeping, None),
        };
        ProjectSnapshot {
            id: handle.id,
            path: handle.path.clone(),
            display_name: handle.display_name.clone(),
            status,
            current_milestone_id,
        }
    }

    async fn send_scheduler_signal(&self, id: Uuid, signal: SchedulerSignal) -> Result<(), ControlError> {
        let guard = self.projects.read().await;
        let handle = guard.get(&id).ok_or(ControlError::ProjectNotFound(id))?;
        let _ = handle.scheduler_tx.send(signal).await;
        Ok(())
    }

    pub async fn wake_now(&self, id: Uuid) -> Result<(), ControlError> {
        self.send_scheduler_signal(id, SchedulerSignal::WakeNow).await
    }

    pub async fn pause(&self, id: Uuid) -> Result<(), ControlError> {
        self.send_scheduler_signal(id, SchedulerSignal::Pause).await
    }

    pub async fn resume(&self, id: Uuid) -> Result<(), ControlError> {
        self.send_scheduler_signal(id, SchedulerSignal::Resume).await
    }

    pub async fn cancel_milestone(&self, id: Uuid, _milestone_id: Uuid) -> Result<(), ControlError> {
        self.send_scheduler_signal(id, SchedulerSignal::CancelCurrentMilestone).await
    }

    async fn send_engine_signal(&self, id: Uuid, signal: EngineSignal) -> Result<(), ControlError> {
        let guard = self.projects.read().await;
        let handle = guard.get(&id).ok_or(ControlError::ProjectNotFound(id))?;
        let engine_tx = handle.current_engine_tx.lock().await;
        match engine_tx.as_ref() {
            Some(tx) => {
                let _ = tx.send(signal).await;
                Ok(())
            }
            None => Err(ControlError::NoActiveMilestone(id)),
        }
    }

    pub async fn provide_guidance(&self, id: Uuid, text: String) -> Result<(), ControlError> {
        self.send_engine_signal(id, EngineSignal::Guidance(text)).await
    }

    /// `approveAwaitingReview` / `rejectAwaitingReview`: these act on a
    /// milestone sitting in `awaiting_review`, i.e. after its Iteration
    /// Engine has already exited, so they go straight through the
    /// Persistence Store and Version-Control Driver rather than through a
    /// live engine channel.
    pub async fn approve_awaiting_review(&self, id: Uuid, milestone_id: Uuid) -> Result<(), ControlError> {
        self.finalize_awaiting_review(id, milestone_id, true).await
    }

    pub async fn reject_awaiting_review(&self, id: Uuid, milestone_id: Uuid) -> Result<(), ControlError> {
        self.finalize_awaiting_review(id, milestone_id, false).await
    }

    async fn finalize_awaiting_review(&self, id: Uuid, milestone_id: Uuid, approve: bool) -> Result<(), ControlError> {
        let guard = self.projects.read().await;
        let handle = guard.get(&id).ok_or(ControlError::ProjectNotFound(id))?;
        let loaded = handle.store.read_milestone(milestone_id).await?;
        if loaded.value.status != crate::persistence::MilestoneStatus::AwaitingReview {
            return Err(ControlError::NotAwaitingReview(milestone_id));
        }
        let git = crate::vcs::GitDriver::new(handle.path.clone());
        crate::iteration::resolve_awaiting_review(handle.store.as_ref(), &git, milestone_id, approve).await?;
        self.events.emit(
            id,
            EventKind::MilestoneStatusChange,
            serde_json::json!({"milestoneId": milestone_id, "status": if approve {"completed"} else {"failed"}}),
        );
        // A resolved review frees the project to look for more work.
        self.send_scheduler_signal(id, SchedulerSignal::WakeNow).await
    }

    /// Crash recovery (§4.8): for every registered project, read its
    /// persisted status and re-enter the scheduler at the appropriate
    /// point. Called once at startup before the control API starts
    /// accepting traffic.
    pub async fn recover_all(&self) -> Result<(), ControlError> {
        let app_config = self.read_app_config();
        for registration in app_config.projects.clone() {
            if let Err(e) = self
                .start_project(registration.id, registration.path.clone(), registration.display_name.clone())
                .await
            {
                warn!(project_id = %registration.id, error = %e, "failed to recover project at startup");
                continue;
            }
            self.events.emit(
                registration.id,
                EventKind::Recovered,
                serde_json::json!({"path": registration.path}),
            );
            info!(project_id = %registration.id, "project recovered");
        }
        Ok(())
    }
}
