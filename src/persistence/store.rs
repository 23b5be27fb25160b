//! Persistence Store (§4.1)
//!
//! Reads and writes the on-disk `.anima/` state tree for a single project.
//! Every write is atomic (temp file + rename) and optimistic-concurrency
//! checked against a `Version` token. Callers that need a read-modify-write
//! sequence must wrap it in `with_project_lock`.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{AnimaError, Result};
use crate::persistence::lock::ProjectLock;
use crate::persistence::models::{InboxItem, Milestone, MilestoneOrder, ProjectConfig, ProjectState};
use crate::persistence::version::Version;

/// Type-erased lock guard: the lock is released when this drops. Concrete
/// type varies by store implementation (a real file lock vs. an in-process
/// mutex for the test double).
pub type LockGuard = Box<dyn Send>;

/// A value paired with the version token it was read at.
#[derive(Debug, Clone)]
pub struct Versioned<T> {
    pub value: T,
    pub version: Version,
}

/// Storage surface the rest of the core depends on. Generalizes over the
/// filesystem so the scheduler, engine, and supervisor can be exercised
/// against an in-memory double in tests.
#[async_trait]
pub trait PersistenceStore: Send + Sync {
    async fn read_project_config(&self) -> Result<ProjectConfig>;

    async fn read_project_state(&self) -> Result<Versioned<ProjectState>>;
    async fn write_project_state(&self, state: &ProjectState, expected: Version) -> Result<Version>;

    async fn read_milestone(&self, id: Uuid) -> Result<Versioned<Milestone>>;
    async fn write_milestone(&self, milestone: &Milestone, expected: Version) -> Result<Version>;
    async fn list_milestones(&self) -> Result<Vec<Milestone>>;
    async fn delete_milestone(&self, id: Uuid) -> Result<()>;

    async fn read_order(&self) -> Result<Versioned<MilestoneOrder>>;
    async fn write_order(&self, order: &MilestoneOrder, expected: Version) -> Result<Version>;

    async fn read_inbox_item(&self, id: Uuid) -> Result<Versioned<InboxItem>>;
    async fn write_inbox_item(&self, item: &InboxItem, expected: Version) -> Result<Version>;
    async fn list_inbox_items(&self) -> Result<Vec<InboxItem>>;

    /// Serialize a read-modify-write sequence against every other caller of
    /// this store for the same project, local or cross-process (§4.1).
    async fn with_project_lock(&self) -> Result<LockGuard>;
}

/// Atomically write `contents` to `path`: write to a sibling temp file, then
/// rename over the destination. Renames are atomic on the same filesystem,
/// so readers never observe a partially-written file.
fn atomic_write(path: &Path, contents: &[u8]) -> Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir).map_err(|source| AnimaError::PersistenceIo {
        path: dir.display().to_string(),
        source,
    })?;
    let tmp_name = format!(
        ".{}.tmp-{}",
        path.file_name().and_then(|n| n.to_str()).unwrap_or("tmp"),
        Uuid::new_v4()
    );
    let tmp_path = dir.join(tmp_name);
    std::fs::write(&tmp_path, contents).map_err(|source| AnimaError::PersistenceIo {
        path: tmp_path.display().to_string(),
        source,
    })?;
    std::fs::rename(&tmp_path, path).map_err(|source| AnimaError::PersistenceIo {
        path: path.display().to_string(),
        source,
    })?;
    Ok(())
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let bytes = std::fs::read(path).map_err(|source| AnimaError::PersistenceIo {
        path: path.display().to_string(),
        source,
    })?;
    serde_json::from_slice(&bytes).map_err(|e| AnimaError::CorruptState {
        path: path.display().to_string(),
        reason: e.to_string(),
    })
}

/// Filesystem-backed implementation rooted at a project's `.anima`
/// directory.
pub struct FsPersistenceStore {
    anima_dir: PathBuf,
    lock: ProjectLock,
}

impl FsPersistenceStore {
    pub fn new(anima_dir: PathBuf) -> Self {
        let lock = ProjectLock::new(&anima_dir);
        Self { anima_dir, lock }
    }

    fn config_path(&self) -> PathBuf {
        self.anima_dir.join("config.json")
    }

    fn state_path(&self) -> PathBuf {
        self.anima_dir.join("state.json")
    }

    fn order_path(&self) -> PathBuf {
        self.anima_dir.join("milestones").join("order.json")
    }

    fn milestone_path(&self, id: Uuid) -> PathBuf {
        self.anima_dir.join("milestones").join(format!("{id}.json"))
    }

    fn inbox_path(&self, id: Uuid) -> PathBuf {
        self.anima_dir.join("inbox").join(format!("{id}.json"))
    }
}

/// Compare-and-swap write: checks the on-disk token still matches
/// `expected` before writing, atomically, returning the new token.
fn cas_write<T: serde::Serialize>(path: &Path, value: &T, expected: Version) -> Result<Version> {
    let current = Version::of_path(path)?;
    if current != expected {
        return Err(AnimaError::PersistenceStale {
            path: path.display().to_string(),
        });
    }
    let bytes = serde_json::to_vec_pretty(value).map_err(|e| AnimaError::CorruptState {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;
    atomic_write(path, &bytes)?;
    Version::of_path(path)
}

#[async_trait]
impl PersistenceStore for FsPersistenceStore {
    async fn read_project_config(&self) -> Result<ProjectConfig> {
        let path = self.config_path();
        tokio::task::spawn_blocking(move || read_json(&path))
            .await
            .map_err(|e| AnimaError::FatalEngine(e.to_string()))?
    }

    async fn read_project_state(&self) -> Result<Versioned<ProjectState>> {
        let path = self.state_path();
        tokio::task::spawn_blocking(move || {
            let value: ProjectState = read_json(&path)?;
            let version = Version::of_path(&path)?;
            Ok(Versioned { value, version })
        })
        .await
        .map_err(|e| AnimaError::FatalEngine(e.to_string()))?
    }

    async fn write_project_state(&self, state: &ProjectState, expected: Version) -> Result<Version> {
        let path = self.state_path();
        let state = state.clone();
        tokio::task::spawn_blocking(move || cas_write(&path, &state, expected))
            .await
            .map_err(|e| AnimaError::FatalEngine(e.to_string()))?
    }

    async fn read_milestone(&self, id: Uuid) -> Result<Versioned<Milestone>> {
        let path = self.milestone_path(id);
        tokio::task::spawn_blocking(move || {
            let value: Milestone = read_json(&path)?;
            let version = Version::of_path(&path)?;
            Ok(Versioned { value, version })
        })
        .await
        .map_err(|e| AnimaError::FatalEngine(e.to_string()))?
    }

    async fn write_milestone(&self, milestone: &Milestone, expected: Version) -> Result<Version> {
        let path = self.milestone_path(milestone.id);
        let milestone = milestone.clone();
        tokio::task::spawn_blocking(move || cas_write(&path, &milestone, expected))
            .await
            .map_err(|e| AnimaError::FatalEngine(e.to_string()))?
    }

    async fn list_milestones(&self) -> Result<Vec<Milestone>> {
        let dir = self.anima_dir.join("milestones");
        tokio::task::spawn_blocking(move || {
            let mut out = Vec::new();
            if !dir.exists() {
                return Ok(out);
            }
            let entries = std::fs::read_dir(&dir).map_err(|source| AnimaError::PersistenceIo {
                path: dir.display().to_string(),
                source,
            })?;
            for entry in entries {
                let entry = entry.map_err(|source| AnimaError::PersistenceIo {
                    path: dir.display().to_string(),
                    source,
                })?;
                let path = entry.path();
                if path.file_name().and_then(|n| n.to_str()) == Some("order.json") {
                    continue;
                }
                if path.extension().and_then(|e| e.to_str()) != Some("json") {
                    continue;
                }
                out.push(read_json::<Milestone>(&path)?);
            }
            Ok(out)
        })
        .await
        .map_err(|e| AnimaError::FatalEngine(e.to_string()))?
    }

    async fn delete_milestone(&self, id: Uuid) -> Result<()> {
        let path = self.milestone_path(id);
        tokio::task::spawn_blocking(move || match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(AnimaError::PersistenceIo {
                path: path.display().to_string(),
                source,
            }),
        })
        .await
        .map_err(|e| AnimaError::FatalEngine(e.to_string()))?
    }

    async fn read_order(&self) -> Result<Versioned<MilestoneOrder>> {
        let path = self.order_path();
        tokio::task::spawn_blocking(move || {
            let version = Version::of_path(&path)?;
            if version.is_absent() {
                return Ok(Versioned {
                    value: MilestoneOrder::default(),
                    version,
                });
            }
            let value: MilestoneOrder = read_json(&path)?;
            Ok(Versioned { value, version })
        })
        .await
        .map_err(|e| AnimaError::FatalEngine(e.to_string()))?
    }

    async fn write_order(&self, order: &MilestoneOrder, expected: Version) -> Result<Version> {
        let path = self.order_path();
        let order = order.clone();
        tokio::task::spawn_blocking(move || cas_write(&path, &order, expected))
            .await
            .map_err(|e| AnimaError::FatalEngine(e.to_string()))?
    }

    async fn read_inbox_item(&self, id: Uuid) -> Result<Versioned<InboxItem>> {
        let path = self.inbox_path(id);
        tokio::task::spawn_blocking(move || {
            let value: InboxItem = read_json(&path)?;
            let version = Version::of_path(&path)?;
            Ok(Versioned { value, version })
        })
        .await
        .map_err(|e| AnimaError::FatalEngine(e.to_string()))?
    }

    async fn write_inbox_item(&self, item: &InboxItem, expected: Version) -> Result<Version> {
        let path = self.inbox_path(item.id);
        let item = item.clone();
        tokio::task::spawn_blocking(move || cas_write(&path, &item, expected))
            .await
            .map_err(|e| AnimaError::FatalEngine(e.to_string()))?
    }

    async fn list_inbox_items(&self) -> Result<Vec<InboxItem>> {
        let dir = self.anima_dir.join("inbox");
        tokio::task::spawn_blocking(move || {
            let mut out = Vec::new();
            if !dir.exists() {
                return Ok(out);
            }
            let entries = std::fs::read_dir(&dir).map_err(|source| AnimaError::PersistenceIo {
                path: dir.display().to_string(),
                source,
            })?;
            for entry in entries {
                let entry = entry.map_err(|source| AnimaError::PersistenceIo {
                    path: dir.display().to_string(),
                    source,
                })?;
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) != Some("json") {
                    continue;
                }
                out.push(read_json::<InboxItem>(&path)?);
            }
            Ok(out)
        })
        .await
        .map_err(|e| AnimaError::FatalEngine(e.to_string()))?
    }

    async fn with_project_lock(&self) -> Result<LockGuard> {
        let lock = self.lock.clone();
        let guard = tokio::task::spawn_blocking(move || lock.acquire_blocking())
            .await
            .map_err(|e| AnimaError::FatalEngine(e.to_string()))??;
        Ok(Box::new(guard))
    }
}

/// In-memory double for tests, mirroring the shape of the filesystem store
/// without ever touching disk. Versions are a simple monotonic counter per
/// key rather than mtime+length.
#[derive(Default)]
pub struct MockPersistenceStore {
    config: RwLock<Option<ProjectConfig>>,
    state: RwLock<Option<(ProjectState, u64)>>,
    milestones: RwLock<HashMap<Uuid, (Milestone, u64)>>,
    order: RwLock<(MilestoneOrder, u64)>,
    inbox: RwLock<HashMap<Uuid, (InboxItem, u64)>>,
    lock: Arc<tokio::sync::Mutex<()>>,
}

fn counter_to_version(n: u64) -> Version {
    // Reuse Version's equality semantics via a synthetic path-free token:
    // encode the counter into the mtime field directly through the public
    // constructor surface (absent vs not), using a dedicated helper.
    Version::from_counter(n)
}

impl MockPersistenceStore {
    pub fn new(config: ProjectConfig, state: ProjectState) -> Self {
        Self {
            config: RwLock::new(Some(config)),
            state: RwLock::new(Some((state, 0))),
            milestones: RwLock::new(HashMap::new()),
            order: RwLock::new((MilestoneOrder::default(), 0)),
            inbox: RwLock::new(HashMap::new()),
            lock: Arc::new(tokio::sync::Mutex::new(())),
        }
    }
}

#[async_trait]
impl PersistenceStore for MockPersistenceStore {
    async fn read_project_config(&self) -> Result<ProjectConfig> {
        self.config
            .read()
            .await
            .clone()
            .ok_or_else(|| AnimaError::FatalEngine("no config in mock store".into()))
    }

    async fn read_project_state(&self) -> Result<Versioned<ProjectState>> {
        let guard = self.state.read().await;
        let (value, n) = guard
            .clone()
            .ok_or_else(|| AnimaError::FatalEngine("no state in mock store".into()))?;
        Ok(Versioned {
            value,
            version: counter_to_version(n),
        })
    }

    async fn write_project_state(&self, state: &ProjectState, expected: Version) -> Result<Version> {
        let mut guard = self.state.write().await;
        let current_n = guard.as_ref().map(|(_, n)| *n).unwrap_or(0);
        if counter_to_version(current_n) != expected {
            return Err(AnimaError::PersistenceStale {
                path: "state.json".into(),
            });
        }
        let next = current_n + 1;
        *guard = Some((state.clone(), next));
        Ok(counter_to_version(next))
    }

    async fn read_milestone(&self, id: Uuid) -> Result<Versioned<Milestone>> {
        let guard = self.milestones.read().await;
        let (value, n) = guard
            .get(&id)
            .cloned()
            .ok_or_else(|| AnimaError::CorruptState {
                path: format!("milestones/{id}.json"),
                reason: "not found".into(),
            })?;
        Ok(Versioned {
            value,
            version: counter_to_version(n),
        })
    }

    async fn write_milestone(&self, milestone: &Milestone, expected: Version) -> Result<Version> {
        let mut guard = self.milestones.write().await;
        let current_n = guard.get(&milestone.id).map(|(_, n)| *n).unwrap_or(0);
        if counter_to_version(current_n) != expected {
            return Err(AnimaError::PersistenceStale {
                path: format!("milestones/{}.json", milestone.id),
            });
        }
        let next = current_n + 1;
        guard.insert(milestone.id, (milestone.clone(), next));
        Ok(counter_to_version(next))
    }

    async fn list_milestones(&self) -> Result<Vec<Milestone>> {
        Ok(self.milestones.read().await.values().map(|(m, _)| m.clone()).collect())
    }

    async fn delete_milestone(&self, id: Uuid) -> Result<()> {
        self.milestones.write().await.remove(&id);
        Ok(())
    }

    async fn read_order(&self) -> Result<Versioned<MilestoneOrder>> {
        let guard = self.order.read().await;
        Ok(Versioned {
            value: guard.0.clone(),
            version: counter_to_version(guard.1),
        })
    }

    async fn write_order(&self, order: &MilestoneOrder, expected: Version) -> Result<Version> {
        let mut guard = self.order.write().await;
        if counter_to_version(guard.1) != expected {
            return Err(AnimaError::PersistenceStale {
                path: "milestones/order.json".into(),
            });
        }
        guard.1 += 1;
        guard.0 = order.clone();
        Ok(counter_to_version(guard.1))
    }

    async fn read_inbox_item(&self, id: Uuid) -> Result<Versioned<InboxItem>> {
        let guard = self.inbox.read().await;
        let (value, n) = guard
            .get(&id)
            .cloned()
            .ok_or_else(|| AnimaError::CorruptState {
                path: format!("inbox/{id}.json"),
                reason: "not found".into(),
            })?;
        Ok(Versioned {
            value,
            version: counter_to_version(n),
        })
    }

    async fn write_inbox_item(&self, item: &InboxItem, expected: Version) -> Result<Version> {
        let mut guard = self.inbox.write().await;
        let current_n = guard.get(&item.id).map(|(_, n)| *n).unwrap_or(0);
        if counter_to_version(current_n) != expected {
            return Err(AnimaError::PersistenceStale {
                path: format!("inbox/{}.json", item.id),
            });
        }
        let next = current_n + 1;
        guard.insert(item.id, (item.clone(), next));
        Ok(counter_to_version(next))
    }

    async fn list_inbox_items(&self) -> Result<Vec<InboxItem>> {
        Ok(self.inbox.read().await.values().map(|(i, _)| i.clone()).collect())
    }

    async fn with_project_lock(&self) -> Result<LockGuard> {
        let guard = self.lock.clone().lock_owned().await;
        Ok(Box::new(guard))
    }
}
