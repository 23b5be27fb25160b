//! Project-level and app-level persisted entities (§3)

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use uuid::Uuid;

/// Fields the core doesn't know about yet, preserved byte-for-byte on
/// read-modify-write so a newer core (or a human editing the file by hand)
/// doesn't lose data when an older core round-trips the file (§9).
pub type UnknownFields = BTreeMap<String, serde_json::Value>;

// ============================================================================
// App-level: ProjectRegistration
// ============================================================================

/// A project registered with this Anima instance (app-level scope).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProjectRegistration {
    pub id: Uuid,
    pub path: PathBuf,
    pub display_name: String,
    pub added_at: DateTime<Utc>,
    #[serde(default, flatten)]
    pub unknown: UnknownFields,
}

impl ProjectRegistration {
    pub fn new(path: PathBuf, display_name: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            path,
            display_name,
            added_at: Utc::now(),
            unknown: UnknownFields::default(),
        }
    }
}

/// The app-level registry, persisted at `<app-config-dir>/config.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub schema_version: Option<u32>,
    #[serde(default)]
    pub projects: Vec<ProjectRegistration>,
    #[serde(default, flatten)]
    pub unknown: UnknownFields,
}

// ============================================================================
// Project-level: ProjectState
// ============================================================================

/// The lifecycle status of a project (§3, §4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectStatus {
    Sleeping,
    Checking,
    Awake,
    Paused,
    RateLimited,
}

/// Per-project runtime state, persisted at `.anima/state.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectState {
    #[serde(default)]
    pub schema_version: Option<u32>,
    pub status: ProjectStatus,
    #[serde(default)]
    pub current_milestone_id: Option<Uuid>,
    #[serde(default)]
    pub rate_limit_reset_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub tokens_used: u64,
    #[serde(default)]
    pub cost_usd: f64,
    #[serde(default)]
    pub first_activated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_active_at: Option<DateTime<Utc>>,
    #[serde(default, flatten)]
    pub unknown: UnknownFields,
}

impl ProjectState {
    /// The initial state for a freshly-registered project.
    pub fn fresh() -> Self {
        Self {
            schema_version: None,
            status: ProjectStatus::Sleeping,
            current_milestone_id: None,
            rate_limit_reset_at: None,
            tokens_used: 0,
            cost_usd: 0.0,
            first_activated_at: None,
            last_active_at: None,
            unknown: UnknownFields::default(),
        }
    }

    /// Invariant check from §3: `currentMilestoneId` non-empty iff status is
    /// one of the three "has an active milestone" statuses.
    pub fn invariant_holds(&self) -> bool {
        let requires_milestone = matches!(
            self.status,
            ProjectStatus::Awake | ProjectStatus::Paused | ProjectStatus::RateLimited
        );
        requires_milestone == self.current_milestone_id.is_some()
    }
}

// ============================================================================
// Project-level: ProjectConfig
// ============================================================================

/// How the Wake Scheduler decides when to leave `sleeping` (§4.5).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WakeSchedule {
    Interval { interval_minutes: u32 },
    Times { times: Vec<String> },
    Manual,
}

impl WakeSchedule {
    /// §3 invariant: `intervalMinutes > 0` / `times[]` non-empty and "HH:MM".
    pub fn is_valid(&self) -> bool {
        match self {
            WakeSchedule::Interval { interval_minutes } => *interval_minutes > 0,
            WakeSchedule::Times { times } => !times.is_empty() && times.iter().all(|t| is_hh_mm(t)),
            WakeSchedule::Manual => true,
        }
    }
}

fn is_hh_mm(s: &str) -> bool {
    let Some((h, m)) = s.split_once(':') else {
        return false;
    };
    let (Ok(h), Ok(m)) = (h.parse::<u32>(), m.parse::<u32>()) else {
        return false;
    };
    h < 24 && m < 60 && h.to_string().len() <= 2 && m.to_string().len() == 2
}

/// Per-project configuration, read from `.anima/config.json`. Never mutated
/// by the core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectConfig {
    #[serde(default)]
    pub schema_version: Option<u32>,
    pub project_name: String,
    pub wake_schedule: WakeSchedule,
    #[serde(default)]
    pub default_requires_human_review: bool,
    #[serde(default = "default_agent_timeout_ms")]
    pub agent_timeout_ms: u64,
    #[serde(default = "default_max_iterations")]
    pub max_iterations_per_milestone: u32,
    /// The repository's default integration branch, resolved once at
    /// registration rather than hard-coded to `main` (§9 open question 1).
    #[serde(default)]
    pub integration_branch: Option<String>,
    /// Path to the interactive agent CLI binary; never read from the
    /// process environment by the core itself (§6).
    #[serde(default)]
    pub agent_command: Option<String>,
    #[serde(default, flatten)]
    pub unknown: UnknownFields,
}

fn default_agent_timeout_ms() -> u64 {
    15 * 60 * 1000
}

fn default_max_iterations() -> u32 {
    50
}

// ============================================================================
// Project-level: InboxItem
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InboxItemType {
    Bug,
    Feature,
    Optimization,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InboxPriority {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InboxSource {
    Manual,
    Github,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InboxStatus {
    Pending,
    Included,
    Dismissed,
}

/// A dropped-in idea or bug report, persisted at
/// `.anima/inbox/{id}.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboxItem {
    #[serde(default)]
    pub schema_version: Option<u32>,
    pub id: Uuid,
    pub item_type: InboxItemType,
    pub title: String,
    pub description: String,
    pub priority: InboxPriority,
    pub source: InboxSource,
    #[serde(default)]
    pub source_ref: Option<String>,
    pub status: InboxStatus,
    #[serde(default)]
    pub included_in_milestone: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    #[serde(default, flatten)]
    pub unknown: UnknownFields,
}

impl InboxItem {
    /// §3: `status` transitions `pending -> included` only with a milestone id.
    pub fn mark_included(&mut self, milestone_id: Uuid) {
        self.status = InboxStatus::Included;
        self.included_in_milestone = Some(milestone_id);
    }

    /// §3: `status` transitions `pending -> dismissed`.
    pub fn mark_dismissed(&mut self) {
        self.status = InboxStatus::Dismissed;
    }
}

// ============================================================================
// Project-level: Milestone
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MilestoneStatus {
    Draft,
    Ready,
    InProgress,
    AwaitingReview,
    Completed,
    Cancelled,
    Failed,
}

impl MilestoneStatus {
    /// §4.7: deletable only from `draft`/`ready`.
    pub fn is_deletable(&self) -> bool {
        matches!(self, MilestoneStatus::Draft | MilestoneStatus::Ready)
    }

    /// §3: terminal statuses never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            MilestoneStatus::Completed | MilestoneStatus::Cancelled | MilestoneStatus::Failed
        )
    }
}

/// A bounded unit of work, persisted at `.anima/milestones/{id}.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Milestone {
    #[serde(default)]
    pub schema_version: Option<u32>,
    pub id: Uuid,
    pub title: String,
    pub doc_path: PathBuf,
    pub requires_human_review: bool,
    pub status: MilestoneStatus,
    pub branch_name: String,
    #[serde(default)]
    pub base_commit: Option<String>,
    #[serde(default)]
    pub iteration_count: u32,
    #[serde(default)]
    pub consecutive_rejections: u32,
    #[serde(default)]
    pub tokens_used: u64,
    #[serde(default)]
    pub cost_usd: f64,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, flatten)]
    pub unknown: UnknownFields,
}

impl Milestone {
    pub fn new(title: String, doc_path: PathBuf, requires_human_review: bool) -> Self {
        let id = Uuid::new_v4();
        Self {
            schema_version: None,
            id,
            title,
            doc_path,
            requires_human_review,
            status: MilestoneStatus::Draft,
            branch_name: format!("milestone/{id}"),
            base_commit: None,
            iteration_count: 0,
            consecutive_rejections: 0,
            tokens_used: 0,
            cost_usd: 0.0,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            unknown: UnknownFields::default(),
        }
    }

    /// Tag name used when finalizing this milestone (§4.6.3, §6).
    pub fn tag_name(&self) -> String {
        format!("milestone-{}", self.id)
    }
}

// ============================================================================
// Project-level: MilestoneOrder
// ============================================================================

/// Ordered list of `ready` milestone ids, persisted at
/// `.anima/milestones/order.json`. Ids of milestones no longer `ready` are
/// ignored by the reader (§8 boundary behavior).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MilestoneOrder {
    #[serde(default)]
    pub schema_version: Option<u32>,
    #[serde(default)]
    pub order: Vec<Uuid>,
    #[serde(default, flatten)]
    pub unknown: UnknownFields,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn project_state_invariant_holds_for_sleeping_without_milestone() {
        let state = ProjectState::fresh();
        assert!(state.invariant_holds());
    }

    #[test]
    fn project_state_invariant_violated_if_awake_without_milestone() {
        let mut state = ProjectState::fresh();
        state.status = ProjectStatus::Awake;
        assert!(!state.invariant_holds());
    }

    #[test]
    fn project_state_invariant_holds_for_awake_with_milestone() {
        let mut state = ProjectState::fresh();
        state.status = ProjectStatus::Awake;
        state.current_milestone_id = Some(Uuid::new_v4());
        assert!(state.invariant_holds());
    }

    #[test]
    fn wake_schedule_interval_requires_positive_minutes() {
        assert!(WakeSchedule::Interval { interval_minutes: 5 }.is_valid());
        assert!(!WakeSchedule::Interval { interval_minutes: 0 }.is_valid());
    }

    #[test]
    fn wake_schedule_times_requires_non_empty_valid_times() {
        assert!(WakeSchedule::Times {
            times: vec!["09:00".into(), "17:30".into()]
        }
        .is_valid());
        assert!(!WakeSchedule::Times { times: vec![] }.is_valid());
        assert!(!WakeSchedule::Times {
            times: vec!["25:00".into()]
        }
        .is_valid());
        assert!(!WakeSchedule::Times {
            times: vec!["not-a-time".into()]
        }
        .is_valid());
    }

    #[test]
    fn milestone_status_deletable_only_from_draft_or_ready() {
        assert!(MilestoneStatus::Draft.is_deletable());
        assert!(MilestoneStatus::Ready.is_deletable());
        assert!(!MilestoneStatus::InProgress.is_deletable());
        assert!(!MilestoneStatus::Completed.is_deletable());
    }

    #[test]
    fn milestone_tag_name_format() {
        let m = Milestone::new("Title".into(), PathBuf::from("m.md"), false);
        assert_eq!(m.tag_name(), format!("milestone-{}", m.id));
        assert_eq!(m.branch_name, format!("milestone/{}", m.id));
    }

    #[test]
    fn inbox_item_mark_included_sets_milestone() {
        let mut item = InboxItem {
            schema_version: None,
            id: Uuid::new_v4(),
            item_type: InboxItemType::Bug,
            title: "t".into(),
            description: "d".into(),
            priority: InboxPriority::Medium,
            source: InboxSource::Manual,
            source_ref: None,
            status: InboxStatus::Pending,
            included_in_milestone: None,
            created_at: Utc::now(),
            unknown: UnknownFields::default(),
        };
        let mid = Uuid::new_v4();
        item.mark_included(mid);
        assert_eq!(item.status, InboxStatus::Included);
        assert_eq!(item.included_in_milestone, Some(mid));
    }

    #[test]
    fn unknown_fields_round_trip() {
        let json = serde_json::json!({
            "status": "sleeping",
            "tokensUsed": 0,
            "costUsd": 0.0,
            "fromTheFuture": "preserved"
        });
        let state: ProjectState = serde_json::from_value(json).unwrap();
        assert_eq!(
            state.unknown.get("fromTheFuture"),
            Some(&serde_json::Value::String("preserved".into()))
        );
        let back = serde_json::to_value(&state).unwrap();
        assert_eq!(back["fromTheFuture"], "preserved");
    }
}
