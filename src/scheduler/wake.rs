//! Per-project wake/sleep state machine (§4.5).

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveTime, Utc};
use tokio::sync::{mpsc, Mutex};
use tracing::{info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::events::EventBus;
use crate::iteration::{EngineOutcome, EngineSignal, MilestoneRunner};
use crate::persistence::{MilestoneStatus, PersistenceStore, ProjectStatus, WakeSchedule};

const DEFAULT_QUOTA_BACKOFF: Duration = Duration::from_secs(60 * 60);

/// Control-API commands routed to a project's scheduler.
#[derive(Debug, Clone)]
pub enum SchedulerSignal {
    WakeNow,
    Pause,
    Resume,
    CancelCurrentMilestone,
}

/// Drives one project's `sleeping/checking/awake/paused/rate_limited`
/// transitions (§4.5). Owns no milestone state directly; all persisted
/// mutation goes through `store` under the project lock, matching the
/// ownership split in §3 ("Ownership rules").
pub struct WakeScheduler {
    store: Arc<dyn PersistenceStore>,
    clock: Arc<dyn Clock>,
    events: EventBus,
    project_id: Uuid,
    runner: Arc<dyn MilestoneRunner>,
    /// Populated while an Iteration Engine is running, so the control API
    /// can route milestone-specific signals (approve/reject/guidance)
    /// without the scheduler itself parsing them.
    current_engine_tx: Arc<Mutex<Option<mpsc::Sender<EngineSignal>>>>,
}

impl WakeScheduler {
    pub fn new(
        store: Arc<dyn PersistenceStore>,
        clock: Arc<dyn Clock>,
        events: EventBus,
        project_id: Uuid,
        runner: Arc<dyn MilestoneRunner>,
    ) -> Self {
        Self {
            store,
            clock,
            events,
            project_id,
            runner,
            current_engine_tx: Arc::new(Mutex::new(None)),
        }
    }

    pub fn current_engine_tx(&self) -> Arc<Mutex<Option<mpsc::Sender<EngineSignal>>>> {
        self.current_engine_tx.clone()
    }

    /// Runs until `control_rx`'s sender is dropped (project deregistered).
    /// §4.5: "on startup, a check is performed immediately regardless of
    /// type" — but that only applies starting from `sleeping`. A restart
    /// (crash recovery, process restart) that finds `awake`, `paused`, or
    /// `rate_limited` persisted must resume from there instead of being
    /// forced through `checking`, or an in-progress milestone's state is
    /// lost (§4.8).
    pub async fn run(&self, mut control_rx: mpsc::Receiver<SchedulerSignal>) {
        let initial_status = self.store.read_project_state().await.ok().map(|v| v.value.status);
        if !matches!(
            initial_status,
            Some(ProjectStatus::Awake) | Some(ProjectStatus::Paused) | Some(ProjectStatus::RateLimited)
        ) {
            self.enter_checking().await;
        }
        loop {
            let status = match self.store.read_project_state().await {
                Ok(versioned) => versioned.value.status,
                Err(e) => {
                    warn!(project_id = %self.project_id, error = %e, "failed to read project state; pausing scheduler tick");
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    continue;
                }
            };

            match status {
                ProjectStatus::Sleeping => {
                    if !self.wait_for_wake(&mut control_rx).await {
                        return;
                    }
                    self.enter_checking().await;
                }
                ProjectStatus::Checking => {
                    // Transient: `enter_checking` always resolves it before
                    // returning, but a concurrent writer could observe this.
                    self.enter_checking().await;
                }
                ProjectStatus::Awake => {
                    self.run_current_milestone(&mut control_rx).await;
                }
                ProjectStatus::Paused => {
                    if !self.wait_for_resume_or_cancel(&mut control_rx).await {
                        return;
                    }
                }
                ProjectStatus::RateLimited => {
                    if !self.wait_out_quota(&mut control_rx).await {
                        return;
                    }
                }
            }
        }
    }

    /// `checking`: read `MilestoneOrder`, hand the first still-`ready`
    /// milestone to the Iteration Engine, else fall back to `sleeping`.
    async fn enter_checking(&self) {
        let Ok(loaded_state) = self.store.read_project_state().await else {
            return;
        };
        let mut state = loaded_state.value;
        let previous_status = state.status;
        state.status = ProjectStatus::Checking;
        if self.store.write_project_state(&state, loaded_state.version).await.is_err() {
            return;
        }
        if previous_status != ProjectStatus::Checking {
            self.events.emit(
                self.project_id,
                crate::events::EventKind::StatusChange,
                serde_json::json!({"status": "checking"}),
            );
        }

        // A milestone already `in_progress` (left over from a quota
        // back-off or a crash-recovery restart) is resumed before looking
        // for new work, so it picks up from the exact same round rather
        // than being abandoned for the next `ready` milestone in order.
        if let Some(milestone_id) = state.current_milestone_id {
            if let Ok(loaded_milestone) = self.store.read_milestone(milestone_id).await {
                if loaded_milestone.value.status == MilestoneStatus::InProgress {
                    self.set_awake(milestone_id).await;
                    return;
                }
            }
        }

        let Ok(loaded_order) = self.store.read_order().await else {
            return;
        };
        let mut ready_milestone = None;
        for id in &loaded_order.value.order {
            if let Ok(versioned) = self.store.read_milestone(*id).await {
                if versioned.value.status == MilestoneStatus::Ready {
                    ready_milestone = Some(*id);
                    break;
                }
            }
        }

        match ready_milestone {
            Some(id) => self.set_awake(id).await,
            None => {
                let Ok(loaded_state) = self.store.read_project_state().await else {
                    return;
                };
                let mut state = loaded_state.value;
                if state.status == ProjectStatus::Checking {
                    state.status = ProjectStatus::Sleeping;
                    let _ = self.store.write_project_state(&state, loaded_state.version).await;
                }
            }
        }
    }

    /// §3 "scheduler picks up ready milestone → awake / in_progress": marks
    /// the project awake and claims `milestone_id` as current. The Iteration
    /// Engine's own `pre_start` still owns the milestone-document transition
    /// to `in_progress` and the branch bookkeeping that goes with it.
    async fn set_awake(&self, milestone_id: Uuid) {
        let Ok(loaded_state) = self.store.read_project_state().await else {
            return;
        };
        let mut state = loaded_state.value;
        state.status = ProjectStatus::Awake;
        state.current_milestone_id = Some(milestone_id);
        let _ = self.store.write_project_state(&state, loaded_state.version).await;
    }

    async fn run_current_milestone(&self, control_rx: &mut mpsc::Receiver<SchedulerSignal>) {
        let Ok(loaded_state) = self.store.read_project_state().await else {
            return;
        };
        let Some(milestone_id) = loaded_state.value.current_milestone_id else {
            warn!(project_id = %self.project_id, "awake with no currentMilestoneId; forcing sleep");
            let mut state = loaded_state.value;
            state.status = ProjectStatus::Sleeping;
            let _ = self.store.write_project_state(&state, loaded_state.version).await;
            return;
        };

        let (engine_tx, mut engine_rx) = mpsc::channel::<EngineSignal>(8);
        *self.current_engine_tx.lock().await = Some(engine_tx);

        let runner = self.runner.clone();
        let run_fut = runner.run_milestone(milestone_id, &mut engine_rx);
        tokio::pin!(run_fut);

        let outcome = loop {
            tokio::select! {
                result = &mut run_fut => break result,
                signal = control_rx.recv() => {
                    match signal {
                        Some(SchedulerSignal::CancelCurrentMilestone) => {
                            if let Some(tx) = self.current_engine_tx.lock().await.as_ref() {
                                let _ = tx.send(EngineSignal::Cancel).await;
                            }
                        }
                        Some(SchedulerSignal::Pause) | Some(SchedulerSignal::Resume) | Some(SchedulerSignal::WakeNow) => {
                            // No-op while a milestone is actively running;
                            // pause/resume apply to the `paused` state, wake
                            // applies to `sleeping`.
                        }
                        None => break Err(crate::error::AnimaError::FatalEngine("control channel closed".into())),
                    }
                }
            }
        };

        *self.current_engine_tx.lock().await = None;

        match outcome {
            Ok(EngineOutcome::Completed) | Ok(EngineOutcome::AwaitingReview) => {
                info!(project_id = %self.project_id, %milestone_id, "milestone run finished");
            }
            Ok(EngineOutcome::Cancelled) => {
                self.events.emit(
                    self.project_id,
                    crate::events::EventKind::StatusChange,
                    serde_json::json!({"status": "sleeping", "reason": "cancelled"}),
                );
            }
            Ok(EngineOutcome::Failed) => {
                warn!(project_id = %self.project_id, %milestone_id, "milestone failed");
            }
            Ok(EngineOutcome::Quota { reset_at }) => {
                self.enter_rate_limited(reset_at).await;
            }
            Err(e) => {
                warn!(project_id = %self.project_id, %milestone_id, error = %e, "iteration engine returned an error");
            }
        }
    }

    /// §4.5 "quota back-off": persist `rate_limited` and an absolute
    /// `rateLimitResetAt` so a restart respects the same deadline.
    async fn enter_rate_limited(&self, reset_at: Option<DateTime<Utc>>) {
        let Ok(loaded_state) = self.store.read_project_state().await else {
            return;
        };
        let mut state = loaded_state.value;
        let resolved = reset_at.unwrap_or_else(|| self.clock.now() + chrono::Duration::from_std(DEFAULT_QUOTA_BACKOFF).unwrap());
        state.status = ProjectStatus::RateLimited;
        state.rate_limit_reset_at = Some(resolved);
        let _ = self.store.write_project_state(&state, loaded_state.version).await;
        self.events.emit(
            self.project_id,
            crate::events::EventKind::QuotaEvent,
            serde_json::json!({"resetAt": resolved}),
        );
    }

    async fn wait_out_quota(&self, control_rx: &mut mpsc::Receiver<SchedulerSignal>) -> bool {
        let Ok(loaded_state) = self.store.read_project_state().await else {
            return true;
        };
        let reset_at = loaded_state
            .value
            .rate_limit_reset_at
            .unwrap_or_else(|| self.clock.now() + chrono::Duration::from_std(DEFAULT_QUOTA_BACKOFF).unwrap());

        tokio::select! {
            _ = self.clock.sleep_until(reset_at) => {
                self.enter_checking().await;
                true
            }
            signal = control_rx.recv() => {
                match signal {
                    Some(SchedulerSignal::CancelCurrentMilestone) => {
                        if let Ok(loaded) = self.store.read_project_state().await {
                            if let Some(milestone_id) = loaded.value.current_milestone_id {
                                if let Ok(m) = self.store.read_milestone(milestone_id).await {
                                    let mut milestone = m.value;
                                    milestone.status = MilestoneStatus::Cancelled;
                                    let _ = self.store.write_milestone(&milestone, m.version).await;
                                }
                            }
                            let mut state = loaded.value;
                            state.status = ProjectStatus::Sleeping;
                            state.current_milestone_id = None;
                            let _ = self.store.write_project_state(&state, loaded.version).await;
                        }
                        true
                    }
                    Some(_) => true,
                    None => false,
                }
            }
        }
    }

    async fn wait_for_resume_or_cancel(&self, control_rx: &mut mpsc::Receiver<SchedulerSignal>) -> bool {
        match control_rx.recv().await {
            Some(SchedulerSignal::Resume) => {
                if let Some(tx) = self.current_engine_tx.lock().await.as_ref() {
                    let _ = tx.send(EngineSignal::Resume).await;
                }
                true
            }
            Some(SchedulerSignal::CancelCurrentMilestone) => {
                if let Some(tx) = self.current_engine_tx.lock().await.as_ref() {
                    let _ = tx.send(EngineSignal::Cancel).await;
                }
                true
            }
            Some(_) => true,
            None => false,
        }
    }

    /// `sleeping`: block until the configured wake policy fires or a
    /// control signal requests an immediate wake.
    async fn wait_for_wake(&self, control_rx: &mut mpsc::Receiver<SchedulerSignal>) -> bool {
        let schedule = match self.store.read_project_config().await {
            Ok(config) => config.wake_schedule,
            Err(_) => return true,
        };

        tokio::select! {
            _ = self.sleep_until_next_tick(&schedule) => true,
            signal = control_rx.recv() => {
                match signal {
                    Some(SchedulerSignal::WakeNow) => true,
                    Some(_) => true,
                    None => false,
                }
            }
        }
    }

    /// §4.5 timing rules. `interval` reschedules after this call returns
    /// (i.e. after tick completion, never after tick start — the caller
    /// only invokes this once each time it re-enters `sleeping`). `times`
    /// re-derives the next wall-clock tick every call, which naturally
    /// absorbs daylight-saving shifts since it always compares against
    /// `clock.now()`. `manual` never resolves on its own; only an external
    /// signal or quota timer moves a manual project.
    async fn sleep_until_next_tick(&self, schedule: &WakeSchedule) {
        match schedule {
            WakeSchedule::Interval { interval_minutes } => {
                self.clock.sleep(Duration::from_secs(u64::from(*interval_minutes) * 60)).await;
            }
            WakeSchedule::Times { times } => {
                if let Some(next) = next_time_of_day(self.clock.now(), times) {
                    self.clock.sleep_until(next).await;
                } else {
                    std::future::pending::<()>().await;
                }
            }
            WakeSchedule::Manual => {
                std::future::pending::<()>().await;
            }
        }
    }
}

/// Finds the soonest `HH:MM` entry strictly after `now`, rolling over to the
/// earliest entry tomorrow if all of today's have passed.
fn next_time_of_day(now: DateTime<Utc>, times: &[String]) -> Option<DateTime<Utc>> {
    let mut parsed: Vec<NaiveTime> = times
        .iter()
        .filter_map(|t| {
            let (h, m) = t.split_once(':')?;
            NaiveTime::from_hms_opt(h.parse().ok()?, m.parse().ok()?, 0)
        })
        .collect();
    if parsed.is_empty() {
        return None;
    }
    parsed.sort();

    let today = now.date_naive();
    for time in &parsed {
        let candidate = today.and_time(*time).and_utc();
        if candidate > now {
            return Some(candidate);
        }
    }
    let tomorrow = today.succ_opt()?;
    Some(tomorrow.and_time(parsed[0]).and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn next_time_of_day_picks_soonest_remaining_slot_today() {
        let now = Utc.with_ymd_and_hms(2026, 3, 5, 10, 0, 0).unwrap();
        let next = next_time_of_day(now, &["09:00".to_string(), "17:30".to_string()]).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 3, 5, 17, 30, 0).unwrap());
    }

    #[test]
    fn next_time_of_day_rolls_over_to_tomorrow_when_all_passed() {
        let now = Utc.with_ymd_and_hms(2026, 3, 5, 23, 0, 0).unwrap();
        let next = next_time_of_day(now, &["09:00".to_string()]).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 3, 6, 9, 0, 0).unwrap());
    }

    #[test]
    fn next_time_of_day_none_for_empty_list() {
        assert!(next_time_of_day(Utc::now(), &[]).is_none());
    }
}
