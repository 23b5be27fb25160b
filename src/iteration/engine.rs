//! Iteration Engine (§4.6): drives one active milestone from `in_progress`
//! through an alternating Developer/Acceptor loop to a terminal outcome.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::agent::{AgentProcessHost, AgentStreamParser, QuotaStatus, StreamEvent, Verdict};
use crate::clock::Clock;
use crate::error::{AnimaError, Result};
use crate::events::{EventBus, EventKind};
use crate::iteration::prompts::{self, ProjectContext};
use crate::persistence::{
    Milestone, MilestoneStatus, PersistenceStore, ProjectConfig, ProjectStatus, Version,
};
use crate::vcs::{GitDriver, MergeStrategy};

const REJECTION_THRESHOLD: u32 = 3;
const IDLE_WINDOW: Duration = Duration::from_millis(500);

/// Signals the control API can direct at a running milestone.
#[derive(Debug, Clone)]
pub enum EngineSignal {
    /// Resume after a human-reviewed pause (rejection threshold or
    /// `maxIterationsPerMilestone`).
    Resume,
    /// Cancel the milestone while it is `in_progress`.
    Cancel,
    /// Approve a milestone sitting in `awaiting_review`.
    Approve,
    /// Reject a milestone sitting in `awaiting_review`, forwarding the
    /// reason back to the developer.
    Reject(String),
    /// Freeform human guidance injected into the next developer round.
    Guidance(String),
}

/// Where a milestone run landed. The scheduler uses this to decide the
/// project's next `checking`/`rate_limited` transition.
#[derive(Debug, Clone)]
pub enum EngineOutcome {
    Completed,
    AwaitingReview,
    Cancelled,
    Failed,
    Quota { reset_at: Option<DateTime<Utc>> },
}

enum RoundResult {
    Verdict(Verdict),
    Quota { status: QuotaStatus, reset_at: Option<DateTime<Utc>> },
    Timeout,
    SessionExited,
}

pub struct IterationEngine {
    pub store: Arc<dyn PersistenceStore>,
    pub clock: Arc<dyn Clock>,
    pub events: EventBus,
    pub project_id: Uuid,
    pub project_root: PathBuf,
    pub anima_dir: PathBuf,
}

impl IterationEngine {
    /// Drive `milestone_id` to a terminal outcome. `control_rx` delivers
    /// human/control-API signals for this one milestone's lifetime.
    pub async fn run(&self, milestone_id: Uuid, control_rx: &mut mpsc::Receiver<EngineSignal>) -> Result<EngineOutcome> {
        let config = self.store.read_project_config().await?;
        let git = Arc::new(GitDriver::new(self.project_root.clone()));

        let (mut milestone, mut milestone_version) = self.pre_start(milestone_id, &config, &git).await?;

        let agent_command = config
            .agent_command
            .clone()
            .ok_or_else(|| AnimaError::FatalEngine("no agentCommand configured".into()))?;

        let developer = AgentProcessHost::spawn(&agent_command, &[], &self.project_root)?;
        let acceptor = AgentProcessHost::spawn(&agent_command, &[], &self.project_root)?;
        let mut dev_parser = AgentStreamParser::new();
        let mut acc_parser = AgentStreamParser::new();

        let ctx = ProjectContext::load(&self.project_root, &self.anima_dir).await;
        let milestone_doc = tokio::fs::read_to_string(self.project_root.join(&milestone.doc_path))
            .await
            .unwrap_or_default();

        let mut last_rejection_reason: Option<String> = None;
        let mut completed_features: Vec<String> = Vec::new();
        let mut guidance: Option<String> = None;

        let outcome = loop {
            if let Ok(signal) = control_rx.try_recv() {
                if let Some(outcome) = self
                    .handle_out_of_band_signal(signal, &mut milestone, &mut milestone_version, &mut guidance)
                    .await?
                {
                    break outcome;
                }
            }

            self.events.emit(
                self.project_id,
                EventKind::RoundStarted,
                serde_json::json!({"milestoneId": milestone_id, "round": milestone.iteration_count}),
            );

            let dev_prompt = prompts::developer_prompt(
                &ctx,
                &milestone,
                &milestone_doc,
                &milestone.branch_name,
                milestone.iteration_count,
                &completed_features,
                guidance.as_deref().or(last_rejection_reason.as_deref()),
            )
            .await;
            guidance = None;
            developer.send_line(&dev_prompt)?;

            let dev_result = self
                .await_round(&developer, &mut dev_parser, config.agent_timeout_ms)
                .await;

            match dev_result {
                RoundResult::Timeout | RoundResult::SessionExited => {
                    milestone.consecutive_rejections += 1;
                    self.persist_milestone(&mut milestone, &mut milestone_version).await?;
                    if let Some(outcome) = self
                        .check_rejection_threshold(&mut milestone, &mut milestone_version, control_rx, &mut guidance)
                        .await?
                    {
                        break outcome;
                    }
                    continue;
                }
                RoundResult::Quota { reset_at, .. } => break EngineOutcome::Quota { reset_at },
                RoundResult::Verdict(Verdict::AllFeaturesComplete { commits, .. }) => {
                    completed_features_from_commits(&mut completed_features, &commits);
                    let result = self
                        .final_review(
                            &ctx,
                            &milestone,
                            &milestone_doc,
                            &acceptor,
                            &mut acc_parser,
                            &git,
                            config.agent_timeout_ms,
                        )
                        .await?;
                    match result {
                        FinalReviewResult::Accepted => {
                            break self
                                .complete_milestone(&mut milestone, &mut milestone_version, &config, &git)
                                .await?;
                        }
                        FinalReviewResult::Rejected(reason) => {
                            last_rejection_reason = Some(reason);
                            continue;
                        }
                        FinalReviewResult::Quota { reset_at } => break EngineOutcome::Quota { reset_at },
                    }
                }
                RoundResult::Verdict(_) => {
                    // A per-round implementation report was produced; the
                    // developer's latest commit is the one under review.
                    let commit_hash = git
                        .log(&milestone.branch_name, None)
                        .await?
                        .first()
                        .map(|entry| entry.hash.clone())
                        .unwrap_or_default();

                    let criterion = format!("round {}", milestone.iteration_count);
                    let acc_prompt = prompts::acceptor_round_prompt(&ctx, &criterion, &commit_hash).await;
                    acceptor.send_line(&acc_prompt)?;

                    let acc_result = self
                        .await_round(&acceptor, &mut acc_parser, config.agent_timeout_ms)
                        .await;

                    match acc_result {
                        RoundResult::Verdict(Verdict::Accepted) => {
                            milestone.consecutive_rejections = 0;
                            milestone.iteration_count += 1;
                            self.persist_milestone(&mut milestone, &mut milestone_version).await?;
                            self.events.emit(
                                self.project_id,
                                EventKind::Verdict,
                                serde_json::json!({"milestoneId": milestone_id, "verdict": "accepted"}),
                            );
                        }
                        RoundResult::Verdict(Verdict::Rejected { reason }) => {
                            milestone.consecutive_rejections += 1;
                            self.persist_milestone(&mut milestone, &mut milestone_version).await?;
                            last_rejection_reason = Some(reason);
                            if let Some(outcome) = self
                                .check_rejection_threshold(&mut milestone, &mut milestone_version, control_rx, &mut guidance)
                                .await?
                            {
                                break outcome;
                            }
                        }
                        RoundResult::Timeout | RoundResult::SessionExited => {
                            milestone.consecutive_rejections += 1;
                            self.persist_milestone(&mut milestone, &mut milestone_version).await?;
                            last_rejection_reason = Some("timeout".to_string());
                            if let Some(outcome) = self
                                .check_rejection_threshold(&mut milestone, &mut milestone_version, control_rx, &mut guidance)
                                .await?
                            {
                                break outcome;
                            }
                        }
                        RoundResult::Quota { reset_at, .. } => break EngineOutcome::Quota { reset_at },
                        RoundResult::Verdict(Verdict::AllFeaturesComplete { .. }) => {
                            // The acceptor should never emit this; treat as a
                            // rejection to avoid silently completing.
                            milestone.consecutive_rejections += 1;
                            self.persist_milestone(&mut milestone, &mut milestone_version).await?;
                        }
                    }
                }
            }

            if milestone.iteration_count >= config.max_iterations_per_milestone {
                self.pause_for_human(&mut milestone, &mut milestone_version).await?;
                if let Some(outcome) = self
                    .wait_for_resume(control_rx, &mut milestone, &mut milestone_version, &mut guidance)
                    .await?
                {
                    break outcome;
                }
            }
        };

        developer.kill().await.ok();
        acceptor.kill().await.ok();
        Ok(outcome)
    }

    async fn pre_start(
        &self,
        milestone_id: Uuid,
        config: &ProjectConfig,
        git: &GitDriver,
    ) -> Result<(Milestone, Version)> {
        let status = git.status().await?;
        if status.is_dirty() {
            return Err(AnimaError::FatalEngine(
                "working tree is dirty at milestone start".into(),
            ));
        }

        let loaded = self.store.read_milestone(milestone_id).await?;
        let mut milestone = loaded.value;
        let mut milestone_version = loaded.version;

        // A milestone already `in_progress` (quota back-off, crash-recovery
        // restart) resumes on its existing branch from its existing
        // baseCommit/iterationCount rather than starting over.
        let resuming = milestone.status == MilestoneStatus::InProgress && milestone.base_commit.is_some();

        if resuming {
            git.switch_branch(&milestone.branch_name).await?;
            tracing::info!(project_id = %self.project_id, %milestone_id, "resuming in-progress milestone");
        } else {
            let integration_branch = config
                .integration_branch
                .clone()
                .unwrap_or_else(|| "main".to_string());
            git.switch_branch(&integration_branch).await?;
            let base_commit = git
                .log(&integration_branch, None)
                .await?
                .first()
                .map(|entry| entry.hash.clone())
                .ok_or_else(|| AnimaError::FatalEngine("integration branch has no commits".into()))?;

            git.create_branch(&milestone.branch_name, &base_commit).await?;
            git.switch_branch(&milestone.branch_name).await?;

            milestone.status = MilestoneStatus::InProgress;
            milestone.base_commit = Some(base_commit);
            milestone.started_at = Some(self.clock.now());

            let _lock = self.store.with_project_lock().await?;
            milestone_version = self.store.write_milestone(&milestone, milestone_version).await?;

            tracing::info!(project_id = %self.project_id, %milestone_id, "starting milestone");
        }

        let loaded_state = self.store.read_project_state().await?;
        let mut state = loaded_state.value;
        state.status = ProjectStatus::Awake;
        state.current_milestone_id = Some(milestone_id);
        state.last_active_at = Some(self.clock.now());
        self.store.write_project_state(&state, loaded_state.version).await?;

        self.events.emit(
            self.project_id,
            EventKind::MilestoneStatusChange,
            serde_json::json!({"milestoneId": milestone_id, "status": "in_progress"}),
        );

        Ok((milestone, milestone_version))
    }

    async fn await_round(&self, host: &AgentProcessHost, parser: &mut AgentStreamParser, timeout_ms: u64) -> RoundResult {
        let deadline = Duration::from_millis(timeout_ms);
        let clock = self.clock.clone();
        let outcome = tokio::time::timeout(deadline, async {
            loop {
                match tokio::time::timeout(IDLE_WINDOW, host.output.recv_async()).await {
                    Ok(Ok(chunk)) => {
                        let events = parser.feed(&chunk, clock.as_ref());
                        for event in events {
                            if let StreamEvent::Quota { status, reset_at } = event {
                                return RoundResult::Quota { status, reset_at };
                            }
                        }
                    }
                    Ok(Err(_)) => return RoundResult::SessionExited,
                    Err(_) => {
                        if let Some(StreamEvent::Verdict(verdict)) = parser.flush_idle() {
                            return RoundResult::Verdict(verdict);
                        }
                        if !host.is_alive() {
                            return RoundResult::SessionExited;
                        }
                    }
                }
            }
        })
        .await;
        outcome.unwrap_or(RoundResult::Timeout)
    }

    async fn final_review(
        &self,
        ctx: &ProjectContext,
        milestone: &Milestone,
        milestone_doc: &str,
        acceptor: &AgentProcessHost,
        parser: &mut AgentStreamParser,
        git: &GitDriver,
        timeout_ms: u64,
    ) -> Result<FinalReviewResult> {
        let base_commit = milestone
            .base_commit
            .clone()
            .ok_or_else(|| AnimaError::FatalEngine("missing baseCommit at final review".into()))?;
        let commits = git
            .log(&milestone.branch_name, Some(&base_commit))
            .await?
            .into_iter()
            .map(|entry| entry.hash)
            .collect::<Vec<_>>();

        // §4.6.2: inject the milestone's full acceptance-criteria list — the
        // milestone document itself, since that's where it's written.
        let prompt = prompts::acceptor_final_review_prompt(ctx, milestone_doc, &commits).await;
        acceptor.send_line(&prompt)?;

        match self.await_round(acceptor, parser, timeout_ms).await {
            RoundResult::Verdict(Verdict::Accepted) => Ok(FinalReviewResult::Accepted),
            RoundResult::Verdict(Verdict::Rejected { reason }) => Ok(FinalReviewResult::Rejected(reason)),
            RoundResult::Quota { reset_at, .. } => Ok(FinalReviewResult::Quota { reset_at }),
            RoundResult::Timeout | RoundResult::SessionExited => {
                Ok(FinalReviewResult::Rejected("timeout during final review".to_string()))
            }
            RoundResult::Verdict(Verdict::AllFeaturesComplete { .. }) => {
                Ok(FinalReviewResult::Rejected("unexpected verdict during final review".to_string()))
            }
        }
    }

    /// §4.6.3: merge + tag, keep branch by default. When the milestone
    /// requires human review, finalization is deferred entirely until a
    /// human approves via `resolve_awaiting_review` — per §8 scenario 6,
    /// an ACCEPTED final review under human review leaves "no merge/tag
    /// yet".
    async fn complete_milestone(
        &self,
        milestone: &mut Milestone,
        milestone_version: &mut Version,
        config: &ProjectConfig,
        git: &GitDriver,
    ) -> Result<EngineOutcome> {
        let outcome_status = if milestone.requires_human_review {
            MilestoneStatus::AwaitingReview
        } else {
            let integration_branch = config
                .integration_branch
                .clone()
                .unwrap_or_else(|| "main".to_string());
            git.switch_branch(&integration_branch).await?;
            let merge_result = git.merge(&milestone.branch_name, MergeStrategy::FastForward).await?;
            if !merge_result.success() {
                git.merge(&milestone.branch_name, MergeStrategy::Merge).await?;
            }
            git.tag(&milestone.tag_name(), &integration_branch).await?;
            MilestoneStatus::Completed
        };
        milestone.status = outcome_status;
        milestone.completed_at = Some(self.clock.now());

        let _lock = self.store.with_project_lock().await?;
        *milestone_version = self.store.write_milestone(milestone, *milestone_version).await?;

        let loaded_state = self.store.read_project_state().await?;
        let mut state = loaded_state.value;
        state.status = ProjectStatus::Sleeping;
        state.current_milestone_id = None;
        self.store.write_project_state(&state, loaded_state.version).await?;

        self.events.emit(
            self.project_id,
            EventKind::MilestoneStatusChange,
            serde_json::json!({"milestoneId": milestone.id, "status": format!("{outcome_status:?}")}),
        );

        Ok(if milestone.requires_human_review {
            EngineOutcome::AwaitingReview
        } else {
            EngineOutcome::Completed
        })
    }

    async fn fail_milestone(&self, milestone: &mut Milestone, milestone_version: &mut Version, git: &GitDriver, cancelled: bool) -> Result<EngineOutcome> {
        if let Some(base_commit) = milestone.base_commit.clone() {
            git.switch_branch(&milestone.branch_name).await.ok();
            git.reset(&base_commit, true).await.ok();
        }
        milestone.status = if cancelled { MilestoneStatus::Cancelled } else { MilestoneStatus::Failed };

        let _lock = self.store.with_project_lock().await?;
        *milestone_version = self.store.write_milestone(milestone, *milestone_version).await?;

        let loaded_state = self.store.read_project_state().await?;
        let mut state = loaded_state.value;
        state.status = ProjectStatus::Sleeping;
        state.current_milestone_id = None;
        self.store.write_project_state(&state, loaded_state.version).await?;

        self.events.emit(
            self.project_id,
            EventKind::MilestoneStatusChange,
            serde_json::json!({"milestoneId": milestone.id, "status": if cancelled {"cancelled"} else {"failed"}}),
        );

        Ok(if cancelled { EngineOutcome::Cancelled } else { EngineOutcome::Failed })
    }

    async fn pause_for_human(&self, milestone: &mut Milestone, milestone_version: &mut Version) -> Result<()> {
        let loaded_state = self.store.read_project_state().await?;
        let mut state = loaded_state.value;
        state.status = ProjectStatus::Paused;

        let _lock = self.store.with_project_lock().await?;
        *milestone_version = self.store.write_milestone(milestone, *milestone_version).await?;
        self.store.write_project_state(&state, loaded_state.version).await?;

        self.events.emit(
            self.project_id,
            EventKind::StatusChange,
            serde_json::json!({"status": "paused", "milestoneId": milestone.id}),
        );
        Ok(())
    }

    async fn check_rejection_threshold(
        &self,
        milestone: &mut Milestone,
        milestone_version: &mut Version,
        control_rx: &mut mpsc::Receiver<EngineSignal>,
        guidance: &mut Option<String>,
    ) -> Result<Option<EngineOutcome>> {
        if milestone.consecutive_rejections < REJECTION_THRESHOLD {
            return Ok(None);
        }
        self.pause_for_human(milestone, milestone_version).await?;
        self.wait_for_resume(control_rx, milestone, milestone_version, guidance).await
    }

    /// Blocks until a human sends `Resume` or `Cancel` (§4.6: "wait for
    /// human input ... on resume: consecutiveRejections := 0; continue").
    /// Guidance sent while paused is captured for the round after resume.
    async fn wait_for_resume(
        &self,
        control_rx: &mut mpsc::Receiver<EngineSignal>,
        milestone: &mut Milestone,
        milestone_version: &mut Version,
        guidance: &mut Option<String>,
    ) -> Result<Option<EngineOutcome>> {
        loop {
            match control_rx.recv().await {
                Some(EngineSignal::Resume) => {
                    milestone.consecutive_rejections = 0;
                    let loaded_state = self.store.read_project_state().await?;
                    let mut state = loaded_state.value;
                    state.status = ProjectStatus::Awake;
                    let _lock = self.store.with_project_lock().await?;
                    *milestone_version = self.store.write_milestone(milestone, *milestone_version).await?;
                    self.store.write_project_state(&state, loaded_state.version).await?;
                    return Ok(None);
                }
                Some(EngineSignal::Cancel) => {
                    let git = GitDriver::new(self.project_root.clone());
                    return Ok(Some(self.fail_milestone(milestone, milestone_version, &git, true).await?));
                }
                Some(EngineSignal::Guidance(text)) => {
                    *guidance = Some(text);
                    continue;
                }
                Some(EngineSignal::Approve) | Some(EngineSignal::Reject(_)) => {
                    continue;
                }
                None => return Ok(Some(EngineOutcome::Failed)),
            }
        }
    }

    async fn handle_out_of_band_signal(
        &self,
        signal: EngineSignal,
        milestone: &mut Milestone,
        milestone_version: &mut Version,
        guidance: &mut Option<String>,
    ) -> Result<Option<EngineOutcome>> {
        match signal {
            EngineSignal::Cancel => {
                let git = GitDriver::new(self.project_root.clone());
                Ok(Some(self.fail_milestone(milestone, milestone_version, &git, true).await?))
            }
            EngineSignal::Guidance(text) => {
                *guidance = Some(text);
                Ok(None)
            }
            _ => Ok(None),
        }
    }

    async fn persist_milestone(&self, milestone: &mut Milestone, milestone_version: &mut Version) -> Result<()> {
        let _lock = self.store.with_project_lock().await?;
        *milestone_version = self.store.write_milestone(milestone, *milestone_version).await?;
        Ok(())
    }
}

enum FinalReviewResult {
    Accepted,
    Rejected(String),
    Quota { reset_at: Option<DateTime<Utc>> },
}

fn completed_features_from_commits(completed: &mut Vec<String>, commits: &[String]) {
    for hash in commits {
        if !completed.contains(hash) {
            completed.push(hash.clone());
        }
    }
}

/// Surfaces a milestone that was approved/rejected by a human while
/// `awaiting_review`. The engine itself has already exited by this point;
/// this is invoked directly by the Supervisor's control-API handler.
pub async fn resolve_awaiting_review(
    store: &dyn PersistenceStore,
    git: &GitDriver,
    milestone_id: Uuid,
    approve: bool,
) -> Result<()> {
    let loaded = store.read_milestone(milestone_id).await?;
    let mut milestone = loaded.value;
    if milestone.status != MilestoneStatus::AwaitingReview {
        return Err(AnimaError::FatalEngine(format!(
            "milestone {milestone_id} is not awaiting_review"
        )));
    }
    if approve {
        // §4.6.3 finalization, deferred from `complete_milestone` until now
        // because this milestone required human review.
        let config = store.read_project_config().await?;
        let integration_branch = config
            .integration_branch
            .clone()
            .unwrap_or_else(|| "main".to_string());
        git.switch_branch(&integration_branch).await?;
        let merge_result = git.merge(&milestone.branch_name, MergeStrategy::FastForward).await?;
        if !merge_result.success() {
            git.merge(&milestone.branch_name, MergeStrategy::Merge).await?;
        }
        git.tag(&milestone.tag_name(), &integration_branch).await?;
        milestone.status = MilestoneStatus::Completed;
    } else {
        if let Some(base_commit) = milestone.base_commit.clone() {
            git.switch_branch(&milestone.branch_name).await.ok();
            git.reset(&base_commit, true).await.ok();
        }
        milestone.status = MilestoneStatus::Failed;
    }
    let _lock = store.with_project_lock().await?;
    store.write_milestone(&milestone, loaded.version).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejection_threshold_constant_matches_worked_example() {
        assert_eq!(REJECTION_THRESHOLD, 3);
    }

    #[test]
    fn completed_features_from_commits_deduplicates() {
        let mut completed = vec!["abc".to_string()];
        completed_features_from_commits(&mut completed, &["abc".to_string(), "def".to_string()]);
        assert_eq!(completed, vec!["abc".to_string(), "def".to_string()]);
    }
}
