//! Iteration Engine (§4.6): drives a single milestone from `in_progress` to
//! a terminal or suspended outcome via the Developer/Acceptor agent loop.

mod engine;
pub mod prompts;

use async_trait::async_trait;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::Result;

pub use engine::{resolve_awaiting_review, EngineOutcome, EngineSignal, IterationEngine};

/// Seam the Wake Scheduler depends on to run a milestone without depending
/// on the Iteration Engine's internals, keeping the dependency one-way
/// (`scheduler` -> `iteration`, never back).
#[async_trait]
pub trait MilestoneRunner: Send + Sync {
    async fn run_milestone(&self, milestone_id: Uuid, control_rx: &mut mpsc::Receiver<EngineSignal>) -> Result<EngineOutcome>;
}

#[async_trait]
impl MilestoneRunner for IterationEngine {
    async fn run_milestone(&self, milestone_id: Uuid, control_rx: &mut mpsc::Receiver<EngineSignal>) -> Result<EngineOutcome> {
        self.run(milestone_id, control_rx).await
    }
}
