//! Structured events produced by the Agent Stream Parser (§4.4).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuotaStatus {
    RateLimited,
    QuotaExhausted,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Verdict {
    Accepted,
    Rejected { reason: String },
    AllFeaturesComplete { summary: String, commits: Vec<String> },
}

/// One structured event surfaced from a single agent session's output
/// stream. `Text`/`ToolUse` are passthrough for UI; `Verdict`/`Quota` are
/// the terminal/control signals the Iteration Engine and Wake Scheduler act
/// on.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    Text { chunk: String },
    ToolUse { name: String, brief: String },
    Verdict(Verdict),
    Telemetry { tokens: u64, cost_usd: f64 },
    Quota { status: QuotaStatus, reset_at: Option<DateTime<Utc>> },
    /// The underlying process exited; carries its exit code if known.
    SessionExited { exit_code: Option<i32> },
}
