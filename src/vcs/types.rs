use serde::{Deserialize, Serialize};

/// Verbatim result of a single git invocation (§4.2: "a command that fails
/// returns its exit code, standard output, and standard error verbatim").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandOutput {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeStrategy {
    FastForward,
    Merge,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkingTreeStatus {
    pub clean: bool,
    pub untracked: Vec<String>,
    pub staged: Vec<String>,
    pub modified: Vec<String>,
}

impl WorkingTreeStatus {
    pub fn is_dirty(&self) -> bool {
        !self.clean
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub hash: String,
    pub author: String,
    pub subject: String,
}
