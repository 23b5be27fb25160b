use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::Mutex;

use crate::error::{AnimaError, Result};
use crate::vcs::types::{CommandOutput, LogEntry, MergeStrategy, WorkingTreeStatus};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Runs `git` commands in one project's working tree. All commands are
/// serialized through `lock` so two concurrent drivers on the same tree
/// (e.g. a status poll racing a commit) never interleave.
pub struct GitDriver {
    working_dir: PathBuf,
    timeout: Duration,
    lock: Mutex<()>,
}

impl GitDriver {
    pub fn new(working_dir: PathBuf) -> Self {
        Self {
            working_dir,
            timeout: DEFAULT_TIMEOUT,
            lock: Mutex::new(()),
        }
    }

    pub fn with_timeout(working_dir: PathBuf, timeout: Duration) -> Self {
        Self {
            working_dir,
            timeout,
            lock: Mutex::new(()),
        }
    }

    async fn run(&self, args: &[&str]) -> Result<CommandOutput> {
        let _guard = self.lock.lock().await;
        let command_line = format!("git {}", args.join(" "));

        let mut cmd = Command::new("git");
        cmd.args(args)
            .current_dir(&self.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let output = tokio::time::timeout(self.timeout, cmd.output())
            .await
            .map_err(|_| AnimaError::VersionControl {
                command: command_line.clone(),
                exit_code: None,
                stderr: "timed out".into(),
            })?
            .map_err(|source| AnimaError::PersistenceIo {
                path: self.working_dir.display().to_string(),
                source,
            })?;

        Ok(CommandOutput {
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    /// Runs a command and turns a non-zero exit into `VersionControl`.
    async fn run_checked(&self, args: &[&str]) -> Result<CommandOutput> {
        let out = self.run(args).await?;
        if !out.success() {
            return Err(AnimaError::VersionControl {
                command: format!("git {}", args.join(" ")),
                exit_code: out.exit_code,
                stderr: out.stderr,
            });
        }
        Ok(out)
    }

    pub async fn current_branch(&self) -> Result<String> {
        let out = self.run_checked(&["rev-parse", "--abbrev-ref", "HEAD"]).await?;
        Ok(out.stdout.trim().to_string())
    }

    /// Resolves the repository's default integration branch once, at
    /// registration time (§9): prefer the remote's HEAD symref, fall back to
    /// the branch currently checked out.
    pub async fn default_integration_branch(&self) -> Result<String> {
        let out = self
            .run(&["symbolic-ref", "refs/remotes/origin/HEAD"])
            .await?;
        if out.success() {
            if let Some(name) = out.stdout.trim().strip_prefix("refs/remotes/origin/") {
                return Ok(name.to_string());
            }
        }
        self.current_branch().await
    }

    pub async fn create_branch(&self, name: &str, from_ref: &str) -> Result<()> {
        self.run_checked(&["branch", name, from_ref]).await?;
        Ok(())
    }

    pub async fn switch_branch(&self, name: &str) -> Result<()> {
        self.run_checked(&["checkout", name]).await?;
        Ok(())
    }

    pub async fn status(&self) -> Result<WorkingTreeStatus> {
        let out = self.run_checked(&["status", "--porcelain=v1"]).await?;
        let mut untracked = Vec::new();
        let mut staged = Vec::new();
        let mut modified = Vec::new();
        for line in out.stdout.lines() {
            if line.len() < 3 {
                continue;
            }
            let (index_flag, worktree_flag) = (line.as_bytes()[0], line.as_bytes()[1]);
            let path = line[3..].to_string();
            if index_flag == b'?' && worktree_flag == b'?' {
                untracked.push(path);
            } else {
                if index_flag != b' ' {
                    staged.push(path.clone());
                }
                if worktree_flag != b' ' {
                    modified.push(path);
                }
            }
        }
        let clean = untracked.is_empty() && staged.is_empty() && modified.is_empty();
        Ok(WorkingTreeStatus {
            clean,
            untracked,
            staged,
            modified,
        })
    }

    pub async fn log(&self, branch: &str, since: Option<&str>) -> Result<Vec<LogEntry>> {
        let range = match since {
            Some(since) => format!("{since}..{branch}"),
            None => branch.to_string(),
        };
        let out = self
            .run_checked(&["log", "--pretty=format:%H%x1f%an%x1f%s", &range])
            .await?;
        let mut entries = Vec::new();
        for line in out.stdout.lines().filter(|l| !l.is_empty()) {
            let mut parts = line.splitn(3, '\x1f');
            let (Some(hash), Some(author), Some(subject)) = (parts.next(), parts.next(), parts.next())
            else {
                continue;
            };
            entries.push(LogEntry {
                hash: hash.to_string(),
                author: author.to_string(),
                subject: subject.to_string(),
            });
        }
        Ok(entries)
    }

    pub async fn show_commit(&self, hash: &str) -> Result<String> {
        let out = self.run_checked(&["show", hash]).await?;
        Ok(out.stdout)
    }

    pub async fn diff(&self, from_ref: &str, to_ref: &str) -> Result<String> {
        let range = format!("{from_ref}..{to_ref}");
        let out = self.run_checked(&["diff", &range]).await?;
        Ok(out.stdout)
    }

    pub async fn merge(&self, branch: &str, strategy: MergeStrategy) -> Result<CommandOutput> {
        let args: Vec<&str> = match strategy {
            MergeStrategy::FastForward => vec!["merge", "--ff-only", branch],
            MergeStrategy::Merge => vec!["merge", "--no-ff", branch],
        };
        self.run(&args).await
    }

    pub async fn tag(&self, name: &str, reference: &str) -> Result<()> {
        self.run_checked(&["tag", name, reference]).await?;
        Ok(())
    }

    pub async fn reset(&self, reference: &str, hard: bool) -> Result<()> {
        let mode = if hard { "--hard" } else { "--soft" };
        self.run_checked(&["reset", mode, reference]).await?;
        Ok(())
    }

    pub async fn delete_branch(&self, name: &str, force: bool) -> Result<()> {
        let flag = if force { "-D" } else { "-d" };
        self.run_checked(&["branch", flag, name]).await?;
        Ok(())
    }

    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn init_repo() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        let driver = GitDriver::new(dir.path().to_path_buf());
        driver.run_checked(&["init", "-q", "-b", "main"]).await.unwrap();
        driver
            .run_checked(&["config", "user.email", "test@example.com"])
            .await
            .unwrap();
        driver.run_checked(&["config", "user.name", "Test"]).await.unwrap();
        tokio::fs::write(dir.path().join("README.md"), "hello\n").await.unwrap();
        driver.run_checked(&["add", "."]).await.unwrap();
        driver.run_checked(&["commit", "-q", "-m", "init"]).await.unwrap();
        dir
    }

    #[tokio::test]
    async fn current_branch_reports_initial_branch() {
        let dir = init_repo().await;
        let driver = GitDriver::new(dir.path().to_path_buf());
        assert_eq!(driver.current_branch().await.unwrap(), "main");
    }

    #[tokio::test]
    async fn status_is_clean_after_commit_and_dirty_after_edit() {
        let dir = init_repo().await;
        let driver = GitDriver::new(dir.path().to_path_buf());
        assert!(driver.status().await.unwrap().clean);

        tokio::fs::write(dir.path().join("README.md"), "changed\n").await.unwrap();
        let status = driver.status().await.unwrap();
        assert!(status.is_dirty());
        assert!(status.modified.contains(&"README.md".to_string()));
    }

    #[tokio::test]
    async fn create_branch_then_switch_then_merge_fast_forward() {
        let dir = init_repo().await;
        let driver = GitDriver::new(dir.path().to_path_buf());
        driver.create_branch("feature", "main").await.unwrap();
        driver.switch_branch("feature").await.unwrap();

        tokio::fs::write(dir.path().join("feature.txt"), "x\n").await.unwrap();
        driver.run_checked(&["add", "."]).await.unwrap();
        driver.run_checked(&["commit", "-q", "-m", "feat: add file"]).await.unwrap();

        driver.switch_branch("main").await.unwrap();
        let out = driver.merge("feature", MergeStrategy::FastForward).await.unwrap();
        assert!(out.success());
    }

    #[tokio::test]
    async fn invalid_command_surfaces_exit_code_and_stderr() {
        let dir = init_repo().await;
        let driver = GitDriver::new(dir.path().to_path_buf());
        let err = driver.switch_branch("does-not-exist").await.unwrap_err();
        match err {
            AnimaError::VersionControl { exit_code, .. } => assert_ne!(exit_code, Some(0)),
            other => panic!("expected VersionControl, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn default_integration_branch_falls_back_to_current_branch_without_remote() {
        let dir = init_repo().await;
        let driver = GitDriver::new(dir.path().to_path_buf());
        assert_eq!(driver.default_integration_branch().await.unwrap(), "main");
    }
}
