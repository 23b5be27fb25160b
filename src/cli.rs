//! `anima-cli`: a one-shot control CLI talking to a running `anima` server's
//! HTTP control API (§10.5).

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "anima-cli", about = "Control CLI for a running anima server")]
struct Cli {
    /// Address of the anima server's control API.
    #[arg(long, env = "ANIMA_BIND_ADDR", default_value = "127.0.0.1:4317")]
    server: SocketAddr,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Register a project directory.
    Register {
        path: PathBuf,
        #[arg(long)]
        display_name: Option<String>,
    },
    /// Deregister a project.
    Remove { project_id: Uuid },
    /// List every registered project and its current status.
    List,
    /// Show one project's current snapshot.
    Status { project_id: Uuid },
    /// Force an immediate wake check.
    Wake { project_id: Uuid },
    /// Pause a project's active milestone.
    Pause { project_id: Uuid },
    /// Resume a paused project.
    Resume { project_id: Uuid },
    /// Cancel the milestone currently in progress.
    Cancel { project_id: Uuid, milestone_id: Uuid },
    /// Approve a milestone sitting in `awaiting_review`.
    Approve { project_id: Uuid, milestone_id: Uuid },
    /// Reject a milestone sitting in `awaiting_review`.
    Reject {
        project_id: Uuid,
        milestone_id: Uuid,
        reason: String,
    },
    /// Inject freeform guidance into the next developer round.
    Guidance { project_id: Uuid, text: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let client = reqwest::Client::new();
    let base = format!("http://{}", cli.server);

    let response = match cli.command {
        Command::Register { path, display_name } => {
            let display_name = display_name.unwrap_or_else(|| {
                path.file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| path.display().to_string())
            });
            client
                .post(format!("{base}/api/projects"))
                .json(&serde_json::json!({"path": path, "displayName": display_name}))
                .send()
                .await?
        }
        Command::Remove { project_id } => client.delete(format!("{base}/api/projects/{project_id}")).send().await?,
        Command::List => client.get(format!("{base}/api/projects")).send().await?,
        Command::Status { project_id } => client.get(format!("{base}/api/projects/{project_id}")).send().await?,
        Command::Wake { project_id } => client.post(format!("{base}/api/projects/{project_id}/wake")).send().await?,
        Command::Pause { project_id } => client.post(format!("{base}/api/projects/{project_id}/pause")).send().await?,
        Command::Resume { project_id } => client.post(format!("{base}/api/projects/{project_id}/resume")).send().await?,
        Command::Cancel { project_id, milestone_id } => {
            client
                .post(format!("{base}/api/projects/{project_id}/milestones/{milestone_id}/cancel"))
                .send()
                .await?
        }
        Command::Approve { project_id, milestone_id } => {
            client
                .post(format!("{base}/api/projects/{project_id}/milestones/{milestone_id}/approve"))
                .send()
                .await?
        }
        Command::Reject {
            project_id,
            milestone_id,
            reason,
        } => {
            client
                .post(format!("{base}/api/projects/{project_id}/milestones/{milestone_id}/reject"))
                .json(&serde_json::json!({"reason": reason}))
                .send()
                .await?
        }
        Command::Guidance { project_id, text } => {
            client
                .post(format!("{base}/api/projects/{project_id}/guidance"))
                .json(&serde_json::json!({"text": text}))
                .send()
                .await?
        }
    };

    let status = response.status();
    let body: Value = response.json().await.unwrap_or(Value::Null);
    if !status.is_success() {
        bail!("server returned {status}: {body}");
    }
    println!("{}", serde_json::to_string_pretty(&body)?);
    Ok(())
}
