//! Anima server: the long-running process hosting the Supervisor and its
//! HTTP control API.

use std::sync::Arc;

use anima::api::{self, handlers::ServerState};
use anima::clock::SystemClock;
use anima::config::Config;
use anima::logging::ProjectLogLayer;
use anima::supervisor::Supervisor;
use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let project_logs = ProjectLogLayer::new();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info,anima=debug,tower_http=debug".into()))
        .with(tracing_subscriber::fmt::layer())
        .with(project_logs.clone())
        .init();

    let config = Config::load()?;
    tracing::info!(config_dir = %config.config_dir.display(), bind_addr = %config.bind_addr, "starting anima");

    std::fs::create_dir_all(&config.config_dir)?;

    let supervisor = Arc::new(Supervisor::new(config.config_dir.clone(), Arc::new(SystemClock), project_logs));
    supervisor.recover_all().await.map_err(|e| anyhow::anyhow!(e.to_string()))?;

    let app = api::create_router(ServerState { supervisor });

    let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
    tracing::info!(addr = %config.bind_addr, "control API listening");
    axum::serve(listener, app).await?;

    Ok(())
}
