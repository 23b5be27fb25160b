//! App-level configuration (§10.4): where the registry lives and what
//! address the control API binds to. Project-level `ProjectConfig` is a
//! persisted entity owned by `anima::persistence` instead, since it is
//! read per-project rather than once at startup.

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;

/// Resolved application configuration, merging env vars and CLI flags.
#[derive(Debug, Clone)]
pub struct Config {
    pub config_dir: PathBuf,
    pub bind_addr: SocketAddr,
}

/// `anima` server CLI flags. Env vars `ANIMA_CONFIG_DIR`/`ANIMA_BIND_ADDR`
/// are read by `clap`'s `env` feature; explicit flags win over them.
#[derive(Debug, Parser)]
#[command(name = "anima", about = "Desktop-resident multi-project supervisor")]
pub struct Cli {
    /// Directory holding the app-level project registry (`config.json`).
    #[arg(long, env = "ANIMA_CONFIG_DIR")]
    pub config_dir: Option<PathBuf>,

    /// Address the control API binds to.
    #[arg(long, env = "ANIMA_BIND_ADDR", default_value = "127.0.0.1:4317")]
    pub bind_addr: SocketAddr,
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        let cli = Cli::parse();
        let config_dir = cli
            .config_dir
            .or_else(|| dirs::config_dir().map(|d| d.join("anima")))
            .ok_or_else(|| anyhow::anyhow!("could not resolve a config directory; pass --config-dir"))?;
        Ok(Self {
            config_dir,
            bind_addr: cli.bind_addr,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_parses_minimal_args() {
        let cli = Cli::parse_from(["anima"]);
        assert_eq!(cli.bind_addr.to_string(), "127.0.0.1:4317");
        assert!(cli.config_dir.is_none());
    }

    #[test]
    fn cli_accepts_explicit_bind_addr() {
        let cli = Cli::parse_from(["anima", "--bind-addr", "0.0.0.0:9000"]);
        assert_eq!(cli.bind_addr.to_string(), "0.0.0.0:9000");
    }
}
