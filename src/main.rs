//! incusgate
//!
//! An SSH front-end for Incus: terminates SSH sessions and proxies shells,
//! execs, PTYs and agent sockets into instances. The login name selects the
//! instance, project and in-instance account.

mod agent;
mod banner;
mod config;
mod error;
mod hostuser;
mod incus;
mod login;
mod session;
mod ssh;
mod subshell;

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn, Level};
use tracing_subscriber::EnvFilter;

use crate::config::GatewayConfig;
use crate::hostuser::HostUserdb;

/// incusgate - SSH gateway into Incus instances
#[derive(Parser, Debug)]
#[command(name = "incusgate", version, about)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "/etc/incusgate/config.toml")]
    config: PathBuf,

    /// Generate default configuration and exit
    #[arg(long)]
    generate_config: bool,

    /// Override listen address
    #[arg(short, long)]
    listen: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new(Level::DEBUG.to_string())
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(Level::INFO.to_string()))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    if cli.generate_config {
        let config = GatewayConfig::default();
        let content = toml::to_string_pretty(&config)?;
        println!("{content}");
        return Ok(());
    }

    let mut config = GatewayConfig::load_or_default(&cli.config)
        .with_context(|| format!("Failed to load config from {}", cli.config.display()))?;

    if let Some(listen) = cli.listen {
        config.listen_addr = listen;
    }

    config.ensure_dirs()?;

    info!("Starting incusgate");
    info!("  Listen address: {}", config.listen_addr);
    info!("  Incus socket: {}", config.incus_socket.display());
    info!("  Shell mode: {:?}", config.shell);

    check_host_identity().await?;

    ssh::run_server(Arc::new(config)).await?;

    Ok(())
}

/// The `id` utility must be present at startup; also warn early when the
/// service user is unlikely to reach the Incus socket.
async fn check_host_identity() -> Result<()> {
    let userdb = HostUserdb::new()?;

    if let Ok(user) = std::env::var("USER") {
        match userdb.group_names(&user).await {
            Ok(groups) => {
                if !groups.iter().any(|g| g == "incus-admin" || g == "root") {
                    warn!("user '{user}' is not in incus-admin; the daemon socket may be unreachable");
                }
            }
            Err(err) => warn!("could not resolve groups for '{user}': {err}"),
        }
    }

    Ok(())
}
