//! compdash agent: serves read-only system metrics to the fleet dashboard.
//!
//! Subsystems, each on its own task:
//! - metrics sampler feeding the raw-TCP server
//! - mDNS advertisement once the listener has a port
//! - autonomous release checks
//! - dashboard-liveness ticker

mod advertise;
mod config;
mod sampler;
mod server;
mod updater;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::sampler::Sampler;
use crate::server::AgentServer;
use crate::updater::Updater;

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser, Debug)]
#[command(name = "compdash-agent", version, about = "Fleet metrics agent")]
struct Cli {
    /// Path to the YAML config file.
    #[arg(short, long, env = "COMPDASH_AGENT_CONFIG")]
    config: Option<PathBuf>,
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing();

    let cfg = config::load_config(cli.config.as_deref()).await;
    let hostname = gethostname::gethostname().to_string_lossy().to_string();
    info!("compdash agent v{VERSION} starting on {hostname}");

    let sampler = Arc::new(Sampler::new(VERSION));
    let updater = Arc::new(Updater::new(
        VERSION,
        &cfg.update.github_repo,
        cfg.update.auto_update,
    ));
    tokio::spawn(Arc::clone(&updater).run_periodic_checks());

    let (server, mut port_rx) =
        AgentServer::new(sampler, Arc::clone(&updater), cfg.server.base_port);

    tokio::spawn(async move {
        let port = loop {
            if let Some(port) = *port_rx.borrow_and_update() {
                break port;
            }
            if port_rx.changed().await.is_err() {
                return;
            }
        };
        if let Err(e) = advertise::run(hostname, port).await {
            error!("mdns advertisement stopped: {e:#}");
        }
    });

    spawn_liveness_ticker(Arc::clone(&server));

    // Only a fatal bind failure comes back from here.
    server.run().await
}

/// Log dashboard connect/disconnect transitions, sampled every 5 seconds.
fn spawn_liveness_ticker(server: Arc<AgentServer>) {
    tokio::spawn(async move {
        let mut connected = false;
        let mut ticker = tokio::time::interval(Duration::from_secs(5));
        loop {
            ticker.tick().await;
            let now = server.dashboard_connected();
            if now != connected {
                connected = now;
                if now {
                    info!("dashboard connected");
                } else {
                    info!("no dashboard connected");
                }
            }
        }
    });
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
}
