//! compdash collector: discovers agents, polls the fleet, and drives
//! version-gated updates.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::{broadcast, mpsc};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use compdash_collector::config;
use compdash_collector::discovery;
use compdash_collector::fleet::{Fleet, FleetEvent};
use compdash_collector::poll::PollEngine;
use compdash_collector::store::IdentityStore;
use compdash_collector::updates::UpdateController;
use compdash_proto::Endpoint;

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser, Debug)]
#[command(name = "compdash-collector", version, about = "Fleet monitoring collector")]
struct Cli {
    /// Path to the YAML config file.
    #[arg(short, long, env = "COMPDASH_COLLECTOR_CONFIG")]
    config: Option<PathBuf>,

    /// Extra `host:port` endpoints to poll alongside discovery. May repeat.
    #[arg(long = "endpoint")]
    endpoints: Vec<String>,
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing();

    let cfg = config::load_config(cli.config.as_deref()).await;

    // Bad endpoint strings are a startup failure, not something to limp
    // past: the operator typed them.
    let manual_endpoints = cli
        .endpoints
        .iter()
        .map(|raw| {
            raw.parse::<Endpoint>()
                .with_context(|| format!("invalid --endpoint `{raw}`"))
        })
        .collect::<Result<Vec<_>>>()?;

    let store = match cfg.store.path.clone() {
        Some(path) => IdentityStore::new(path),
        None => IdentityStore::at_default_location(),
    };
    info!("compdash collector v{VERSION}, store at {}", store.path().display());

    let state = store.load().await;
    info!("loaded {} known machines", state.machines.len());
    let fleet = Arc::new(Fleet::new(store, state));

    let engine = PollEngine::new(Arc::clone(&fleet));
    engine.bootstrap();
    for endpoint in manual_endpoints {
        engine.add_manual(endpoint);
    }

    let (discovery_tx, discovery_rx) = mpsc::channel(64);
    discovery::spawn(discovery_tx);
    Arc::clone(&engine).run_discovery(discovery_rx);

    let controller = Arc::new(UpdateController::new(
        Arc::clone(&fleet),
        &cfg.update.github_repo,
        VERSION,
    ));
    tokio::spawn(Arc::clone(&controller).run_periodic());

    run_event_log(fleet).await;
    Ok(())
}

/// The headless stand-in for the card grid: one log line per fleet
/// transition, until shutdown.
async fn run_event_log(fleet: Arc<Fleet>) {
    let mut events = fleet.subscribe();
    loop {
        match events.recv().await {
            Ok(FleetEvent::Updated { hardware_uuid }) => {
                if let Some(entry) = fleet.entry(&hardware_uuid) {
                    info!(
                        "{}: {} ({} failures{})",
                        entry.identity.display_name,
                        if entry.is_online { "online" } else { "offline" },
                        entry.consecutive_failures,
                        entry
                            .last_error
                            .as_deref()
                            .map(|e| format!(", last error: {e}"))
                            .unwrap_or_default(),
                    );
                }
            }
            Ok(FleetEvent::Removed { hardware_uuid }) => {
                info!("machine {hardware_uuid} removed");
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!("event log fell behind by {skipped} events");
            }
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
}
