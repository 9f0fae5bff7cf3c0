//! Bonjour/mDNS advertisement of the agent's metrics port.

use std::net::Ipv4Addr;
use std::time::Duration;

use anyhow::{Context, Result};
use mdns_sd::{ServiceDaemon, ServiceInfo};
use tracing::{debug, warn};

use compdash_proto::MDNS_SERVICE_TYPE;

const READVERTISE_INTERVAL: Duration = Duration::from_secs(60);

/// Register the service and keep re-announcing it so the advertisement
/// survives interface flaps. Never returns while the daemon is healthy.
pub async fn run(hostname: String, port: u16) -> Result<()> {
    let daemon = ServiceDaemon::new().context("mdns daemon failed to start")?;

    loop {
        match register(&daemon, &hostname, port) {
            Ok(()) => debug!("advertising {MDNS_SERVICE_TYPE} as `{hostname}` on port {port}"),
            Err(e) => warn!("mdns registration failed: {e:#}"),
        }
        tokio::time::sleep(READVERTISE_INTERVAL).await;
    }
}

fn register(daemon: &ServiceDaemon, hostname: &str, port: u16) -> Result<()> {
    let ip = primary_ipv4().context("no routable IPv4 address to advertise")?;
    let service = ServiceInfo::new(
        MDNS_SERVICE_TYPE,
        hostname,
        &format!("{hostname}.local."),
        ip,
        port,
        None,
    )
    .context("invalid service info")?;

    daemon.register(service).context("service registration")?;
    Ok(())
}

fn primary_ipv4() -> Option<Ipv4Addr> {
    crate::sampler::enumerate_interfaces()
        .first()
        .and_then(|iface| iface.ipv4.parse().ok())
}
