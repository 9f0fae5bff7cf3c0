//! mDNS browsing for `_computerdash._tcp` agents.
//!
//! The browser worker owns its service-name map and forwards only *changes*:
//! a Found for each new appearance (or address change), a Lost when an
//! advertisement goes away. Service names are hostnames and hostnames
//! change; identity is always resolved downstream from the first successful
//! poll, never from here.

use std::collections::HashMap;
use std::time::Duration;

use mdns_sd::{ServiceDaemon, ServiceEvent};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use compdash_proto::{Endpoint, MDNS_SERVICE_TYPE};

const RESTART_DELAY: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryEvent {
    Found {
        service_name: String,
        endpoint: Endpoint,
    },
    Lost {
        service_name: String,
    },
}

/// Start the browser worker. On daemon failure it restarts browsing after a
/// short delay; it only exits when the event receiver is gone.
pub fn spawn(events: mpsc::Sender<DiscoveryEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match browse(&events).await {
                BrowseExit::ReceiverClosed => return,
                BrowseExit::DaemonFailed(e) => {
                    warn!("mdns browser failed: {e:#}; restarting in {}s", RESTART_DELAY.as_secs());
                    tokio::time::sleep(RESTART_DELAY).await;
                }
            }
        }
    })
}

enum BrowseExit {
    ReceiverClosed,
    DaemonFailed(anyhow::Error),
}

async fn browse(events: &mpsc::Sender<DiscoveryEvent>) -> BrowseExit {
    // The daemon handle must outlive the receiver loop.
    let daemon = match ServiceDaemon::new() {
        Ok(daemon) => daemon,
        Err(e) => return BrowseExit::DaemonFailed(e.into()),
    };
    let receiver = match daemon.browse(MDNS_SERVICE_TYPE) {
        Ok(receiver) => receiver,
        Err(e) => return BrowseExit::DaemonFailed(e.into()),
    };

    let mut known: HashMap<String, Endpoint> = HashMap::new();
    loop {
        let event = match receiver.recv_async().await {
            Ok(event) => event,
            Err(e) => return BrowseExit::DaemonFailed(e.into()),
        };

        match event {
            ServiceEvent::ServiceResolved(info) => {
                let service_name = instance_name(info.get_fullname());
                let Some(address) = info.get_addresses().iter().next() else {
                    debug!("`{service_name}` resolved without an address");
                    continue;
                };
                let endpoint = Endpoint::new(address.to_string(), info.get_port());

                // Re-announcements of an unchanged endpoint are not
                // re-emitted.
                let previous = known.insert(service_name.clone(), endpoint.clone());
                if previous.as_ref() == Some(&endpoint) {
                    continue;
                }

                info!("discovered `{service_name}` at {endpoint}");
                if events
                    .send(DiscoveryEvent::Found {
                        service_name,
                        endpoint,
                    })
                    .await
                    .is_err()
                {
                    return BrowseExit::ReceiverClosed;
                }
            }
            ServiceEvent::ServiceRemoved(_, fullname) => {
                let service_name = instance_name(&fullname);
                if known.remove(&service_name).is_none() {
                    continue;
                }

                info!("lost `{service_name}`");
                if events
                    .send(DiscoveryEvent::Lost { service_name })
                    .await
                    .is_err()
                {
                    return BrowseExit::ReceiverClosed;
                }
            }
            ServiceEvent::SearchStarted(_)
            | ServiceEvent::ServiceFound(_, _)
            | ServiceEvent::SearchStopped(_) => {}
        }
    }
}

fn instance_name(fullname: &str) -> String {
    fullname
        .strip_suffix(&format!(".{MDNS_SERVICE_TYPE}"))
        .unwrap_or(fullname)
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instance_name_strips_the_service_suffix() {
        assert_eq!(
            instance_name("booth-3._computerdash._tcp.local."),
            "booth-3"
        );
        // Unexpected shapes pass through untouched.
        assert_eq!(instance_name("weird"), "weird");
    }
}
