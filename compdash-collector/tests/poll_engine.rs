//! End-to-end poll engine tests against an in-process fake agent speaking
//! the real wire framing.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use compdash_collector::fleet::Fleet;
use compdash_collector::poll::{PollEngine, PollTiming};
use compdash_collector::store::IdentityStore;
use compdash_proto::{wire, Endpoint};

const FAST: PollTiming = PollTiming {
    interval: Duration::from_millis(50),
    deadline: Duration::from_millis(500),
};

struct FakeAgent {
    addr: SocketAddr,
    polls: Arc<AtomicUsize>,
    handle: JoinHandle<()>,
}

impl FakeAgent {
    /// Serve `status_json` to every `GET /status` until stopped.
    async fn serve(status_json: &'static str) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let polls = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&polls);
        let handle = tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    return;
                };
                counter.fetch_add(1, Ordering::SeqCst);

                let mut buf = vec![0u8; 4096];
                let _ = stream.read(&mut buf).await;
                let response =
                    wire::build_response(200, status_json.as_bytes(), "application/json");
                let _ = stream.write_all(&response).await;
                let _ = stream.shutdown().await;
            }
        });

        FakeAgent {
            addr,
            polls,
            handle,
        }
    }

    fn endpoint(&self) -> Endpoint {
        Endpoint::new("127.0.0.1", self.addr.port())
    }

    fn stop(&self) {
        self.handle.abort();
    }
}

fn fleet_in(dir: &tempfile::TempDir) -> Arc<Fleet> {
    let store = IdentityStore::new(dir.path().join("machines.json"));
    Arc::new(Fleet::new(store, Default::default()))
}

async fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("timed out waiting for {what}");
}

const BOOTH_STATUS: &str = r#"{
    "hardwareUUID": "4C4C4544-0042",
    "hostname": "booth-3",
    "cpuTempCelsius": 51.0,
    "cpuUsagePercent": 7.5,
    "networkBytesPerSec": 2048.0,
    "uptimeSeconds": 3600.0,
    "osVersion": "14.4.1",
    "chipType": "Apple M2",
    "networks": [{
        "interfaceName": "en0",
        "ipAddress": "127.0.0.1",
        "macAddress": "AA:BB:CC:DD:EE:FF",
        "interfaceType": "Ethernet"
    }],
    "fileVaultEnabled": true,
    "agentVersion": "1.4.2"
}"#;

/// A first-generation agent still emitting the singular `network` object
/// and no version field.
const LEGACY_STATUS: &str = r#"{
    "hardwareUUID": "LEGACY-0001",
    "hostname": "projection",
    "cpuTempCelsius": -1,
    "cpuUsagePercent": 22.0,
    "networkBytesPerSec": 0,
    "uptimeSeconds": 120.0,
    "osVersion": "10.0.19045",
    "chipType": "Unknown",
    "network": {
        "interfaceName": "Ethernet",
        "ipAddress": "127.0.0.1",
        "macAddress": "Unknown",
        "interfaceType": "Ethernet"
    },
    "fileVaultEnabled": false
}"#;

#[tokio::test]
async fn cold_start_creates_a_persisted_fleet_entry() {
    let dir = tempfile::tempdir().unwrap();
    let fleet = fleet_in(&dir);
    let engine = PollEngine::with_timing(Arc::clone(&fleet), FAST);

    let agent = FakeAgent::serve(BOOTH_STATUS).await;
    assert!(engine.add_manual(agent.endpoint()));

    wait_until("fleet entry creation", || {
        fleet.entry("4C4C4544-0042").is_some()
    })
    .await;

    let entry = fleet.entry("4C4C4544-0042").unwrap();
    assert!(entry.is_online);
    assert_eq!(entry.identity.display_name, "booth-3");
    assert_eq!(entry.identity.last_known_hostname, "booth-3");
    assert_eq!(entry.identity.last_known_ip.as_deref(), Some("127.0.0.1"));
    assert_eq!(
        entry.latest_status.as_ref().unwrap().agent_version.as_deref(),
        Some("1.4.2")
    );

    // The identity reached disk.
    let persisted = IdentityStore::new(dir.path().join("machines.json"))
        .load()
        .await;
    assert_eq!(persisted.machines.len(), 1);
    assert_eq!(persisted.machines[0].hardware_uuid, "4C4C4544-0042");

    agent.stop();
}

#[tokio::test]
async fn legacy_single_network_agents_are_polled_fine() {
    let dir = tempfile::tempdir().unwrap();
    let fleet = fleet_in(&dir);
    let engine = PollEngine::with_timing(Arc::clone(&fleet), FAST);

    let agent = FakeAgent::serve(LEGACY_STATUS).await;
    engine.add_manual(agent.endpoint());

    wait_until("legacy entry creation", || {
        fleet.entry("LEGACY-0001").is_some()
    })
    .await;

    let entry = fleet.entry("LEGACY-0001").unwrap();
    let status = entry.latest_status.unwrap();
    assert_eq!(status.networks.len(), 1);
    assert_eq!(status.networks[0].ipv4, "127.0.0.1");
    assert_eq!(status.agent_version, None);

    agent.stop();
}

#[tokio::test]
async fn partition_marks_offline_after_three_failures_then_recovers() {
    let dir = tempfile::tempdir().unwrap();
    let fleet = fleet_in(&dir);
    let engine = PollEngine::with_timing(Arc::clone(&fleet), FAST);

    let agent = FakeAgent::serve(BOOTH_STATUS).await;
    let endpoint = agent.endpoint();
    engine.add_manual(endpoint.clone());

    wait_until("initial online", || {
        fleet.entry("4C4C4544-0042").is_some_and(|e| e.is_online)
    })
    .await;

    // Partition: the agent goes away; polls start failing.
    agent.stop();
    wait_until("offline after third failure", || {
        fleet.entry("4C4C4544-0042").is_some_and(|e| !e.is_online)
    })
    .await;
    assert!(fleet.entry("4C4C4544-0042").unwrap().consecutive_failures >= 3);

    // Recovery on the same address flips it back on the next success. The
    // old listener may take a moment to release the port.
    let listener = loop {
        match TcpListener::bind(("127.0.0.1", endpoint.port)).await {
            Ok(listener) => break listener,
            Err(_) => tokio::time::sleep(Duration::from_millis(25)).await,
        }
    };
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            let mut buf = vec![0u8; 4096];
            let _ = stream.read(&mut buf).await;
            let response =
                wire::build_response(200, BOOTH_STATUS.as_bytes(), "application/json");
            let _ = stream.write_all(&response).await;
            let _ = stream.shutdown().await;
        }
    });

    wait_until("recovery", || {
        fleet.entry("4C4C4544-0042").is_some_and(|e| e.is_online)
    })
    .await;
    assert_eq!(fleet.entry("4C4C4544-0042").unwrap().consecutive_failures, 0);
}

#[tokio::test]
async fn delete_cancels_polling_before_returning() {
    let dir = tempfile::tempdir().unwrap();
    let fleet = fleet_in(&dir);
    let engine = PollEngine::with_timing(Arc::clone(&fleet), FAST);

    let agent = FakeAgent::serve(BOOTH_STATUS).await;
    engine.add_manual(agent.endpoint());

    wait_until("fleet entry creation", || {
        fleet.entry("4C4C4544-0042").is_some()
    })
    .await;

    assert!(engine.delete_machine("4C4C4544-0042").await);
    assert!(fleet.entry("4C4C4544-0042").is_none());

    // Give any straggler one interval to show itself, then require silence.
    tokio::time::sleep(Duration::from_millis(150)).await;
    let settled = agent.polls.load(Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(agent.polls.load(Ordering::SeqCst), settled);

    agent.stop();
}
