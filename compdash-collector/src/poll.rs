//! The three-lane polling supervisor.
//!
//! Each known endpoint gets an independent task that polls `GET /status` on
//! a fixed cadence. Lanes are keyed differently (service name, endpoint
//! string, hardware UUID) and one machine may be polled on several lanes at
//! once; the fleet's merge rules keep that convergent. Tasks are cancelled
//! by aborting their handle, which also aborts an in-flight connection.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use compdash_proto::{wire, Endpoint, Status};

use crate::discovery::DiscoveryEvent;
use crate::fleet::{Fleet, PollLane};

#[derive(Debug, Clone, Copy)]
pub struct PollTiming {
    /// Sleep between poll attempts on one lane.
    pub interval: Duration,
    /// Whole-RPC deadline for a single poll.
    pub deadline: Duration,
}

impl Default for PollTiming {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            deadline: Duration::from_secs(3),
        }
    }
}

#[derive(Debug, Error)]
pub enum PollError {
    #[error("connection timed out")]
    Timeout,
    #[error("connection closed before a complete response")]
    Closed,
    #[error("agent returned status {0}")]
    Rejected(u16),
    #[error("undecodable status payload: {0}")]
    Decode(#[from] serde_json::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// One lane task and the machine it has learned it is polling. The binding
/// is empty until the first success.
struct LaneTask {
    endpoint: Endpoint,
    handle: JoinHandle<()>,
    bound_uuid: Arc<Mutex<Option<String>>>,
}

impl LaneTask {
    fn cancel(&self) {
        self.handle.abort();
    }

    fn bound_to(&self, hardware_uuid: &str) -> bool {
        self.bound_uuid.lock().as_deref() == Some(hardware_uuid)
    }
}

pub struct PollEngine {
    fleet: Arc<Fleet>,
    timing: PollTiming,
    /// Discovered lane, keyed by mDNS service name.
    discovered: Mutex<HashMap<String, LaneTask>>,
    /// Manual lane, keyed by the user-entered `host:port` string.
    manual: Mutex<HashMap<String, LaneTask>>,
    /// Fallback-IP lane, keyed by hardware UUID.
    fallback: Mutex<HashMap<String, LaneTask>>,
}

impl PollEngine {
    pub fn new(fleet: Arc<Fleet>) -> Arc<Self> {
        Self::with_timing(fleet, PollTiming::default())
    }

    /// Same engine with non-default timing; used by tests that cannot wait
    /// out real poll intervals.
    pub fn with_timing(fleet: Arc<Fleet>, timing: PollTiming) -> Arc<Self> {
        Arc::new(Self {
            fleet,
            timing,
            discovered: Mutex::new(HashMap::new()),
            manual: Mutex::new(HashMap::new()),
            fallback: Mutex::new(HashMap::new()),
        })
    }

    /// Spawn lanes for every persisted identity: manual where an endpoint
    /// was saved, fallback-IP where only an address is known.
    pub fn bootstrap(self: &Arc<Self>) {
        for identity in self.fleet.identities() {
            if let Some(manual) = &identity.manual_endpoint {
                match manual.parse::<Endpoint>() {
                    Ok(endpoint) => {
                        self.add_manual(endpoint);
                    }
                    Err(e) => warn!(
                        "persisted endpoint `{manual}` for {} is invalid: {e}",
                        identity.hardware_uuid
                    ),
                }
            } else if let Some(ip) = &identity.last_known_ip {
                self.spawn_fallback(&identity.hardware_uuid, ip);
            }
        }
    }

    /// Consume discovery events until the channel closes.
    pub fn run_discovery(self: Arc<Self>, mut events: mpsc::Receiver<DiscoveryEvent>) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    DiscoveryEvent::Found {
                        service_name,
                        endpoint,
                    } => self.on_found(service_name, endpoint),
                    DiscoveryEvent::Lost { service_name } => self.on_lost(&service_name).await,
                }
            }
        })
    }

    fn on_found(self: &Arc<Self>, service_name: String, endpoint: Endpoint) {
        let mut table = self.discovered.lock();
        if let Some(existing) = table.get(&service_name) {
            if existing.endpoint == endpoint {
                return;
            }
            // Same advertisement, new address: restart the lane there.
            existing.cancel();
        }
        let task = self.spawn_lane(PollLane::Discovered, endpoint, None);
        table.insert(service_name, task);
    }

    async fn on_lost(&self, service_name: &str) {
        let task = self.discovered.lock().remove(service_name);
        let Some(task) = task else {
            return;
        };
        task.cancel();

        // Let the remaining lanes take over status and failure counting.
        let bound = task.bound_uuid.lock().clone();
        if let Some(hardware_uuid) = bound {
            self.fleet.discovered_lost(&hardware_uuid).await;
        }
    }

    /// Start polling a user-entered endpoint. Re-adding the same string is
    /// a no-op.
    pub fn add_manual(self: &Arc<Self>, endpoint: Endpoint) -> bool {
        let key = endpoint.to_string();
        let mut table = self.manual.lock();
        if table.contains_key(&key) {
            return false;
        }
        let task = self.spawn_lane(PollLane::Manual, endpoint, None);
        table.insert(key, task);
        true
    }

    pub fn remove_manual(&self, endpoint_string: &str) -> bool {
        match self.manual.lock().remove(endpoint_string) {
            Some(task) => {
                task.cancel();
                true
            }
            None => false,
        }
    }

    /// Align the fallback-IP lane with a machine's identity: running at its
    /// last known IP when eligible, absent when a manual endpoint covers it.
    pub fn sync_fallback_lane(self: &Arc<Self>, hardware_uuid: &str) {
        let Some(entry) = self.fleet.entry(hardware_uuid) else {
            return;
        };

        if entry.identity.manual_endpoint.is_some() {
            if let Some(task) = self.fallback.lock().remove(hardware_uuid) {
                task.cancel();
            }
            return;
        }
        if let Some(ip) = &entry.identity.last_known_ip {
            self.spawn_fallback(hardware_uuid, ip);
        }
    }

    fn spawn_fallback(self: &Arc<Self>, hardware_uuid: &str, ip: &str) {
        let endpoint = Endpoint::with_default_port(ip);
        let mut table = self.fallback.lock();
        if let Some(existing) = table.get(hardware_uuid) {
            if existing.endpoint == endpoint {
                return;
            }
            existing.cancel();
        }
        let task = self.spawn_lane(
            PollLane::FallbackIp,
            endpoint,
            Some(hardware_uuid.to_string()),
        );
        table.insert(hardware_uuid.to_string(), task);
    }

    /// Cancel every lane task referencing a machine. Synchronous: when this
    /// returns, nothing is polling the machine anymore.
    pub fn cancel_machine(&self, hardware_uuid: &str) {
        if let Some(task) = self.fallback.lock().remove(hardware_uuid) {
            task.cancel();
        }
        for table in [&self.discovered, &self.manual] {
            table.lock().retain(|_, task| {
                if task.bound_to(hardware_uuid) {
                    task.cancel();
                    false
                } else {
                    true
                }
            });
        }
    }

    /// Explicit user delete: cancel the machine's lanes, then drop it from
    /// the fleet and the store.
    pub async fn delete_machine(&self, hardware_uuid: &str) -> bool {
        self.cancel_machine(hardware_uuid);
        self.fleet.remove(hardware_uuid).await
    }

    fn spawn_lane(
        self: &Arc<Self>,
        lane: PollLane,
        endpoint: Endpoint,
        bound: Option<String>,
    ) -> LaneTask {
        let bound_uuid = Arc::new(Mutex::new(bound));
        let slot = Arc::clone(&bound_uuid);
        let engine = Arc::downgrade(self);
        let fleet = Arc::clone(&self.fleet);
        let timing = self.timing;
        let task_endpoint = endpoint.clone();

        let handle = tokio::spawn(async move {
            loop {
                match poll_status(&task_endpoint, timing.deadline).await {
                    Ok(status) => {
                        let hardware_uuid = status.hardware_uuid.clone();
                        *slot.lock() = Some(hardware_uuid.clone());

                        let outcome = fleet.record_success(lane, &task_endpoint, status).await;
                        if outcome.ip_changed.is_some() {
                            if let Some(engine) = engine.upgrade() {
                                engine.sync_fallback_lane(&hardware_uuid);
                            }
                        }
                    }
                    Err(e) => {
                        debug!("poll of {task_endpoint} failed: {e}");
                        let bound = slot.lock().clone();
                        fleet
                            .record_failure(bound.as_deref(), lane, &e.to_string())
                            .await;
                    }
                }
                tokio::time::sleep(timing.interval).await;
            }
        });

        LaneTask {
            endpoint,
            handle,
            bound_uuid,
        }
    }
}

/// One `GET /status` round-trip over a fresh connection.
pub async fn poll_status(endpoint: &Endpoint, deadline: Duration) -> Result<Status, PollError> {
    tokio::time::timeout(deadline, fetch_status(endpoint))
        .await
        .map_err(|_| PollError::Timeout)?
}

async fn fetch_status(endpoint: &Endpoint) -> Result<Status, PollError> {
    let mut stream = TcpStream::connect((endpoint.host.as_str(), endpoint.port)).await?;
    stream
        .write_all(&wire::build_request("GET", "/status", b"", None))
        .await?;

    // Connection: close framing; the peer's EOF delimits the response.
    let mut raw = Vec::new();
    stream.read_to_end(&mut raw).await?;

    let code = wire::parse_status_code(&raw).ok_or(PollError::Closed)?;
    if code != 200 {
        return Err(PollError::Rejected(code));
    }
    let body = wire::extract_body(&raw).ok_or(PollError::Closed)?;
    Ok(Status::from_json(body)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{IdentityStore, StoreState};

    fn engine_in(dir: &tempfile::TempDir) -> Arc<PollEngine> {
        let store = IdentityStore::new(dir.path().join("machines.json"));
        let fleet = Arc::new(Fleet::new(store, StoreState::default()));
        PollEngine::new(fleet)
    }

    #[tokio::test]
    async fn re_adding_a_manual_endpoint_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine_in(&dir);

        assert!(engine.add_manual("10.9.8.7:49990".parse().unwrap()));
        assert!(!engine.add_manual("10.9.8.7:49990".parse().unwrap()));
        assert_eq!(engine.manual.lock().len(), 1);

        assert!(engine.remove_manual("10.9.8.7:49990"));
        assert!(!engine.remove_manual("10.9.8.7:49990"));
    }

    #[tokio::test]
    async fn unreachable_endpoint_times_out_within_deadline() {
        // RFC 5737 TEST-NET address: never routable.
        let endpoint: Endpoint = "192.0.2.1:49990".parse().unwrap();
        let started = std::time::Instant::now();
        let err = poll_status(&endpoint, Duration::from_millis(200))
            .await
            .unwrap_err();
        assert!(matches!(err, PollError::Timeout | PollError::Io(_)));
        assert!(started.elapsed() < Duration::from_secs(2));
    }
}
