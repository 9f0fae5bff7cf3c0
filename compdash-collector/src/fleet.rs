//! The in-memory fleet view and the merge rules that feed it.
//!
//! The fleet is a single-owner map `hardware UUID -> FleetEntry`; entries
//! hold values only, never back-pointers. Views take snapshots or subscribe
//! to the event channel. All mutations run in short critical sections and
//! persistence happens after the lock is released, serialized behind one
//! gate so identity writes never reorder against the mutations that
//! produced them.

use std::collections::hash_map::Entry as MapEntry;
use std::collections::HashMap;

use parking_lot::RwLock;
use time::OffsetDateTime;
use tokio::sync::{broadcast, Mutex as AsyncMutex};
use tracing::{info, warn};

use compdash_proto::{Endpoint, Status, Thresholds};

use crate::store::{GlobalSettings, Identity, IdentityStore, SortOrder, StoreState};

/// Consecutive failures on a counting lane before a machine shows offline.
pub const OFFLINE_THRESHOLD: u32 = 3;

/// Ceiling used when clamping per-machine temperature thresholds.
const TEMP_CEILING_CELSIUS: f64 = 110.0;

/// The three acquisition strategies. A machine may be served by several at
/// once; discovered data wins because it reflects the currently advertised
/// address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollLane {
    Discovered,
    Manual,
    FallbackIp,
}

#[derive(Debug, Clone)]
pub struct FleetEntry {
    pub identity: Identity,
    pub latest_status: Option<Status>,
    pub is_online: bool,
    pub consecutive_failures: u32,
    /// True while mDNS currently sees this machine.
    pub is_discovered_active: bool,
    pub discovered_endpoint: Option<Endpoint>,
    pub last_error: Option<String>,
}

impl FleetEntry {
    fn new(identity: Identity) -> Self {
        Self {
            identity,
            latest_status: None,
            is_online: false,
            consecutive_failures: 0,
            is_discovered_active: false,
            discovered_endpoint: None,
            last_error: None,
        }
    }
}

#[derive(Debug, Clone)]
pub enum FleetEvent {
    Updated { hardware_uuid: String },
    Removed { hardware_uuid: String },
}

/// What a successful merge changed, for the poll supervisor.
#[derive(Debug, Default)]
pub struct MergeOutcome {
    pub created: bool,
    /// Set when the primary IPv4 moved; the fallback lane restarts with it.
    pub ip_changed: Option<String>,
}

struct FleetState {
    sort_order: SortOrder,
    settings: GlobalSettings,
    entries: HashMap<String, FleetEntry>,
}

impl FleetState {
    fn to_store_state(&self) -> StoreState {
        let mut machines: Vec<Identity> = self
            .entries
            .values()
            .map(|entry| entry.identity.clone())
            .collect();
        machines.sort_by(|a, b| {
            a.display_name
                .cmp(&b.display_name)
                .then_with(|| a.hardware_uuid.cmp(&b.hardware_uuid))
        });

        StoreState {
            sort_order: self.sort_order,
            settings: self.settings,
            machines,
        }
    }
}

pub struct Fleet {
    state: RwLock<FleetState>,
    store: IdentityStore,
    persist_gate: AsyncMutex<()>,
    events: broadcast::Sender<FleetEvent>,
}

impl Fleet {
    pub fn new(store: IdentityStore, initial: StoreState) -> Self {
        let entries = initial
            .machines
            .into_iter()
            .map(|identity| (identity.hardware_uuid.clone(), FleetEntry::new(identity)))
            .collect();

        let (events, _) = broadcast::channel(256);
        Self {
            state: RwLock::new(FleetState {
                sort_order: initial.sort_order,
                settings: initial.settings,
                entries,
            }),
            store,
            persist_gate: AsyncMutex::new(()),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FleetEvent> {
        self.events.subscribe()
    }

    pub fn snapshot(&self) -> Vec<FleetEntry> {
        self.state.read().entries.values().cloned().collect()
    }

    pub fn entry(&self, hardware_uuid: &str) -> Option<FleetEntry> {
        self.state.read().entries.get(hardware_uuid).cloned()
    }

    pub fn identities(&self) -> Vec<Identity> {
        self.state
            .read()
            .entries
            .values()
            .map(|entry| entry.identity.clone())
            .collect()
    }

    /// Merge one successful poll, keyed on the status's hardware UUID.
    pub async fn record_success(
        &self,
        lane: PollLane,
        endpoint: &Endpoint,
        status: Status,
    ) -> MergeOutcome {
        let hardware_uuid = status.hardware_uuid.clone();
        let outcome = self
            .mutate(|state| {
                let now = OffsetDateTime::now_utc();
                let default_thresholds = state.settings.temp_thresholds;
                let mut outcome = MergeOutcome::default();
                let mut persist = false;

                let entry = match state.entries.entry(hardware_uuid.clone()) {
                    MapEntry::Occupied(occupied) => occupied.into_mut(),
                    MapEntry::Vacant(vacant) => {
                        info!("new machine `{}` ({hardware_uuid})", status.hostname);
                        outcome.created = true;
                        persist = true;
                        vacant.insert(FleetEntry::new(Identity {
                            hardware_uuid: hardware_uuid.clone(),
                            last_known_hostname: status.hostname.clone(),
                            display_name: status.hostname.clone(),
                            thresholds: default_thresholds,
                            last_seen: now,
                            manual_endpoint: (lane == PollLane::Manual)
                                .then(|| endpoint.to_string()),
                            last_known_ip: None,
                            widget_slots: None,
                        }))
                    }
                };

                entry.consecutive_failures = 0;
                entry.is_online = true;
                entry.last_error = None;
                entry.identity.last_seen = now;

                if entry.identity.last_known_hostname != status.hostname {
                    entry.identity.last_known_hostname = status.hostname.clone();
                    persist = true;
                }

                match lane {
                    PollLane::Discovered => {
                        entry.is_discovered_active = true;
                        entry.discovered_endpoint = Some(endpoint.clone());
                        entry.latest_status = Some(status.clone());
                    }
                    PollLane::Manual | PollLane::FallbackIp => {
                        // Discovered data is fresher: it is the currently
                        // advertised address. Other lanes only fill in when
                        // discovery does not see the machine.
                        if !entry.is_discovered_active {
                            entry.latest_status = Some(status.clone());
                        }
                        if lane == PollLane::Manual {
                            let as_string = endpoint.to_string();
                            if entry.identity.manual_endpoint.as_deref() != Some(as_string.as_str()) {
                                entry.identity.manual_endpoint = Some(as_string);
                                persist = true;
                            }
                        }
                    }
                }

                if let Some(ip) = status.primary_ipv4() {
                    if entry.identity.last_known_ip.as_deref() != Some(ip) {
                        entry.identity.last_known_ip = Some(ip.to_string());
                        outcome.ip_changed = Some(ip.to_string());
                        persist = true;
                    }
                }

                (outcome, persist)
            })
            .await;

        self.emit(FleetEvent::Updated { hardware_uuid });
        outcome
    }

    /// Count one failed poll against the machine a lane is bound to.
    ///
    /// Unbound lanes (no success yet) have nothing to count against. A
    /// non-discovered lane whose machine is currently served by discovery
    /// must not count either: the machine is demonstrably fine.
    pub async fn record_failure(&self, bound_uuid: Option<&str>, lane: PollLane, error: &str) {
        let Some(uuid) = bound_uuid else {
            return;
        };

        let went_offline = self
            .mutate(|state| {
                let Some(entry) = state.entries.get_mut(uuid) else {
                    return (false, false);
                };
                if lane != PollLane::Discovered && entry.is_discovered_active {
                    return (false, false);
                }

                entry.consecutive_failures += 1;
                let went_offline =
                    entry.is_online && entry.consecutive_failures >= OFFLINE_THRESHOLD;
                if went_offline {
                    entry.is_online = false;
                    entry.last_error = Some(error.to_string());
                    info!(
                        "machine {} offline after {} consecutive failures",
                        entry.identity.display_name, entry.consecutive_failures
                    );
                }
                (went_offline, false)
            })
            .await;

        if went_offline {
            self.emit(FleetEvent::Updated {
                hardware_uuid: uuid.to_string(),
            });
        }
    }

    /// The mDNS advertisement for this machine disappeared; other lanes
    /// resume counting failures and serving status data.
    pub async fn discovered_lost(&self, hardware_uuid: &str) {
        self.mutate(|state| {
            if let Some(entry) = state.entries.get_mut(hardware_uuid) {
                entry.is_discovered_active = false;
                entry.discovered_endpoint = None;
            }
            ((), false)
        })
        .await;
    }

    /// Best reachable address for outbound RPCs, in preference order:
    /// manual endpoint, currently discovered endpoint, last known IP, first
    /// IPv4 from the latest status.
    pub fn resolve_endpoint(&self, hardware_uuid: &str) -> Option<Endpoint> {
        let state = self.state.read();
        let entry = state.entries.get(hardware_uuid)?;

        if let Some(manual) = &entry.identity.manual_endpoint {
            if let Ok(endpoint) = manual.parse() {
                return Some(endpoint);
            }
        }
        if let Some(endpoint) = &entry.discovered_endpoint {
            return Some(endpoint.clone());
        }
        if let Some(ip) = &entry.identity.last_known_ip {
            return Some(Endpoint::with_default_port(ip.clone()));
        }
        entry
            .latest_status
            .as_ref()
            .and_then(|status| status.primary_ipv4())
            .map(|ip| Endpoint::with_default_port(ip.to_string()))
    }

    pub async fn set_display_name(&self, hardware_uuid: &str, name: &str) -> bool {
        let changed = self
            .mutate(|state| {
                let Some(entry) = state.entries.get_mut(hardware_uuid) else {
                    return (false, false);
                };
                entry.identity.display_name = name.to_string();
                (true, true)
            })
            .await;
        if changed {
            self.emit(FleetEvent::Updated {
                hardware_uuid: hardware_uuid.to_string(),
            });
        }
        changed
    }

    pub async fn set_thresholds(&self, hardware_uuid: &str, mut thresholds: Thresholds) -> bool {
        thresholds.validate(TEMP_CEILING_CELSIUS);
        let changed = self
            .mutate(|state| {
                let Some(entry) = state.entries.get_mut(hardware_uuid) else {
                    return (false, false);
                };
                entry.identity.thresholds = thresholds;
                (true, true)
            })
            .await;
        if changed {
            self.emit(FleetEvent::Updated {
                hardware_uuid: hardware_uuid.to_string(),
            });
        }
        changed
    }

    /// Record or clear a user-entered endpoint for this machine.
    pub async fn set_manual_endpoint(
        &self,
        hardware_uuid: &str,
        endpoint: Option<&Endpoint>,
    ) -> bool {
        let changed = self
            .mutate(|state| {
                let Some(entry) = state.entries.get_mut(hardware_uuid) else {
                    return (false, false);
                };
                entry.identity.manual_endpoint = endpoint.map(Endpoint::to_string);
                (true, true)
            })
            .await;
        if changed {
            self.emit(FleetEvent::Updated {
                hardware_uuid: hardware_uuid.to_string(),
            });
        }
        changed
    }

    pub async fn set_sort_order(&self, order: SortOrder) {
        self.mutate(|state| {
            state.sort_order = order;
            ((), true)
        })
        .await;
    }

    /// Attach or clear the one-line error shown on a machine's card.
    pub async fn set_last_error(&self, hardware_uuid: &str, error: Option<String>) {
        self.mutate(|state| {
            if let Some(entry) = state.entries.get_mut(hardware_uuid) {
                entry.last_error = error;
            }
            ((), false)
        })
        .await;
        self.emit(FleetEvent::Updated {
            hardware_uuid: hardware_uuid.to_string(),
        });
    }

    /// Explicit user delete. The caller cancels the machine's lane tasks
    /// first; entries are never removed automatically.
    pub async fn remove(&self, hardware_uuid: &str) -> bool {
        let removed = self
            .mutate(|state| {
                let removed = state.entries.remove(hardware_uuid).is_some();
                (removed, removed)
            })
            .await;
        if removed {
            self.emit(FleetEvent::Removed {
                hardware_uuid: hardware_uuid.to_string(),
            });
        }
        removed
    }

    /// Run one mutation in a critical section, then persist the resulting
    /// snapshot if the closure asked for it. The async gate orders
    /// mutate+persist pairs; the state lock is never held across the write.
    async fn mutate<R>(&self, f: impl FnOnce(&mut FleetState) -> (R, bool)) -> R {
        let _gate = self.persist_gate.lock().await;

        let (result, snapshot) = {
            let mut state = self.state.write();
            let (result, persist) = f(&mut state);
            let snapshot = persist.then(|| state.to_store_state());
            (result, snapshot)
        };

        if let Some(snapshot) = snapshot {
            if let Err(e) = self.store.save(&snapshot).await {
                // In-memory state stays authoritative; the next mutation
                // retries the write.
                warn!("identity store write failed: {e}");
            }
        }

        result
    }

    fn emit(&self, event: FleetEvent) {
        let _ = self.events.send(event);
    }
}
