//! Persistent identity store: one JSON file of everything the collector
//! knows about its machines.
//!
//! Reads are tolerant (a missing, unreadable, or mismatched file yields the
//! defaults); writes are atomic (temp sibling, fsync, rename). Keys are
//! sorted and the file is pretty-printed so it diffs cleanly in backups.

use std::io::Write;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::{debug, warn};

use compdash_proto::Thresholds;

const STORE_DIR: &str = "ComputerDashboard";
const STORE_FILE: &str = "machines.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    #[default]
    Name,
    Temperature,
    Uptime,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GlobalSettings {
    #[serde(rename = "tempThresholds")]
    pub temp_thresholds: Thresholds,
    #[serde(rename = "cpuThresholds")]
    pub cpu_thresholds: Thresholds,
}

impl Default for GlobalSettings {
    fn default() -> Self {
        Self {
            temp_thresholds: Thresholds::temperature_default(),
            cpu_thresholds: Thresholds::cpu_default(),
        }
    }
}

/// One machine as persisted, keyed by hardware UUID. The UUID is the only
/// identity; hostname and addresses are just the latest observations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Identity {
    #[serde(rename = "hardwareUUID")]
    pub hardware_uuid: String,
    #[serde(rename = "lastKnownHostname")]
    pub last_known_hostname: String,
    /// User-editable; defaults to the hostname on first sight.
    #[serde(rename = "displayName")]
    pub display_name: String,
    pub thresholds: Thresholds,
    #[serde(rename = "lastSeen", with = "time::serde::rfc3339")]
    pub last_seen: OffsetDateTime,
    #[serde(rename = "manualEndpoint", default, skip_serializing_if = "Option::is_none")]
    pub manual_endpoint: Option<String>,
    #[serde(rename = "lastKnownIP", default, skip_serializing_if = "Option::is_none")]
    pub last_known_ip: Option<String>,
    /// Opaque UI attachment; carried through untouched.
    #[serde(rename = "widgetSlots", default, skip_serializing_if = "Option::is_none")]
    pub widget_slots: Option<Vec<serde_json::Value>>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct StoreState {
    #[serde(rename = "sortOrder", default)]
    pub sort_order: SortOrder,
    #[serde(default)]
    pub settings: GlobalSettings,
    #[serde(default)]
    pub machines: Vec<Identity>,
}

#[derive(Clone)]
pub struct IdentityStore {
    path: PathBuf,
}

impl IdentityStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// `<user-app-data>/ComputerDashboard/machines.json`.
    pub fn at_default_location() -> Self {
        let base = dirs::data_dir().unwrap_or_else(|| PathBuf::from("."));
        Self::new(base.join(STORE_DIR).join(STORE_FILE))
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    /// Load the persisted state. Every failure mode degrades to defaults;
    /// the collector must come up regardless of what is on disk.
    pub async fn load(&self) -> StoreState {
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(e) => {
                debug!("no identity store at {}: {e}", self.path.display());
                return StoreState::default();
            }
        };

        serde_json::from_str(&raw).unwrap_or_else(|e| {
            warn!(
                "identity store at {} did not parse: {e}; starting fresh",
                self.path.display()
            );
            StoreState::default()
        })
    }

    /// Atomic write: serialize, write to a temp sibling, fsync, rename over.
    pub async fn save(&self, state: &StoreState) -> std::io::Result<()> {
        // Round-tripping through `Value` sorts object keys.
        let value = serde_json::to_value(state)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        let text = serde_json::to_string_pretty(&value)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

        let path = self.path.clone();
        tokio::task::spawn_blocking(move || {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let tmp = path.with_extension("json.tmp");
            {
                let mut file = std::fs::File::create(&tmp)?;
                file.write_all(text.as_bytes())?;
                file.sync_all()?;
            }
            std::fs::rename(&tmp, &path)
        })
        .await
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    fn identity(uuid: &str) -> Identity {
        Identity {
            hardware_uuid: uuid.to_string(),
            last_known_hostname: "booth-3".into(),
            display_name: "Booth 3".into(),
            thresholds: Thresholds::temperature_default(),
            last_seen: datetime!(2026-08-02 12:00:00 UTC),
            manual_endpoint: Some("10.0.0.7:49990".into()),
            last_known_ip: Some("192.168.1.40".into()),
            widget_slots: None,
        }
    }

    fn store_in(dir: &tempfile::TempDir) -> IdentityStore {
        IdentityStore::new(dir.path().join(STORE_FILE))
    }

    #[tokio::test]
    async fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);

        let state = StoreState {
            sort_order: SortOrder::Temperature,
            settings: GlobalSettings::default(),
            machines: vec![identity("uuid-a"), identity("uuid-b")],
        };
        store.save(&state).await.unwrap();

        assert_eq!(store.load().await, state);
    }

    #[tokio::test]
    async fn missing_file_loads_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let state = store_in(&dir).load().await;
        assert_eq!(state, StoreState::default());
        assert_eq!(state.sort_order, SortOrder::Name);
        assert!(state.machines.is_empty());
    }

    #[tokio::test]
    async fn garbage_file_loads_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        tokio::fs::write(store.path(), "{ not json").await.unwrap();
        assert_eq!(store.load().await, StoreState::default());
    }

    #[tokio::test]
    async fn schema_mismatch_loads_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        tokio::fs::write(store.path(), r#"{"machines": "not-a-list"}"#)
            .await
            .unwrap();
        assert_eq!(store.load().await, StoreState::default());
    }

    #[tokio::test]
    async fn file_is_pretty_printed_with_sorted_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        store
            .save(&StoreState {
                machines: vec![identity("uuid-a")],
                ..StoreState::default()
            })
            .await
            .unwrap();

        let text = tokio::fs::read_to_string(store.path()).await.unwrap();
        assert!(text.contains('\n'), "expected indented output");
        let machines = text.find("\"machines\"").unwrap();
        let settings = text.find("\"settings\"").unwrap();
        let sort_order = text.find("\"sortOrder\"").unwrap();
        assert!(machines < settings && settings < sort_order);
        // Timestamps are RFC-3339.
        assert!(text.contains("2026-08-02T12:00:00Z"));
        // No stale temp sibling is left behind.
        assert!(!store.path().with_extension("json.tmp").exists());
    }

    #[tokio::test]
    async fn optional_fields_are_omitted_when_absent() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        let mut machine = identity("uuid-a");
        machine.manual_endpoint = None;
        machine.last_known_ip = None;
        store
            .save(&StoreState {
                machines: vec![machine],
                ..StoreState::default()
            })
            .await
            .unwrap();

        let text = tokio::fs::read_to_string(store.path()).await.unwrap();
        assert!(!text.contains("manualEndpoint"));
        assert!(!text.contains("lastKnownIP"));
    }
}
