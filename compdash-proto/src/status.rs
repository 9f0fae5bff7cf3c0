//! The `/status` payload returned by every agent.
//!
//! Field names are part of the wire contract and must not change: agents in
//! the field emit exactly these keys. Decoding accepts the legacy singular
//! `network` object emitted by first-generation agents; encoding always emits
//! the `networks` list.

use serde::{Deserialize, Deserializer, Serialize};

/// Sentinel reported by samplers for metrics the platform cannot provide.
pub const METRIC_UNAVAILABLE: f64 = -1.0;

/// One machine's metrics snapshot, agent → collector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Status {
    #[serde(rename = "hardwareUUID")]
    pub hardware_uuid: String,
    pub hostname: String,
    #[serde(rename = "cpuTempCelsius")]
    pub cpu_temp_celsius: f64,
    #[serde(rename = "cpuUsagePercent")]
    pub cpu_usage_percent: f64,
    #[serde(rename = "networkBytesPerSec")]
    pub network_bytes_per_sec: f64,
    #[serde(rename = "uptimeSeconds")]
    pub uptime_seconds: f64,
    #[serde(rename = "osVersion")]
    pub os_version: String,
    #[serde(rename = "chipType")]
    pub chip_type: String,
    #[serde(
        rename = "networks",
        alias = "network",
        deserialize_with = "one_or_many",
        default
    )]
    pub networks: Vec<NetworkInterface>,
    #[serde(rename = "fileVaultEnabled")]
    pub file_vault_enabled: bool,
    #[serde(
        rename = "agentVersion",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub agent_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpus: Option<Vec<Gpu>>,
}

/// One active, IPv4-bearing network interface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkInterface {
    #[serde(rename = "interfaceName")]
    pub name: String,
    #[serde(rename = "ipAddress")]
    pub ipv4: String,
    #[serde(rename = "macAddress")]
    pub mac: String,
    #[serde(rename = "interfaceType")]
    pub kind: InterfaceKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InterfaceKind {
    Ethernet,
    #[serde(rename = "Wi-Fi")]
    WiFi,
    Bridge,
    #[serde(rename = "VPN")]
    Vpn,
    #[serde(other)]
    Other,
}

/// One discrete or integrated GPU.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Gpu {
    pub name: String,
    #[serde(rename = "temperatureC")]
    pub temperature_c: f64,
    #[serde(rename = "usagePercent")]
    pub usage_percent: f64,
}

impl Status {
    pub fn to_json(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    pub fn from_json(raw: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(raw)
    }

    /// The interface the dashboard treats as primary: the first entry, which
    /// the sampler orders Ethernet-before-Wi-Fi then by name.
    pub fn primary_ipv4(&self) -> Option<&str> {
        self.networks.first().map(|n| n.ipv4.as_str())
    }
}

/// Accepts both `networks: [..]` and the legacy `network: {..}` form.
fn one_or_many<'de, D>(deserializer: D) -> Result<Vec<NetworkInterface>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        Many(Vec<NetworkInterface>),
        One(NetworkInterface),
    }

    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::Many(list) => list,
        OneOrMany::One(single) => vec![single],
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Status {
        Status {
            hardware_uuid: "4C4C4544-0042-4A10-8031-B7C04F503032".into(),
            hostname: "booth-3".into(),
            cpu_temp_celsius: 54.5,
            cpu_usage_percent: 12.0,
            network_bytes_per_sec: 1024.0,
            uptime_seconds: 86_400.0,
            os_version: "14.4.1".into(),
            chip_type: "Apple M2".into(),
            networks: vec![NetworkInterface {
                name: "en0".into(),
                ipv4: "192.168.1.40".into(),
                mac: "AA:BB:CC:DD:EE:FF".into(),
                kind: InterfaceKind::Ethernet,
            }],
            file_vault_enabled: true,
            agent_version: Some("1.4.2".into()),
            gpus: None,
        }
    }

    #[test]
    fn encodes_wire_field_names() {
        let json: serde_json::Value =
            serde_json::from_slice(&sample().to_json().unwrap()).unwrap();
        assert!(json.get("hardwareUUID").is_some());
        assert!(json.get("cpuTempCelsius").is_some());
        assert!(json.get("networkBytesPerSec").is_some());
        assert!(json.get("networks").is_some());
        // Singular form is decode-only.
        assert!(json.get("network").is_none());
        // Absent optionals are omitted entirely.
        assert!(json.get("gpus").is_none());
    }

    #[test]
    fn decodes_legacy_singular_network() {
        let raw = br#"{
            "hardwareUUID": "u", "hostname": "h",
            "cpuTempCelsius": -1, "cpuUsagePercent": 40.0,
            "networkBytesPerSec": 0, "uptimeSeconds": 10,
            "osVersion": "10.0", "chipType": "Unknown",
            "network": {
                "interfaceName": "Ethernet",
                "ipAddress": "10.0.0.5",
                "macAddress": "Unknown",
                "interfaceType": "Ethernet"
            },
            "fileVaultEnabled": false
        }"#;
        let status = Status::from_json(raw).unwrap();
        assert_eq!(status.networks.len(), 1);
        assert_eq!(status.networks[0].ipv4, "10.0.0.5");
        assert_eq!(status.agent_version, None);
    }

    #[test]
    fn decodes_current_networks_list() {
        let status = Status::from_json(&sample().to_json().unwrap()).unwrap();
        assert_eq!(status, sample());
    }

    #[test]
    fn unknown_fields_are_ignored() {
        let mut json: serde_json::Value =
            serde_json::from_slice(&sample().to_json().unwrap()).unwrap();
        json["someFutureField"] = serde_json::json!({"nested": true});
        let status: Status = serde_json::from_value(json).unwrap();
        assert_eq!(status, sample());
    }

    #[test]
    fn unknown_interface_kind_decodes_as_other() {
        let raw = br#"{
            "interfaceName": "utun3", "ipAddress": "100.64.0.1",
            "macAddress": "Unknown", "interfaceType": "Thunderbolt"
        }"#;
        let iface: NetworkInterface = serde_json::from_slice(raw).unwrap();
        assert_eq!(iface.kind, InterfaceKind::Other);
    }

    #[test]
    fn primary_ipv4_is_first_interface() {
        assert_eq!(sample().primary_ipv4(), Some("192.168.1.40"));
        let mut empty = sample();
        empty.networks.clear();
        assert_eq!(empty.primary_ipv4(), None);
    }
}
