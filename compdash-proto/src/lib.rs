//! Shared wire protocol for the compdash agent and collector.
//!
//! Both ends of the LAN protocol live here so they can never drift apart:
//! - Minimal HTTP/1.1 framing ([`wire`])
//! - The `/status` JSON payload with its legacy-field fallback ([`status`])
//! - Threshold triples used by the dashboard cards ([`thresholds`])
//! - Release version parsing and ordering ([`version`])
//! - `host:port` endpoint strings ([`endpoint`])
//! - Release-registry JSON shapes ([`registry`])

pub mod endpoint;
pub mod registry;
pub mod status;
pub mod thresholds;
pub mod version;
pub mod wire;

/// mDNS service type advertised by every agent and browsed by the collector,
/// in the `local.` domain. No TXT records are attached; machine identity is
/// resolved from the status payload, never from the advertisement.
pub const MDNS_SERVICE_TYPE: &str = "_computerdash._tcp.local.";

pub use endpoint::{Endpoint, EndpointParseError, DEFAULT_AGENT_PORT};
pub use status::{Gpu, InterfaceKind, NetworkInterface, Status, METRIC_UNAVAILABLE};
pub use thresholds::Thresholds;
pub use version::SemanticVersion;
