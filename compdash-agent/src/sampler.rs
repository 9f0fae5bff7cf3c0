//! On-demand system metrics snapshots.
//!
//! One [`Sampler`] lives for the process lifetime. Identity facts that cannot
//! change while the OS is running (hardware UUID, chip type, disk encryption)
//! are probed once at construction; everything else is read per call.
//! Metrics the platform cannot provide are reported as sentinels
//! (`-1.0` / empty list), never as errors.

use std::time::Instant;

use mac_address::mac_address_by_name;
use parking_lot::Mutex;
use sysinfo::{Components, Networks, System};
use tracing::debug;

use compdash_proto::{InterfaceKind, NetworkInterface, Status, METRIC_UNAVAILABLE};

pub struct Sampler {
    hardware_uuid: String,
    chip_type: String,
    disk_encrypted: bool,
    agent_version: String,
    state: Mutex<SamplerState>,
}

struct SamplerState {
    system: System,
    components: Components,
    networks: Networks,
    throughput: ThroughputTracker,
}

impl Sampler {
    pub fn new(agent_version: &str) -> Self {
        let hostname = read_hostname();
        let hardware_uuid =
            read_hardware_uuid().unwrap_or_else(|| format!("unknown-{hostname}"));
        let mut system = System::new();
        // Populates the CPU list; also seeds the usage delta for the first
        // real sample.
        system.refresh_cpu_usage();
        let chip_type = system
            .cpus()
            .first()
            .map(|cpu| cpu.brand().trim().to_string())
            .filter(|brand| !brand.is_empty())
            .unwrap_or_else(|| "Unknown".to_string());

        debug!(%hardware_uuid, %chip_type, "sampler initialized");

        Self {
            hardware_uuid,
            chip_type,
            disk_encrypted: read_disk_encryption(),
            agent_version: agent_version.to_string(),
            state: Mutex::new(SamplerState {
                system,
                components: Components::new_with_refreshed_list(),
                networks: Networks::new_with_refreshed_list(),
                throughput: ThroughputTracker::default(),
            }),
        }
    }

    /// Build one complete `Status`. Callable from any thread; the first call
    /// after startup reports zero throughput and CPU usage because both are
    /// delta-based.
    pub fn current_status(&self) -> Status {
        let mut state = self.state.lock();

        state.system.refresh_cpu_usage();
        let cpu_usage_percent = if state.system.cpus().is_empty() {
            METRIC_UNAVAILABLE
        } else {
            f64::from(state.system.global_cpu_info().cpu_usage()).clamp(0.0, 100.0)
        };

        state.components.refresh();
        let cpu_temp_celsius = read_cpu_temperature(&state.components);

        state.networks.refresh();
        let total: u64 = state
            .networks
            .iter()
            .filter(|(name, _)| !is_loopback_name(name))
            .map(|(_, data)| data.total_received() + data.total_transmitted())
            .sum();
        let network_bytes_per_sec = state.throughput.bytes_per_sec(total, Instant::now());

        Status {
            hardware_uuid: self.hardware_uuid.clone(),
            hostname: read_hostname(),
            cpu_temp_celsius,
            cpu_usage_percent,
            network_bytes_per_sec,
            uptime_seconds: System::uptime() as f64,
            os_version: System::os_version().unwrap_or_else(|| "Unknown".to_string()),
            chip_type: self.chip_type.clone(),
            networks: enumerate_interfaces(),
            file_vault_enabled: self.disk_encrypted,
            agent_version: Some(self.agent_version.clone()),
            gpus: None,
        }
    }
}

fn read_hostname() -> String {
    gethostname::gethostname().to_string_lossy().to_string()
}

fn read_cpu_temperature(components: &Components) -> f64 {
    const CPU_LABELS: &[&str] = &["cpu", "tctl", "tdie", "package", "core"];

    components
        .iter()
        .find(|c| {
            let label = c.label().to_lowercase();
            CPU_LABELS.iter().any(|token| label.contains(token))
        })
        .map(|c| f64::from(c.temperature()))
        .unwrap_or(METRIC_UNAVAILABLE)
}

/// Delta tracker over the aggregate in+out byte counter. A counter that runs
/// backwards (reset or wrap) clamps the delta to zero.
#[derive(Default)]
struct ThroughputTracker {
    prev: Option<(u64, Instant)>,
}

impl ThroughputTracker {
    fn bytes_per_sec(&mut self, total: u64, now: Instant) -> f64 {
        let prev = self.prev.replace((total, now));

        let Some((prev_total, prev_at)) = prev else {
            return 0.0;
        };

        let elapsed = now.duration_since(prev_at).as_secs_f64();
        if elapsed <= 0.0 {
            return 0.0;
        }

        let delta = total.saturating_sub(prev_total);
        delta as f64 / elapsed
    }
}

/// Active, non-loopback interfaces that carry an IPv4 address, ordered
/// Ethernet-before-Wi-Fi then by name. The first entry is the machine's
/// primary address as far as the dashboard is concerned.
pub fn enumerate_interfaces() -> Vec<NetworkInterface> {
    let Ok(addrs) = if_addrs::get_if_addrs() else {
        return Vec::new();
    };

    let mut interfaces: Vec<NetworkInterface> = Vec::new();
    for addr in addrs {
        if addr.is_loopback() {
            continue;
        }
        let if_addrs::IfAddr::V4(v4) = &addr.addr else {
            continue;
        };
        // One entry per interface: the first IPv4 wins.
        if interfaces.iter().any(|i| i.name == addr.name) {
            continue;
        }

        let mac = mac_address_by_name(&addr.name)
            .ok()
            .flatten()
            .map(|mac| format_mac(&mac.bytes()))
            .unwrap_or_else(|| "Unknown".to_string());

        interfaces.push(NetworkInterface {
            kind: classify_interface(&addr.name),
            name: addr.name,
            ipv4: v4.ip.to_string(),
            mac,
        });
    }

    sort_interfaces(&mut interfaces);
    interfaces
}

fn format_mac(bytes: &[u8; 6]) -> String {
    bytes
        .iter()
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join(":")
}

fn classify_interface(name: &str) -> InterfaceKind {
    let lower = name.to_lowercase();

    if lower.contains("wi-fi")
        || lower.contains("wifi")
        || lower.contains("wireless")
        || lower.contains("wlan")
        || lower.starts_with("wlp")
    {
        return InterfaceKind::WiFi;
    }
    if lower.contains("vpn") || lower.contains("tailscale") || lower.starts_with("utun") {
        return InterfaceKind::Vpn;
    }
    if lower.contains("bridge") || lower.starts_with("br") {
        return InterfaceKind::Bridge;
    }

    // Physical adapters default to Ethernet.
    InterfaceKind::Ethernet
}

fn sort_interfaces(interfaces: &mut [NetworkInterface]) {
    interfaces.sort_by(|a, b| {
        let a_wifi = a.kind == InterfaceKind::WiFi;
        let b_wifi = b.kind == InterfaceKind::WiFi;
        a_wifi.cmp(&b_wifi).then_with(|| a.name.cmp(&b.name))
    });
}

fn is_loopback_name(name: &str) -> bool {
    name == "lo" || name.starts_with("lo0")
}

fn read_hardware_uuid() -> Option<String> {
    #[cfg(target_os = "linux")]
    {
        for path in ["/sys/class/dmi/id/product_uuid", "/etc/machine-id"] {
            if let Ok(raw) = std::fs::read_to_string(path) {
                let id = raw.trim();
                if !id.is_empty() {
                    return Some(id.to_string());
                }
            }
        }
        None
    }

    #[cfg(target_os = "macos")]
    {
        let output = std::process::Command::new("ioreg")
            .args(["-rd1", "-c", "IOPlatformExpertDevice"])
            .output()
            .ok()?;
        let text = String::from_utf8_lossy(&output.stdout);
        text.lines()
            .find(|line| line.contains("IOPlatformUUID"))
            .and_then(|line| line.split('"').nth(3))
            .map(str::to_string)
    }

    #[cfg(target_os = "windows")]
    {
        let output = std::process::Command::new("wmic")
            .args(["csproduct", "get", "UUID"])
            .output()
            .ok()?;
        let text = String::from_utf8_lossy(&output.stdout);
        text.lines()
            .map(str::trim)
            .find(|line| !line.is_empty() && !line.eq_ignore_ascii_case("UUID"))
            .map(str::to_string)
    }

    #[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
    {
        None
    }
}

fn read_disk_encryption() -> bool {
    #[cfg(target_os = "macos")]
    {
        std::process::Command::new("fdesetup")
            .arg("status")
            .output()
            .map(|out| String::from_utf8_lossy(&out.stdout).contains("FileVault is On"))
            .unwrap_or(false)
    }

    #[cfg(target_os = "linux")]
    {
        std::process::Command::new("lsblk")
            .args(["-rno", "TYPE"])
            .output()
            .map(|out| {
                String::from_utf8_lossy(&out.stdout)
                    .lines()
                    .any(|line| line.trim() == "crypt")
            })
            .unwrap_or(false)
    }

    #[cfg(not(any(target_os = "macos", target_os = "linux")))]
    {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn iface(name: &str, kind: InterfaceKind) -> NetworkInterface {
        NetworkInterface {
            name: name.to_string(),
            ipv4: "10.0.0.1".to_string(),
            mac: "Unknown".to_string(),
            kind,
        }
    }

    #[test]
    fn classification_matches_adapter_names() {
        assert_eq!(classify_interface("en0"), InterfaceKind::Ethernet);
        assert_eq!(classify_interface("eth0"), InterfaceKind::Ethernet);
        assert_eq!(classify_interface("Wi-Fi"), InterfaceKind::WiFi);
        assert_eq!(classify_interface("wlan0"), InterfaceKind::WiFi);
        assert_eq!(classify_interface("wlp3s0"), InterfaceKind::WiFi);
        assert_eq!(classify_interface("utun4"), InterfaceKind::Vpn);
        assert_eq!(classify_interface("tailscale0"), InterfaceKind::Vpn);
        assert_eq!(classify_interface("bridge100"), InterfaceKind::Bridge);
    }

    #[test]
    fn ethernet_sorts_before_wifi_then_by_name() {
        let mut list = vec![
            iface("wlan0", InterfaceKind::WiFi),
            iface("eth1", InterfaceKind::Ethernet),
            iface("eth0", InterfaceKind::Ethernet),
            iface("tailscale0", InterfaceKind::Vpn),
        ];
        sort_interfaces(&mut list);
        let names: Vec<&str> = list.iter().map(|i| i.name.as_str()).collect();
        assert_eq!(names, ["eth0", "eth1", "tailscale0", "wlan0"]);
    }

    #[test]
    fn throughput_first_sample_is_zero() {
        let mut tracker = ThroughputTracker::default();
        assert_eq!(tracker.bytes_per_sec(1_000_000, Instant::now()), 0.0);
    }

    #[test]
    fn throughput_is_delta_over_elapsed() {
        let mut tracker = ThroughputTracker::default();
        let start = Instant::now();
        tracker.bytes_per_sec(1_000, start);
        let rate = tracker.bytes_per_sec(6_000, start + Duration::from_secs(5));
        assert!((rate - 1_000.0).abs() < f64::EPSILON);
    }

    #[test]
    fn throughput_counter_reset_clamps_to_zero() {
        let mut tracker = ThroughputTracker::default();
        let start = Instant::now();
        tracker.bytes_per_sec(9_000, start);
        let rate = tracker.bytes_per_sec(100, start + Duration::from_secs(5));
        assert_eq!(rate, 0.0);
    }

    #[test]
    fn mac_formatting_is_uppercase_colon_separated() {
        assert_eq!(
            format_mac(&[0xa1, 0xb2, 0xc3, 0x04, 0x05, 0x06]),
            "A1:B2:C3:04:05:06"
        );
    }

    #[test]
    fn sampler_produces_complete_status() {
        let sampler = Sampler::new("1.4.2");
        let status = sampler.current_status();
        assert!(!status.hardware_uuid.is_empty());
        assert!(!status.hostname.is_empty());
        assert_eq!(status.agent_version.as_deref(), Some("1.4.2"));
        // Delta-based metrics may legitimately be zero on the first call,
        // but never negative other than the sentinel.
        assert!(status.cpu_usage_percent >= METRIC_UNAVAILABLE);
        assert!(status.network_bytes_per_sec >= 0.0);
    }
}
