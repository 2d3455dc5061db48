//! Fleet configuration: loaded once at startup from a TOML file under
//! `~/.config/gc-ir-fleet/`, the same load-or-default arrangement the
//! teacher uses for its own config file, swapped from INI to TOML since
//! this crate has no other use for an INI parser.
//!
//! ```text
//! ~/.config/gc-ir-fleet/
//!   fleet.toml   — device list and keyset path
//! ```

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::address::LogicalAddress;
use crate::error::{DispatchError, Result};

/// One device entry as written in `fleet.toml`, matching the external
/// configuration shape of §6: `{host, tcp_port, module, max_ports, count}`.
/// `count > 1` expands to that many sequential entries at consecutive host
/// addresses (§4.4). `name` is a local addition for logs and diagnostics;
/// it carries no protocol meaning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceEntry {
    #[serde(default)]
    pub name: Option<String>,
    pub host: String,
    #[serde(default = "default_tcp_port")]
    pub tcp_port: u16,
    #[serde(default = "default_module")]
    pub module: u32,
    #[serde(default = "default_max_ports")]
    pub max_ports: u32,
    #[serde(default = "default_count")]
    pub count: u32,
}

fn default_tcp_port() -> u16 {
    4998
}

fn default_module() -> u32 {
    1
}

fn default_max_ports() -> u32 {
    3
}

fn default_count() -> u32 {
    1
}

/// The full fleet: keyset path, every configured device entry, and the
/// slot→address map (§3, §4.4). `slots` is the externally-supplied,
/// injective `slot -> module:port` mapping the Registry is handed; when
/// left empty, [`FleetConfig::resolve_slots`] falls back to a documented
/// default assignment so the crate stays runnable from a device list alone.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FleetConfig {
    pub keyset_path: PathBuf,
    #[serde(default)]
    pub devices: Vec<DeviceEntry>,
    #[serde(default)]
    pub slots: BTreeMap<u32, LogicalAddress>,
}

impl FleetConfig {
    fn default_for(config_dir: &Path) -> Self {
        Self {
            keyset_path: config_dir.join("keyset.xml"),
            devices: Vec::new(),
            slots: BTreeMap::new(),
        }
    }

    /// Load config from `path`, falling back to an empty default fleet if
    /// the file is missing. A malformed file is still an error.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        match tokio::fs::read_to_string(path).await {
            Ok(raw) => {
                let parsed: FleetConfig = toml::from_str(&raw)
                    .map_err(|e| DispatchError::BadConfig(format!("{}: {e}", path.display())))?;
                Ok(parsed)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let dir = path.parent().unwrap_or_else(|| Path::new("."));
                Ok(FleetConfig::default_for(dir))
            }
            Err(e) => Err(DispatchError::BadConfig(format!(
                "failed to read {}: {e}",
                path.display()
            ))),
        }
    }

    /// Expand every entry's `count` into individual, single-device entries
    /// with sequentially incremented host addresses (§4.4). Non-IPv4 hosts
    /// (e.g. DNS names) with `count > 1` are rejected: there's no sequencing
    /// rule for them.
    pub fn expand(&self) -> Result<Vec<ExpandedDevice>> {
        let mut out = Vec::new();
        for entry in &self.devices {
            if entry.count == 0 {
                return Err(DispatchError::BadConfig(format!(
                    "device {:?} has count 0",
                    entry.name
                )));
            }
            if entry.count == 1 {
                out.push(ExpandedDevice::from_entry(entry, entry.host.clone(), 0));
                continue;
            }
            let base: Ipv4Addr = Ipv4Addr::from_str(&entry.host).map_err(|_| {
                DispatchError::BadConfig(format!(
                    "device {:?} has count {} but host {:?} is not an IPv4 address",
                    entry.name, entry.count, entry.host
                ))
            })?;
            let base_octets = u32::from(base);
            for i in 0..entry.count {
                let host = Ipv4Addr::from(base_octets + i).to_string();
                out.push(ExpandedDevice::from_entry(entry, host, i));
            }
        }
        Ok(out)
    }

    /// The slot→address map to build the Registry from: `self.slots` if the
    /// config supplied one (§4.4's "the mapping itself is supplied
    /// externally"), otherwise a default assignment over `devices` in file
    /// order, ports `1..=max_ports` within each device — the documented
    /// fallback for running from a bare device list with no slot map.
    pub fn resolve_slots(&self, devices: &[ExpandedDevice]) -> BTreeMap<u32, LogicalAddress> {
        if !self.slots.is_empty() {
            return self.slots.clone();
        }
        let mut slots = BTreeMap::new();
        let mut next_slot = 1u32;
        for device in devices {
            for port in 1..=device.max_ports {
                slots.insert(next_slot, LogicalAddress::new(device.module, port));
                next_slot += 1;
            }
        }
        slots
    }
}

/// One physical device after `count` expansion: a unique name, endpoint,
/// and its module/port shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpandedDevice {
    pub name: String,
    pub host: String,
    pub tcp_port: u16,
    pub module: u32,
    pub max_ports: u32,
}

impl ExpandedDevice {
    fn from_entry(entry: &DeviceEntry, host: String, index: u32) -> Self {
        let base_name = entry.name.clone().unwrap_or_else(|| entry.host.clone());
        let name = if entry.count > 1 {
            format!("{base_name}-{}", index + 1)
        } else {
            base_name
        };
        Self {
            name,
            host,
            tcp_port: entry.tcp_port,
            module: entry.module,
            max_ports: entry.max_ports,
        }
    }
}

/// Resolve the config directory to `~/.config/gc-ir-fleet/` regardless of OS.
pub fn resolve_config_dir() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("gc-ir-fleet"))
}

pub fn default_config_path() -> PathBuf {
    resolve_config_dir()
        .unwrap_or_else(|| PathBuf::from(".").join("gc-ir-fleet"))
        .join("fleet.toml")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> FleetConfig {
        FleetConfig {
            keyset_path: PathBuf::from("keyset.xml"),
            devices: vec![DeviceEntry {
                name: Some("living-room".to_string()),
                host: "192.168.1.20".to_string(),
                tcp_port: 4998,
                module: 1,
                max_ports: 3,
                count: 3,
            }],
            slots: BTreeMap::new(),
        }
    }

    #[test]
    fn count_expands_to_sequential_hosts() {
        let expanded = sample().expand().unwrap();
        assert_eq!(expanded.len(), 3);
        assert_eq!(expanded[0].host, "192.168.1.20");
        assert_eq!(expanded[0].name, "living-room-1");
        assert_eq!(expanded[1].host, "192.168.1.21");
        assert_eq!(expanded[2].host, "192.168.1.22");
    }

    #[test]
    fn single_count_keeps_original_name() {
        let mut cfg = sample();
        cfg.devices[0].count = 1;
        let expanded = cfg.expand().unwrap();
        assert_eq!(expanded.len(), 1);
        assert_eq!(expanded[0].name, "living-room");
    }

    #[test]
    fn non_ipv4_host_with_count_is_rejected() {
        let mut cfg = sample();
        cfg.devices[0].host = "blaster.local".to_string();
        assert!(cfg.expand().is_err());
    }

    #[test]
    fn zero_count_is_rejected() {
        let mut cfg = sample();
        cfg.devices[0].count = 0;
        assert!(cfg.expand().is_err());
    }

    #[test]
    fn empty_slots_fall_back_to_default_assignment() {
        let mut cfg = sample();
        cfg.devices[0].count = 1;
        cfg.devices[0].max_ports = 2;
        let expanded = cfg.expand().unwrap();
        let slots = cfg.resolve_slots(&expanded);
        assert_eq!(slots.len(), 2);
        assert_eq!(slots[&1], LogicalAddress::new(1, 1));
        assert_eq!(slots[&2], LogicalAddress::new(1, 2));
    }

    #[test]
    fn explicit_slots_are_used_verbatim() {
        let mut cfg = sample();
        cfg.devices[0].count = 1;
        cfg.slots
            .insert(7, LogicalAddress::new(cfg.devices[0].module, 1));
        let expanded = cfg.expand().unwrap();
        let slots = cfg.resolve_slots(&expanded);
        assert_eq!(slots.len(), 1);
        assert_eq!(slots[&7], LogicalAddress::new(1, 1));
    }

    #[tokio::test]
    async fn missing_file_loads_defaults() {
        let result = FleetConfig::load("/nonexistent/path/fleet.toml").await.unwrap();
        assert!(result.devices.is_empty());
    }

    #[tokio::test]
    async fn malformed_file_is_bad_config() {
        let dir = std::env::temp_dir().join(format!("gc-ir-fleet-test-{}", std::process::id()));
        tokio::fs::create_dir_all(&dir).await.unwrap();
        let path = dir.join("fleet.toml");
        tokio::fs::write(&path, "not valid toml {{{").await.unwrap();
        let result = FleetConfig::load(&path).await;
        assert!(matches!(result, Err(DispatchError::BadConfig(_))));
        let _ = tokio::fs::remove_dir_all(&dir).await;
    }
}
