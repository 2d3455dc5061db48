//! Device Registry: maps flat 1-based slots to Device Connections (§4.4).
//!
//! The Registry exclusively owns every Device Connection it constructs; the
//! Dispatcher only ever holds the non-owning handles returned by `resolve`.

use std::collections::HashMap;
use std::time::Duration;

use crate::address::{DeviceEndpoint, LogicalAddress};
use crate::config::{ExpandedDevice, FleetConfig};
use crate::connection::{DeviceConnection, HealthRecord};
use crate::error::{DispatchError, Result};

const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(10);

struct Slot {
    address: LogicalAddress,
    device_name: String,
    connection: DeviceConnection,
}

/// `slot -> Device Connection`, built once from a [`FleetConfig`] and
/// read-only thereafter.
pub struct Registry {
    slots: HashMap<u32, Slot>,
}

impl Registry {
    /// Expand `config`'s devices, resolve the slot map (externally supplied
    /// via `config.slots`, or the documented default assignment — see
    /// [`FleetConfig::resolve_slots`]), and spawn one Device Connection per
    /// distinct `module:port` address the slot map actually references.
    /// Slots that alias the same address share one connection.
    pub fn build(config: &FleetConfig) -> Result<Self> {
        let devices = config.expand()?;

        let mut by_module: HashMap<u32, &ExpandedDevice> = HashMap::new();
        for device in &devices {
            if by_module.insert(device.module, device).is_some() {
                return Err(DispatchError::BadConfig(format!(
                    "module {} is claimed by more than one device entry",
                    device.module
                )));
            }
        }

        let slot_map = config.resolve_slots(&devices);
        let mut connections: HashMap<LogicalAddress, DeviceConnection> = HashMap::new();
        let mut slots = HashMap::new();

        for (&slot, &address) in &slot_map {
            let device = by_module.get(&address.module).ok_or_else(|| {
                DispatchError::UnknownDevice(format!(
                    "slot {slot} addresses module {} which no device entry declares",
                    address.module
                ))
            })?;
            if address.port == 0 || address.port > device.max_ports {
                return Err(DispatchError::BadConfig(format!(
                    "slot {slot} addresses port {} but device {:?} only has {} ports",
                    address.port, device.name, device.max_ports
                )));
            }

            let connection = connections
                .entry(address)
                .or_insert_with(|| DeviceConnection::spawn(endpoint_for(device), address))
                .clone();

            slots.insert(
                slot,
                Slot {
                    address,
                    device_name: device.name.clone(),
                    connection,
                },
            );
        }

        tracing::info!(slots = slots.len(), "registry built");
        Ok(Self { slots })
    }

    pub fn resolve(&self, slot: u32) -> Result<(LogicalAddress, &DeviceConnection)> {
        let entry = self
            .slots
            .get(&slot)
            .ok_or(DispatchError::UnknownSlot(slot))?;
        Ok((entry.address, &entry.connection))
    }

    /// `(slot, device_name, address, health)` for every known slot, for diagnostics.
    pub fn list(&self) -> Vec<(u32, &str, LogicalAddress, HealthRecord)> {
        let mut out: Vec<_> = self
            .slots
            .iter()
            .map(|(&slot, entry)| {
                (
                    slot,
                    entry.device_name.as_str(),
                    entry.address,
                    entry.connection.health(),
                )
            })
            .collect();
        out.sort_by_key(|(slot, ..)| *slot);
        out
    }

    pub async fn shutdown(&self) {
        let mut drains = Vec::with_capacity(self.slots.len());
        for entry in self.slots.values() {
            drains.push(entry.connection.shutdown(SHUTDOWN_DEADLINE));
        }
        futures_join_all(drains).await;
    }
}

/// Minimal stand-in for `futures::future::join_all` so the crate does not
/// need the `futures` dependency for a single call site.
async fn futures_join_all<F: std::future::Future<Output = ()>>(futures: Vec<F>) {
    for f in futures {
        f.await;
    }
}

fn endpoint_for(device: &ExpandedDevice) -> DeviceEndpoint {
    DeviceEndpoint {
        host: device.host.clone(),
        tcp_port: device.tcp_port,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn config_with_two_devices() -> FleetConfig {
        FleetConfig {
            keyset_path: PathBuf::from("keyset.xml"),
            devices: vec![
                crate::config::DeviceEntry {
                    name: Some("den".to_string()),
                    host: "127.0.0.1".to_string(),
                    tcp_port: 4998,
                    module: 1,
                    max_ports: 3,
                    count: 1,
                },
                crate::config::DeviceEntry {
                    name: Some("bedroom".to_string()),
                    host: "127.0.0.2".to_string(),
                    tcp_port: 4998,
                    module: 2,
                    max_ports: 2,
                    count: 1,
                },
            ],
            slots: Default::default(),
        }
    }

    #[test]
    fn slots_assigned_in_device_then_port_order_by_default() {
        let registry = Registry::build(&config_with_two_devices()).unwrap();
        assert_eq!(registry.slots.len(), 5);
        let (addr, _) = registry.resolve(1).unwrap();
        assert_eq!(addr, LogicalAddress::new(1, 1));
        let (addr, _) = registry.resolve(3).unwrap();
        assert_eq!(addr, LogicalAddress::new(1, 3));
        let (addr, _) = registry.resolve(4).unwrap();
        assert_eq!(addr, LogicalAddress::new(2, 1));
    }

    #[test]
    fn explicit_slot_map_is_honored_over_the_default() {
        let mut config = config_with_two_devices();
        config.slots.insert(42, LogicalAddress::new(2, 2));
        let registry = Registry::build(&config).unwrap();
        assert_eq!(registry.slots.len(), 1);
        let (addr, _) = registry.resolve(42).unwrap();
        assert_eq!(addr, LogicalAddress::new(2, 2));
    }

    #[test]
    fn slot_addressing_an_unknown_module_is_rejected() {
        let mut config = config_with_two_devices();
        config.slots.insert(1, LogicalAddress::new(99, 1));
        assert!(Registry::build(&config).is_err());
    }

    #[test]
    fn unknown_slot_is_an_error() {
        let registry = Registry::build(&config_with_two_devices()).unwrap();
        assert_eq!(
            registry.resolve(999).unwrap_err(),
            DispatchError::UnknownSlot(999)
        );
    }

    #[test]
    fn list_includes_every_slot() {
        let registry = Registry::build(&config_with_two_devices()).unwrap();
        let listing = registry.list();
        assert_eq!(listing.len(), 5);
        assert_eq!(listing[0].0, 1);
        assert_eq!(listing[4].0, 5);
    }
}
