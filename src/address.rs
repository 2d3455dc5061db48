//! Addressing types shared by the codec, connection, registry, and dispatcher.

use serde::{Deserialize, Serialize};

/// A `module:port` address on a specific Global Cache device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LogicalAddress {
    pub module: u32,
    pub port: u32,
}

impl LogicalAddress {
    pub fn new(module: u32, port: u32) -> Self {
        Self { module, port }
    }
}

impl std::fmt::Display for LogicalAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.module, self.port)
    }
}

impl std::str::FromStr for LogicalAddress {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (module, port) = s.split_once(':').ok_or(())?;
        Ok(Self {
            module: module.parse().map_err(|_| ())?,
            port: port.parse().map_err(|_| ())?,
        })
    }
}

/// A TCP endpoint hosting one or more Global Cache IR ports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceEndpoint {
    pub host: String,
    pub tcp_port: u16,
}

impl Default for DeviceEndpoint {
    fn default() -> Self {
        Self {
            host: String::new(),
            tcp_port: 4998,
        }
    }
}

impl std::fmt::Display for DeviceEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.tcp_port)
    }
}
