//! Fleet dispatcher and connection pool for networked Global Caché IR
//! blasters, driven by a RedRat keyset database.
//!
//! This crate is the core described in the design document: keyset
//! decoding, the command codec, per-port device connections, the device
//! registry, and the dispatcher façade. The HTTP front-end, config file
//! delivery mechanism, and container packaging are external collaborators.

pub mod address;
pub mod codec;
pub mod config;
pub mod connection;
pub mod dispatch;
pub mod error;
pub mod keyset;
pub mod registry;

pub use address::{DeviceEndpoint, LogicalAddress};
pub use config::FleetConfig;
pub use connection::{ConnectionState, DeviceConnection, HealthRecord};
pub use dispatch::Dispatcher;
pub use error::{DispatchError, Result};
pub use keyset::{IRWaveform, KeysetCatalogue};
pub use registry::Registry;
