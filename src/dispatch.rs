//! Dispatcher: the façade offered to the external HTTP layer (§4.5, §6).
//!
//! Every operation returns a structured, serializable outcome rather than
//! panicking or leaving partial state: a press either completed or it
//! didn't, there is no "ok with warnings".

use std::time::Instant;

use serde::Serialize;

use crate::error::{DispatchError, Result};
use crate::keyset::{IRWaveform, KeysetCatalogue};
use crate::registry::Registry;

/// Outcome of a `press` or `press_and_hold` call.
#[derive(Debug, Clone, Serialize)]
pub struct PressOutcome {
    pub status: &'static str,
    pub repeat: u32,
    pub elapsed_ms: u64,
}

/// Outcome of `stop`.
#[derive(Debug, Clone, Serialize)]
pub struct StopOutcome {
    pub status: &'static str,
}

/// One slot's entry in a `health()` listing.
#[derive(Debug, Clone, Serialize)]
pub struct SlotHealth {
    pub slot: u32,
    pub device: String,
    pub address: String,
    pub state: String,
    pub consecutive_failures: u32,
    pub last_error_kind: Option<String>,
}

pub struct Dispatcher {
    catalogue: KeysetCatalogue,
    registry: Registry,
}

impl Dispatcher {
    pub fn new(catalogue: KeysetCatalogue, registry: Registry) -> Self {
        Self { catalogue, registry }
    }

    fn waveform(&self, device_name: &str, key_name: &str) -> Result<&IRWaveform> {
        if !self.catalogue.contains_device(device_name) {
            return Err(DispatchError::UnknownDevice(device_name.to_string()));
        }
        self.catalogue
            .get(device_name, key_name)
            .ok_or_else(|| DispatchError::UnknownKey {
                device: device_name.to_string(),
                key: key_name.to_string(),
            })
    }

    /// One logical press, repeated `count` times (§4.5).
    pub async fn press(
        &self,
        slot: u32,
        device_name: &str,
        key_name: &str,
        count: u32,
    ) -> Result<PressOutcome> {
        let waveform = self.waveform(device_name, key_name)?;
        let (_, connection) = self.registry.resolve(slot)?;
        // Each logical press includes the keyset's own native repeat count
        // (§3 `repeat_count_default`), not just the caller's `count`.
        let repeat = count.max(1) * (waveform.repeat_count_default + 1);
        let start = Instant::now();
        connection.press(waveform, repeat).await?;
        Ok(PressOutcome {
            status: "ok",
            repeat,
            elapsed_ms: start.elapsed().as_millis() as u64,
        })
    }

    /// Holds the key for approximately `duration_ms`, computing `<repeat>`
    /// from the waveform's base/repeat durations (§4.5).
    pub async fn press_and_hold(
        &self,
        slot: u32,
        device_name: &str,
        key_name: &str,
        duration_ms: f64,
    ) -> Result<PressOutcome> {
        let waveform = self.waveform(device_name, key_name)?;
        let (_, connection) = self.registry.resolve(slot)?;
        let repeat = repeat_for_hold(
            waveform.base_duration_ms(),
            waveform.repeat_duration_ms(),
            duration_ms,
        );
        let start = Instant::now();
        connection.press(waveform, repeat).await?;
        Ok(PressOutcome {
            status: "ok",
            repeat,
            elapsed_ms: start.elapsed().as_millis() as u64,
        })
    }

    pub async fn stop(&self, slot: u32) -> Result<StopOutcome> {
        let (_, connection) = self.registry.resolve(slot)?;
        connection.stop().await?;
        Ok(StopOutcome { status: "ok" })
    }

    pub fn list_keys(&self, device_name: &str) -> Vec<&str> {
        self.catalogue.list_keys(device_name)
    }

    pub fn health(&self) -> Vec<SlotHealth> {
        self.registry
            .list()
            .into_iter()
            .map(|(slot, device, address, health)| SlotHealth {
                slot,
                device: device.to_string(),
                address: address.to_string(),
                state: format!("{:?}", health.state),
                consecutive_failures: health.consecutive_failures,
                last_error_kind: health.last_error_kind,
            })
            .collect()
    }

    pub async fn shutdown(&self) {
        self.registry.shutdown().await;
    }
}

/// Compute `<repeat>` from hold duration and waveform durations (§4.5, S6).
fn repeat_for_hold(base_ms: f64, repeat_ms: f64, duration_ms: f64) -> u32 {
    if repeat_ms > 0.0 {
        let extra = ((duration_ms - base_ms) / repeat_ms).ceil();
        (extra as i64 + 1).max(1) as u32
    } else {
        (duration_ms / base_ms).round().max(1.0) as u32
    }
}
