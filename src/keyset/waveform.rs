//! Canonical IR waveform representation and the keyset catalogue.

use std::collections::HashMap;

/// One decoded IR signal: a base segment emitted once, optionally followed
/// by a repeat segment emitted `repeat_count_default` more times, each
/// preceded by `intra_sig_pause_cycles`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IRWaveform {
    /// Carrier frequency, rounded to the nearest Hz for wire purposes but
    /// kept as the real value here for duration math.
    pub modulation_freq_hz: u32,
    /// Alternating pulse/space durations in modulation cycles. Even length, non-empty.
    pub base_cycles: Vec<u32>,
    /// Alternating pulse/space durations for the repeat unit. Even length, may be empty.
    pub repeat_cycles: Vec<u32>,
    /// Number of times the repeat segment follows the base segment for one press.
    pub repeat_count_default: u32,
    /// Space duration, in cycles, inserted before each repeat segment.
    pub intra_sig_pause_cycles: u32,
}

impl IRWaveform {
    /// Total duration of the base segment, in milliseconds.
    pub fn base_duration_ms(&self) -> f64 {
        cycles_to_ms(&self.base_cycles, self.modulation_freq_hz)
    }

    /// Total duration of one repeat unit (pause + repeat segment), in milliseconds.
    pub fn repeat_duration_ms(&self) -> f64 {
        if self.repeat_cycles.is_empty() {
            return 0.0;
        }
        let pause_ms =
            self.intra_sig_pause_cycles as f64 * 1000.0 / self.modulation_freq_hz as f64;
        pause_ms + cycles_to_ms(&self.repeat_cycles, self.modulation_freq_hz)
    }
}

fn cycles_to_ms(cycles: &[u32], freq_hz: u32) -> f64 {
    let total: u64 = cycles.iter().map(|&c| c as u64).sum();
    total as f64 * 1000.0 / freq_hz as f64
}

/// `(device_name -> (key_name -> IRWaveform))`, built once at load time and
/// read-only thereafter (or swapped atomically as a whole on reload).
#[derive(Debug, Clone, Default)]
pub struct KeysetCatalogue {
    devices: HashMap<String, HashMap<String, IRWaveform>>,
}

impl KeysetCatalogue {
    pub(crate) fn new() -> Self {
        Self {
            devices: HashMap::new(),
        }
    }

    /// Insert a waveform, overwriting any prior entry for the same
    /// `(device, key)` pair. Returns `true` if an entry was overwritten.
    pub(crate) fn insert(&mut self, device: &str, key: &str, waveform: IRWaveform) -> bool {
        let table = self.devices.entry(device.to_string()).or_default();
        table.insert(key.to_string(), waveform).is_some()
    }

    pub fn get(&self, device: &str, key: &str) -> Option<&IRWaveform> {
        self.devices.get(device)?.get(key)
    }

    pub fn devices(&self) -> impl Iterator<Item = &str> {
        self.devices.keys().map(String::as_str)
    }

    /// Key names known for `device`, or an empty vec if the device is unknown.
    pub fn list_keys(&self, device: &str) -> Vec<&str> {
        match self.devices.get(device) {
            Some(table) => table.keys().map(String::as_str).collect(),
            None => Vec::new(),
        }
    }

    pub fn contains_device(&self, device: &str) -> bool {
        self.devices.contains_key(device)
    }
}
