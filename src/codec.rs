//! Command/response codec for the Global Cache Unified TCP protocol (§4.2).
//!
//! The wire format is ASCII, `\r`-terminated. This module only ever sees
//! already-stripped lines on the read side and only ever appends the
//! terminator on the write side.

use std::fmt;

use crate::address::LogicalAddress;
use crate::error::DeviceErrorCode;
use crate::keyset::IRWaveform;

/// Carriage return: the sole framing byte of the wire protocol.
pub const TERMINATOR: char = '\r';

/// A constructed `sendir` command, ready to be rendered to the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendIrCommand {
    pub address: LogicalAddress,
    pub id: u16,
    pub freq_hz: u32,
    pub repeat: u32,
    pub offset: u32,
    pub durations: Vec<u32>,
}

impl SendIrCommand {
    /// Build the command for one waveform, repeated `repeat` times total (§4.2).
    pub fn new(address: LogicalAddress, id: u16, waveform: &IRWaveform, repeat: u32) -> Self {
        let mut durations = waveform.base_cycles.clone();
        let offset = if waveform.repeat_cycles.is_empty() {
            1
        } else {
            durations.push(waveform.intra_sig_pause_cycles);
            durations.extend_from_slice(&waveform.repeat_cycles);
            waveform.base_cycles.len() as u32 + 1
        };
        Self {
            address,
            id,
            freq_hz: waveform.modulation_freq_hz,
            repeat: repeat.max(1),
            offset,
            durations,
        }
    }

    /// The exact wire line, including the trailing `\r`.
    pub fn to_wire_line(&self) -> String {
        format!("{self}{TERMINATOR}")
    }
}

impl fmt::Display for SendIrCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "sendir,{},{},{},{},{}",
            self.address, self.id, self.freq_hz, self.repeat, self.offset
        )?;
        for d in &self.durations {
            write!(f, ",{d}")?;
        }
        Ok(())
    }
}

pub fn stopir_line(address: LogicalAddress) -> String {
    format!("stopir,{address}{TERMINATOR}")
}

pub fn getversion_line() -> String {
    format!("getversion,0{TERMINATOR}")
}

/// A parsed inbound frame (§4.2).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseFrame {
    CompleteIr {
        address: LogicalAddress,
        id: u16,
    },
    BusyIr {
        address: LogicalAddress,
        id: u16,
    },
    DeviceError {
        address: Option<LogicalAddress>,
        code: Option<DeviceErrorCode>,
    },
    IrLearnerEnabled,
    /// `device,<module>,<type>` — one line of a `getdevices` listing.
    Device { module: u32, device_type: String },
    EndListDevices,
    /// Anything else: version strings, `get_IRL` output, etc. Routed to
    /// whichever unaddressed query is waiting, by FIFO order.
    Informational(String),
}

/// Parse one already-unterminated line into a [`ResponseFrame`].
pub fn parse_line(line: &str) -> ResponseFrame {
    let line = line.trim_end_matches(TERMINATOR).trim();

    if let Some(rest) = line.strip_prefix("completeir,") {
        if let Some((addr, id)) = parse_addr_and_id(rest) {
            return ResponseFrame::CompleteIr { address: addr, id };
        }
    }
    if let Some(rest) = line.strip_prefix("busyIR,") {
        if let Some((addr, id)) = parse_addr_and_id(rest) {
            return ResponseFrame::BusyIr { address: addr, id };
        }
    }
    if let Some(rest) = line.strip_prefix("ERR_") {
        // ERR_<module>:<port>,<code>
        if let Some((addr_str, code_str)) = rest.split_once(',') {
            let address = addr_str.parse().ok();
            let code = code_str.trim().parse().ok();
            return ResponseFrame::DeviceError { address, code };
        }
    }
    if let Some(rest) = line.strip_prefix("ERR ") {
        let code = rest.trim().parse().ok();
        return ResponseFrame::DeviceError {
            address: None,
            code,
        };
    }
    if line == "IR Learner Enabled" {
        return ResponseFrame::IrLearnerEnabled;
    }
    if let Some(rest) = line.strip_prefix("device,") {
        if let Some((module_str, ty)) = rest.split_once(',') {
            if let Ok(module) = module_str.trim().parse() {
                return ResponseFrame::Device {
                    module,
                    device_type: ty.trim().to_string(),
                };
            }
        }
    }
    if line == "endlistdevices" {
        return ResponseFrame::EndListDevices;
    }

    ResponseFrame::Informational(line.to_string())
}

fn parse_addr_and_id(rest: &str) -> Option<(LogicalAddress, u16)> {
    let (addr_str, id_str) = rest.split_once(',')?;
    let address = addr_str.parse().ok()?;
    let id = id_str.trim().parse().ok()?;
    Some((address, id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keyset::IRWaveform;

    fn waveform_with_repeat() -> IRWaveform {
        IRWaveform {
            modulation_freq_hz: 40_000,
            base_cycles: vec![10, 40],
            repeat_cycles: vec![40, 10],
            repeat_count_default: 1,
            intra_sig_pause_cycles: 200,
        }
    }

    #[test]
    fn builds_s2_sendir_line() {
        let cmd = SendIrCommand::new(LogicalAddress::new(1, 2), 7, &waveform_with_repeat(), 3);
        assert_eq!(cmd.to_string(), "sendir,1:2,7,40000,3,3,10,40,200,40,10");
        assert!(cmd.to_wire_line().ends_with('\r'));
    }

    #[test]
    fn base_only_waveform_has_offset_one() {
        let waveform = IRWaveform {
            modulation_freq_hz: 38_000,
            base_cycles: vec![1, 2, 3, 4],
            repeat_cycles: vec![],
            repeat_count_default: 0,
            intra_sig_pause_cycles: 1,
        };
        let cmd = SendIrCommand::new(LogicalAddress::new(1, 1), 1, &waveform, 5);
        assert_eq!(cmd.offset, 1);
        assert_eq!(cmd.durations, vec![1, 2, 3, 4]);
    }

    #[test]
    fn round_trips_sendir_fields() {
        // Property 3 (§8): parsing a synthesized sendir recovers all fields exactly.
        let cmd = SendIrCommand::new(LogicalAddress::new(3, 4), 42, &waveform_with_repeat(), 9);
        let line = cmd.to_string();
        let parts: Vec<&str> = line.split(',').collect();
        assert_eq!(parts[0], "sendir");
        assert_eq!(parts[1], "3:4");
        assert_eq!(parts[2], "42");
        assert_eq!(parts[3], "40000");
        assert_eq!(parts[4], "9");
        assert_eq!(parts[5], "3");
        let durations: Vec<u32> = parts[6..].iter().map(|s| s.parse().unwrap()).collect();
        assert_eq!(durations, cmd.durations);
    }

    #[test]
    fn parses_completeir() {
        let frame = parse_line("completeir,1:2,7\r");
        assert_eq!(
            frame,
            ResponseFrame::CompleteIr {
                address: LogicalAddress::new(1, 2),
                id: 7
            }
        );
    }

    #[test]
    fn parses_busyir() {
        let frame = parse_line("busyIR,1:2,7");
        assert_eq!(
            frame,
            ResponseFrame::BusyIr {
                address: LogicalAddress::new(1, 2),
                id: 7
            }
        );
    }

    #[test]
    fn parses_err_with_address() {
        let frame = parse_line("ERR_1:2,001");
        assert_eq!(
            frame,
            ResponseFrame::DeviceError {
                address: Some(LogicalAddress::new(1, 2)),
                code: Some(1)
            }
        );
    }

    #[test]
    fn parses_err_without_address() {
        let frame = parse_line("ERR 14");
        assert_eq!(
            frame,
            ResponseFrame::DeviceError {
                address: None,
                code: Some(14)
            }
        );
    }

    #[test]
    fn parses_device_listing_and_terminator() {
        assert_eq!(
            parse_line("device,1,IRP2"),
            ResponseFrame::Device {
                module: 1,
                device_type: "IRP2".to_string()
            }
        );
        assert_eq!(parse_line("endlistdevices"), ResponseFrame::EndListDevices);
    }

    #[test]
    fn unrecognized_line_is_informational() {
        assert_eq!(
            parse_line("3.0-000"),
            ResponseFrame::Informational("3.0-000".to_string())
        );
    }
}
