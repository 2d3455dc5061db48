//! RedRat `KeyManager` XML decoder: turns a keyset file into a [`KeysetCatalogue`].

use base64::Engine;
use serde::Deserialize;

use crate::error::{DispatchError, Result};

use super::waveform::{IRWaveform, KeysetCatalogue};

/// Sentinel marking a segment boundary in the decoded index stream.
const SEGMENT_MARKER: u8 = 0x7F;

/// The only `IRPacket` type this core understands; others are skipped with
/// a diagnostic (§6).
const SUPPORTED_PACKET_TYPE: &str = "ProntoModulatedSignal";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct KeyManagerXml {
    #[serde(rename = "AVDeviceList", default)]
    av_device_list: AvDeviceListXml,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "PascalCase")]
struct AvDeviceListXml {
    #[serde(rename = "AVDevice", default)]
    av_device: Vec<AvDeviceXml>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AvDeviceXml {
    name: String,
    #[serde(rename = "Signals", default)]
    signals: SignalsXml,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "PascalCase")]
struct SignalsXml {
    #[serde(rename = "IRPacket", default)]
    ir_packet: Vec<IrPacketXml>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct IrPacketXml {
    name: String,
    #[serde(rename = "Type", default)]
    type_: Option<String>,
    modulation_freq: f64,
    #[serde(default)]
    no_repeats: u32,
    #[serde(default)]
    intra_sig_pause: f64,
    lengths: String,
    sig_data: String,
}

/// Decode a complete RedRat `KeyManager` XML document into a catalogue.
///
/// Malformed XML, invalid Base64, and out-of-range `Lengths` indices all map
/// to [`DispatchError::BadKeyset`] naming the offending device/key where
/// possible.
pub fn decode_catalogue(xml: &str) -> Result<KeysetCatalogue> {
    let doc: KeyManagerXml = quick_xml::de::from_str(xml)
        .map_err(|e| DispatchError::BadKeyset(format!("malformed keyset XML: {e}")))?;

    let mut catalogue = KeysetCatalogue::new();

    for device in &doc.av_device_list.av_device {
        for packet in &device.signals.ir_packet {
            if let Some(ty) = &packet.type_ {
                if ty != SUPPORTED_PACKET_TYPE {
                    tracing::debug!(
                        device = %device.name,
                        key = %packet.name,
                        packet_type = %ty,
                        "skipping unsupported IRPacket type"
                    );
                    continue;
                }
            }

            let waveform = decode_packet(&device.name, packet)?;
            if catalogue.insert(&device.name, &packet.name, waveform) {
                tracing::warn!(
                    device = %device.name,
                    key = %packet.name,
                    "duplicate key name in keyset, later entry wins"
                );
            }
        }
    }

    Ok(catalogue)
}

fn decode_packet(device_name: &str, packet: &IrPacketXml) -> Result<IRWaveform> {
    let ctx = || format!("{device_name}/{}", packet.name);

    let lengths: Vec<f64> = packet
        .lengths
        .split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<f64>()
                .map_err(|_| DispatchError::BadKeyset(format!("bad Lengths entry in {}", ctx())))
        })
        .collect::<Result<_>>()?;

    let raw = base64::engine::general_purpose::STANDARD
        .decode(packet.sig_data.trim())
        .map_err(|e| DispatchError::BadKeyset(format!("invalid SigData base64 in {}: {e}", ctx())))?;

    if raw.len() % 2 != 0 {
        return Err(DispatchError::BadKeyset(format!(
            "SigData has an odd byte count in {}",
            ctx()
        )));
    }

    let mut indices = Vec::with_capacity(raw.len() / 2);
    for pair in raw.chunks_exact(2) {
        let (high, low) = (pair[0], pair[1]);
        if high != 0 {
            return Err(DispatchError::BadKeyset(format!(
                "non-zero reserved high byte in {}",
                ctx()
            )));
        }
        indices.push(low);
    }

    let (base_idx, repeat_idx) = split_segments(&indices);

    let base_ms = resolve_lengths(&base_idx, &lengths, &ctx)?;
    let repeat_ms = resolve_lengths(&repeat_idx, &lengths, &ctx)?;

    let freq = packet.modulation_freq;
    if freq <= 0.0 {
        return Err(DispatchError::BadKeyset(format!(
            "non-positive ModulationFreq in {}",
            ctx()
        )));
    }

    let base_cycles = quantize(&base_ms, freq);
    let repeat_cycles = quantize(&repeat_ms, freq);

    if base_cycles.is_empty() || base_cycles.len() % 2 != 0 {
        return Err(DispatchError::BadKeyset(format!(
            "base segment has odd or zero length in {}",
            ctx()
        )));
    }
    if !repeat_cycles.is_empty() && repeat_cycles.len() % 2 != 0 {
        return Err(DispatchError::BadKeyset(format!(
            "repeat segment has odd length in {}",
            ctx()
        )));
    }

    let intra_sig_pause_cycles =
        (packet.intra_sig_pause * freq / 1000.0).round().max(1.0) as u32;

    Ok(IRWaveform {
        modulation_freq_hz: freq.round() as u32,
        base_cycles,
        repeat_cycles,
        repeat_count_default: packet.no_repeats,
        intra_sig_pause_cycles,
    })
}

/// Split a decoded index stream into `(base, repeat)` on the first two
/// `0x7F` sentinels. A packet with no sentinel is all-base; one sentinel
/// yields an empty repeat segment (§4.1.3).
fn split_segments(indices: &[u8]) -> (Vec<u8>, Vec<u8>) {
    let first = indices.iter().position(|&b| b == SEGMENT_MARKER);
    let Some(first) = first else {
        return (indices.to_vec(), Vec::new());
    };
    let base = indices[..first].to_vec();
    let rest = &indices[first + 1..];
    let second = rest.iter().position(|&b| b == SEGMENT_MARKER);
    let repeat = match second {
        Some(second) => rest[..second].to_vec(),
        None => rest.to_vec(),
    };
    (base, repeat)
}

fn resolve_lengths(
    indices: &[u8],
    lengths: &[f64],
    ctx: &dyn Fn() -> String,
) -> Result<Vec<f64>> {
    indices
        .iter()
        .map(|&idx| {
            lengths
                .get(idx as usize)
                .copied()
                .ok_or_else(|| DispatchError::BadKeyset(format!("Lengths index {idx} out of range in {}", ctx())))
        })
        .collect()
}

/// Error-accumulating quantization: walk the ms sequence keeping a floating
/// residual so cumulative drift stays under one cycle (§4.1.5). Any element
/// that would round to 0 is clamped to 1, with the clamp amount folded into
/// the next element's residual so total duration is preserved (§4.1.7).
fn quantize(ms: &[f64], freq_hz: f64) -> Vec<u32> {
    let mut out = Vec::with_capacity(ms.len());
    let mut err = 0.0_f64;
    for &t_ms in ms {
        let x = t_ms * freq_hz / 1000.0 + err;
        let mut rounded = x.round();
        err = x - rounded;
        if rounded < 1.0 {
            err -= 1.0 - rounded;
            rounded = 1.0;
        }
        out.push(rounded as u32);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_xml() -> String {
        // S1 — Decode one packet from §8.
        let sig_bytes: [u8; 12] = [0, 0, 0, 1, 0, 127, 0, 1, 0, 0, 0, 127];
        let sig_b64 = base64::engine::general_purpose::STANDARD.encode(sig_bytes);
        format!(
            r#"<KeyManager>
                <AVDeviceList>
                    <AVDevice>
                        <Name>TV</Name>
                        <Signals>
                            <IRPacket>
                                <Name>Power</Name>
                                <Type>ProntoModulatedSignal</Type>
                                <ModulationFreq>40000</ModulationFreq>
                                <NoRepeats>1</NoRepeats>
                                <IntraSigPause>5.0</IntraSigPause>
                                <Lengths>0.25,1.0</Lengths>
                                <SigData>{sig_b64}</SigData>
                            </IRPacket>
                        </Signals>
                    </AVDevice>
                </AVDeviceList>
            </KeyManager>"#
        )
    }

    #[test]
    fn decodes_s1_scenario() {
        let catalogue = decode_catalogue(&sample_xml()).unwrap();
        let waveform = catalogue.get("TV", "Power").unwrap();
        assert_eq!(waveform.base_cycles, vec![10, 40]);
        assert_eq!(waveform.repeat_cycles, vec![40, 10]);
        assert_eq!(waveform.intra_sig_pause_cycles, 200);
        assert_eq!(waveform.modulation_freq_hz, 40_000);
    }

    #[test]
    fn base_only_packet_has_no_repeat_segment() {
        let sig_bytes: [u8; 4] = [0, 0, 0, 1];
        let sig_b64 = base64::engine::general_purpose::STANDARD.encode(sig_bytes);
        let xml = format!(
            r#"<KeyManager>
                <AVDeviceList>
                    <AVDevice>
                        <Name>AC</Name>
                        <Signals>
                            <IRPacket>
                                <Name>On</Name>
                                <ModulationFreq>38000</ModulationFreq>
                                <IntraSigPause>10.0</IntraSigPause>
                                <Lengths>0.5,1.5</Lengths>
                                <SigData>{sig_b64}</SigData>
                            </IRPacket>
                        </Signals>
                    </AVDevice>
                </AVDeviceList>
            </KeyManager>"#
        );
        let catalogue = decode_catalogue(&xml).unwrap();
        let waveform = catalogue.get("AC", "On").unwrap();
        assert!(waveform.repeat_cycles.is_empty());
        assert_eq!(waveform.base_cycles.len(), 2);
    }

    #[test]
    fn unsupported_packet_type_is_skipped() {
        let xml = r#"<KeyManager>
            <AVDeviceList>
                <AVDevice>
                    <Name>AC</Name>
                    <Signals>
                        <IRPacket>
                            <Name>Weird</Name>
                            <Type>RawSignal</Type>
                            <ModulationFreq>38000</ModulationFreq>
                            <IntraSigPause>1.0</IntraSigPause>
                            <Lengths>1.0</Lengths>
                            <SigData>AAA=</SigData>
                        </IRPacket>
                    </Signals>
                </AVDevice>
            </AVDeviceList>
        </KeyManager>"#;
        let catalogue = decode_catalogue(xml).unwrap();
        assert!(catalogue.list_keys("AC").is_empty());
    }

    #[test]
    fn out_of_range_length_index_is_bad_keyset() {
        let sig_bytes: [u8; 2] = [0, 5];
        let sig_b64 = base64::engine::general_purpose::STANDARD.encode(sig_bytes);
        let xml = format!(
            r#"<KeyManager>
                <AVDeviceList>
                    <AVDevice>
                        <Name>AC</Name>
                        <Signals>
                            <IRPacket>
                                <Name>On</Name>
                                <ModulationFreq>38000</ModulationFreq>
                                <IntraSigPause>1.0</IntraSigPause>
                                <Lengths>1.0</Lengths>
                                <SigData>{sig_b64}</SigData>
                            </IRPacket>
                        </Signals>
                    </AVDevice>
                </AVDeviceList>
            </KeyManager>"#
        );
        let err = decode_catalogue(&xml).unwrap_err();
        assert!(matches!(err, DispatchError::BadKeyset(_)));
    }

    #[test]
    fn quantize_matches_s1() {
        let base = quantize(&[0.25, 1.0], 40_000.0);
        assert_eq!(base, vec![10, 40]);
    }

    #[test]
    fn quantize_clamps_sub_cycle_values_to_one() {
        // 0.001 ms at 40kHz is 0.04 cycles, would round to 0 without the clamp.
        let cycles = quantize(&[0.001, 0.001], 40_000.0);
        assert!(cycles.iter().all(|&c| c >= 1));
    }
}
