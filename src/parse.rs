//! Binary decoders for Muse BLE notification payloads.
//!
//! Everything here is pure (no I/O, no shared state) and never panics on
//! malformed input: short packets produce short results.
//!
//! | Function | Input | Output |
//! |---|---|---|
//! | [`decode_eeg_packet`] | one EEG notification | up to 12 samples in µV |
//! | [`raw_to_microvolts`] | one 12-bit ADC code | µV |
//! | [`ControlAccumulator`] | control-channel fragments | complete JSON replies |

use crate::protocol::{
    ADC_MIDSCALE, ADC_REFERENCE_VOLTS, DEVICE_GAIN, EEG_HEADER_LEN, EEG_SAMPLES_PER_READING,
};

// ── EEG ──────────────────────────────────────────────────────────────────────

/// Convert a raw 12-bit ADC code to microvolts.
///
/// `µV = (raw − 2048) × 1.64 / 2048 × 10⁶ / 256`
///
/// 12-bit ADC centred at mid-scale, 1.64 V reference, front-end gain 256.
pub fn raw_to_microvolts(raw: u16) -> f64 {
    (raw as f64 - ADC_MIDSCALE) * ADC_REFERENCE_VOLTS / ADC_MIDSCALE * 1_000_000.0 / DEVICE_GAIN
}

/// Decode one EEG notification into calibrated samples (µV).
///
/// Layout: a 2-byte big-endian packet index, then 12 unsigned 12-bit samples
/// packed two per three bytes:
/// ```text
/// [AA BB CC] → even = (AA << 4) | (BB >> 4)
///              odd  = ((BB & 0x0F) << 8) | CC
/// ```
///
/// Sample `i` starts at byte `2 + ⌊1.5·i⌋`.  Decoding stops at the first
/// sample whose two bytes are not both present, so a truncated packet yields
/// a prefix of the samples and an empty or header-only packet yields none.
pub fn decode_eeg_packet(packet: &[u8]) -> Vec<f64> {
    let mut samples = Vec::with_capacity(EEG_SAMPLES_PER_READING);
    for i in 0..EEG_SAMPLES_PER_READING {
        let off = EEG_HEADER_LEN + i * 3 / 2;
        let (Some(&hi), Some(&lo)) = (packet.get(off), packet.get(off + 1)) else {
            break;
        };
        let raw = if i % 2 == 0 {
            ((hi as u16) << 4) | ((lo as u16) >> 4)
        } else {
            (((hi as u16) & 0x0F) << 8) | lo as u16
        };
        samples.push(raw_to_microvolts(raw));
    }
    samples
}

/// Packet index carried in the first two bytes of an EEG notification.
pub fn packet_index(packet: &[u8]) -> Option<u16> {
    match packet {
        [hi, lo, ..] => Some(u16::from_be_bytes([*hi, *lo])),
        _ => None,
    }
}

// ── Control replies ───────────────────────────────────────────────────────────

/// Reassembles JSON objects that the headband splits across several
/// control-channel notifications.
///
/// ```
/// # use muse_bandpower::parse::ControlAccumulator;
/// let mut acc = ControlAccumulator::new();
/// assert!(acc.push(r#"{"fw":"1.2."#).is_none());
/// assert_eq!(acc.push(r#"13","rc":0}"#).as_deref(), Some(r#"{"fw":"1.2.13","rc":0}"#));
/// ```
///
/// Text outside a top-level object is discarded.
#[derive(Debug, Default)]
pub struct ControlAccumulator {
    buffer: String,
    depth: usize,
}

impl ControlAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one fragment.  Returns the first object completed by it, if any;
    /// text following that object inside the same fragment is dropped.
    pub fn push(&mut self, fragment: &str) -> Option<String> {
        for ch in fragment.chars() {
            match ch {
                '{' => {
                    if self.depth == 0 {
                        self.buffer.clear();
                    }
                    self.depth += 1;
                }
                '}' if self.depth == 0 => continue,
                '}' => self.depth -= 1,
                _ if self.depth == 0 => continue,
                _ => {}
            }
            self.buffer.push(ch);
            if ch == '}' && self.depth == 0 {
                return Some(std::mem::take(&mut self.buffer));
            }
        }
        None
    }
}
