//! GATT UUIDs, sampling constants, calibration, and control-command helpers
//! for the Muse headband.
//!
//! All characteristic UUIDs belong to the Muse vendor namespace
//! `273eXXXX-4c4d-454d-96be-f03bac821358`.

use std::time::Duration;

use uuid::Uuid;

// ── Service ──────────────────────────────────────────────────────────────────

/// Primary GATT service UUID advertised by Muse devices.
pub const MUSE_SERVICE_UUID: Uuid = Uuid::from_u128(0x0000fe8d_0000_1000_8000_00805f9b34fb);

// ── Characteristics ───────────────────────────────────────────────────────────

/// Control channel.  Commands are written here; JSON replies come back as
/// notifications on the same characteristic.
pub const CONTROL_CHARACTERISTIC: Uuid =
    Uuid::from_u128(0x273e0001_4c4d_454d_96be_f03bac821358);

/// EEG per-channel characteristics, indexed by [`crate::types::Channel::index`]:
///
/// | Index | UUID suffix | Electrode |
/// |-------|-------------|-----------|
/// | 0     | 0003        | TP9       |
/// | 1     | 0004        | AF7       |
/// | 2     | 0005        | AF8       |
/// | 3     | 0006        | TP10      |
pub const EEG_CHARACTERISTICS: [Uuid; EEG_CHANNEL_COUNT] = [
    Uuid::from_u128(0x273e0003_4c4d_454d_96be_f03bac821358), // TP9
    Uuid::from_u128(0x273e0004_4c4d_454d_96be_f03bac821358), // AF7
    Uuid::from_u128(0x273e0005_4c4d_454d_96be_f03bac821358), // AF8
    Uuid::from_u128(0x273e0006_4c4d_454d_96be_f03bac821358), // TP10
];

// ── Sampling constants ────────────────────────────────────────────────────────

/// Number of physical EEG electrodes streamed by the service.
pub const EEG_CHANNEL_COUNT: usize = 4;

/// EEG sample rate in Hz (256 samples per second per channel).
pub const EEG_FREQUENCY: f64 = 256.0;

/// Number of 12-bit samples packed into one EEG notification.
pub const EEG_SAMPLES_PER_READING: usize = 12;

/// Bytes preceding the packed samples (big-endian packet index).
pub const EEG_HEADER_LEN: usize = 2;

/// Minimum notification length that carries all [`EEG_SAMPLES_PER_READING`]
/// samples: header plus 12 × 1.5 bytes.
pub const EEG_PACKET_LEN: usize = EEG_HEADER_LEN + EEG_SAMPLES_PER_READING * 3 / 2;

/// Electrode names in [`EEG_CHARACTERISTICS`] index order.
pub const EEG_CHANNEL_NAMES: [&str; EEG_CHANNEL_COUNT] = ["TP9", "AF7", "AF8", "TP10"];

// ── Calibration ───────────────────────────────────────────────────────────────

/// Mid-scale code of the 12-bit ADC.
pub const ADC_MIDSCALE: f64 = 2048.0;

/// ADC reference voltage in volts.
pub const ADC_REFERENCE_VOLTS: f64 = 1.64;

/// Fixed analog front-end gain of the headband.
pub const DEVICE_GAIN: f64 = 256.0;

// ── Control commands ──────────────────────────────────────────────────────────

/// Startup sequence written to [`CONTROL_CHARACTERISTIC`] after all EEG
/// characteristics are subscribed, in order:
///
/// | Command | Purpose |
/// |---|---|
/// | `v1`  | version query (wakes some firmware revisions) |
/// | `p20` | preset selection |
/// | `s`   | resume |
/// | `d`   | start streaming |
pub const HANDSHAKE_COMMANDS: [&str; 4] = ["v1", "p20", "s", "d"];

/// Pause after every handshake command.  An empirical accommodation for the
/// firmware, overridable through [`crate::muse_client::MuseClientConfig`].
pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_millis(500);

/// Encode a text command for the control characteristic.
///
/// The headband accepts the bare ASCII command terminated by a newline.
///
/// ```
/// # use muse_bandpower::protocol::encode_command;
/// assert_eq!(encode_command("p20"), b"p20\n");
/// ```
pub fn encode_command(cmd: &str) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(cmd.len() + 1);
    bytes.extend_from_slice(cmd.as_bytes());
    bytes.push(b'\n');
    bytes
}

/// Decode a notification from the control characteristic into a string
/// fragment.
///
/// Replies are framed as `[len, payload…]`; the payload is clamped to the
/// bytes actually received.  Returns an empty string for an empty packet.
pub fn decode_response(bytes: &[u8]) -> String {
    let Some((&len, rest)) = bytes.split_first() else {
        return String::new();
    };
    let end = (len as usize).min(rest.len());
    String::from_utf8_lossy(&rest[..end]).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handshake_commands_are_newline_terminated() {
        let encoded: Vec<Vec<u8>> = HANDSHAKE_COMMANDS.iter().map(|c| encode_command(c)).collect();
        assert_eq!(
            encoded,
            vec![b"v1\n".to_vec(), b"p20\n".to_vec(), b"s\n".to_vec(), b"d\n".to_vec()]
        );
    }

    #[test]
    fn full_packet_length() {
        assert_eq!(EEG_PACKET_LEN, 20);
    }

    #[test]
    fn decode_response_clamps_to_received_bytes() {
        assert_eq!(decode_response(&[]), "");
        assert_eq!(decode_response(&[3, b'{', b'"', b'a']), "{\"a");
        assert_eq!(decode_response(&[9, b'{', b'}']), "{}");
    }
}
