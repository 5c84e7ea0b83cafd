//! # muse-bandpower
//!
//! Streams EEG from an [Interaxon Muse](https://choosemuse.com/) headband over
//! Bluetooth Low Energy, estimates per-band spectral power over a sliding
//! window, and fans the results out to WebSocket clients as JSON.
//!
//! ## Wire messages
//!
//! ```text
//! {"type":"muse_status","connected":true,"state":"streaming","device_name":"Muse-AB12",
//!  "device_address":"00:55:DA:B0:AB:12","timestamp":"2024-05-01T10:00:00.123456+02:00"}
//! {"type":"band_powers","data":{"Theta":1.9,"Alpha":3.2,...},"timestamp":"..."}
//! {"type":"pong"}
//! ```
//!
//! Clients may send `{"type":"ping"}` or `{"type":"status"}`; anything else is
//! ignored.
//!
//! ## Module overview
//!
//! | Module | Purpose |
//! |---|---|
//! | [`prelude`] | One-line glob import of the most commonly needed types |
//! | [`protocol`] | GATT UUIDs, sampling constants, and command framing |
//! | [`parse`] | EEG packet decoding and control-reply reassembly |
//! | [`types`] | Channels, link state, bands, and outbound messages |
//! | [`buffer`] | Fixed-length per-channel sample windows |
//! | [`analysis`] | FFT band-power estimation |
//! | [`backoff`] | Reconnect delay policy |
//! | [`muse_client`] | BLE discovery, connect, subscriptions, and the handshake |
//! | [`manager`] | Connection state machine with liveness checks and retry |
//! | [`hub`] | Subscriber set and event fan-out |
//! | [`server`] | WebSocket acceptor |
//! | [`service`] | Task wiring, analysis loop, and shutdown |
//! | [`config`] | Command-line options |

pub mod analysis;
pub mod backoff;
pub mod buffer;
pub mod config;
pub mod hub;
pub mod manager;
pub mod muse_client;
pub mod parse;
pub mod protocol;
pub mod server;
pub mod service;
pub mod types;

// ── Prelude ───────────────────────────────────────────────────────────────────

/// Convenience re-exports for downstream crates.
///
/// ```no_run
/// use muse_bandpower::prelude::*;
///
/// # #[tokio::main]
/// # async fn main() -> anyhow::Result<()> {
/// let buffers = ChannelBuffers::new(512);
/// let analyzer = BandPowerAnalyzer::for_buffers(&buffers);
/// let powers = analyzer.compute(&buffers)?;
/// println!("{}", OutboundMessage::band_powers(powers).to_json()?);
/// # Ok(())
/// # }
/// ```
pub mod prelude {
    // ── Acquisition ───────────────────────────────────────────────────────────
    pub use crate::buffer::ChannelBuffers;
    pub use crate::manager::{ConnectionManager, Link, Transport};
    pub use crate::muse_client::{MuseClient, MuseClientConfig, MuseDevice, MuseHandle};

    // ── Analysis and fan-out ──────────────────────────────────────────────────
    pub use crate::analysis::{AnalysisError, BandPowerAnalyzer};
    pub use crate::hub::{BroadcastHub, SubscriberId};

    // ── Data types ────────────────────────────────────────────────────────────
    pub use crate::types::{
        BandPowers, Channel, ConnectionState, DeviceInfo, LinkStatus, OutboundMessage, BANDS,
    };

    // ── Protocol constants ────────────────────────────────────────────────────
    pub use crate::protocol::{EEG_CHANNEL_NAMES, EEG_FREQUENCY, EEG_SAMPLES_PER_READING};

    pub use crate::config::ServiceConfig;
}
