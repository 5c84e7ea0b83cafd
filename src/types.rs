//! Data model shared by the acquisition pipeline and the subscriber protocol.

use std::fmt;

use chrono::{Local, SecondsFormat};
use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};

use crate::protocol::{EEG_CHANNEL_COUNT, EEG_CHANNEL_NAMES};

// ── Channels ──────────────────────────────────────────────────────────────────

/// One of the four electrode sites on the headband.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Channel {
    /// Left rear, over the ear.
    Tp9,
    /// Left forehead.
    Af7,
    /// Right forehead.
    Af8,
    /// Right rear, over the ear.
    Tp10,
}

impl Channel {
    pub const ALL: [Channel; EEG_CHANNEL_COUNT] =
        [Channel::Tp9, Channel::Af7, Channel::Af8, Channel::Tp10];

    /// Stable index, also the position of this channel's characteristic in
    /// [`crate::protocol::EEG_CHARACTERISTICS`].
    pub const fn index(self) -> usize {
        self as usize
    }

    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    pub const fn name(self) -> &'static str {
        EEG_CHANNEL_NAMES[self as usize]
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ── Connection state ──────────────────────────────────────────────────────────

/// Lifecycle of the link to the headband.  Written only by
/// [`crate::manager::ConnectionManager`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Scanning,
    Connecting,
    Streaming,
}

impl ConnectionState {
    pub fn is_streaming(self) -> bool {
        self == ConnectionState::Streaming
    }
}

/// Identity of a discovered headband.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    /// Advertised name, e.g. `"Muse-AB12"`.
    pub name: String,
    /// Platform address: a MAC on Linux, a UUID string on macOS.
    pub address: String,
}

/// Current state plus the device it refers to, published on a
/// `tokio::sync::watch` channel.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LinkStatus {
    pub state: ConnectionState,
    pub device: Option<DeviceInfo>,
}

impl LinkStatus {
    pub fn connected(&self) -> bool {
        self.state.is_streaming()
    }

    /// Snapshot as an outbound status event stamped with the current time.
    pub fn to_event(&self) -> OutboundMessage {
        OutboundMessage::MuseStatus {
            connected: self.connected(),
            state: self.state,
            device_name: self.device.as_ref().map(|d| d.name.clone()),
            device_address: self.device.as_ref().map(|d| d.address.clone()),
            timestamp: iso_timestamp(),
        }
    }
}

// ── Bands ─────────────────────────────────────────────────────────────────────

/// A named frequency range `[low_hz, high_hz)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Band {
    pub name: &'static str,
    pub low_hz: f64,
    pub high_hz: f64,
}

impl Band {
    pub fn contains(&self, freq_hz: f64) -> bool {
        freq_hz >= self.low_hz && freq_hz < self.high_hz
    }
}

/// The five reported bands, in output order.
pub const BANDS: [Band; 5] = [
    Band { name: "Theta", low_hz: 4.0, high_hz: 8.0 },
    Band { name: "Alpha", low_hz: 8.0, high_hz: 12.0 },
    Band { name: "Low beta", low_hz: 12.0, high_hz: 16.0 },
    Band { name: "High beta", low_hz: 16.0, high_hz: 25.0 },
    Band { name: "Gamma", low_hz: 25.0, high_hz: 45.0 },
];

/// Result of one analysis tick: band name → mean spectral magnitude.
///
/// Bands with no contributing channel are absent.  Serializes as a JSON
/// object in [`BANDS`] order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BandPowers(Vec<(&'static str, f64)>);

impl BandPowers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, band: &'static str, power: f64) {
        match self.0.iter_mut().find(|(name, _)| *name == band) {
            Some(entry) => entry.1 = power,
            None => self.0.push((band, power)),
        }
    }

    pub fn get(&self, band: &str) -> Option<f64> {
        self.0.iter().find(|(name, _)| *name == band).map(|(_, p)| *p)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&'static str, f64)> + '_ {
        self.0.iter().copied()
    }
}

impl Serialize for BandPowers {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (name, power) in &self.0 {
            map.serialize_entry(name, power)?;
        }
        map.end()
    }
}

// ── Subscriber protocol ───────────────────────────────────────────────────────

/// Messages sent to subscribers, tagged by `type`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundMessage {
    /// `{"type":"muse_status","connected":…,"device_name":…,…}`
    MuseStatus {
        connected: bool,
        state: ConnectionState,
        device_name: Option<String>,
        device_address: Option<String>,
        timestamp: String,
    },
    /// `{"type":"band_powers","data":{"Alpha":…},"timestamp":…}`
    BandPowers { data: BandPowers, timestamp: String },
    /// Reply to a [`ClientRequest::Ping`].
    Pong,
}

impl OutboundMessage {
    pub fn band_powers(data: BandPowers) -> Self {
        OutboundMessage::BandPowers { data, timestamp: iso_timestamp() }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Requests a subscriber may send.  Anything else fails to parse and is
/// dropped by the hub.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientRequest {
    Ping,
    Status,
}

/// Local time, ISO-8601 with offset and microseconds.
pub fn iso_timestamp() -> String {
    Local::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}

// ── Indicator adapter ─────────────────────────────────────────────────────────

/// Vocabulary of the external status-light controller.
///
/// That controller listens on its own socket for
/// `{"type":"muse_status","state":"<state>"}`; this enum lets a bridge map
/// our richer [`LinkStatus`] onto it.
///
/// The full controller vocabulary is listed so messages for it can be built
/// here, but [`IndicatorState::from_transition`] only produces `Idle`,
/// `Searching`, `Connecting`, `Streaming` and `Reconnecting`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum IndicatorState {
    /// Controller boot animation; never derived from a link state.
    Startup,
    Idle,
    Searching,
    Connecting,
    /// Linked but not yet streaming.  The link goes straight from
    /// Connecting to Streaming, so this is never derived.
    Connected,
    Streaming,
    Reconnecting,
    /// Controller-side fault; link errors surface as `Idle` or `Reconnecting`.
    Error,
}

impl IndicatorState {
    /// Map a state transition.  `previous` distinguishes an idle disconnect
    /// from a lost link (`reconnecting`).
    pub fn from_transition(previous: ConnectionState, current: &LinkStatus) -> Self {
        match current.state {
            ConnectionState::Streaming => IndicatorState::Streaming,
            ConnectionState::Connecting => IndicatorState::Connecting,
            ConnectionState::Scanning => IndicatorState::Searching,
            ConnectionState::Disconnected if previous.is_streaming() => {
                IndicatorState::Reconnecting
            }
            ConnectionState::Disconnected => IndicatorState::Idle,
        }
    }

    /// The message shape the indicator controller accepts.
    pub fn to_message(self) -> serde_json::Value {
        serde_json::json!({ "type": "muse_status", "state": self })
    }
}
