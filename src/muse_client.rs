use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::StreamExt;
use log::{debug, info, warn};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::buffer::ChannelBuffers;
use crate::manager::{Link, Transport};
use crate::parse::{decode_eeg_packet, packet_index, ControlAccumulator};
use crate::protocol::{
    decode_response, encode_command, CONTROL_CHARACTERISTIC, DEFAULT_SETTLE_DELAY,
    EEG_CHARACTERISTICS, EEG_SAMPLES_PER_READING, HANDSHAKE_COMMANDS, MUSE_SERVICE_UUID,
};
use crate::types::{Channel, DeviceInfo};

// ── MuseDevice ────────────────────────────────────────────────────────────────

/// A headband found during discovery; pass it to [`MuseClient::connect_to`].
#[derive(Clone, Debug)]
pub struct MuseDevice {
    /// Advertised device name (e.g. `"Muse-AB12"`).
    pub name: String,
    /// Platform BLE identifier.
    /// • macOS / Windows: a UUID string
    /// • Linux: a Bluetooth MAC address (`AA:BB:CC:DD:EE:FF`)
    pub id: String,
    pub(crate) peripheral: Peripheral,
    /// The adapter that discovered this device.  Kept so that
    /// [`MuseClient::connect_to`] can watch it for disconnect events without
    /// creating a second `Manager`.
    pub(crate) adapter: Adapter,
}

impl MuseDevice {
    pub fn info(&self) -> DeviceInfo {
        DeviceInfo { name: self.name.clone(), address: self.id.clone() }
    }
}

// ── Link events ───────────────────────────────────────────────────────────────

/// Transport events raised outside the connection manager's own loop.
///
/// The disconnect watcher and the notification task push these onto a
/// single-consumer queue; only the manager acts on them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEvent {
    /// The link for `session` went down.
    Disconnected { session: u64 },
}

// ── MuseClientConfig ──────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct MuseClientConfig {
    /// Case-insensitive substring that the advertised name must contain.
    /// Default: `"muse"`.
    pub name_filter: String,
    /// Discovery window in seconds. Default: `10`.
    pub scan_timeout_secs: u64,
    /// Timeout for the transport connect in seconds. Default: `20`.
    pub connect_timeout_secs: u64,
    /// Pause after each handshake command. Default: 500 ms.
    pub settle_delay: Duration,
}

impl Default for MuseClientConfig {
    fn default() -> Self {
        Self {
            name_filter: "muse".into(),
            scan_timeout_secs: 10,
            connect_timeout_secs: 20,
            settle_delay: DEFAULT_SETTLE_DELAY,
        }
    }
}

/// `true` when `name` contains `filter`, ignoring case.
pub fn name_matches(name: &str, filter: &str) -> bool {
    name.to_lowercase().contains(&filter.to_lowercase())
}

/// `true` when the discovered service list includes the Muse primary service.
pub fn exposes_muse_service(services: impl IntoIterator<Item = Uuid>) -> bool {
    services.into_iter().any(|uuid| uuid == MUSE_SERVICE_UUID)
}

// ── Notification routing ──────────────────────────────────────────────────────

/// Decode one EEG notification and append it to `channel`'s window.
///
/// A packet that does not decode to a full reading is dropped whole.
/// Returns whether the samples were stored.
pub fn ingest_eeg_notification(buffers: &ChannelBuffers, channel: Channel, data: &[u8]) -> bool {
    let samples = decode_eeg_packet(data);
    if samples.len() < EEG_SAMPLES_PER_READING {
        debug!(
            "{channel}: dropping short packet ({} bytes, {} samples)",
            data.len(),
            samples.len()
        );
        return false;
    }
    buffers.push_samples(channel, &samples);
    true
}

// ── MuseClient ────────────────────────────────────────────────────────────────

/// BLE central for the headband: discovery, connection, EEG subscription,
/// and notification dispatch into [`ChannelBuffers`].
pub struct MuseClient {
    config: MuseClientConfig,
}

impl MuseClient {
    pub fn new(config: MuseClientConfig) -> Self {
        Self { config }
    }

    // ── Public: discovery ─────────────────────────────────────────────────────

    /// Scan until the first device whose name matches
    /// [`MuseClientConfig::name_filter`] appears, or the scan window closes.
    pub async fn find_device(&self) -> Result<MuseDevice> {
        let adapter = first_adapter().await?;

        info!(
            "Scanning for devices matching {:?} ({} s) …",
            self.config.name_filter, self.config.scan_timeout_secs
        );
        adapter.start_scan(ScanFilter::default()).await?;
        let found = self.find_first(&adapter).await;
        adapter.stop_scan().await.ok();

        let (peripheral, name) = found?;
        let id = peripheral.id().to_string();
        info!("Found: {name} ({id})");
        Ok(MuseDevice { name, id, peripheral, adapter })
    }

    // ── Public: connect_to ────────────────────────────────────────────────────

    /// Open the link, subscribe to the four EEG characteristics (and the
    /// control characteristic), and spawn the dispatch and disconnect-watch
    /// tasks.  Disconnects are reported on `events` tagged with `session`.
    ///
    /// The headband does not stream until [`Link::start`] is called.
    pub async fn connect_to(
        &self,
        device: MuseDevice,
        buffers: Arc<ChannelBuffers>,
        events: mpsc::Sender<LinkEvent>,
        session: u64,
    ) -> Result<MuseHandle> {
        let MuseDevice { name, peripheral, adapter, .. } = device;
        let connect_timeout = Duration::from_secs(self.config.connect_timeout_secs);

        // BlueZ's Device1.Connect can block forever on a device that went out
        // of range, so the connect is always bounded.
        tokio::time::timeout(connect_timeout, peripheral.connect())
            .await
            .map_err(|_| anyhow!("BLE connect() timed out after {connect_timeout:?}"))??;

        // On Linux the stack reports the connection before the remote GATT
        // cache is populated; discovering too early returns an empty set.
        #[cfg(target_os = "linux")]
        tokio::time::sleep(Duration::from_millis(600)).await;

        let setup = self
            .subscribe_all(&peripheral, &name, buffers, events.clone(), session, adapter)
            .await;
        match setup {
            Ok((control_char, tasks)) => Ok(MuseHandle {
                peripheral,
                control_char,
                settle_delay: self.config.settle_delay,
                tasks,
            }),
            Err(e) => {
                // Do not leave the link half-open.
                peripheral.disconnect().await.ok();
                Err(e)
            }
        }
    }

    // ── Private ───────────────────────────────────────────────────────────────

    async fn subscribe_all(
        &self,
        peripheral: &Peripheral,
        device_name: &str,
        buffers: Arc<ChannelBuffers>,
        events: mpsc::Sender<LinkEvent>,
        session: u64,
        adapter: Adapter,
    ) -> Result<(Characteristic, Vec<JoinHandle<()>>)> {
        tokio::time::timeout(Duration::from_secs(15), peripheral.discover_services())
            .await
            .map_err(|_| anyhow!("discover_services() timed out after 15 s"))??;
        info!("Connected and services discovered: {device_name}");
        if !exposes_muse_service(peripheral.services().iter().map(|s| s.uuid)) {
            warn!("{device_name} does not list the Muse service {MUSE_SERVICE_UUID}; trying anyway");
        }

        let chars: BTreeSet<Characteristic> = peripheral.characteristics();
        let find_char = |uuid: Uuid| -> Result<Characteristic> {
            chars
                .iter()
                .find(|c| c.uuid == uuid)
                .cloned()
                .ok_or_else(|| anyhow!("Characteristic {uuid} not found"))
        };

        let control_char = find_char(CONTROL_CHARACTERISTIC)?;

        // All four EEG sources must be live before any command is sent.
        let mut subscribed = 0;
        for channel in Channel::ALL {
            let uuid = EEG_CHARACTERISTICS[channel.index()];
            match find_char(uuid) {
                Ok(c) => match peripheral.subscribe(&c).await {
                    Ok(()) => {
                        info!("Subscribed to EEG channel {} ({channel})", channel.index());
                        subscribed += 1;
                    }
                    Err(e) => warn!("Failed to subscribe to {channel}: {e}"),
                },
                Err(e) => warn!("EEG char {channel}: {e}"),
            }
        }
        if subscribed == 0 {
            return Err(anyhow!("no EEG characteristic could be subscribed"));
        }

        // Replies to `v1` arrive here; failure only costs us the log line.
        if let Err(e) = peripheral.subscribe(&control_char).await {
            warn!("Control characteristic subscribe failed: {e}");
        }

        let watcher = spawn_disconnect_watcher(adapter, peripheral.clone(), events.clone(), session);
        let dispatcher = spawn_dispatcher(peripheral.clone(), buffers, events, session).await?;
        Ok((control_char, vec![watcher, dispatcher]))
    }

    /// Poll until the first matching peripheral appears or the timeout expires.
    async fn find_first(&self, adapter: &Adapter) -> Result<(Peripheral, String)> {
        use tokio::time::{sleep, timeout};

        let timeout_secs = self.config.scan_timeout_secs;
        let filter = &self.config.name_filter;
        let result = timeout(Duration::from_secs(timeout_secs), async {
            loop {
                let peripherals = adapter.peripherals().await.unwrap_or_default();
                for p in peripherals {
                    if let Ok(Some(props)) = p.properties().await {
                        if let Some(name) = props.local_name {
                            if name_matches(&name, filter) {
                                return (p, name);
                            }
                        }
                    }
                }
                sleep(Duration::from_millis(250)).await;
            }
        })
        .await;

        result.map_err(|_| anyhow!("No device matching {filter:?} found within {timeout_secs} s"))
    }
}

/// First Bluetooth adapter on the host.
async fn first_adapter() -> Result<Adapter> {
    let manager = Manager::new().await?;
    let adapter = manager
        .adapters()
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| anyhow!("No Bluetooth adapter found"))?;

    // CoreBluetooth starts in an "unknown" state; scanning before it reports
    // PoweredOn is a silent no-op.
    #[cfg(target_os = "macos")]
    {
        use btleplug::api::CentralState;

        let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
        loop {
            match adapter.adapter_state().await {
                Ok(CentralState::PoweredOn) => break,
                Ok(state) if tokio::time::Instant::now() >= deadline => {
                    warn!("macOS: adapter still {state:?} after 3 s, scanning anyway");
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!("macOS: adapter_state() error: {e}");
                    break;
                }
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
        tokio::time::sleep(Duration::from_millis(300)).await;
    }

    Ok(adapter)
}

/// Watch the adapter's event stream for this peripheral's disconnect.  Often
/// fires before the notification stream closes.
fn spawn_disconnect_watcher(
    adapter: Adapter,
    peripheral: Peripheral,
    events: mpsc::Sender<LinkEvent>,
    session: u64,
) -> JoinHandle<()> {
    let peripheral_id = peripheral.id();
    tokio::spawn(async move {
        match adapter.events().await {
            Ok(mut stream) => {
                while let Some(event) = stream.next().await {
                    if let CentralEvent::DeviceDisconnected(id) = event {
                        if id == peripheral_id {
                            info!("Disconnect watcher: device {id:?} disconnected.");
                            let _ = events.send(LinkEvent::Disconnected { session }).await;
                            break;
                        }
                    }
                }
            }
            Err(e) => warn!("Disconnect watcher: could not subscribe to adapter events: {e}"),
        }
    })
}

/// Route notifications: EEG packets into the buffers, control fragments into
/// the JSON accumulator.  Reports a disconnect when the stream ends.
async fn spawn_dispatcher(
    peripheral: Peripheral,
    buffers: Arc<ChannelBuffers>,
    events: mpsc::Sender<LinkEvent>,
    session: u64,
) -> Result<JoinHandle<()>> {
    let mut notifications = peripheral.notifications().await?;
    Ok(tokio::spawn(async move {
        info!("Notification stream subscribed, waiting for data…");
        let mut notif_count: u64 = 0;
        let mut dropped: u64 = 0;
        let mut ctrl_acc = ControlAccumulator::new();

        while let Some(notif) = notifications.next().await {
            let data = &notif.value;
            let uuid = notif.uuid;
            notif_count += 1;

            if let Some(channel) = EEG_CHARACTERISTICS
                .iter()
                .position(|&u| u == uuid)
                .and_then(Channel::from_index)
            {
                if notif_count <= 5 || notif_count % 500 == 0 {
                    info!(
                        "notif #{notif_count} {channel} idx={:?} len={} (dropped so far: {dropped})",
                        packet_index(data),
                        data.len()
                    );
                }
                if !ingest_eeg_notification(&buffers, channel, data) {
                    dropped += 1;
                }
                continue;
            }

            if uuid == CONTROL_CHARACTERISTIC {
                let fragment = decode_response(data);
                debug!("Control fragment: {fragment:?}");
                if let Some(json) = ctrl_acc.push(&fragment) {
                    match serde_json::from_str::<serde_json::Value>(&json) {
                        Ok(reply) => info!("Device reply: {reply}"),
                        Err(e) => warn!("Control JSON parse error: {e} | raw: {json}"),
                    }
                }
                continue;
            }

            debug!("Unknown notification from {uuid}");
        }

        info!("Notification stream ended – device disconnected.");
        let _ = events.send(LinkEvent::Disconnected { session }).await;
    }))
}

#[async_trait]
impl Transport for MuseClient {
    type Device = MuseDevice;
    type Link = MuseHandle;

    async fn find_device(&self) -> Result<MuseDevice> {
        MuseClient::find_device(self).await
    }

    fn device_info(device: &MuseDevice) -> DeviceInfo {
        device.info()
    }

    async fn connect(
        &self,
        device: MuseDevice,
        buffers: Arc<ChannelBuffers>,
        events: mpsc::Sender<LinkEvent>,
        session: u64,
    ) -> Result<MuseHandle> {
        self.connect_to(device, buffers, events, session).await
    }
}

// ── MuseHandle ────────────────────────────────────────────────────────────────

/// An open link: command API, liveness check, and teardown.
///
/// Dropping the handle stops the background tasks but does not close the
/// link; call [`Link::disconnect`] for that.
pub struct MuseHandle {
    peripheral: Peripheral,
    control_char: Characteristic,
    settle_delay: Duration,
    tasks: Vec<JoinHandle<()>>,
}

impl MuseHandle {
    /// Write one command (e.g. `"d"`) to the control characteristic.
    pub async fn send_command(&self, cmd: &str) -> Result<()> {
        let payload = encode_command(cmd);
        self.peripheral
            .write(&self.control_char, &payload, WriteType::WithoutResponse)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl Link for MuseHandle {
    /// Run the startup sequence `v1` → `p20` → `s` → `d`, pausing after each
    /// command.  A failed write is logged and the sequence continues.
    ///
    /// Returns the number of commands that failed.
    async fn start(&self) -> usize {
        let mut failed = 0;
        for cmd in HANDSHAKE_COMMANDS {
            match self.send_command(cmd).await {
                Ok(()) => info!("Sent {cmd:?}"),
                Err(e) => {
                    warn!("Command {cmd:?} failed: {e}");
                    failed += 1;
                }
            }
            tokio::time::sleep(self.settle_delay).await;
        }
        failed
    }

    /// Link state as reported by the adapter.  Errors count as disconnected.
    async fn is_connected(&self) -> bool {
        self.peripheral.is_connected().await.unwrap_or(false)
    }

    /// Stop the background tasks and close the link.
    async fn disconnect(&self) -> Result<()> {
        for task in &self.tasks {
            task.abort();
        }
        self.peripheral.disconnect().await?;
        Ok(())
    }
}

impl Drop for MuseHandle {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}
