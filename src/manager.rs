//! Connection lifecycle: discovery, connect, handshake, liveness, and
//! backoff-driven retry.
//!
//! ```text
//! Disconnected ─▶ Scanning ─▶ Connecting ─▶ Streaming
//!       ▲             │             │             │
//!       └─────────────┴── failure ──┘   disconnect / failed poll
//! ```
//!
//! A failure before Streaming waits [`Backoff::next_delay`] and retries; a
//! lost link goes straight back to scanning.  Every state change is published
//! on the watch channel and broadcast as a status event.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use log::{debug, info, warn};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::backoff::Backoff;
use crate::buffer::ChannelBuffers;
use crate::hub::BroadcastHub;
use crate::muse_client::{LinkEvent, MuseClient};
use crate::types::{ConnectionState, DeviceInfo, IndicatorState, LinkStatus};

/// Capacity of the transport event queue.
const LINK_EVENT_QUEUE: usize = 16;

/// Discovery and connection, as seen by the manager.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    type Device: Send;
    type Link: Link;

    /// Find one device to connect to.
    async fn find_device(&self) -> Result<Self::Device>;

    fn device_info(device: &Self::Device) -> DeviceInfo;

    /// Open the link and start routing its notifications into `buffers`.
    /// Transport disconnects must be reported on `events` tagged `session`.
    async fn connect(
        &self,
        device: Self::Device,
        buffers: Arc<ChannelBuffers>,
        events: mpsc::Sender<LinkEvent>,
        session: u64,
    ) -> Result<Self::Link>;
}

/// An open link.
#[async_trait]
pub trait Link: Send + Sync {
    /// Run the startup handshake; returns the number of failed commands.
    async fn start(&self) -> usize;

    async fn is_connected(&self) -> bool;

    async fn disconnect(&self) -> Result<()>;
}

/// Why a streaming session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// The transport reported the disconnect.
    Disconnected,
    /// The liveness poll found the link down.
    HealthCheckFailed,
    /// Shutdown was requested.
    Shutdown,
}

/// Owns the BLE central role and the only writer of [`LinkStatus`].
pub struct ConnectionManager<T: Transport = MuseClient> {
    client: T,
    buffers: Arc<ChannelBuffers>,
    hub: Arc<BroadcastHub>,
    status: watch::Sender<LinkStatus>,
    backoff: Backoff,
    health_poll: Duration,
    session: u64,
    events_tx: mpsc::Sender<LinkEvent>,
    events_rx: mpsc::Receiver<LinkEvent>,
}

impl<T: Transport> ConnectionManager<T> {
    pub fn new(
        client: T,
        buffers: Arc<ChannelBuffers>,
        hub: Arc<BroadcastHub>,
        status: watch::Sender<LinkStatus>,
        health_poll: Duration,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::channel(LINK_EVENT_QUEUE);
        Self {
            client,
            buffers,
            hub,
            status,
            backoff: Backoff::default(),
            health_poll,
            session: 0,
            events_tx,
            events_rx,
        }
    }

    /// Replace the retry policy.
    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Run until `shutdown` is cancelled.  Never returns early on device
    /// errors.
    pub async fn run(mut self, shutdown: CancellationToken) {
        info!("Connection manager started");
        while !shutdown.is_cancelled() {
            match self.establish(&shutdown).await {
                Ok((link, device)) => {
                    let end = self.stream(&link, &shutdown).await;
                    info!("Session {} ended: {end:?}", self.session);
                    if let Err(e) = link.disconnect().await {
                        debug!("Disconnect after session end: {e}");
                    }
                    self.set_state(ConnectionState::Disconnected, Some(device));
                }
                Err(_) if shutdown.is_cancelled() => break,
                Err(e) => {
                    let delay = self.attempt_failed(&e);
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
        self.set_state(ConnectionState::Disconnected, None);
        info!("Connection manager stopped");
    }

    /// Scan, connect, and handshake.  On success the state is Streaming.
    ///
    /// Discovery gives way to `shutdown`.  A connect in progress is allowed
    /// to finish so that the link it opened can be closed again.
    async fn establish(&mut self, shutdown: &CancellationToken) -> Result<(T::Link, DeviceInfo)> {
        self.set_state(ConnectionState::Scanning, None);
        let device = tokio::select! {
            _ = shutdown.cancelled() => bail!("shutdown during discovery"),
            found = self.client.find_device() => found?,
        };
        let info = T::device_info(&device);

        self.set_state(ConnectionState::Connecting, Some(info.clone()));
        self.session += 1;
        self.buffers.reset();
        info!("Connecting to {} (session {})...", info.name, self.session);
        let link = self
            .client
            .connect(device, Arc::clone(&self.buffers), self.events_tx.clone(), self.session)
            .await?;

        if shutdown.is_cancelled() {
            link.disconnect().await.ok();
            bail!("shutdown during connect");
        }

        let failed = tokio::select! {
            _ = shutdown.cancelled() => {
                link.disconnect().await.ok();
                bail!("shutdown during handshake");
            }
            failed = link.start() => failed,
        };
        if failed > 0 {
            warn!("{failed} handshake command(s) failed; streaming may not start");
        }

        self.session_started(&info);
        Ok((link, info))
    }

    /// Wait for the session to end: a transport disconnect event for this
    /// session, a failed liveness poll, or shutdown.
    async fn stream(&mut self, link: &T::Link, shutdown: &CancellationToken) -> SessionEnd {
        let mut poll = tokio::time::interval(self.health_poll);
        poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        poll.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return SessionEnd::Shutdown,
                event = self.events_rx.recv() => match event {
                    Some(event) if self.is_current(event) => {
                        warn!("Device disconnected!");
                        return SessionEnd::Disconnected;
                    }
                    Some(LinkEvent::Disconnected { session }) => {
                        debug!("Ignoring disconnect from stale session {session}");
                    }
                    // The manager holds a sender, so the queue never closes.
                    None => return SessionEnd::Disconnected,
                },
                _ = poll.tick() => {
                    if !link.is_connected().await {
                        warn!("Connection lost (liveness poll)");
                        return SessionEnd::HealthCheckFailed;
                    }
                }
            }
        }
    }

    /// Whether `event` belongs to the session in progress.
    fn is_current(&self, event: LinkEvent) -> bool {
        match event {
            LinkEvent::Disconnected { session } => session == self.session,
        }
    }

    /// Streaming reached: report it and restart the retry sequence.
    fn session_started(&mut self, info: &DeviceInfo) {
        self.backoff.reset();
        self.set_state(ConnectionState::Streaming, Some(info.clone()));
        info!("Streaming from {} ({})", info.name, info.address);
    }

    /// Report a failed attempt and return how long to wait before the next.
    fn attempt_failed(&mut self, error: &anyhow::Error) -> Duration {
        warn!("Connection attempt failed: {error:#}");
        let delay = self.backoff.next_delay();
        self.set_state(ConnectionState::Disconnected, None);
        info!("Retrying in {:.2} s...", delay.as_secs_f64());
        delay
    }

    /// Publish a state change and broadcast it if anything changed.
    fn set_state(&self, state: ConnectionState, device: Option<DeviceInfo>) {
        let next = LinkStatus { state, device };
        let mut previous = state;
        let changed = self.status.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                previous = current.state;
                *current = next.clone();
                true
            }
        });
        if changed {
            info!("State: {previous:?} -> {state:?}");
            debug!("Indicator: {}", IndicatorState::from_transition(previous, &next).to_message());
            self.hub.publish_status();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::muse_client::MuseClientConfig;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Instant;

    const DEVICE: &str = "Muse-Test";

    #[derive(Default)]
    struct LinkState {
        connected: AtomicBool,
        disconnects: AtomicUsize,
    }

    struct ScriptedLink(Arc<LinkState>);

    #[async_trait]
    impl Link for ScriptedLink {
        async fn start(&self) -> usize {
            0
        }

        async fn is_connected(&self) -> bool {
            self.0.connected.load(Ordering::SeqCst)
        }

        async fn disconnect(&self) -> Result<()> {
            self.0.connected.store(false, Ordering::SeqCst);
            self.0.disconnects.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    /// Each discovery pops the next outcome: `true` finds the device,
    /// `false` (or an empty script) fails.
    #[derive(Default)]
    struct ScriptedTransport {
        script: Mutex<VecDeque<bool>>,
        attempts: Mutex<Vec<Instant>>,
        link: Arc<LinkState>,
        events: Mutex<Option<mpsc::Sender<LinkEvent>>>,
        session: AtomicU64,
        /// Cancelled from inside `connect`, as if shutdown arrived mid-connect.
        cancel_on_connect: Option<CancellationToken>,
    }

    impl ScriptedTransport {
        fn new(script: &[bool]) -> Arc<Self> {
            Arc::new(Self { script: Mutex::new(script.iter().copied().collect()), ..Default::default() })
        }

        fn attempts(&self) -> Vec<Instant> {
            self.attempts.lock().unwrap().clone()
        }

        async fn report_disconnect(&self, session: u64) {
            let tx = self.events.lock().unwrap().clone().unwrap();
            tx.send(LinkEvent::Disconnected { session }).await.unwrap();
        }
    }

    #[async_trait]
    impl Transport for Arc<ScriptedTransport> {
        type Device = ();
        type Link = ScriptedLink;

        async fn find_device(&self) -> Result<()> {
            self.attempts.lock().unwrap().push(Instant::now());
            match self.script.lock().unwrap().pop_front() {
                Some(true) => Ok(()),
                _ => bail!("no device in range"),
            }
        }

        fn device_info(_device: &()) -> DeviceInfo {
            DeviceInfo { name: DEVICE.into(), address: "00:55:DA:00:00:01".into() }
        }

        async fn connect(
            &self,
            _device: (),
            _buffers: Arc<ChannelBuffers>,
            events: mpsc::Sender<LinkEvent>,
            session: u64,
        ) -> Result<ScriptedLink> {
            *self.events.lock().unwrap() = Some(events);
            self.session.store(session, Ordering::SeqCst);
            self.link.connected.store(true, Ordering::SeqCst);
            if let Some(token) = &self.cancel_on_connect {
                token.cancel();
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            Ok(ScriptedLink(Arc::clone(&self.link)))
        }
    }

    struct Harness<T: Transport> {
        manager: ConnectionManager<T>,
        status: watch::Receiver<LinkStatus>,
        messages: mpsc::Receiver<String>,
    }

    fn harness<T: Transport>(client: T, health_poll: Duration) -> Harness<T> {
        let (status_tx, status) = watch::channel(LinkStatus::default());
        let hub = Arc::new(BroadcastHub::new(status.clone()));
        let (tx, mut messages) = mpsc::channel(256);
        hub.subscribe(tx);
        assert!(messages.try_recv().is_ok());
        let manager =
            ConnectionManager::new(client, Arc::new(ChannelBuffers::new(16)), hub, status_tx, health_poll);
        Harness { manager, status, messages }
    }

    fn fast_backoff() -> Backoff {
        Backoff::new(Duration::from_millis(20), Duration::from_millis(80), 2.0)
    }

    /// Read status events until one reports `state`; returns it.
    async fn wait_for_state(rx: &mut mpsc::Receiver<String>, state: &str) -> serde_json::Value {
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                let text = rx.recv().await.unwrap();
                let msg: serde_json::Value = serde_json::from_str(&text).unwrap();
                if msg["type"] == "muse_status" && msg["state"] == state {
                    return msg;
                }
            }
        })
        .await
        .unwrap_or_else(|_| panic!("no {state:?} status"))
    }

    async fn wait_for_attempts(transport: &ScriptedTransport, n: usize) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while transport.attempts().len() < n {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[test]
    fn every_transition_is_broadcast_once() {
        let Harness { manager, status, mut messages } =
            harness(MuseClient::new(MuseClientConfig::default()), Duration::from_secs(2));
        let device = DeviceInfo { name: "Muse-1".into(), address: "AA".into() };

        manager.set_state(ConnectionState::Scanning, None);
        manager.set_state(ConnectionState::Scanning, None);
        manager.set_state(ConnectionState::Connecting, Some(device.clone()));
        manager.set_state(ConnectionState::Streaming, Some(device));

        let states: Vec<String> = std::iter::from_fn(|| messages.try_recv().ok())
            .map(|text| {
                let v: serde_json::Value = serde_json::from_str(&text).unwrap();
                v["state"].as_str().unwrap().to_string()
            })
            .collect();
        assert_eq!(states, ["scanning", "connecting", "streaming"]);
        assert!(status.borrow().connected());
    }

    #[test]
    fn streaming_resets_the_retry_delay() {
        let Harness { mut manager, status, .. } =
            harness(ScriptedTransport::new(&[]), Duration::from_secs(2));
        manager = manager.with_backoff(fast_backoff());
        let err = anyhow::anyhow!("no device");

        assert_eq!(manager.attempt_failed(&err), Duration::from_millis(20));
        assert_eq!(manager.attempt_failed(&err), Duration::from_millis(40));
        assert_eq!(status.borrow().state, ConnectionState::Disconnected);

        manager.session_started(&DeviceInfo { name: DEVICE.into(), address: "AA".into() });
        assert!(status.borrow().connected());
        assert_eq!(manager.attempt_failed(&err), Duration::from_millis(20));
    }

    #[test]
    fn only_current_session_events_count() {
        let Harness { mut manager, .. } = harness(ScriptedTransport::new(&[]), Duration::from_secs(2));
        manager.session = 3;
        assert!(manager.is_current(LinkEvent::Disconnected { session: 3 }));
        assert!(!manager.is_current(LinkEvent::Disconnected { session: 2 }));
    }

    #[tokio::test]
    async fn cancelled_run_ends_disconnected() {
        let Harness { manager, status, .. } =
            harness(MuseClient::new(MuseClientConfig::default()), Duration::from_secs(2));
        let shutdown = CancellationToken::new();
        shutdown.cancel();
        manager.run(shutdown).await;
        assert_eq!(status.borrow().state, ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn failed_attempts_report_disconnected_and_back_off() {
        let transport = ScriptedTransport::new(&[]);
        let Harness { manager, mut messages, .. } =
            harness(Arc::clone(&transport), Duration::from_secs(2));
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(manager.with_backoff(fast_backoff()).run(shutdown.clone()));

        wait_for_state(&mut messages, "scanning").await;
        let msg = wait_for_state(&mut messages, "disconnected").await;
        assert_eq!(msg["connected"], false);
        assert!(msg["device_name"].is_null());

        wait_for_attempts(&transport, 3).await;
        shutdown.cancel();
        task.await.unwrap();

        let attempts = transport.attempts();
        assert!(attempts[1] - attempts[0] >= Duration::from_millis(20));
        assert!(attempts[2] - attempts[1] >= Duration::from_millis(40));
    }

    #[tokio::test]
    async fn stale_disconnect_is_ignored_current_one_ends_session() {
        let transport = ScriptedTransport::new(&[true]);
        let Harness { manager, status, mut messages } =
            harness(Arc::clone(&transport), Duration::from_secs(60));
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(manager.with_backoff(fast_backoff()).run(shutdown.clone()));

        let msg = wait_for_state(&mut messages, "streaming").await;
        assert_eq!(msg["connected"], true);
        assert_eq!(msg["device_name"], DEVICE);
        let session = transport.session.load(Ordering::SeqCst);

        transport.report_disconnect(session - 1).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(status.borrow().state, ConnectionState::Streaming);

        transport.report_disconnect(session).await;
        let msg = wait_for_state(&mut messages, "disconnected").await;
        assert_eq!(msg["connected"], false);
        assert_eq!(msg["device_name"], DEVICE);
        assert_eq!(transport.link.disconnects.load(Ordering::SeqCst), 1);

        // A lost link rescans without waiting out a backoff.
        wait_for_state(&mut messages, "scanning").await;
        shutdown.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn failed_liveness_poll_ends_session() {
        let transport = ScriptedTransport::new(&[true]);
        let Harness { manager, mut messages, .. } =
            harness(Arc::clone(&transport), Duration::from_millis(10));
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(manager.with_backoff(fast_backoff()).run(shutdown.clone()));

        wait_for_state(&mut messages, "streaming").await;
        transport.link.connected.store(false, Ordering::SeqCst);

        let msg = wait_for_state(&mut messages, "disconnected").await;
        assert_eq!(msg["connected"], false);
        assert_eq!(transport.link.disconnects.load(Ordering::SeqCst), 1);
        shutdown.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn shutdown_during_connect_closes_the_link() {
        let shutdown = CancellationToken::new();
        let transport = Arc::new(ScriptedTransport {
            script: Mutex::new(VecDeque::from([true])),
            cancel_on_connect: Some(shutdown.clone()),
            ..Default::default()
        });
        let Harness { manager, status, mut messages } =
            harness(Arc::clone(&transport), Duration::from_secs(2));

        tokio::time::timeout(Duration::from_secs(2), manager.run(shutdown)).await.unwrap();

        assert_eq!(transport.link.disconnects.load(Ordering::SeqCst), 1);
        assert!(!transport.link.connected.load(Ordering::SeqCst));
        assert_eq!(status.borrow().state, ConnectionState::Disconnected);
        let states: Vec<String> = std::iter::from_fn(|| messages.try_recv().ok())
            .map(|text| serde_json::from_str::<serde_json::Value>(&text).unwrap()["state"].to_string())
            .collect();
        assert!(!states.iter().any(|s| s.contains("streaming")), "{states:?}");
    }
}
