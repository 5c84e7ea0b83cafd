//! Fan-out of status and band-power events to connected subscribers.
//!
//! A subscriber is the sending half of a bounded queue drained by that
//! connection's writer task.  Delivery is `try_send`: a subscriber that is
//! gone or too far behind fails delivery and is dropped from the set after
//! the pass, so a stalled client can never hold up the others.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use log::{debug, info, warn};
use thiserror::Error;
use tokio::sync::{mpsc, watch};

use crate::types::{BandPowers, ClientRequest, LinkStatus, OutboundMessage};

/// Per-subscriber queue depth.  At 10 Hz this is ten seconds of backlog.
pub const SUBSCRIBER_QUEUE_DEPTH: usize = 100;

/// Opaque handle returned by [`BroadcastHub::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriberId(u64);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HubError {
    #[error("subscriber {0:?} is closed")]
    Closed(SubscriberId),
    #[error("subscriber {0:?} queue is full")]
    Full(SubscriberId),
    #[error("unknown subscriber {0:?}")]
    Unknown(SubscriberId),
}

pub struct BroadcastHub {
    subscribers: Mutex<HashMap<SubscriberId, mpsc::Sender<String>>>,
    next_id: AtomicU64,
    status: watch::Receiver<LinkStatus>,
}

impl BroadcastHub {
    /// Hub that reports the link status carried by `status`.
    pub fn new(status: watch::Receiver<LinkStatus>) -> Self {
        Self {
            subscribers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            status,
        }
    }

    /// Add a subscriber and send it the latest status.  A subscriber whose
    /// queue is already closed is not added.
    pub fn subscribe(&self, tx: mpsc::Sender<String>) -> SubscriberId {
        let id = SubscriberId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let greeting = self.current_status().to_event();
        match deliver(id, &tx, &greeting) {
            Ok(()) => {}
            Err(e @ HubError::Closed(_)) => {
                debug!("Hub: not adding {id:?}: {e}");
                return id;
            }
            Err(e) => warn!("Hub: initial status to {id:?} failed: {e}"),
        }
        let count = {
            let mut subs = self.subscribers();
            subs.insert(id, tx);
            subs.len()
        };
        info!("Hub: subscriber {id:?} added ({count} total)");
        id
    }

    /// Remove a subscriber.  Unknown ids are ignored.
    pub fn unsubscribe(&self, id: SubscriberId) {
        if self.subscribers().remove(&id).is_some() {
            info!("Hub: subscriber {id:?} removed");
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers().len()
    }

    pub fn current_status(&self) -> LinkStatus {
        self.status.borrow().clone()
    }

    /// Serialize once and deliver to every subscriber.  Subscribers whose
    /// delivery fails are removed once the pass is complete.  Returns the
    /// number of successful deliveries.
    pub fn publish(&self, message: &OutboundMessage) -> usize {
        let text = match message.to_json() {
            Ok(text) => text,
            Err(e) => {
                warn!("Hub: could not serialize message: {e}");
                return 0;
            }
        };

        let mut subs = self.subscribers();
        let mut failed = Vec::new();
        for (&id, tx) in subs.iter() {
            if let Err(e) = try_deliver(id, tx, text.clone()) {
                debug!("Hub: delivery failed: {e}");
                failed.push(id);
            }
        }
        for id in &failed {
            subs.remove(id);
        }
        let delivered = subs.len();
        drop(subs);

        if !failed.is_empty() {
            info!("Hub: dropped {} subscriber(s) after failed delivery", failed.len());
        }
        delivered
    }

    /// Broadcast the current link status.
    pub fn publish_status(&self) -> usize {
        let status = self.current_status();
        debug!("Hub: status {:?} {:?}", status.state, status.device);
        self.publish(&status.to_event())
    }

    /// Broadcast a band-power result.  Empty results are not sent.
    pub fn publish_band_powers(&self, powers: BandPowers) -> usize {
        if powers.is_empty() {
            return 0;
        }
        self.publish(&OutboundMessage::band_powers(powers))
    }

    /// Send a message to one subscriber only.
    pub fn send_to(&self, id: SubscriberId, message: &OutboundMessage) -> Result<(), HubError> {
        let tx = self.subscribers().get(&id).cloned().ok_or(HubError::Unknown(id))?;
        deliver(id, &tx, message)
    }

    /// Handle a text frame received from subscriber `id`.
    ///
    /// * `{"type":"ping"}` → `{"type":"pong"}` to `id` alone
    /// * `{"type":"status"}` → status broadcast to everyone
    /// * anything else is ignored
    pub fn handle_inbound(&self, id: SubscriberId, text: &str) {
        match serde_json::from_str::<ClientRequest>(text) {
            Ok(ClientRequest::Ping) => {
                if let Err(e) = self.send_to(id, &OutboundMessage::Pong) {
                    debug!("Hub: pong to {id:?} failed: {e}");
                    if !matches!(e, HubError::Unknown(_)) {
                        self.unsubscribe(id);
                    }
                }
            }
            Ok(ClientRequest::Status) => {
                self.publish_status();
            }
            Err(e) => debug!("Hub: ignoring message from {id:?}: {e}"),
        }
    }

    fn subscribers(&self) -> MutexGuard<'_, HashMap<SubscriberId, mpsc::Sender<String>>> {
        self.subscribers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn deliver(
    id: SubscriberId,
    tx: &mpsc::Sender<String>,
    message: &OutboundMessage,
) -> Result<(), HubError> {
    match message.to_json() {
        Ok(text) => try_deliver(id, tx, text),
        Err(e) => {
            warn!("Hub: could not serialize message: {e}");
            Ok(())
        }
    }
}

fn try_deliver(id: SubscriberId, tx: &mpsc::Sender<String>, text: String) -> Result<(), HubError> {
    tx.try_send(text).map_err(|e| match e {
        mpsc::error::TrySendError::Closed(_) => HubError::Closed(id),
        mpsc::error::TrySendError::Full(_) => HubError::Full(id),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ConnectionState, DeviceInfo};
    use serde_json::Value;

    fn hub() -> (watch::Sender<LinkStatus>, BroadcastHub) {
        let (tx, rx) = watch::channel(LinkStatus::default());
        (tx, BroadcastHub::new(rx))
    }

    fn drain(rx: &mut mpsc::Receiver<String>) -> Vec<Value> {
        let mut out = Vec::new();
        while let Ok(text) = rx.try_recv() {
            out.push(serde_json::from_str(&text).unwrap());
        }
        out
    }

    #[test]
    fn subscribe_sends_current_status() {
        let (status_tx, hub) = hub();
        status_tx.send_replace(LinkStatus {
            state: ConnectionState::Streaming,
            device: Some(DeviceInfo { name: "Muse-1".into(), address: "AA".into() }),
        });
        let (tx, mut rx) = mpsc::channel(8);
        hub.subscribe(tx);
        let msgs = drain(&mut rx);
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0]["type"], "muse_status");
        assert_eq!(msgs[0]["connected"], true);
        assert_eq!(msgs[0]["device_name"], "Muse-1");
    }

    #[test]
    fn failed_subscriber_is_removed_others_still_receive() {
        let (_status, hub) = hub();
        let (tx_a, mut rx_a) = mpsc::channel(8);
        let (tx_b, rx_b) = mpsc::channel(8);
        let (tx_c, mut rx_c) = mpsc::channel(8);
        hub.subscribe(tx_a);
        hub.subscribe(tx_b);
        hub.subscribe(tx_c);
        drain(&mut rx_a);
        drain(&mut rx_c);
        drop(rx_b);

        let mut powers = BandPowers::new();
        powers.insert("Alpha", 1.25);
        assert_eq!(hub.publish_band_powers(powers), 2);
        assert_eq!(hub.subscriber_count(), 2);

        for rx in [&mut rx_a, &mut rx_c] {
            let msgs = drain(rx);
            assert_eq!(msgs.len(), 1);
            assert_eq!(msgs[0]["type"], "band_powers");
            assert_eq!(msgs[0]["data"]["Alpha"], 1.25);
        }
    }

    #[test]
    fn closed_subscriber_is_never_added() {
        let (_status, hub) = hub();
        let (tx, rx) = mpsc::channel(8);
        drop(rx);
        hub.subscribe(tx);
        assert_eq!(hub.subscriber_count(), 0);
    }

    #[test]
    fn full_queue_counts_as_failure() {
        let (_status, hub) = hub();
        let (tx, _rx) = mpsc::channel(1);
        hub.subscribe(tx); // greeting fills the queue
        assert_eq!(hub.publish_status(), 0);
        assert_eq!(hub.subscriber_count(), 0);
    }

    #[test]
    fn empty_band_powers_are_not_published() {
        let (_status, hub) = hub();
        let (tx, mut rx) = mpsc::channel(8);
        hub.subscribe(tx);
        drain(&mut rx);
        assert_eq!(hub.publish_band_powers(BandPowers::new()), 0);
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn ping_replies_to_sender_only() {
        let (_status, hub) = hub();
        let (tx_a, mut rx_a) = mpsc::channel(8);
        let (tx_b, mut rx_b) = mpsc::channel(8);
        let a = hub.subscribe(tx_a);
        hub.subscribe(tx_b);
        drain(&mut rx_a);
        drain(&mut rx_b);

        hub.handle_inbound(a, r#"{"type":"ping"}"#);
        let msgs = drain(&mut rx_a);
        assert_eq!(msgs, vec![serde_json::json!({"type": "pong"})]);
        assert!(drain(&mut rx_b).is_empty());
    }

    #[test]
    fn status_request_rebroadcasts_to_all() {
        let (_status, hub) = hub();
        let (tx_a, mut rx_a) = mpsc::channel(8);
        let (tx_b, mut rx_b) = mpsc::channel(8);
        let a = hub.subscribe(tx_a);
        hub.subscribe(tx_b);
        drain(&mut rx_a);
        drain(&mut rx_b);

        hub.handle_inbound(a, r#"{"type":"status"}"#);
        for rx in [&mut rx_a, &mut rx_b] {
            let msgs = drain(rx);
            assert_eq!(msgs.len(), 1);
            assert_eq!(msgs[0]["type"], "muse_status");
            assert_eq!(msgs[0]["connected"], false);
        }
    }

    #[test]
    fn malformed_inbound_is_ignored() {
        let (_status, hub) = hub();
        let (tx, mut rx) = mpsc::channel(8);
        let id = hub.subscribe(tx);
        drain(&mut rx);
        for junk in ["", "{", "[]", r#"{"type":"reboot"}"#, r#"{"kind":"ping"}"#] {
            hub.handle_inbound(id, junk);
        }
        assert!(drain(&mut rx).is_empty());
        assert_eq!(hub.subscriber_count(), 1);
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let (_status, hub) = hub();
        let (tx, mut rx) = mpsc::channel(8);
        let id = hub.subscribe(tx);
        drain(&mut rx);
        hub.unsubscribe(id);
        hub.unsubscribe(id);
        assert_eq!(hub.publish_status(), 0);
        assert!(drain(&mut rx).is_empty());
    }
}
