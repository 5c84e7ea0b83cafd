//! Wires the components together and owns their lifetimes.
//!
//! ```text
//!  ConnectionManager ──notifications──▶ ChannelBuffers ──▶ analysis loop
//!         │                                                     │
//!         └──── watch<LinkStatus> ─────▶ BroadcastHub ◀──────────┘
//!                                            │
//!                                     WebSocket clients
//! ```

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use log::{error, info, warn};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::analysis::BandPowerAnalyzer;
use crate::buffer::ChannelBuffers;
use crate::config::ServiceConfig;
use crate::hub::BroadcastHub;
use crate::manager::ConnectionManager;
use crate::muse_client::MuseClient;
use crate::server;
use crate::types::LinkStatus;

/// Interval between heartbeat log lines.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

/// How long shutdown waits for the tasks before giving up on them.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Run the service until Ctrl-C or SIGTERM.
pub async fn run(config: ServiceConfig) -> Result<()> {
    let addr = config.bind_addr();
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding WebSocket server to {addr}"))?;

    let buffers = Arc::new(ChannelBuffers::for_window(config.window_secs));
    let (status_tx, status_rx) = watch::channel(LinkStatus::default());
    let hub = Arc::new(BroadcastHub::new(status_rx.clone()));
    let shutdown = CancellationToken::new();

    info!(
        "Window {} samples ({} s), {} Hz updates",
        buffers.capacity(),
        config.window_secs,
        config.rate_hz
    );

    let manager = ConnectionManager::new(
        MuseClient::new(config.client_config()),
        Arc::clone(&buffers),
        Arc::clone(&hub),
        status_tx,
        config.health_poll(),
    );

    let tasks: Vec<(&str, JoinHandle<()>)> = vec![
        ("connection manager", tokio::spawn(manager.run(shutdown.clone()))),
        (
            "analysis",
            tokio::spawn(analysis_loop(
                Arc::clone(&buffers),
                Arc::clone(&hub),
                status_rx,
                config.analysis_period(),
                shutdown.clone(),
            )),
        ),
        ("server", tokio::spawn(server::serve(listener, Arc::clone(&hub), shutdown.clone()))),
    ];

    shutdown_signal().await;
    info!("Shutting down...");
    shutdown.cancel();

    for (name, task) in tasks {
        match tokio::time::timeout(SHUTDOWN_GRACE, task).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("{name} task failed: {e}"),
            Err(_) => warn!("{name} task did not stop within {SHUTDOWN_GRACE:?}"),
        }
    }
    info!("Stopped");
    Ok(())
}

/// Compute and publish band powers every `period` while the link is
/// streaming.  Ticks that fall behind are delayed, never bunched.
pub async fn analysis_loop(
    buffers: Arc<ChannelBuffers>,
    hub: Arc<BroadcastHub>,
    status: watch::Receiver<LinkStatus>,
    period: Duration,
    shutdown: CancellationToken,
) {
    let analyzer = BandPowerAnalyzer::for_buffers(&buffers);
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last_heartbeat = Instant::now();

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }

        if !status.borrow().state.is_streaming() {
            continue;
        }

        let alpha = match analyzer.compute(&buffers) {
            Ok(powers) => {
                let alpha = powers.get("Alpha");
                hub.publish_band_powers(powers);
                alpha
            }
            Err(e) => {
                error!("Band-power analysis failed: {e}");
                None
            }
        };

        if last_heartbeat.elapsed() >= HEARTBEAT_INTERVAL {
            last_heartbeat = Instant::now();
            let alpha = alpha.map_or_else(|| "no band data yet".to_string(), |a| format!("Alpha {a:.3}"));
            info!(
                "Heartbeat: {} samples, {alpha}, {} client(s)",
                buffers.total_samples(),
                hub.subscriber_count()
            );
        }
    }
}

/// Resolves on Ctrl-C, or on SIGTERM where that exists.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Ctrl-C handler unavailable: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                term.recv().await;
            }
            Err(e) => {
                error!("SIGTERM handler unavailable: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Channel, ConnectionState};
    use std::f64::consts::PI;
    use tokio::sync::mpsc;

    const N: usize = 256;

    fn live_buffers() -> Arc<ChannelBuffers> {
        let buffers = Arc::new(ChannelBuffers::new(N));
        let sine: Vec<f64> = (0..N).map(|i| 30.0 * (2.0 * PI * 10.0 * i as f64 / 256.0).sin()).collect();
        for ch in Channel::ALL {
            buffers.push_samples(ch, &sine);
        }
        buffers
    }

    #[tokio::test]
    async fn publishes_only_while_streaming() {
        let buffers = live_buffers();
        let (status_tx, status_rx) = watch::channel(LinkStatus::default());
        let hub = Arc::new(BroadcastHub::new(status_rx.clone()));
        let (tx, mut rx) = mpsc::channel(64);
        hub.subscribe(tx);
        let greeting = rx.recv().await.unwrap();
        assert!(greeting.contains("muse_status"));

        let shutdown = CancellationToken::new();
        let task = tokio::spawn(analysis_loop(
            Arc::clone(&buffers),
            Arc::clone(&hub),
            status_rx,
            Duration::from_millis(10),
            shutdown.clone(),
        ));

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(rx.try_recv().is_err(), "nothing is published while disconnected");

        status_tx.send_replace(LinkStatus { state: ConnectionState::Streaming, device: None });
        let text = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
        let msg: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(msg["type"], "band_powers");
        assert!(msg["data"]["Alpha"].as_f64().unwrap() > 0.0);

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
    }
}
