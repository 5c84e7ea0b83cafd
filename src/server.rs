//! WebSocket endpoint.
//!
//! Every accepted connection becomes one hub subscriber.  A writer task drains
//! the subscriber queue into the socket; the reader loop hands text frames to
//! [`BroadcastHub::handle_inbound`].  Either side finishing tears down the
//! whole connection.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use crate::hub::{BroadcastHub, SUBSCRIBER_QUEUE_DEPTH};

/// How long a closing connection may spend flushing its queue.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Accept connections until `shutdown` is cancelled.
pub async fn serve(listener: TcpListener, hub: Arc<BroadcastHub>, shutdown: CancellationToken) {
    if let Ok(addr) = listener.local_addr() {
        info!("WebSocket server listening on ws://{addr}");
    }
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let hub = Arc::clone(&hub);
                    let shutdown = shutdown.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, peer, hub, shutdown).await {
                            debug!("Client {peer}: {e:#}");
                        }
                    });
                }
                Err(e) => warn!("Accept failed: {e}"),
            },
        }
    }
    info!("WebSocket server stopped");
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    hub: Arc<BroadcastHub>,
    shutdown: CancellationToken,
) -> Result<()> {
    let ws = tokio_tungstenite::accept_async(stream).await?;
    info!("Client connected: {peer}");
    let (mut sink, mut source) = ws.split();

    let (tx, mut rx) = mpsc::channel::<String>(SUBSCRIBER_QUEUE_DEPTH);
    let id = hub.subscribe(tx);

    let mut writer = tokio::spawn(async move {
        while let Some(text) = rx.recv().await {
            if let Err(e) = sink.send(Message::Text(text)).await {
                debug!("Send failed: {e}");
                break;
            }
        }
        let _ = sink.close().await;
    });

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = &mut writer => break,
            frame = source.next() => match frame {
                Some(Ok(Message::Text(text))) => hub.handle_inbound(id, &text),
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!("Client {peer} read error: {e}");
                    break;
                }
            },
        }
    }

    // Dropping the hub's sender ends the writer, which closes the socket.
    hub.unsubscribe(id);
    if !writer.is_finished() && tokio::time::timeout(CLOSE_TIMEOUT, &mut writer).await.is_err() {
        writer.abort();
    }
    info!("Client disconnected: {peer}");
    Ok(())
}
