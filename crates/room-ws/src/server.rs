//! Accepting side of the WebSocket provider.
//!
//! Each accepted socket is upgraded, exchanges handshakes, and only then is
//! handed to the room as an `Inbound` channel followed by `Opened`. Sockets
//! that never complete the handshake are dropped without an event.

use crate::connection::{read_handshake, read_loop, write_loop, WsChannel};
use crate::message::{HandshakeMessage, HandshakeRole};
use crate::provider::Endpoint;
use anyhow::{anyhow, Context, Result};
use futures::{SinkExt, StreamExt};
use room_core::{Channel, ChannelEvent, PeerId};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

/// Accept connections until the provider shuts down.
pub(crate) async fn accept_loop(listener: TcpListener, endpoint: Arc<Endpoint>) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                let endpoint = Arc::clone(&endpoint);
                tokio::spawn(async move {
                    if let Err(e) = accept_peer(stream, addr, endpoint).await {
                        debug!("Dropped connection from {}: {:#}", addr, e);
                    }
                });
            }
            Err(e) => {
                error!("Failed to accept connection: {}", e);
            }
        }
    }
}

async fn accept_peer(stream: TcpStream, addr: SocketAddr, endpoint: Arc<Endpoint>) -> Result<()> {
    // Health checks (like `nc -z`) connect and close without upgrading
    let ws_stream = accept_async(stream)
        .await
        .with_context(|| format!("WebSocket upgrade failed for {}", addr))?;
    let (mut write, mut read) = ws_stream.split();

    // Send our handshake immediately
    let ours = HandshakeMessage::new(endpoint.peer_id.as_str(), HandshakeRole::Server);
    write
        .send(Message::Binary(ours.to_binary().into()))
        .await
        .context("Failed to send handshake")?;

    let theirs = timeout(endpoint.handshake_timeout, read_handshake(&mut read))
        .await
        .map_err(|_| anyhow!("Handshake timed out"))??;
    if theirs.role != HandshakeRole::Client {
        warn!("{} sent a {:?} handshake to a listener", addr, theirs.role);
    }
    let remote = PeerId::new(theirs.peer_id)?;

    let shared = endpoint.allocate();
    let (channel, outbound_rx) = WsChannel::new(Arc::clone(&shared), remote.clone());
    info!(
        "Accepted channel {} from {} ({})",
        channel.id(),
        remote,
        addr
    );

    shared.emit(ChannelEvent::Inbound(channel));
    shared.emit(ChannelEvent::Opened(shared.id));

    let writer = tokio::spawn(write_loop(write, outbound_rx));
    let reader_shared = Arc::clone(&shared);
    let reader = tokio::spawn(async move {
        read_loop(reader_shared, read).await;
        writer.abort();
    });
    shared.set_task(reader.abort_handle());

    Ok(())
}
