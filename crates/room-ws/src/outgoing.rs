//! Dialing side of the WebSocket provider.

use crate::connection::{read_handshake, read_loop, write_loop, ChannelShared};
use crate::message::{HandshakeMessage, HandshakeRole};
use crate::provider::Endpoint;
use anyhow::{anyhow, Context, Result};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use room_core::{ChannelEvent, PeerId, TransportError};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

type ClientStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Open a channel to `target`, then pump it until either side closes.
///
/// A failed dial or handshake is reported as `Errored`; the task is aborted
/// when the owner closes the channel first.
pub(crate) async fn dial(
    endpoint: Arc<Endpoint>,
    shared: Arc<ChannelShared>,
    target: PeerId,
    outbound: mpsc::UnboundedReceiver<Message>,
) {
    let (write, read) = match handshake(&endpoint, &target).await {
        Ok(halves) => halves,
        Err(e) => {
            warn!("Failed to open channel {} to {}: {:#}", shared.id, target, e);
            if shared.finish() {
                shared.emit(ChannelEvent::Errored(
                    shared.id,
                    TransportError::ConnectionFailed(format!("{:#}", e)),
                ));
            }
            return;
        }
    };

    if shared.is_closed() {
        return;
    }
    info!("Opened channel {} to {}", shared.id, target);
    shared.emit(ChannelEvent::Opened(shared.id));

    let writer = tokio::spawn(write_loop(write, outbound));
    read_loop(shared, read).await;
    writer.abort();
}

async fn handshake(
    endpoint: &Endpoint,
    target: &PeerId,
) -> Result<(SplitSink<ClientStream, Message>, SplitStream<ClientStream>)> {
    let (ws_stream, _) = connect_async(target.as_str())
        .await
        .with_context(|| format!("Could not reach {}", target))?;
    let (mut write, mut read) = ws_stream.split();

    let ours = HandshakeMessage::new(endpoint.peer_id.as_str(), HandshakeRole::Client);
    write
        .send(Message::Binary(ours.to_binary().into()))
        .await
        .context("Failed to send handshake")?;

    let theirs = timeout(endpoint.handshake_timeout, read_handshake(&mut read))
        .await
        .map_err(|_| anyhow!("Handshake with {} timed out", target))??;

    if theirs.peer_id != target.as_str() {
        // Reachable under another name (e.g. advertised LAN address)
        debug!("{} identifies itself as {}", target, theirs.peer_id);
    }
    Ok((write, read))
}
