//! A WebSocket as a room [`Channel`].
//!
//! Each channel splits its socket: a writer task drains an unbounded queue
//! into the sink (so `send` never blocks), and a reader task forwards frames
//! to the provider's event sender. `Closed` is reported exactly once, whether
//! the remote hung up or we called `close`.

use crate::message::{HandshakeError, HandshakeMessage, MAX_MESSAGE_SIZE};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use room_core::transport::Result;
use room_core::{Channel, ChannelEvent, ConnectionId, PeerId, TransportError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, warn};

/// State shared between a channel handle and its background tasks.
pub(crate) struct ChannelShared {
    pub(crate) id: ConnectionId,
    closed: AtomicBool,
    events: mpsc::UnboundedSender<ChannelEvent>,
    /// Reader (inbound) or dial-then-read (outgoing) task
    task: Mutex<Option<AbortHandle>>,
}

impl ChannelShared {
    pub(crate) fn new(id: ConnectionId, events: mpsc::UnboundedSender<ChannelEvent>) -> Arc<Self> {
        Arc::new(Self {
            id,
            closed: AtomicBool::new(false),
            events,
            task: Mutex::new(None),
        })
    }

    pub(crate) fn emit(&self, event: ChannelEvent) {
        let _ = self.events.send(event);
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Mark the channel finished. True only for the first caller.
    pub(crate) fn finish(&self) -> bool {
        !self.closed.swap(true, Ordering::AcqRel)
    }

    /// Attach the channel's background task. Aborted at once if already closed.
    pub(crate) fn set_task(&self, handle: AbortHandle) {
        if self.is_closed() {
            handle.abort();
            return;
        }
        *self.task.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
    }

    fn abort_task(&self) {
        if let Some(task) = self.task.lock().unwrap_or_else(|e| e.into_inner()).take() {
            task.abort();
        }
    }
}

/// One end of a room channel carried over a WebSocket.
pub struct WsChannel {
    shared: Arc<ChannelShared>,
    remote: PeerId,
    outbound: mpsc::UnboundedSender<Message>,
}

impl WsChannel {
    pub(crate) fn new(
        shared: Arc<ChannelShared>,
        remote: PeerId,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<Message>) {
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                shared,
                remote,
                outbound,
            }),
            outbound_rx,
        )
    }
}

impl Channel for WsChannel {
    fn id(&self) -> ConnectionId {
        self.shared.id
    }

    fn remote(&self) -> &PeerId {
        &self.remote
    }

    fn send(&self, data: &[u8]) -> Result<()> {
        if self.shared.is_closed() {
            return Err(TransportError::ChannelClosed);
        }
        self.outbound
            .send(Message::Binary(data.to_vec().into()))
            .map_err(|_| TransportError::ChannelClosed)
    }

    fn close(&self) {
        if !self.shared.finish() {
            return;
        }
        debug!("Closing channel {} to {}", self.shared.id, self.remote);
        let _ = self.outbound.send(Message::Close(None));
        self.shared.abort_task();
        self.shared.emit(ChannelEvent::Closed(self.shared.id));
    }
}

/// Drain queued frames into the socket until the channel closes.
pub(crate) async fn write_loop<S>(
    mut write: SplitSink<WebSocketStream<S>, Message>,
    mut outbound: mpsc::UnboundedReceiver<Message>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    while let Some(msg) = outbound.recv().await {
        let closing = matches!(msg, Message::Close(_));
        if let Err(e) = write.send(msg).await {
            debug!("WebSocket write failed: {}", e);
            break;
        }
        if closing {
            break;
        }
    }
    let _ = write.close().await;
}

/// Forward frames from the socket as `Data` events, then report `Closed`.
pub(crate) async fn read_loop<S>(
    shared: Arc<ChannelShared>,
    mut read: SplitStream<WebSocketStream<S>>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let id = shared.id;
    loop {
        match read.next().await {
            Some(Ok(msg)) => {
                let data = match msg {
                    Message::Binary(data) => data.to_vec(),
                    Message::Text(text) => text.into_bytes(),
                    Message::Ping(_) | Message::Pong(_) => continue,
                    Message::Close(_) => {
                        debug!("Received close frame on channel {}", id);
                        break;
                    }
                    Message::Frame(_) => continue,
                };

                if data.len() > MAX_MESSAGE_SIZE {
                    warn!(
                        "Message on channel {} exceeds max size ({} > {}), dropping",
                        id,
                        data.len(),
                        MAX_MESSAGE_SIZE
                    );
                    continue;
                }
                if shared.is_closed() {
                    break;
                }
                shared.emit(ChannelEvent::Data(id, data));
            }
            Some(Err(e)) => {
                match e {
                    WsError::ConnectionClosed | WsError::AlreadyClosed => {
                        debug!("Channel {} closed", id);
                    }
                    _ => {
                        error!("WebSocket error on channel {}: {}", id, e);
                    }
                }
                break;
            }
            None => {
                debug!("Channel {} stream ended", id);
                break;
            }
        }
    }

    if shared.finish() {
        shared.emit(ChannelEvent::Closed(id));
    }
}

/// Wait for the peer's handshake, which must be its first data frame.
pub(crate) async fn read_handshake<S>(
    read: &mut SplitStream<WebSocketStream<S>>,
) -> std::result::Result<HandshakeMessage, HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        match read.next().await {
            Some(Ok(Message::Binary(data))) => {
                return HandshakeMessage::from_binary(&data).ok_or(HandshakeError::Unexpected);
            }
            Some(Ok(Message::Text(text))) => {
                return HandshakeMessage::from_binary(text.as_bytes())
                    .ok_or(HandshakeError::Unexpected);
            }
            Some(Ok(Message::Close(_))) | None => return Err(HandshakeError::Closed),
            Some(Ok(_)) => continue,
            Some(Err(e)) => return Err(HandshakeError::WebSocket(e.to_string())),
        }
    }
}
