//! Relay admission and per-connection receive loop
//!
//! Each accepted client gets two tasks: the receive loop below, which
//! dispatches messages in arrival order, and a writer task that drains the
//! connection's outbound queue into the socket.

use std::net::SocketAddr;
use std::ops::ControlFlow;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::tungstenite::http::header::{HeaderMap, ORIGIN, SEC_WEBSOCKET_PROTOCOL};
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, warn};

use super::{
    ActiveSet, Admission, Connection, ConnectionId, OriginPolicy, RelayError, RelayResult,
    ECHO_PROTOCOL,
};

/// A data frame received from a client
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
}

/// The fan-out relay: admission policy plus the set of open connections
#[derive(Debug, Default)]
pub struct Relay {
    active: ActiveSet,
    origin_policy: OriginPolicy,
}

impl Relay {
    pub fn new(origin_policy: OriginPolicy) -> Self {
        Self {
            active: ActiveSet::new(),
            origin_policy,
        }
    }

    /// Number of currently open connections
    pub async fn connection_count(&self) -> usize {
        self.active.len().await
    }

    /// Decide whether an upgrade request from `origin` may proceed
    pub fn on_upgrade_request(&self, origin: &str) -> Admission {
        self.origin_policy.evaluate(origin)
    }

    /// Check an upgrade request's headers: origin first, then sub-protocol.
    /// Returns the sub-protocol to answer with, if any.
    pub fn admit(&self, headers: &HeaderMap) -> RelayResult<Option<&'static str>> {
        let origin = headers
            .get(ORIGIN)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");

        if self.on_upgrade_request(origin) == Admission::Reject {
            return Err(RelayError::OriginRejected(origin.to_string()));
        }
        negotiate_protocol(headers)
    }

    /// Register a freshly upgraded connection
    pub async fn on_open(&self, connection: Connection) {
        if !self.active.add(connection.clone()).await {
            warn!("Connection {} was already active", connection.id());
        }
    }

    /// Dispatch one received frame. Returns the recipients it was queued for,
    /// in delivery order.
    ///
    /// Text is sent to every open connection, sender included, in insertion
    /// order. Binary goes back to the sender only. A failed recipient is
    /// logged and skipped.
    pub async fn on_frame_received(&self, sender: &Connection, frame: Frame) -> Vec<ConnectionId> {
        match frame {
            Frame::Text(text) => {
                debug!("Received message from {}: {}", sender.remote_addr(), text);
                let mut delivered = Vec::new();
                for recipient in self.active.snapshot().await {
                    match recipient.send_text(text.as_str()) {
                        Ok(()) => delivered.push(recipient.id()),
                        Err(e) => warn!("Broadcast to {} failed: {}", recipient.remote_addr(), e),
                    }
                }
                delivered
            }
            Frame::Binary(data) => {
                debug!(
                    "Received binary message of {} bytes from {}",
                    data.len(),
                    sender.remote_addr()
                );
                match sender.send_binary(data) {
                    Ok(()) => vec![sender.id()],
                    Err(e) => {
                        warn!("Echo to {} failed: {}", sender.remote_addr(), e);
                        Vec::new()
                    }
                }
            }
        }
    }

    /// Handle one message off the wire. Breaks with the peer's close frame
    /// when the connection should end.
    pub async fn on_message(
        &self,
        connection: &Connection,
        message: Message,
    ) -> ControlFlow<Option<CloseFrame<'static>>> {
        match message {
            Message::Text(text) => {
                self.on_frame_received(connection, Frame::Text(text)).await;
            }
            Message::Binary(data) => {
                self.on_frame_received(connection, Frame::Binary(data)).await;
            }
            Message::Ping(_) => {
                // Pong is queued by the protocol layer
            }
            Message::Close(frame) => return ControlFlow::Break(frame),
            other => {
                debug!(
                    "Ignoring unexpected frame type from {}: {:?}",
                    connection.remote_addr(),
                    other
                );
            }
        }
        ControlFlow::Continue(())
    }

    /// Retire a connection: drop it from the active set and stop its writer
    pub async fn on_close(&self, connection: &Connection, frame: Option<&CloseFrame<'_>>) {
        self.active.remove(connection.id()).await;
        connection.close();

        match frame {
            Some(frame) => info!(
                "Peer {} disconnected ({}: {})",
                connection.remote_addr(),
                u16::from(frame.code),
                frame.reason
            ),
            None => info!("Peer {} disconnected", connection.remote_addr()),
        }
    }

    /// Run an upgraded connection until it closes or shutdown is signalled.
    /// Returns once the close frame has been handed to the socket.
    pub async fn serve<S>(
        &self,
        ws_stream: WebSocketStream<S>,
        peer_addr: SocketAddr,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (ws_sender, mut ws_receiver) = ws_stream.split();
        let (connection, outbound_rx) = Connection::new(peer_addr);
        let writer = tokio::spawn(write_loop(ws_sender, outbound_rx, peer_addr));

        self.on_open(connection.clone()).await;
        info!("Connection {} accepted from {}", connection.id(), peer_addr);

        let mut close_frame = None;
        loop {
            tokio::select! {
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(message)) => {
                            if let ControlFlow::Break(frame) = self.on_message(&connection, message).await {
                                close_frame = frame;
                                break;
                            }
                        }
                        Some(Err(e)) => {
                            error!("WebSocket error from {}: {}", peer_addr, e);
                            break;
                        }
                        None => break,
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received, closing connection to {}", peer_addr);
                    break;
                }
            }
        }

        self.on_close(&connection, close_frame.as_ref()).await;
        drop(connection);
        let _ = writer.await;
    }
}

/// Pick the sub-protocol to answer with.
///
/// `Ok(None)` when the client offered none; an error when it offered only
/// protocols other than `echo-protocol`.
pub fn negotiate_protocol(headers: &HeaderMap) -> RelayResult<Option<&'static str>> {
    let mut offered = headers
        .get_all(SEC_WEBSOCKET_PROTOCOL)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .peekable();

    if offered.peek().is_none() {
        return Ok(None);
    }
    if offered.any(|p| p == ECHO_PROTOCOL) {
        Ok(Some(ECHO_PROTOCOL))
    } else {
        Err(RelayError::ProtocolNotOffered)
    }
}

/// Drain the outbound queue into the socket until a close is requested
async fn write_loop<S>(
    mut ws_sender: SplitSink<WebSocketStream<S>, Message>,
    mut outbound_rx: mpsc::UnboundedReceiver<Message>,
    peer_addr: SocketAddr,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    while let Some(message) = outbound_rx.recv().await {
        let closing = matches!(message, Message::Close(_));
        if let Err(e) = ws_sender.send(message).await {
            debug!("Send to {} failed: {}", peer_addr, e);
            break;
        }
        if closing {
            break;
        }
    }
    let _ = ws_sender.close().await;
}
