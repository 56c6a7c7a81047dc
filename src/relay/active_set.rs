//! Active connection set
//!
//! The only shared mutable state of the relay. Members are kept in
//! insertion order; broadcasts iterate a snapshot taken under the read lock,
//! so accepts and closes never race a fan-out in progress.

use std::fmt;
use std::net::SocketAddr;

use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use super::{RelayError, RelayResult};

/// Unique identifier of an accepted connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Handle to one open client session.
///
/// Sending only enqueues onto the connection's outbound queue; a dedicated
/// writer task owns the socket. A closed connection fails the enqueue without
/// affecting anyone else.
#[derive(Debug, Clone)]
pub struct Connection {
    id: ConnectionId,
    remote_addr: SocketAddr,
    outbound: mpsc::UnboundedSender<Message>,
}

impl Connection {
    /// Create a connection handle and the receiving end of its outbound queue
    pub fn new(remote_addr: SocketAddr) -> (Self, mpsc::UnboundedReceiver<Message>) {
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let connection = Self {
            id: ConnectionId::new(),
            remote_addr,
            outbound,
        };
        (connection, outbound_rx)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn send_text(&self, text: impl Into<String>) -> RelayResult<()> {
        self.send(Message::Text(text.into()))
    }

    pub fn send_binary(&self, data: impl Into<Vec<u8>>) -> RelayResult<()> {
        self.send(Message::Binary(data.into()))
    }

    /// Ask the writer task to send a close frame and stop
    pub fn close(&self) {
        let _ = self.outbound.send(Message::Close(None));
    }

    fn send(&self, message: Message) -> RelayResult<()> {
        self.outbound
            .send(message)
            .map_err(|_| RelayError::SendFailure(self.id))
    }
}

/// Insertion-ordered set of open connections
#[derive(Debug, Default)]
pub struct ActiveSet {
    members: RwLock<Vec<Connection>>,
}

impl ActiveSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a connection. Returns `false` if it is already a member.
    pub async fn add(&self, connection: Connection) -> bool {
        let mut members = self.members.write().await;
        if members.iter().any(|c| c.id == connection.id) {
            return false;
        }
        members.push(connection);
        true
    }

    /// Remove a connection, preserving the order of the rest
    pub async fn remove(&self, id: ConnectionId) -> Option<Connection> {
        let mut members = self.members.write().await;
        let pos = members.iter().position(|c| c.id == id)?;
        Some(members.remove(pos))
    }

    /// Copy of the current members in insertion order
    pub async fn snapshot(&self) -> Vec<Connection> {
        self.members.read().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.members.read().await.len()
    }

    #[allow(dead_code)]
    pub async fn is_empty(&self) -> bool {
        self.members.read().await.is_empty()
    }
}
