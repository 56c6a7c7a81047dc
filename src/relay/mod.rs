//! Connection fan-out relay
//!
//! Accepts WebSocket clients on the `echo-protocol` sub-protocol. Text frames
//! are broadcast to every open connection (the sender included); binary frames
//! are echoed back to their sender only.

mod active_set;
mod connection;
mod origin;

use thiserror::Error;

pub use active_set::*;
pub use connection::*;
pub use origin::*;

/// Sub-protocol negotiated during the handshake
pub const ECHO_PROTOCOL: &str = "echo-protocol";

/// Relay-related errors
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Connection from origin {0:?} rejected")]
    OriginRejected(String),

    #[error("Client did not offer the echo-protocol sub-protocol")]
    ProtocolNotOffered,

    #[error("Send to connection {0} failed: connection is closed")]
    SendFailure(ConnectionId),

    #[error("Malformed upgrade request: {0}")]
    MalformedUpgrade(&'static str),
}

/// Result type for relay operations
pub type RelayResult<T> = Result<T, RelayError>;
