//! Transport abstraction layer for mjwire.
//!
//! Provides the [`Connector`] and [`Connection`] traits that abstract over
//! the duplex socket the protocol engine is tunneled through. The engine
//! never touches a socket directly: it dials through a `Connector`, then
//! reads and writes whole frames through the resulting `Connection`.
//!
//! # Feature Flags
//!
//! - `websocket` (default) — WebSocket transport via `tokio-tungstenite`
//! - `tls` — enables `wss://` addresses (rustls with webpki roots)
//!
//! The in-memory transport ([`MemoryConnector`]) is always available; it is
//! what the test suites use to play the remote service.

mod error;
mod memory;
#[cfg(feature = "websocket")]
mod websocket;

pub use error::TransportError;
pub use memory::{MemoryConnection, MemoryConnector, MemoryPeer, MemoryServer};
#[cfg(feature = "websocket")]
pub use websocket::{WebSocketConnection, WebSocketConnector};

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counter for generating unique connection IDs.
static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Opaque identifier for a connection.
///
/// Every successful dial gets a fresh id, so log lines from before and
/// after a reconnect can be told apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Creates a new `ConnectionId` from a raw `u64`.
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Allocates the next process-wide unique id.
    pub fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Returns the underlying `u64` value.
    pub fn into_inner(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Dials the remote service.
///
/// A connector is reusable: the lifecycle manager calls [`connect`] once for
/// the initial connection and again for every reconnection attempt.
///
/// The returned futures are `Send` so the engine can drive them from
/// spawned Tokio tasks.
///
/// [`connect`]: Connector::connect
pub trait Connector: Send + Sync + 'static {
    /// The connection type produced by this connector.
    type Connection: Connection;

    /// Opens a new connection to `addr`.
    fn connect(
        &self,
        addr: &str,
    ) -> impl Future<Output = Result<Self::Connection, TransportError>> + Send;
}

/// A single duplex connection that carries whole frames.
///
/// Exactly one task reads (the engine's read loop) while any number of
/// tasks may write. Implementations must serialize concurrent `send` calls
/// so two frames are never interleaved, and a pending `recv` must never
/// block a `send`.
pub trait Connection: Send + Sync + 'static {
    /// Sends one frame to the remote peer.
    fn send(
        &self,
        data: &[u8],
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Receives the next frame from the remote peer.
    ///
    /// Returns `Ok(None)` when the connection is cleanly closed.
    fn recv(
        &self,
    ) -> impl Future<Output = Result<Option<Vec<u8>>, TransportError>> + Send;

    /// Closes the connection.
    fn close(&self) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Returns the unique identifier for this connection.
    fn id(&self) -> ConnectionId;
}
