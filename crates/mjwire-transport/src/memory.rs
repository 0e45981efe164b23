//! In-memory transport for tests.
//!
//! Uses Tokio channels instead of sockets. [`MemoryConnector::pair`] hands
//! back the client-side connector plus a [`MemoryServer`] that plays the
//! remote service: it accepts each dial as a [`MemoryPeer`], can refuse
//! dials, and can end a link either cleanly or with an error.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use tokio::sync::{Mutex, mpsc};

use crate::{Connection, ConnectionId, Connector, TransportError};

/// What the server side pushes down to a client connection.
enum Inbound {
    Data(Vec<u8>),
    Fail(String),
}

/// Client-side connector backed by channels.
#[derive(Clone)]
pub struct MemoryConnector {
    accept_tx: mpsc::UnboundedSender<MemoryPeer>,
    refuse: Arc<AtomicU32>,
}

impl MemoryConnector {
    /// Creates a connector and the server that receives its dials.
    pub fn pair() -> (Self, MemoryServer) {
        let (accept_tx, accept_rx) = mpsc::unbounded_channel();
        let refuse = Arc::new(AtomicU32::new(0));
        let connector = Self {
            accept_tx,
            refuse: Arc::clone(&refuse),
        };
        let server = MemoryServer {
            accept_rx: Mutex::new(accept_rx),
            refuse,
        };
        (connector, server)
    }
}

impl Connector for MemoryConnector {
    type Connection = MemoryConnection;

    async fn connect(
        &self,
        addr: &str,
    ) -> Result<Self::Connection, TransportError> {
        // Consume one refusal if any are queued.
        let refused = self
            .refuse
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                n.checked_sub(1)
            })
            .is_ok();
        if refused {
            return Err(TransportError::ConnectFailed(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                format!("memory server refused {addr}"),
            )));
        }

        let (to_server_tx, to_server_rx) = mpsc::unbounded_channel();
        let (to_client_tx, to_client_rx) = mpsc::unbounded_channel();
        let id = ConnectionId::next();

        let peer = MemoryPeer {
            id,
            to_client: std::sync::Mutex::new(Some(to_client_tx)),
            from_client: Mutex::new(to_server_rx),
        };
        self.accept_tx.send(peer).map_err(|_| {
            TransportError::ConnectFailed(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "memory server dropped",
            ))
        })?;

        tracing::debug!(%id, addr, "opened memory connection");
        Ok(MemoryConnection {
            id,
            to_server: std::sync::Mutex::new(Some(to_server_tx)),
            from_server: Mutex::new(to_client_rx),
        })
    }
}

/// Client side of an in-memory link.
pub struct MemoryConnection {
    id: ConnectionId,
    to_server: std::sync::Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    from_server: Mutex<mpsc::UnboundedReceiver<Inbound>>,
}

impl Connection for MemoryConnection {
    async fn send(&self, data: &[u8]) -> Result<(), TransportError> {
        let guard = self
            .to_server
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let Some(tx) = guard.as_ref() else {
            return Err(TransportError::ConnectionClosed(
                "closed locally".into(),
            ));
        };
        tx.send(data.to_vec()).map_err(|_| {
            TransportError::SendFailed(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "memory peer gone",
            ))
        })
    }

    async fn recv(&self) -> Result<Option<Vec<u8>>, TransportError> {
        match self.from_server.lock().await.recv().await {
            Some(Inbound::Data(data)) => Ok(Some(data)),
            Some(Inbound::Fail(reason)) => {
                Err(TransportError::ReceiveFailed(std::io::Error::new(
                    std::io::ErrorKind::ConnectionReset,
                    reason,
                )))
            }
            None => Ok(None),
        }
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.to_server
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        Ok(())
    }

    fn id(&self) -> ConnectionId {
        self.id
    }
}

/// The remote end of every [`MemoryConnector`] dial.
pub struct MemoryServer {
    accept_rx: Mutex<mpsc::UnboundedReceiver<MemoryPeer>>,
    refuse: Arc<AtomicU32>,
}

impl MemoryServer {
    /// Waits for the next client dial.
    ///
    /// Returns `None` once every connector clone has been dropped.
    pub async fn accept(&self) -> Option<MemoryPeer> {
        self.accept_rx.lock().await.recv().await
    }

    /// Makes the next `count` dials fail with `ConnectFailed`.
    pub fn refuse_next(&self, count: u32) {
        self.refuse.store(count, Ordering::Release);
    }
}

/// Server-side view of one in-memory link.
pub struct MemoryPeer {
    id: ConnectionId,
    to_client: std::sync::Mutex<Option<mpsc::UnboundedSender<Inbound>>>,
    from_client: Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
}

impl MemoryPeer {
    /// Id of the client connection this peer is linked to.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Pushes a frame to the client. Returns `false` if the link is gone.
    pub fn send(&self, data: impl Into<Vec<u8>>) -> bool {
        self.to_client
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .as_ref()
            .is_some_and(|tx| tx.send(Inbound::Data(data.into())).is_ok())
    }

    /// Waits for the next frame written by the client.
    ///
    /// Returns `None` once the client closed or dropped its connection.
    pub async fn recv(&self) -> Option<Vec<u8>> {
        self.from_client.lock().await.recv().await
    }

    /// Ends the link cleanly: the client's `recv` yields `Ok(None)`.
    pub fn close(&self) {
        self.to_client
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
    }

    /// Ends the link with an error: the client's `recv` fails.
    pub fn fail(&self, reason: &str) {
        let mut guard = self
            .to_client
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(tx) = guard.take() {
            let _ = tx.send(Inbound::Fail(reason.to_string()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_round_trip() {
        let (connector, server) = MemoryConnector::pair();
        let conn = connector.connect("mem://lobby").await.unwrap();
        let peer = server.accept().await.unwrap();
        assert_eq!(peer.id(), conn.id());

        conn.send(b"ping").await.unwrap();
        assert_eq!(peer.recv().await.unwrap(), b"ping");

        assert!(peer.send(b"pong".to_vec()));
        assert_eq!(conn.recv().await.unwrap().unwrap(), b"pong");
    }

    #[tokio::test]
    async fn test_peer_close_is_clean_end_of_stream() {
        let (connector, server) = MemoryConnector::pair();
        let conn = connector.connect("mem://lobby").await.unwrap();
        let peer = server.accept().await.unwrap();

        peer.close();
        assert!(conn.recv().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_peer_fail_surfaces_receive_error() {
        let (connector, server) = MemoryConnector::pair();
        let conn = connector.connect("mem://lobby").await.unwrap();
        let peer = server.accept().await.unwrap();

        peer.fail("reset by peer");
        let err = conn.recv().await.unwrap_err();
        assert!(matches!(err, TransportError::ReceiveFailed(_)));
    }

    #[tokio::test]
    async fn test_refused_dials_are_consumed_one_at_a_time() {
        let (connector, server) = MemoryConnector::pair();
        server.refuse_next(2);

        assert!(connector.connect("mem://a").await.is_err());
        assert!(connector.connect("mem://a").await.is_err());
        assert!(connector.connect("mem://a").await.is_ok());
    }

    #[tokio::test]
    async fn test_send_after_local_close_fails() {
        let (connector, server) = MemoryConnector::pair();
        let conn = connector.connect("mem://lobby").await.unwrap();
        let peer = server.accept().await.unwrap();

        conn.close().await.unwrap();
        assert!(conn.send(b"late").await.is_err());
        assert!(peer.recv().await.is_none());
    }
}
