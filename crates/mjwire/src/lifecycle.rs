//! Connection lifecycle: the read loop, redials, and resumption.
//!
//! ```text
//!                 connect()
//! Disconnected ────────────→ Connecting ──ok──→ Connected
//!      ↑                         │                 │
//!      └──────────dial failed────┘                 │ read error / remote close
//!      ↑                                           ↓
//!      └─────────────────────────────────── (fail pending calls,
//!                                             redial after delay)
//!
//! Connected ──close()──→ Closing ──→ Disconnected (terminal)
//! ```
//!
//! When a lost link is not retried, the lifecycle ends and an explicit
//! `connect` may start a new one.
//!
//! After a redial the state stays `Connecting` while the resumption
//! callback runs; ordinary calls wait at the gate until it returns.

use std::fmt;
use std::sync::Arc;

use mjwire_dispatch::{PushEvent, PushSender};
use mjwire_protocol::{
    ActionPrototype, Envelope, FrameHeader, ProtocolError, decode_frame,
};
use mjwire_rpc::CallError;
use mjwire_transport::{Connection, ConnectionId, Connector, TransportError};
use tokio::sync::watch;

use crate::client::{Inner, Resumer};

/// Where the client is in its connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// No link. Calls fail fast unless a redial is under way.
    Disconnected,
    /// Dialing, or running the resumption callback after a redial.
    Connecting,
    /// Calls are written straight through.
    Connected,
    /// `close` is tearing the client down.
    Closing,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Closing => "closing",
        };
        f.write_str(s)
    }
}

/// Why a link stopped being read.
enum LinkEnd {
    Shutdown,
    RemoteClosed,
    Failed(TransportError),
    Dropped,
}

/// Resolves once the shutdown flag is raised (or its sender is gone).
pub(crate) async fn stopped(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|stop| *stop).await;
}

/// Resolves once link `id` is marked for dropping.
async fn kicked(rx: &mut watch::Receiver<Option<ConnectionId>>, id: ConnectionId) {
    let fired = rx.wait_for(|kick| *kick == Some(id)).await.is_ok();
    if !fired {
        std::future::pending::<()>().await;
    }
}

// ---------------------------------------------------------------------------
// Supervisor
// ---------------------------------------------------------------------------

/// Owns the link for the client's lifetime: reads it, and replaces it
/// when it is lost.
pub(crate) async fn supervise<C: Connector>(
    inner: Arc<Inner<C>>,
    addr: String,
    first: Arc<C::Connection>,
    push: PushSender,
) {
    let mut shutdown = inner.shutdown.subscribe();
    let mut kick = inner.kick.subscribe();
    let reconnect = inner.config.reconnect.clone();
    let mut conn = first;
    let mut redialed = false;

    loop {
        let id = conn.id();
        if redialed {
            tokio::spawn(resume(Arc::clone(&inner), id));
        }

        let end = read_loop(&inner, conn.as_ref(), &push, &mut shutdown, &mut kick).await;

        let retry = match &end {
            LinkEnd::Shutdown => false,
            LinkEnd::RemoteClosed => reconnect.enabled && reconnect.on_remote_close,
            LinkEnd::Failed(_) | LinkEnd::Dropped => reconnect.enabled,
        };
        // Raised before the state flips so gated calls keep waiting.
        inner.set_retrying(retry);
        inner.detach(id);
        if let Err(e) = conn.close().await {
            tracing::debug!(conn = %id, error = %e, "close after link end failed");
        }

        match end {
            LinkEnd::Shutdown => break,
            LinkEnd::RemoteClosed => {
                tracing::info!(conn = %id, "remote closed the connection");
            }
            LinkEnd::Failed(e) => {
                tracing::warn!(conn = %id, error = %e, "connection lost");
            }
            LinkEnd::Dropped => {
                tracing::warn!(conn = %id, "connection dropped by keepalive");
            }
        }

        let lost = inner.correlator.fail_all(|| CallError::ConnectionLost);
        if lost > 0 {
            tracing::info!(conn = %id, lost, "failed pending calls");
        }

        if !retry {
            // Released before the state flips, so a caller woken by
            // `Disconnected` can connect again straight away.
            inner.release();
            // Wake gated callers so they see the final state.
            inner.set_state(ConnectionState::Disconnected);
            break;
        }

        match redial(&inner, &addr, &mut shutdown).await {
            Some(next) => {
                conn = next;
                redialed = true;
            }
            None => break,
        }
    }

    inner.set_retrying(false);
    tracing::debug!("supervisor stopped");
}

/// Dials `addr` with the configured delay until it works or the client
/// shuts down.
async fn redial<C: Connector>(
    inner: &Inner<C>,
    addr: &str,
    shutdown: &mut watch::Receiver<bool>,
) -> Option<Arc<C::Connection>> {
    let mut attempt: u32 = 0;
    loop {
        let delay = inner.config.reconnect.next_delay();
        tokio::select! {
            biased;
            () = stopped(shutdown) => return None,
            () = tokio::time::sleep(delay) => {}
        }

        attempt += 1;
        inner.set_state(ConnectionState::Connecting);
        tracing::info!(attempt, addr, "reconnecting");

        let dialed = tokio::select! {
            biased;
            () = stopped(shutdown) => return None,
            dialed = inner.connector.connect(addr) => dialed,
        };

        match dialed {
            Ok(conn) => {
                let conn = Arc::new(conn);
                if !inner.attach(Arc::clone(&conn), ConnectionState::Connecting) {
                    let _ = conn.close().await;
                    return None;
                }
                inner.set_retrying(false);
                tracing::info!(conn = %conn.id(), attempt, "reconnected");
                return Some(conn);
            }
            Err(e) => {
                tracing::warn!(attempt, error = %e, "reconnect attempt failed");
                inner.set_state(ConnectionState::Disconnected);
            }
        }
    }
}

/// Runs the resumption callback for link `id`, then opens the gate.
async fn resume<C: Connector>(inner: Arc<Inner<C>>, id: ConnectionId) {
    if let Some(hook) = inner.resume_hook() {
        tracing::info!(conn = %id, "running resumption callback");
        if let Err(e) = hook(Resumer::new(Arc::clone(&inner))).await {
            tracing::error!(conn = %id, error = %e, "resumption callback failed");
        }
    }
    if inner.promote(id) {
        tracing::info!(conn = %id, "connection resumed");
    }
}

// ---------------------------------------------------------------------------
// Read loop
// ---------------------------------------------------------------------------

/// Reads frames from `conn` until it ends.
///
/// The only reader of the link. Nothing that goes wrong with a single frame
/// ends the loop.
async fn read_loop<C: Connector>(
    inner: &Inner<C>,
    conn: &C::Connection,
    push: &PushSender,
    shutdown: &mut watch::Receiver<bool>,
    kick: &mut watch::Receiver<Option<ConnectionId>>,
) -> LinkEnd {
    let id = conn.id();
    tracing::debug!(conn = %id, "read loop started");

    loop {
        let received = tokio::select! {
            biased;
            () = stopped(shutdown) => return LinkEnd::Shutdown,
            () = kicked(kick, id) => return LinkEnd::Dropped,
            received = conn.recv() => received,
        };

        let bytes = match received {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return LinkEnd::RemoteClosed,
            Err(e) => return LinkEnd::Failed(e),
        };

        for event in route_frame(inner, id, &bytes) {
            tokio::select! {
                biased;
                () = stopped(shutdown) => return LinkEnd::Shutdown,
                delivered = push.deliver(event) => {
                    if delivered.is_err() {
                        tracing::error!(conn = %id, "dispatcher is gone, push event lost");
                    }
                }
            }
        }
    }
}

/// Classifies one frame. Responses are completed here; push events are
/// returned for the queue in the order they must be delivered.
fn route_frame<C: Connector>(
    inner: &Inner<C>,
    conn: ConnectionId,
    bytes: &[u8],
) -> Vec<PushEvent> {
    let frame = match decode_frame(bytes) {
        Ok(frame) => frame,
        Err(e) => {
            tracing::warn!(%conn, error = %e, "dropping malformed frame");
            return Vec::new();
        }
    };

    match frame.header {
        FrameHeader::Response(id) => {
            inner.correlator.complete(id, frame.envelope);
            Vec::new()
        }
        FrameHeader::Notify => decode_notify(inner, conn, frame.envelope),
        FrameHeader::Request(id) => {
            tracing::debug!(%conn, %id, "ignoring request from server");
            Vec::new()
        }
    }
}

fn decode_notify<C: Connector>(
    inner: &Inner<C>,
    conn: ConnectionId,
    envelope: &[u8],
) -> Vec<PushEvent> {
    let envelope = match Envelope::parse(envelope) {
        Ok(envelope) => envelope,
        Err(e) => {
            tracing::warn!(%conn, error = %e, "dropping notify with bad envelope");
            return Vec::new();
        }
    };

    let notify = match inner.routers.notify.decode(&envelope.name, &envelope.data) {
        Ok(notify) => notify,
        Err(ProtocolError::UnknownSchema(name)) => {
            tracing::warn!(%conn, %name, "dropping notify with unknown schema");
            return Vec::new();
        }
        Err(e) => {
            tracing::warn!(%conn, name = %envelope.name, error = %e, "dropping undecodable notify");
            return Vec::new();
        }
    };
    tracing::debug!(%conn, name = %envelope.name, "notify received");

    let action = if envelope.name == inner.config.action_notify_name {
        notify
            .downcast_ref::<ActionPrototype>()
            .and_then(|prototype| {
                match inner.routers.action.decode_action(prototype) {
                    Ok(action) => Some(action),
                    Err(e) => {
                        tracing::warn!(
                            %conn,
                            name = %prototype.name,
                            step = prototype.step,
                            error = %e,
                            "dropping undecodable action"
                        );
                        None
                    }
                }
            })
    } else {
        None
    };

    let mut events = vec![PushEvent::Notify(notify)];
    events.extend(action.map(PushEvent::Action));
    events
}
