//! Error types for the RPC layer.

use mjwire_protocol::{CorrelationId, ProtocolError};
use mjwire_transport::TransportError;

/// Errors a single call can end with.
///
/// Every variant is local to one call except [`ConnectionLost`] and
/// [`Closed`], which are delivered to every pending call at once.
///
/// [`ConnectionLost`]: CallError::ConnectionLost
/// [`Closed`]: CallError::Closed
#[derive(Debug, thiserror::Error)]
pub enum CallError {
    /// The deadline elapsed before a Response arrived.
    #[error("call timed out")]
    Timeout,

    /// The caller cancelled the call before a Response arrived.
    #[error("call cancelled")]
    Cancelled,

    /// The next correlation id is still owned by an earlier call.
    /// The earlier call is unaffected; only the new call fails.
    #[error("correlation id {0} is still pending")]
    DuplicateCorrelationId(CorrelationId),

    /// The Response did not parse as the expected schema.
    #[error("bad response: {0}")]
    Decode(#[source] ProtocolError),

    /// The connection dropped while the call was in flight.
    #[error("connection lost")]
    ConnectionLost,

    /// There is no connection and none is being re-established.
    #[error("not connected")]
    NotConnected,

    /// The client was closed.
    #[error("client closed")]
    Closed,

    /// Writing the Request frame failed.
    #[error(transparent)]
    Transport(#[from] TransportError),
}
