//! Error types for the dispatch layer.

use mjwire_protocol::ProtocolError;

/// Errors raised while registering handlers or delivering push events.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// A handler is already registered for this name. At most one handler
    /// per name; the second registration is rejected, not swapped in.
    #[error("a handler for {0} is already registered")]
    DuplicateHandler(String),

    /// The name could not be bound to the requested message type, usually
    /// because it is already bound to a different one.
    #[error(transparent)]
    Schema(#[from] ProtocolError),

    /// The consumer side of the push queue is gone.
    #[error("push queue closed")]
    QueueClosed,
}
