//! Unified error type for mjwire.

use mjwire_dispatch::DispatchError;
use mjwire_protocol::ProtocolError;
use mjwire_rpc::CallError;
use mjwire_transport::TransportError;

/// Problems loading or validating a [`ClientConfig`](crate::ClientConfig).
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("cannot read config: {0}")]
    Io(#[from] std::io::Error),

    /// The file is not valid JSON for a client config.
    #[error("cannot parse config: {0}")]
    Parse(#[from] serde_json::Error),

    /// A value is present but unusable.
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Top-level error that wraps all crate-specific errors.
///
/// When using the `mjwire` façade you deal with this single error type
/// instead of importing errors from each layer. The `#[from]` attribute on
/// each variant generates the `From` impls, so `?` converts layer errors
/// automatically.
#[derive(Debug, thiserror::Error)]
pub enum MjwireError {
    /// A transport-level error (dial, send, receive).
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// A protocol-level error (frame, envelope, schema).
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// A call failed.
    #[error(transparent)]
    Call(#[from] CallError),

    /// Handler or schema registration failed.
    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    /// The configuration is unusable.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// `connect` was called on a client that already has a connection
    /// lifecycle running.
    #[error("client is already connected")]
    AlreadyConnected,
}
