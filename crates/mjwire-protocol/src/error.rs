//! Error types for the protocol layer.
//!
//! Every variant describes a problem with ONE frame or ONE payload. None of
//! them is fatal to the connection: the read loop logs and moves on, and a
//! call that hits one reports it to its own caller only.

/// Errors that can occur while encoding or decoding the wire format.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// The raw frame bytes are unparseable: empty buffer, unknown category
    /// tag, truncated header, or an out-of-range correlation id.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// The envelope names a schema that is not in the catalog.
    #[error("unknown schema: {0}")]
    UnknownSchema(String),

    /// The bytes did not parse against the schema they claim to be.
    #[error("failed to decode {name}: {source}")]
    Decode {
        /// The schema name the bytes were decoded against.
        name: String,
        /// The underlying protobuf error.
        #[source]
        source: prost::DecodeError,
    },

    /// A name was registered twice with two different message types.
    #[error(
        "schema {name} is already registered as {existing}, cannot register {requested}"
    )]
    SchemaConflict {
        /// The contested schema name.
        name: String,
        /// Type already bound to the name.
        existing: &'static str,
        /// Type the caller tried to bind.
        requested: &'static str,
    },
}
