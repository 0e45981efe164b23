//! Schema-serialized wrappers carried inside frames.
//!
//! Both types are protobuf messages declared by hand with `prost` derive
//! attributes; there is no `.proto` build step.

use prost::Message;

use crate::ProtocolError;

/// `{name, data}` wrapper that follows the frame header.
///
/// `name` is the fully qualified method (Requests) or event type (Notify)
/// name; `data` is the payload serialized against that schema. Responses
/// leave `name` empty: the pending call already knows what it expects.
#[derive(Clone, PartialEq, Message)]
pub struct Envelope {
    /// Dot-separated schema name, e.g. `.lq.Lobby.heatbeat`.
    #[prost(string, tag = "1")]
    pub name: String,
    /// Payload bytes for the named schema.
    #[prost(bytes = "vec", tag = "2")]
    pub data: Vec<u8>,
}

impl Envelope {
    /// Wraps an already-encoded payload.
    pub fn new(name: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            data,
        }
    }

    /// Encodes `payload` and wraps it under `name`.
    pub fn wrap<M: Message>(name: impl Into<String>, payload: &M) -> Self {
        Self::new(name, payload.encode_to_vec())
    }

    /// Parses envelope bytes taken from a frame.
    ///
    /// # Errors
    /// Returns [`ProtocolError::Decode`] if the bytes are not an envelope.
    pub fn parse(bytes: &[u8]) -> Result<Self, ProtocolError> {
        Self::decode(bytes).map_err(|source| ProtocolError::Decode {
            name: "Envelope".into(),
            source,
        })
    }

    /// Decodes `data` as `M`.
    ///
    /// # Errors
    /// Returns [`ProtocolError::Decode`] if `data` does not parse as `M`.
    pub fn open<M: Message + Default>(&self) -> Result<M, ProtocolError> {
        M::decode(self.data.as_slice()).map_err(|source| {
            ProtocolError::Decode {
                name: self.name.clone(),
                source,
            }
        })
    }
}

/// The Notify payload that carries one obfuscated in-game action.
///
/// `data` is XOR-obfuscated (see [`crate::deobfuscate`]) before it can be
/// decoded against the action named by `name`.
#[derive(Clone, PartialEq, Message)]
pub struct ActionPrototype {
    /// Position of the action within the current round.
    #[prost(uint32, tag = "1")]
    pub step: u32,
    /// Action schema name, from the action catalog.
    #[prost(string, tag = "2")]
    pub name: String,
    /// Obfuscated action payload.
    #[prost(bytes = "vec", tag = "3")]
    pub data: Vec<u8>,
}
