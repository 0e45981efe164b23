//! Wire protocol for mjwire.
//!
//! This crate defines the bytes that travel over the socket:
//!
//! - **Frames** ([`encode_frame`], [`decode_frame`], [`FrameHeader`]) —
//!   the category tag and the 2-byte correlation id split.
//! - **Envelopes** ([`Envelope`], [`ActionPrototype`]) — the protobuf
//!   `{name, data}` wrappers inside every frame.
//! - **Catalog** ([`Catalog`], [`Decoded`]) — name → schema lookup used to
//!   decode push events into typed messages.
//! - **Action sub-protocol** ([`deobfuscate`], [`decode_action`]) — the
//!   XOR keystream applied to action payloads.
//! - **Errors** ([`ProtocolError`]) — what can go wrong with one frame.
//!
//! # Architecture
//!
//! The protocol layer sits between transport (raw bytes) and the
//! correlator / dispatcher. It holds no state and knows nothing about
//! connections; every function here is pure.
//!
//! ```text
//! Transport (bytes) → Protocol (Frame → Envelope → Decoded) → RPC / Dispatch
//! ```

mod action;
mod catalog;
mod envelope;
mod error;
mod frame;

pub use action::{
    ACTION_KEY, ActionEvent, apply_keystream, decode_action, deobfuscate,
    obfuscate,
};
pub use catalog::{AnyMessage, Catalog, Decoded, Schema};
pub use envelope::{ActionPrototype, Envelope};
pub use error::ProtocolError;
pub use frame::{
    Category, CorrelationId, Frame, FrameHeader, decode_frame, encode_frame,
};

/// Notify schema name that carries the action sub-protocol.
pub const ACTION_PROTOTYPE: &str = ".lq.ActionPrototype";

// `prost` is part of the public API: message types handed to the catalog
// and to calls are `prost::Message`s.
pub use prost;
