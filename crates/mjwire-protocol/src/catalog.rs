//! Name → schema catalog.
//!
//! Push events arrive as `{name, data}`; the catalog is what turns the name
//! into a concrete message type to decode `data` against. The message
//! types themselves are defined by the caller (they are external schemas),
//! and registered once by name:
//!
//! ```rust
//! use mjwire_protocol::{Catalog, Envelope};
//!
//! #[derive(Clone, PartialEq, prost::Message)]
//! struct NotifyRoomGameStart {
//!     #[prost(string, tag = "1")]
//!     game_url: String,
//! }
//!
//! let mut catalog = Catalog::new();
//! catalog
//!     .register::<NotifyRoomGameStart>(".lq.NotifyRoomGameStart")
//!     .unwrap();
//!
//! let bytes = prost::Message::encode_to_vec(&NotifyRoomGameStart {
//!     game_url: "wss://game".into(),
//! });
//! let decoded = catalog.decode(".lq.NotifyRoomGameStart", &bytes).unwrap();
//! let event = decoded.downcast_ref::<NotifyRoomGameStart>().unwrap();
//! assert_eq!(event.game_url, "wss://game");
//! ```
//!
//! Decoded messages are type-erased behind [`AnyMessage`] so one queue can
//! carry every event kind; consumers get their concrete type back with
//! [`Decoded::downcast_ref`].

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use prost::Message;

use crate::ProtocolError;

/// A decoded protobuf message with its concrete type erased.
///
/// Implemented for every `prost::Message`, so callers never implement it
/// by hand.
pub trait AnyMessage: Any + fmt::Debug + Send + Sync {
    /// Borrows the message as `Any` for downcasting.
    fn as_any(&self) -> &dyn Any;

    /// Rust type name of the concrete message.
    fn type_name(&self) -> &'static str;
}

impl<T: Message + 'static> AnyMessage for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn type_name(&self) -> &'static str {
        std::any::type_name::<T>()
    }
}

/// A decode target for one schema name.
#[derive(Clone, Copy)]
pub struct Schema {
    type_id: TypeId,
    type_name: &'static str,
    decode: fn(&[u8]) -> Result<Arc<dyn AnyMessage>, prost::DecodeError>,
}

impl Schema {
    /// The schema for message type `T`.
    pub fn of<T: Message + Default + 'static>() -> Self {
        Self {
            type_id: TypeId::of::<T>(),
            type_name: std::any::type_name::<T>(),
            decode: decode_as::<T>,
        }
    }

    /// Returns `true` if this schema decodes into `T`.
    pub fn is<T: 'static>(&self) -> bool {
        self.type_id == TypeId::of::<T>()
    }

    /// Rust type name of the decode target.
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    /// Decodes `data` into a fresh message of this schema's type.
    ///
    /// # Errors
    /// Returns the protobuf error if `data` does not parse.
    pub fn decode(
        &self,
        data: &[u8],
    ) -> Result<Arc<dyn AnyMessage>, prost::DecodeError> {
        (self.decode)(data)
    }
}

impl fmt::Debug for Schema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Schema").field(&self.type_name).finish()
    }
}

fn decode_as<T: Message + Default + 'static>(
    data: &[u8],
) -> Result<Arc<dyn AnyMessage>, prost::DecodeError> {
    Ok(Arc::new(T::decode(data)?))
}

/// A named, decoded message.
///
/// Cheap to clone: the message itself is shared.
#[derive(Clone)]
pub struct Decoded {
    name: Arc<str>,
    message: Arc<dyn AnyMessage>,
}

impl Decoded {
    /// Pairs a schema name with its decoded message.
    pub fn new(name: &str, message: Arc<dyn AnyMessage>) -> Self {
        Self {
            name: Arc::from(name),
            message,
        }
    }

    /// The schema name the message was decoded under.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The type-erased message.
    pub fn message(&self) -> &dyn AnyMessage {
        self.message.as_ref()
    }

    /// Borrows the message as `T`, if that is its concrete type.
    pub fn downcast_ref<T: 'static>(&self) -> Option<&T> {
        self.message.as_any().downcast_ref::<T>()
    }

    /// Returns `true` if the message is a `T`.
    pub fn is<T: 'static>(&self) -> bool {
        self.message.as_any().is::<T>()
    }
}

impl fmt::Debug for Decoded {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Decoded")
            .field("name", &self.name)
            .field("message", &self.message)
            .finish()
    }
}

/// Maps schema names to decode targets.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    schemas: HashMap<String, Schema>,
}

impl Catalog {
    /// Creates an empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds `name` to message type `T`.
    ///
    /// Registering the same type under the same name twice is a no-op.
    ///
    /// # Errors
    /// Returns [`ProtocolError::SchemaConflict`] if `name` is already bound
    /// to a different type.
    pub fn register<T: Message + Default + 'static>(
        &mut self,
        name: &str,
    ) -> Result<(), ProtocolError> {
        self.insert(name, Schema::of::<T>())
    }

    /// Binds `name` to an already-built [`Schema`].
    ///
    /// # Errors
    /// Same as [`register`](Self::register).
    pub fn insert(
        &mut self,
        name: &str,
        schema: Schema,
    ) -> Result<(), ProtocolError> {
        if let Some(existing) = self.schemas.get(name) {
            if existing.type_id != schema.type_id {
                return Err(ProtocolError::SchemaConflict {
                    name: name.to_string(),
                    existing: existing.type_name,
                    requested: schema.type_name,
                });
            }
            return Ok(());
        }
        self.schemas.insert(name.to_string(), schema);
        Ok(())
    }

    /// Looks up the decode target for `name`.
    pub fn resolve(&self, name: &str) -> Option<Schema> {
        self.schemas.get(name).copied()
    }

    /// Returns `true` if `name` is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.schemas.contains_key(name)
    }

    /// Decodes `data` against the schema registered for `name`.
    ///
    /// # Errors
    /// - [`ProtocolError::UnknownSchema`] if `name` is not registered
    /// - [`ProtocolError::Decode`] if `data` does not parse
    pub fn decode(
        &self,
        name: &str,
        data: &[u8],
    ) -> Result<Decoded, ProtocolError> {
        let schema = self
            .resolve(name)
            .ok_or_else(|| ProtocolError::UnknownSchema(name.to_string()))?;
        let message =
            schema.decode(data).map_err(|source| ProtocolError::Decode {
                name: name.to_string(),
                source,
            })?;
        Ok(Decoded::new(name, message))
    }

    /// Number of registered names.
    pub fn len(&self) -> usize {
        self.schemas.len()
    }

    /// Returns `true` if nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.schemas.is_empty()
    }

    /// Iterates over registered names in no particular order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.schemas.keys().map(String::as_str)
    }
}
