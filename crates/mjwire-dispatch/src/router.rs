//! Name-routed handlers.
//!
//! A [`Router`] pairs a schema [`Catalog`] with at most one handler per
//! name. The client keeps two of them: one for Notify events and one for
//! actions. The two catalogs are disjoint; a name registered on one is
//! unknown to the other.
//!
//! Registration is checked up front: a second handler for the same name,
//! or a name rebound to a different message type, is rejected when it is
//! registered rather than discovered when an event arrives.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use mjwire_protocol::prost::Message;
use mjwire_protocol::{
    ActionEvent, ActionPrototype, Catalog, Decoded, ProtocolError,
    decode_action,
};

use crate::DispatchError;

type Handler = Arc<dyn Fn(&Decoded) + Send + Sync>;

#[derive(Default)]
struct Routes {
    catalog: Catalog,
    handlers: HashMap<String, Handler>,
}

/// A schema catalog plus one handler per name.
///
/// Shared between the read loop (which decodes) and the dispatcher task
/// (which runs handlers), so every method takes `&self`.
pub struct Router {
    label: &'static str,
    routes: RwLock<Routes>,
}

impl Router {
    /// Creates an empty router. `label` only shows up in log lines.
    pub fn new(label: &'static str) -> Self {
        Self {
            label,
            routes: RwLock::new(Routes::default()),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Routes> {
        self.routes.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Routes> {
        self.routes.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Makes `name` decodable as `T` without attaching a handler.
    ///
    /// Events under such a name still reach passive subscribers.
    ///
    /// # Errors
    /// [`DispatchError::Schema`] if `name` is bound to another type.
    pub fn register_schema<T: Message + Default + 'static>(
        &self,
        name: &str,
    ) -> Result<(), DispatchError> {
        self.write().catalog.register::<T>(name)?;
        Ok(())
    }

    /// Registers the handler for `name`, binding the name to `T`.
    ///
    /// # Errors
    /// - [`DispatchError::DuplicateHandler`] if `name` already has one
    /// - [`DispatchError::Schema`] if `name` is bound to another type
    pub fn on<T, F>(&self, name: &str, handler: F) -> Result<(), DispatchError>
    where
        T: Message + Default + 'static,
        F: Fn(&T) + Send + Sync + 'static,
    {
        let mut routes = self.write();
        if routes.handlers.contains_key(name) {
            return Err(DispatchError::DuplicateHandler(name.to_string()));
        }
        routes.catalog.register::<T>(name)?;

        let handler: Handler = Arc::new(move |event: &Decoded| {
            if let Some(message) = event.downcast_ref::<T>() {
                handler(message);
            }
        });
        routes.handlers.insert(name.to_string(), handler);
        tracing::debug!(router = self.label, name, "handler registered");
        Ok(())
    }

    /// Returns `true` if `name` can be decoded.
    pub fn knows(&self, name: &str) -> bool {
        self.read().catalog.contains(name)
    }

    /// Returns `true` if `name` has a handler.
    pub fn has_handler(&self, name: &str) -> bool {
        self.read().handlers.contains_key(name)
    }

    /// Decodes `data` under `name`.
    ///
    /// # Errors
    /// [`ProtocolError::UnknownSchema`] or [`ProtocolError::Decode`].
    pub fn decode(
        &self,
        name: &str,
        data: &[u8],
    ) -> Result<Decoded, ProtocolError> {
        self.read().catalog.decode(name, data)
    }

    /// Deobfuscates and decodes an action carried by `prototype`.
    ///
    /// # Errors
    /// Same as [`decode`](Self::decode).
    pub fn decode_action(
        &self,
        prototype: &ActionPrototype,
    ) -> Result<ActionEvent, ProtocolError> {
        decode_action(prototype, &self.read().catalog)
    }

    /// Runs the handler registered for `event`'s name.
    ///
    /// Returns `false` (after logging) if there is none. The handler runs
    /// outside the lock, so it may register further handlers. A panic in
    /// the handler is caught and logged; it still counts as dispatched.
    pub fn dispatch(&self, event: &Decoded) -> bool {
        let handler = self.read().handlers.get(event.name()).cloned();
        match handler {
            Some(handler) => {
                if let Err(panic) = catch_unwind(AssertUnwindSafe(|| handler(event))) {
                    let message = if let Some(s) = panic.downcast_ref::<&str>() {
                        (*s).to_string()
                    } else if let Some(s) = panic.downcast_ref::<String>() {
                        s.clone()
                    } else {
                        "non-string panic payload".to_string()
                    };
                    tracing::error!(
                        router = self.label,
                        name = event.name(),
                        panic = %message,
                        "handler panicked"
                    );
                }
                true
            }
            None => {
                tracing::debug!(
                    router = self.label,
                    name = event.name(),
                    "no handler registered, ignoring"
                );
                false
            }
        }
    }
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let routes = self.read();
        f.debug_struct("Router")
            .field("label", &self.label)
            .field("schemas", &routes.catalog.len())
            .field("handlers", &routes.handlers.len())
            .finish()
    }
}
