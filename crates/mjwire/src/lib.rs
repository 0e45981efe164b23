//! # mjwire
//!
//! Client-side engine for a request/response-plus-push RPC protocol carried
//! over one persistent socket.
//!
//! A [`Client`] frames outgoing calls, matches Responses back to them,
//! fans out unsolicited Notify events (and the obfuscated actions nested
//! in them) to handlers, and keeps the link alive across disconnects. The
//! message types are the caller's: any `prost::Message` can be a request,
//! a response, a Notify or an action.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use mjwire::prelude::*;
//!
//! #[derive(Clone, PartialEq, prost::Message)]
//! struct ReqHeartbeat {}
//!
//! #[derive(Clone, PartialEq, prost::Message)]
//! struct NotifyRoomGameStart {
//!     #[prost(string, tag = "1")]
//!     game_url: String,
//! }
//!
//! # async fn run() -> Result<(), MjwireError> {
//! let client = ClientBuilder::new().build(WebSocketConnector)?;
//! client.on_notify::<NotifyRoomGameStart, _>(".lq.NotifyRoomGameStart", |n| {
//!     println!("game starting at {}", n.game_url);
//! })?;
//! client.connect("wss://lobby.example:443/").await?;
//!
//! let _: ReqHeartbeat = client.call(".lq.Lobby.heatbeat", &ReqHeartbeat {}).await?;
//! client.close().await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Layers
//!
//! ```text
//! mjwire (this crate)  ← client, lifecycle, keepalive, config
//!     ↕
//! mjwire-rpc / mjwire-dispatch  ← call correlation / push fan-out
//!     ↕
//! mjwire-protocol  ← frames, envelopes, catalogs, action keystream
//!     ↕
//! mjwire-transport  ← WebSocket and in-memory links
//! ```

mod client;
mod config;
mod error;
mod keepalive;
mod lifecycle;
pub mod logging;

pub use client::{BoxError, Client, ClientBuilder, Resumer};
pub use config::{ClientConfig, KeepaliveConfig, ReconnectConfig};
pub use error::{ConfigError, MjwireError};
pub use lifecycle::ConnectionState;

pub use mjwire_dispatch as dispatch;
pub use mjwire_protocol as protocol;
pub use mjwire_rpc as rpc;
pub use mjwire_transport as transport;

/// Everything needed to build a client and make calls.
pub mod prelude {
    pub use crate::{
        BoxError, Client, ClientBuilder, ClientConfig, ConnectionState,
        KeepaliveConfig, MjwireError, ReconnectConfig, Resumer,
    };
    pub use mjwire_dispatch::{DispatchError, PushEvent};
    pub use mjwire_protocol::ActionEvent;
    pub use mjwire_rpc::{CallContext, CallError, CancelHandle, cancellation};
    pub use mjwire_transport::{Connector, MemoryConnector};
    #[cfg(feature = "websocket")]
    pub use mjwire_transport::WebSocketConnector;
}
