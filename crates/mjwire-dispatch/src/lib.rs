//! Push event fan-out for mjwire.
//!
//! Decoded Notify and action events flow from the read loop, through a
//! bounded queue, to a dispatcher task that runs named handlers and feeds
//! an optional passive subscriber.
//!
//! # Key types
//!
//! - [`Router`] — schema catalog plus at most one handler per name
//! - [`Routers`] — the notify and action routers side by side
//! - [`PushEvent`] — a decoded Notify or action
//! - [`push_queue`] / [`PushSender`] — the bounded queue and its
//!   backpressure policy
//! - [`SubscriberSlot`] — where the optional subscriber queue is attached
//! - [`spawn_dispatcher`] — the consumer task
//!
//! ```text
//! read loop ──deliver()──→ [push queue] ──→ dispatcher ──→ handlers
//!                                              └──deliver()──→ [subscriber queue]
//! ```

mod dispatcher;
mod error;
mod fanout;
mod router;

pub use dispatcher::{Routers, spawn_dispatcher};
pub use error::DispatchError;
pub use fanout::{
    PushEvent, PushReceiver, PushSender, StallCounter, SubscriberSlot, push_queue,
};
pub use router::Router;
