//! Dispatcher task: the single consumer of the push queue.
//!
//! Runs in its own Tokio task, like any other actor: it owns the receiving
//! end of the queue and processes one event at a time, so handlers see
//! events in the order the read loop produced them.
//!
//! For every event it:
//! 1. runs the named handler on the matching router, if any
//! 2. forwards the event to the passive subscriber queue, if one is attached
//!
//! A panicking handler is caught and logged; the task keeps draining.

use std::sync::Arc;

use tokio::task::JoinHandle;

use crate::{PushEvent, PushReceiver, Router, SubscriberSlot};

/// The routers a dispatcher consults.
#[derive(Debug, Clone)]
pub struct Routers {
    /// Handlers keyed by Notify name.
    pub notify: Arc<Router>,
    /// Handlers keyed by action name.
    pub action: Arc<Router>,
}

impl Routers {
    /// Two empty routers.
    pub fn new() -> Self {
        Self {
            notify: Arc::new(Router::new("notify")),
            action: Arc::new(Router::new("action")),
        }
    }

    /// Runs the handler for `event`. Returns `false` if none ran.
    pub fn route(&self, event: &PushEvent) -> bool {
        match event {
            PushEvent::Notify(notify) => self.notify.dispatch(notify),
            PushEvent::Action(action) => self.action.dispatch(&action.action),
        }
    }
}

impl Default for Routers {
    fn default() -> Self {
        Self::new()
    }
}

struct Dispatcher {
    routers: Routers,
    queue: PushReceiver,
    subscriber: SubscriberSlot,
}

impl Dispatcher {
    async fn run(mut self) {
        tracing::debug!("dispatcher started");

        while let Some(event) = self.queue.recv().await {
            self.routers.route(&event);
            self.forward(event).await;
        }

        tracing::debug!("dispatcher stopped");
    }

    async fn forward(&self, event: PushEvent) {
        let Some(subscriber) = self.subscriber.current() else {
            return;
        };
        if subscriber.deliver(event).await.is_err() {
            tracing::info!("push subscriber went away, no longer forwarding");
            self.subscriber.detach();
        }
    }
}

/// Spawns the dispatcher task.
///
/// Events are copied to whatever sender `subscriber` holds at the time;
/// while it is empty they only reach the handlers. The task ends once
/// every [`PushSender`](crate::PushSender) feeding `queue` is dropped and
/// the queue has drained.
pub fn spawn_dispatcher(
    routers: Routers,
    queue: PushReceiver,
    subscriber: SubscriberSlot,
) -> JoinHandle<()> {
    let dispatcher = Dispatcher {
        routers,
        queue,
        subscriber,
    };
    tokio::spawn(dispatcher.run())
}
