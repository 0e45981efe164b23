//! The bounded push queue.
//!
//! The read loop is the producer and the dispatcher task is the consumer.
//! A push event is never dropped to make room: when the queue is full the
//! producer waits. Each time a wait runs past `warn_after` a warning is
//! logged and the stall counter goes up, then the wait resumes.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use mjwire_protocol::{ActionEvent, Decoded};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::SendTimeoutError;

use crate::DispatchError;

/// One decoded push event, in arrival order.
#[derive(Debug, Clone)]
pub enum PushEvent {
    /// A Notify decoded from the notify catalog.
    Notify(Decoded),
    /// An action unpacked from an action-carrying Notify.
    Action(ActionEvent),
}

impl PushEvent {
    /// Schema name of the event (the action name for actions).
    pub fn name(&self) -> &str {
        match self {
            Self::Notify(event) => event.name(),
            Self::Action(event) => event.name(),
        }
    }

    /// Borrows the message as `T`, if that is its concrete type.
    pub fn downcast_ref<T: 'static>(&self) -> Option<&T> {
        match self {
            Self::Notify(event) => event.downcast_ref::<T>(),
            Self::Action(event) => event.downcast_ref::<T>(),
        }
    }
}

/// Shared count of backpressure warnings.
#[derive(Debug, Clone, Default)]
pub struct StallCounter(Arc<AtomicU64>);

impl StallCounter {
    /// Number of warnings surfaced so far.
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }

    fn bump(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed) + 1
    }
}

/// Producer side of a push queue.
#[derive(Clone)]
pub struct PushSender {
    label: &'static str,
    tx: mpsc::Sender<PushEvent>,
    warn_after: Duration,
    stalls: StallCounter,
}

/// Consumer side of a push queue.
pub type PushReceiver = mpsc::Receiver<PushEvent>;

/// Creates a push queue holding at most `capacity` events.
///
/// `label` names the queue in log lines. A zero `capacity` is treated as 1.
pub fn push_queue(
    label: &'static str,
    capacity: usize,
    warn_after: Duration,
    stalls: StallCounter,
) -> (PushSender, PushReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let sender = PushSender {
        label,
        tx,
        warn_after,
        stalls,
    };
    (sender, rx)
}

impl PushSender {
    /// Enqueues `event`, waiting for room if the queue is full.
    ///
    /// # Errors
    /// [`DispatchError::QueueClosed`] if the receiver was dropped.
    pub async fn deliver(&self, event: PushEvent) -> Result<(), DispatchError> {
        let mut event = event;
        let mut waited = Duration::ZERO;
        loop {
            match self.tx.send_timeout(event, self.warn_after).await {
                Ok(()) => return Ok(()),
                Err(SendTimeoutError::Timeout(back)) => {
                    waited += self.warn_after;
                    let stalls = self.stalls.bump();
                    tracing::warn!(
                        queue = self.label,
                        name = back.name(),
                        waited_ms = waited.as_millis() as u64,
                        stalls,
                        "push queue full, holding the read loop"
                    );
                    event = back;
                }
                Err(SendTimeoutError::Closed(_)) => {
                    return Err(DispatchError::QueueClosed);
                }
            }
        }
    }

    /// Returns `true` once the receiver has been dropped.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// The stall counter this queue reports into.
    pub fn stalls(&self) -> &StallCounter {
        &self.stalls
    }
}

impl fmt::Debug for PushSender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PushSender")
            .field("label", &self.label)
            .field("capacity", &self.tx.max_capacity())
            .field("warn_after", &self.warn_after)
            .finish()
    }
}

/// Where the dispatcher finds the passive subscriber queue.
///
/// Empty until a consumer asks for the queue, so events are only copied
/// once someone is there to drain them. Clones share the same slot.
#[derive(Debug, Clone, Default)]
pub struct SubscriberSlot(Arc<Mutex<Option<PushSender>>>);

impl SubscriberSlot {
    /// An empty slot.
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs `sender`, replacing any previous one.
    pub fn attach(&self, sender: PushSender) {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner) = Some(sender);
    }

    /// Removes the sender. Its queue ends once in-flight deliveries finish.
    pub fn detach(&self) -> Option<PushSender> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).take()
    }

    /// The attached sender, if any.
    pub fn current(&self) -> Option<PushSender> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn is_attached(&self) -> bool {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).is_some()
    }
}

#[cfg(test)]
mod tests {
    use mjwire_protocol::Catalog;
    use prost::Message;

    use super::*;

    #[derive(Clone, PartialEq, Message)]
    struct NotifyTick {
        #[prost(uint32, tag = "1")]
        n: u32,
    }

    fn event(n: u32) -> PushEvent {
        let mut catalog = Catalog::new();
        catalog.register::<NotifyTick>("tick").unwrap();
        let bytes = NotifyTick { n }.encode_to_vec();
        PushEvent::Notify(catalog.decode("tick", &bytes).unwrap())
    }

    fn tick(event: &PushEvent) -> u32 {
        event.downcast_ref::<NotifyTick>().unwrap().n
    }

    #[tokio::test]
    async fn test_events_arrive_in_order() {
        let (tx, mut rx) =
            push_queue("test", 8, Duration::from_secs(1), StallCounter::default());
        for n in 0..5 {
            tx.deliver(event(n)).await.unwrap();
        }
        for n in 0..5 {
            assert_eq!(tick(&rx.recv().await.unwrap()), n);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_queue_waits_and_counts_stalls() {
        let stalls = StallCounter::default();
        let (tx, mut rx) =
            push_queue("test", 1, Duration::from_millis(100), stalls.clone());
        tx.deliver(event(1)).await.unwrap();

        let producer = tokio::spawn({
            let tx = tx.clone();
            async move { tx.deliver(event(2)).await }
        });

        // Hold the consumer off for a bit over two warn periods.
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(stalls.get(), 2);

        assert_eq!(tick(&rx.recv().await.unwrap()), 1);
        producer.await.unwrap().unwrap();
        assert_eq!(tick(&rx.recv().await.unwrap()), 2);
    }

    #[tokio::test]
    async fn test_closed_queue_reports_error() {
        let (tx, rx) =
            push_queue("test", 1, Duration::from_secs(1), StallCounter::default());
        drop(rx);
        assert!(tx.is_closed());
        assert!(matches!(
            tx.deliver(event(0)).await,
            Err(DispatchError::QueueClosed)
        ));
    }

    #[tokio::test]
    async fn test_subscriber_slot_attach_and_detach() {
        let slot = SubscriberSlot::new();
        assert!(slot.current().is_none());

        let (tx, mut rx) =
            push_queue("sub", 2, Duration::from_secs(1), StallCounter::default());
        slot.clone().attach(tx);
        assert!(slot.is_attached());

        slot.current().unwrap().deliver(event(7)).await.unwrap();
        assert_eq!(tick(&rx.recv().await.unwrap()), 7);

        assert!(slot.detach().is_some());
        assert!(!slot.is_attached());
        // The last sender is gone, so the queue ends.
        assert!(rx.recv().await.is_none());
    }
}
