//! The correlator: matches Responses to the calls that are waiting for them.
//!
//! # Lifecycle of a call
//!
//! ```text
//! register() ──→ [pending] ──→ complete()  ──→ caller gets Ok / Decode error
//!                    │
//!                    ├────────→ fail_all() ──→ caller gets ConnectionLost / Closed
//!                    │
//!                    └────────→ (caller's context ends) ──→ entry removed,
//!                                a late Response is logged and dropped
//! ```
//!
//! # Correlation ids
//!
//! Ids come from a counter that wraps at 256. At most one pending call may
//! own an id: if the counter lands on an id that is still pending, the NEW
//! call fails with [`CallError::DuplicateCorrelationId`] and the old one is
//! left alone. The counter advances either way, so the next call tries the
//! next id.
//!
//! # Concurrency note
//!
//! One `std::sync::Mutex` guards the counter and the pending map. It is
//! never held across an `.await`, and decoding a Response happens after the
//! entry has been removed, outside the lock.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};

use mjwire_protocol::{CorrelationId, Envelope};
use prost::Message;
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::{CallContext, CallError};

/// Type-erased completion side of a pending call.
///
/// The correlator does not know the response type of each call; the slot
/// does, and decodes into it.
trait ResponseSlot: Send {
    fn fulfil(self: Box<Self>, envelope: &[u8]);
    fn fail(self: Box<Self>, err: CallError);
}

struct TypedSlot<T> {
    tx: oneshot::Sender<Result<T, CallError>>,
}

impl<T: Message + Default + 'static> ResponseSlot for TypedSlot<T> {
    fn fulfil(self: Box<Self>, envelope: &[u8]) {
        let result = Envelope::parse(envelope)
            .and_then(|env| env.open::<T>())
            .map_err(CallError::Decode);
        // The caller may have given up already; nothing to do then.
        let _ = self.tx.send(result);
    }

    fn fail(self: Box<Self>, err: CallError) {
        let _ = self.tx.send(Err(err));
    }
}

/// One outstanding call.
struct PendingCall {
    /// Distinguishes this call from a later one that reuses the id.
    generation: u64,
    api: String,
    issued_at: Instant,
    slot: Box<dyn ResponseSlot>,
}

struct State {
    next_id: CorrelationId,
    next_generation: u64,
    pending: HashMap<CorrelationId, PendingCall>,
}

/// Tracks every outstanding call on one client.
pub struct Correlator {
    state: Mutex<State>,
}

impl Correlator {
    /// Creates a correlator whose first id is `0`.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                next_id: CorrelationId::new(0),
                next_generation: 0,
                pending: HashMap::new(),
            }),
        }
    }

    // Every critical section leaves the map consistent, so a panic in
    // another thread cannot leave it half-updated.
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Allocates the next id and registers a call expecting a `T` reply.
    ///
    /// The call's deadline is enforced by [`PendingReply::wait`].
    ///
    /// # Errors
    /// Returns [`CallError::DuplicateCorrelationId`] if the allocated id is
    /// still owned by an earlier call.
    pub fn register<T: Message + Default + 'static>(
        &self,
        api: &str,
    ) -> Result<PendingReply<'_, T>, CallError> {
        let (tx, rx) = oneshot::channel();
        let mut state = self.lock();

        let id = state.next_id;
        state.next_id = id.next();

        if let Some(existing) = state.pending.get(&id) {
            tracing::warn!(
                %id,
                api,
                holder = %existing.api,
                "correlation id still pending; refusing new call"
            );
            return Err(CallError::DuplicateCorrelationId(id));
        }

        let generation = state.next_generation;
        state.next_generation += 1;
        state.pending.insert(
            id,
            PendingCall {
                generation,
                api: api.to_string(),
                issued_at: Instant::now(),
                slot: Box::new(TypedSlot::<T> { tx }),
            },
        );
        tracing::debug!(%id, api, pending = state.pending.len(), "registered call");

        Ok(PendingReply {
            correlator: self,
            id,
            generation,
            rx: Some(rx),
            settled: false,
        })
    }

    /// Delivers a Response to the call that owns `id`.
    ///
    /// Returns `false` (after logging) if no call owns `id`: the call
    /// already timed out, was cancelled, or the id is bogus. That is never
    /// an error for the read loop.
    pub fn complete(&self, id: CorrelationId, envelope: &[u8]) -> bool {
        let Some(call) = self.lock().pending.remove(&id) else {
            tracing::debug!(%id, "dropping response with no pending call");
            return false;
        };
        tracing::debug!(
            %id,
            api = %call.api,
            elapsed_ms = call.issued_at.elapsed().as_millis() as u64,
            "completing call"
        );
        call.slot.fulfil(envelope);
        true
    }

    /// Fails every pending call with the error built by `make_err` and
    /// clears the id space. Returns how many calls were failed.
    pub fn fail_all(&self, make_err: impl Fn() -> CallError) -> usize {
        let drained: Vec<_> = self.lock().pending.drain().collect();
        let count = drained.len();
        for (id, call) in drained {
            tracing::debug!(%id, api = %call.api, "failing pending call");
            call.slot.fail(make_err());
        }
        count
    }

    /// Removes the call if it is still the one registered under `id`.
    fn withdraw(&self, id: CorrelationId, generation: u64) {
        let mut state = self.lock();
        if state
            .pending
            .get(&id)
            .is_some_and(|call| call.generation == generation)
        {
            state.pending.remove(&id);
            tracing::debug!(%id, "withdrew pending call");
        }
    }

    /// Number of outstanding calls.
    pub fn len(&self) -> usize {
        self.lock().pending.len()
    }

    /// Returns `true` if no call is outstanding.
    pub fn is_empty(&self) -> bool {
        self.lock().pending.is_empty()
    }

    /// Returns `true` if a call currently owns `id`.
    pub fn is_pending(&self, id: CorrelationId) -> bool {
        self.lock().pending.contains_key(&id)
    }
}

impl Default for Correlator {
    fn default() -> Self {
        Self::new()
    }
}

/// The waiting side of a registered call.
///
/// Dropping it before the reply arrives withdraws the call, so a late
/// Response finds nothing to complete.
pub struct PendingReply<'a, T> {
    correlator: &'a Correlator,
    id: CorrelationId,
    generation: u64,
    rx: Option<oneshot::Receiver<Result<T, CallError>>>,
    settled: bool,
}

impl<T> PendingReply<'_, T> {
    /// The id this call owns.
    pub fn id(&self) -> CorrelationId {
        self.id
    }

    /// Waits for the reply, or for `ctx` to end.
    ///
    /// # Errors
    /// - whatever the correlator delivered (decode error, connection lost)
    /// - [`CallError::Timeout`] / [`CallError::Cancelled`] from `ctx`
    pub async fn wait(mut self, ctx: &CallContext) -> Result<T, CallError> {
        let Some(rx) = self.rx.take() else {
            return Err(CallError::ConnectionLost);
        };

        tokio::select! {
            biased;
            reply = rx => {
                self.settled = true;
                // A dropped sender means the correlator itself went away.
                reply.unwrap_or(Err(CallError::ConnectionLost))
            }
            err = ctx.done() => {
                tracing::debug!(id = %self.id, error = %err, "call abandoned");
                Err(err)
            }
        }
    }
}

impl<T> fmt::Debug for PendingReply<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingReply")
            .field("id", &self.id)
            .field("generation", &self.generation)
            .field("settled", &self.settled)
            .finish()
    }
}

impl<T> Drop for PendingReply<'_, T> {
    fn drop(&mut self) {
        if !self.settled {
            self.correlator.withdraw(self.id, self.generation);
        }
    }
}
