//! Call correlation for mjwire.
//!
//! This crate is the bookkeeping behind request/response calls:
//!
//! 1. **Correlation** — handing out 1-byte ids and matching Responses back
//!    to the call that owns them ([`Correlator`])
//! 2. **Deadlines and cancellation** — ending a wait early without leaking
//!    the pending entry ([`CallContext`], [`cancellation`])
//! 3. **Bulk failure** — failing every in-flight call when the link drops
//!    ([`Correlator::fail_all`])
//!
//! # How it fits in the stack
//!
//! ```text
//! Client (above)  ← registers a call, writes the Request, awaits the reply
//!     ↕
//! RPC Layer (this crate)  ← owns the id space and the pending table
//!     ↕
//! Protocol Layer (below)  ← provides CorrelationId, Envelope
//! ```
//!
//! Nothing here touches the socket. The read loop hands Response bytes to
//! [`Correlator::complete`]; the supervisor calls
//! [`Correlator::fail_all`] when the connection goes away.

mod context;
mod correlator;
mod error;

pub use context::{CallContext, CancelHandle, CancellationToken, cancellation};
pub use correlator::{Correlator, PendingReply};
pub use error::CallError;
