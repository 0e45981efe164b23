//! Deadlines and cancellation for calls.
//!
//! Every call runs under a [`CallContext`]. The context ends the wait with
//! [`CallError::Timeout`] when its deadline passes, or with
//! [`CallError::Cancelled`] when its [`CancellationToken`] fires.
//!
//! ```rust
//! use std::time::Duration;
//! use mjwire_rpc::{CallContext, cancellation};
//!
//! let (handle, token) = cancellation();
//! let ctx = CallContext::with_timeout(Duration::from_secs(5)).cancellable(token);
//! // ... hand `ctx` to a call, keep `handle` to abort it early:
//! handle.cancel();
//! assert!(ctx.is_cancelled());
//! ```

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;

use crate::CallError;

/// Creates a linked cancel handle / token pair.
pub fn cancellation() -> (CancelHandle, CancellationToken) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle { tx: Arc::new(tx) }, CancellationToken { rx })
}

/// The side that fires a cancellation.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelHandle {
    /// Cancels every call holding a clone of the linked token.
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }
}

/// The side a call watches.
#[derive(Debug, Clone)]
pub struct CancellationToken {
    rx: watch::Receiver<bool>,
}

impl CancellationToken {
    /// Returns `true` once the linked handle has fired.
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves when the linked handle fires.
    ///
    /// Pends forever if every handle is dropped without firing.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        let fired = rx.wait_for(|cancelled| *cancelled).await.is_ok();
        if !fired {
            std::future::pending::<()>().await;
        }
    }
}

/// Deadline and cancellation for one call.
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    deadline: Option<Instant>,
    cancel: Option<CancellationToken>,
}

impl CallContext {
    /// A context with no deadline and no cancellation.
    pub fn new() -> Self {
        Self::default()
    }

    /// A context that times out `timeout` from now.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self::with_deadline(Instant::now() + timeout)
    }

    /// A context that times out at `deadline`.
    pub fn with_deadline(deadline: Instant) -> Self {
        Self {
            deadline: Some(deadline),
            cancel: None,
        }
    }

    /// Attaches a cancellation token.
    pub fn cancellable(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// The deadline, if any.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Returns `true` if the token has already fired.
    pub fn is_cancelled(&self) -> bool {
        self.cancel
            .as_ref()
            .is_some_and(CancellationToken::is_cancelled)
    }

    /// Resolves with the reason the context ended.
    ///
    /// Cancellation wins if both fire at once.
    pub async fn done(&self) -> CallError {
        let deadline = async {
            match self.deadline {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending().await,
            }
        };
        let cancelled = async {
            match &self.cancel {
                Some(token) => token.cancelled().await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            biased;
            () = cancelled => CallError::Cancelled,
            () = deadline => CallError::Timeout,
        }
    }
}
