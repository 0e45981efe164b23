//! Heartbeat task.
//!
//! Calls the configured heartbeat method on a fixed interval while the
//! client is `Connected`. After `max_missed` consecutive failures the link
//! is dropped, which sends the supervisor down its normal reconnect path.

use std::sync::Arc;

use mjwire_rpc::CallContext;
use mjwire_transport::{Connection, ConnectionId, Connector};
use tokio::time::{Instant, MissedTickBehavior};

use crate::client::Inner;
use crate::lifecycle::stopped;
use crate::{ConnectionState, KeepaliveConfig};

/// Request and response body of the heartbeat call. Fields the server
/// sends back are skipped.
#[derive(Clone, PartialEq, prost::Message)]
struct Heartbeat {}

pub(crate) async fn run<C: Connector>(inner: Arc<Inner<C>>, config: KeepaliveConfig) {
    let period = config.interval();
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    // A heartbeat that overran its slot is not followed by a burst.
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut shutdown = inner.shutdown.subscribe();

    let mut watching: Option<ConnectionId> = None;
    let mut missed: u32 = 0;

    loop {
        tokio::select! {
            biased;
            () = stopped(&mut shutdown) => break,
            _ = ticker.tick() => {}
        }

        if inner.state() != ConnectionState::Connected {
            continue;
        }
        let Some(conn) = inner.current_link() else {
            continue;
        };
        let id = conn.id();
        if watching != Some(id) {
            watching = Some(id);
            missed = 0;
        }

        let ctx = CallContext::with_timeout(period);
        let result = inner
            .issue::<Heartbeat, Heartbeat>(conn.as_ref(), &config.api, &Heartbeat {}, &ctx)
            .await;
        match result {
            Ok(_) => {
                tracing::trace!(conn = %id, "heartbeat ok");
                missed = 0;
            }
            Err(e) => {
                missed += 1;
                tracing::warn!(
                    conn = %id,
                    missed,
                    max_missed = config.max_missed,
                    error = %e,
                    "heartbeat missed"
                );
                if missed >= config.max_missed {
                    tracing::warn!(conn = %id, "too many missed heartbeats, dropping link");
                    inner.kick.send_replace(Some(id));
                    missed = 0;
                }
            }
        }
    }

    tracing::debug!("keepalive stopped");
}
