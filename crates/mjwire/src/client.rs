//! The [`Client`] handle and its builder.
//!
//! A client owns one logical connection to the remote service. Behind the
//! handle sit three long-lived tasks, spawned by [`Client::connect`]:
//!
//! - the **supervisor** (see `lifecycle`): runs the read loop, and when
//!   the link drops, fails pending calls, redials, and runs the resumption
//!   callback
//! - the **dispatcher**: drains the push queue into handlers and the
//!   passive subscriber queue
//! - the **keepalive** (optional): periodic heartbeat call
//!
//! Calls are made from any task through the cheap-to-clone handle.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use mjwire_dispatch::{
    DispatchError, PushReceiver, Routers, StallCounter, SubscriberSlot,
    push_queue, spawn_dispatcher,
};
use mjwire_protocol::prost::Message;
use mjwire_protocol::{ActionPrototype, Envelope, FrameHeader, encode_frame};
use mjwire_rpc::{CallContext, CallError, Correlator};
use mjwire_transport::{Connection, ConnectionId, Connector};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::{ClientConfig, ConnectionState, MjwireError, keepalive, lifecycle};

/// Error type a resumption callback may return.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

type ResumeFuture = Pin<Box<dyn Future<Output = Result<(), BoxError>> + Send>>;
type ResumeHook<C> = Arc<dyn Fn(Resumer<C>) -> ResumeFuture + Send + Sync>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

/// State shared by the handle, the supervisor, and the keepalive task.
pub(crate) struct Inner<C: Connector> {
    pub(crate) connector: C,
    pub(crate) config: ClientConfig,
    pub(crate) correlator: Correlator,
    pub(crate) routers: Routers,
    /// The link calls are written to. `None` while disconnected.
    link: RwLock<Option<Arc<C::Connection>>>,
    state: watch::Sender<ConnectionState>,
    pub(crate) shutdown: watch::Sender<bool>,
    /// Set to a connection id to make the read loop drop that link.
    pub(crate) kick: watch::Sender<Option<ConnectionId>>,
    started: AtomicBool,
    closed: AtomicBool,
    /// `true` while the supervisor is working on getting a link back.
    retrying: AtomicBool,
    resume_hook: Mutex<Option<ResumeHook<C>>>,
    /// Empty until `notifications()` hands out the receiver.
    subscriber: SubscriberSlot,
    subscriber_taken: AtomicBool,
    pub(crate) stalls: StallCounter,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<C: Connector> Inner<C> {
    pub(crate) fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Publishes a state change. A closed client only changes state from
    /// `close` itself.
    pub(crate) fn set_state(&self, next: ConnectionState) {
        if self.is_closed() {
            return;
        }
        let prev = self.state.send_replace(next);
        if prev != next {
            tracing::info!(from = %prev, to = %next, "connection state changed");
        }
    }

    pub(crate) fn set_retrying(&self, retrying: bool) {
        self.retrying.store(retrying, Ordering::Release);
    }

    pub(crate) fn current_link(&self) -> Option<Arc<C::Connection>> {
        self.link
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Installs a new link and publishes `state`. Returns `false` if the
    /// client was closed meanwhile; the link is not installed then.
    pub(crate) fn attach(
        &self,
        conn: Arc<C::Connection>,
        state: ConnectionState,
    ) -> bool {
        let mut link = self.link.write().unwrap_or_else(PoisonError::into_inner);
        if self.is_closed() {
            return false;
        }
        *link = Some(conn);
        self.set_state(state);
        true
    }

    /// Removes link `id` if it is still installed and marks the client
    /// disconnected.
    pub(crate) fn detach(&self, id: ConnectionId) {
        let mut link = self.link.write().unwrap_or_else(PoisonError::into_inner);
        if link.as_ref().is_some_and(|conn| conn.id() == id) {
            *link = None;
        }
        self.set_state(ConnectionState::Disconnected);
    }

    /// Opens the gate for link `id` once resumption is done. Returns
    /// `false` if that link is already gone.
    pub(crate) fn promote(&self, id: ConnectionId) -> bool {
        let link = self.link.write().unwrap_or_else(PoisonError::into_inner);
        if !link.as_ref().is_some_and(|conn| conn.id() == id) {
            return false;
        }
        self.set_state(ConnectionState::Connected);
        !self.is_closed()
    }

    /// Called by the supervisor when it gives up on the link without being
    /// shut down, so an explicit `connect` may start a new lifecycle.
    pub(crate) fn release(&self) {
        self.kick.send_replace(None);
        self.started.store(false, Ordering::Release);
    }

    pub(crate) fn resume_hook(&self) -> Option<ResumeHook<C>> {
        lock(&self.resume_hook).clone()
    }

    /// Waits until calls may be written, or fails if they never will be.
    async fn wait_connected(
        &self,
        ctx: &CallContext,
    ) -> Result<Arc<C::Connection>, CallError> {
        let mut rx = self.state.subscribe();
        loop {
            if self.is_closed() {
                return Err(CallError::Closed);
            }
            let state = *rx.borrow_and_update();
            match state {
                ConnectionState::Connected => {
                    if let Some(conn) = self.current_link() {
                        return Ok(conn);
                    }
                }
                ConnectionState::Connecting => {}
                ConnectionState::Disconnected => {
                    if !self.retrying.load(Ordering::Acquire) {
                        return Err(CallError::NotConnected);
                    }
                }
                ConnectionState::Closing => return Err(CallError::Closed),
            }

            tokio::select! {
                biased;
                err = ctx.done() => return Err(err),
                changed = rx.changed() => {
                    if changed.is_err() {
                        return Err(CallError::Closed);
                    }
                }
            }
        }
    }

    /// Registers, writes, and awaits one call on `conn`.
    pub(crate) async fn issue<Req, Resp>(
        &self,
        conn: &C::Connection,
        api: &str,
        request: &Req,
        ctx: &CallContext,
    ) -> Result<Resp, CallError>
    where
        Req: Message,
        Resp: Message + Default + 'static,
    {
        if ctx.is_cancelled() {
            return Err(CallError::Cancelled);
        }

        // Register first so a fast Response always finds its call.
        let pending = self.correlator.register::<Resp>(api)?;
        let envelope = Envelope::wrap(api, request).encode_to_vec();
        let frame = encode_frame(FrameHeader::Request(pending.id()), &envelope);

        tracing::debug!(id = %pending.id(), api, conn = %conn.id(), "sending request");
        conn.send(&frame).await?;
        pending.wait(ctx).await
    }
}

// ---------------------------------------------------------------------------
// ClientBuilder
// ---------------------------------------------------------------------------

/// Builder for a [`Client`].
///
/// # Example
///
/// ```rust,no_run
/// use mjwire::prelude::*;
///
/// # async fn run() -> Result<(), MjwireError> {
/// let client = ClientBuilder::new()
///     .config(ClientConfig::from_json_file("mjwire.json")?)
///     .build(WebSocketConnector)?;
/// client.connect("wss://lobby.example:443/").await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, Default)]
pub struct ClientBuilder {
    config: ClientConfig,
}

impl ClientBuilder {
    /// Creates a builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the whole configuration.
    pub fn config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the default call deadline.
    pub fn call_timeout(mut self, timeout: std::time::Duration) -> Self {
        self.config.call_timeout_ms =
            u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Enables the passive subscriber queue with the given capacity.
    pub fn subscriber_capacity(mut self, capacity: usize) -> Self {
        self.config.subscriber_capacity = capacity;
        self
    }

    /// Sets the reconnection policy.
    pub fn reconnect(mut self, reconnect: crate::ReconnectConfig) -> Self {
        self.config.reconnect = reconnect;
        self
    }

    /// Enables the heartbeat call.
    pub fn keepalive(mut self, keepalive: crate::KeepaliveConfig) -> Self {
        self.config.keepalive = Some(keepalive);
        self
    }

    /// Builds a client that dials through `connector`.
    ///
    /// Nothing is spawned until [`Client::connect`].
    ///
    /// # Errors
    /// [`MjwireError::Config`] for an unusable configuration.
    pub fn build<C: Connector>(
        self,
        connector: C,
    ) -> Result<Client<C>, MjwireError> {
        self.config.check()?;
        let config = self.config.validated();

        let routers = Routers::new();
        routers
            .notify
            .register_schema::<ActionPrototype>(&config.action_notify_name)?;

        let stalls = StallCounter::default();

        let inner = Inner {
            connector,
            config,
            correlator: Correlator::new(),
            routers,
            link: RwLock::new(None),
            state: watch::Sender::new(ConnectionState::Disconnected),
            shutdown: watch::Sender::new(false),
            kick: watch::Sender::new(None),
            started: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            retrying: AtomicBool::new(false),
            resume_hook: Mutex::new(None),
            subscriber: SubscriberSlot::new(),
            subscriber_taken: AtomicBool::new(false),
            stalls,
            tasks: Mutex::new(Vec::new()),
        };
        Ok(Client {
            inner: Arc::new(inner),
        })
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// Handle to a protocol client. Cheap to clone.
pub struct Client<C: Connector> {
    inner: Arc<Inner<C>>,
}

impl<C: Connector> Clone for Client<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C: Connector> fmt::Debug for Client<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("state", &self.inner.state())
            .field("pending_calls", &self.inner.correlator.len())
            .finish()
    }
}

impl<C: Connector> Client<C> {
    /// Dials `addr` and starts the connection lifecycle.
    ///
    /// A failed first dial is returned to the caller and not retried;
    /// automatic redials only follow the loss of an established link.
    /// If a lost link is not redialed (reconnects disabled, or a clean
    /// remote close), the client settles in `Disconnected` and may be
    /// connected again; registered handlers are kept.
    ///
    /// # Errors
    /// - [`MjwireError::Transport`] if the dial fails
    /// - [`MjwireError::AlreadyConnected`] if the lifecycle is running
    /// - [`CallError::Closed`] (wrapped) if the client was closed
    pub async fn connect(&self, addr: &str) -> Result<(), MjwireError> {
        let inner = &self.inner;
        if inner.is_closed() {
            return Err(CallError::Closed.into());
        }
        if inner.started.swap(true, Ordering::AcqRel) {
            return Err(MjwireError::AlreadyConnected);
        }

        inner.set_state(ConnectionState::Connecting);
        let conn = match inner.connector.connect(addr).await {
            Ok(conn) => Arc::new(conn),
            Err(e) => {
                tracing::warn!(addr, error = %e, "connect failed");
                inner.started.store(false, Ordering::Release);
                inner.set_state(ConnectionState::Disconnected);
                return Err(e.into());
            }
        };

        if !inner.attach(Arc::clone(&conn), ConnectionState::Connected) {
            if let Err(e) = conn.close().await {
                tracing::debug!(error = %e, "close after cancelled connect failed");
            }
            return Err(CallError::Closed.into());
        }
        tracing::info!(conn = %conn.id(), addr, "connected");

        let (push, queue) = push_queue(
            "push",
            inner.config.queue_capacity,
            inner.config.overflow_warn(),
            inner.stalls.clone(),
        );
        // The dispatcher ends on its own once the supervisor drops `push`.
        drop(spawn_dispatcher(
            inner.routers.clone(),
            queue,
            inner.subscriber.clone(),
        ));

        let mut tasks = vec![tokio::spawn(lifecycle::supervise(
            Arc::clone(inner),
            addr.to_string(),
            conn,
            push,
        ))];
        if let Some(config) = inner.config.keepalive.clone() {
            tasks.push(tokio::spawn(keepalive::run(Arc::clone(inner), config)));
        }
        let mut running = lock(&inner.tasks);
        // Left over from a lifecycle whose supervisor gave up: only the
        // keepalive can still be running.
        for task in running.drain(..) {
            task.abort();
        }
        running.extend(tasks);
        Ok(())
    }

    /// Calls `api` with the configured default deadline.
    ///
    /// # Errors
    /// See [`call_with`](Self::call_with).
    pub async fn call<Req, Resp>(
        &self,
        api: &str,
        request: &Req,
    ) -> Result<Resp, CallError>
    where
        Req: Message,
        Resp: Message + Default + 'static,
    {
        let ctx = CallContext::with_timeout(self.inner.config.call_timeout());
        self.call_with(api, request, &ctx).await
    }

    /// Calls `api` under `ctx`.
    ///
    /// While the client is reconnecting, the call waits (bounded by `ctx`)
    /// until the link is back and resumed.
    ///
    /// # Errors
    /// - [`CallError::Timeout`] / [`CallError::Cancelled`] from `ctx`
    /// - [`CallError::DuplicateCorrelationId`] if the next id is taken
    /// - [`CallError::Decode`] if the Response is not a `Resp`
    /// - [`CallError::ConnectionLost`] if the link drops mid-call
    /// - [`CallError::NotConnected`] / [`CallError::Closed`] if there is
    ///   no link and none is coming
    pub async fn call_with<Req, Resp>(
        &self,
        api: &str,
        request: &Req,
        ctx: &CallContext,
    ) -> Result<Resp, CallError>
    where
        Req: Message,
        Resp: Message + Default + 'static,
    {
        let conn = self.inner.wait_connected(ctx).await?;
        self.inner.issue(&conn, api, request, ctx).await
    }

    /// Registers the handler for Notify `name`, decoded as `T`.
    ///
    /// # Errors
    /// [`DispatchError::DuplicateHandler`] or [`DispatchError::Schema`].
    pub fn on_notify<T, F>(&self, name: &str, handler: F) -> Result<(), DispatchError>
    where
        T: Message + Default + 'static,
        F: Fn(&T) + Send + Sync + 'static,
    {
        self.inner.routers.notify.on::<T, F>(name, handler)
    }

    /// Makes Notify `name` decodable as `T` without a handler, so it
    /// reaches the passive subscriber queue.
    ///
    /// # Errors
    /// [`DispatchError::Schema`] if `name` is bound to another type.
    pub fn register_notify<T>(&self, name: &str) -> Result<(), DispatchError>
    where
        T: Message + Default + 'static,
    {
        self.inner.routers.notify.register_schema::<T>(name)
    }

    /// Registers the handler for action `name`, decoded as `T`.
    ///
    /// # Errors
    /// [`DispatchError::DuplicateHandler`] or [`DispatchError::Schema`].
    pub fn on_action<T, F>(&self, name: &str, handler: F) -> Result<(), DispatchError>
    where
        T: Message + Default + 'static,
        F: Fn(&T) + Send + Sync + 'static,
    {
        self.inner.routers.action.on::<T, F>(name, handler)
    }

    /// Makes action `name` decodable as `T` without a handler.
    ///
    /// # Errors
    /// [`DispatchError::Schema`] if `name` is bound to another type.
    pub fn register_action<T>(&self, name: &str) -> Result<(), DispatchError>
    where
        T: Message + Default + 'static,
    {
        self.inner.routers.action.register_schema::<T>(name)
    }

    /// Sets the resumption callback, replacing any previous one.
    ///
    /// It runs once per successful reconnection, before ordinary calls are
    /// let through again. Calls it makes through the given [`Resumer`] skip
    /// that gate. An error is logged; the connection is resumed anyway.
    pub fn on_reconnect<F, Fut>(&self, callback: F)
    where
        F: Fn(Resumer<C>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        let hook: ResumeHook<C> =
            Arc::new(move |resumer| Box::pin(callback(resumer)));
        *lock(&self.inner.resume_hook) = Some(hook);
    }

    /// Takes the passive subscriber queue.
    ///
    /// Push events are copied to it from the moment it is taken; nothing
    /// is buffered before that. Once taken it must be drained, or its
    /// backpressure reaches the read loop. Returns `None` if
    /// `subscriber_capacity` is 0, the queue was already taken, or the
    /// client is closed. The queue ends once the client is closed.
    pub fn notifications(&self) -> Option<PushReceiver> {
        let inner = &self.inner;
        if inner.config.subscriber_capacity == 0 || inner.is_closed() {
            return None;
        }
        if inner.subscriber_taken.swap(true, Ordering::AcqRel) {
            return None;
        }
        let (tx, rx) = push_queue(
            "subscriber",
            inner.config.subscriber_capacity,
            inner.config.overflow_warn(),
            inner.stalls.clone(),
        );
        inner.subscriber.attach(tx);
        Some(rx)
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        self.inner.state()
    }

    /// A receiver that observes every state change.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Number of calls waiting for a Response.
    pub fn pending_calls(&self) -> usize {
        self.inner.correlator.len()
    }

    /// Number of backpressure warnings surfaced so far.
    pub fn queue_stalls(&self) -> u64 {
        self.inner.stalls.get()
    }

    /// The validated configuration in use.
    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// Fails every pending call with [`CallError::Closed`], stops the
    /// lifecycle tasks, and releases the link.
    ///
    /// Closing twice is a no-op. A closed client cannot be reconnected.
    pub async fn close(&self) {
        let inner = &self.inner;
        if inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        inner.state.send_replace(ConnectionState::Closing);
        tracing::info!("closing client");
        inner.shutdown.send_replace(true);

        let link = inner
            .link
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(conn) = link {
            if let Err(e) = conn.close().await {
                tracing::debug!(conn = %conn.id(), error = %e, "close failed");
            }
        }

        let failed = inner.correlator.fail_all(|| CallError::Closed);
        let tasks = std::mem::take(&mut *lock(&inner.tasks));
        for task in tasks {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "lifecycle task ended abnormally");
            }
        }

        inner.subscriber.detach();
        inner.state.send_replace(ConnectionState::Disconnected);
        tracing::info!(failed, "client closed");
    }
}

// ---------------------------------------------------------------------------
// Resumer
// ---------------------------------------------------------------------------

/// Call handle given to the resumption callback.
///
/// Writes straight to the freshly dialed link without waiting for the
/// client to report `Connected`, which only happens after the callback
/// returns.
pub struct Resumer<C: Connector> {
    inner: Arc<Inner<C>>,
}

impl<C: Connector> Resumer<C> {
    pub(crate) fn new(inner: Arc<Inner<C>>) -> Self {
        Self { inner }
    }

    /// Calls `api` with the configured default deadline.
    ///
    /// # Errors
    /// As [`Client::call_with`], except that it never waits for the gate.
    pub async fn call<Req, Resp>(
        &self,
        api: &str,
        request: &Req,
    ) -> Result<Resp, CallError>
    where
        Req: Message,
        Resp: Message + Default + 'static,
    {
        let ctx = CallContext::with_timeout(self.inner.config.call_timeout());
        self.call_with(api, request, &ctx).await
    }

    /// Calls `api` under `ctx`.
    ///
    /// # Errors
    /// As [`call`](Self::call).
    pub async fn call_with<Req, Resp>(
        &self,
        api: &str,
        request: &Req,
        ctx: &CallContext,
    ) -> Result<Resp, CallError>
    where
        Req: Message,
        Resp: Message + Default + 'static,
    {
        if self.inner.is_closed() {
            return Err(CallError::Closed);
        }
        let conn = self
            .inner
            .current_link()
            .ok_or(CallError::ConnectionLost)?;
        self.inner.issue(&conn, api, request, ctx).await
    }
}

impl<C: Connector> fmt::Debug for Resumer<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resumer").finish_non_exhaustive()
    }
}
