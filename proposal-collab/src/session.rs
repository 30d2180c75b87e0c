//! Session transport: binds one shared document to one channel.
//!
//! ```text
//!  local edit ──► Doc ──► LocalChangeObserver ──► forwarder task ──► Outbox ──► transport.publish
//!                  ▲            (drops Remote)                        (queue)
//!                  │
//!  RemoteUpdateApplier ◄── receiver task ◄── Inbound ◄── transport.subscribe
//!  (origin = Remote)
//! ```
//!
//! Lifecycle:
//! - [`SessionTransport::new`] claims the document, installs the observer
//!   and starts the forwarder, so edits made before `connect()` land in the
//!   bounded outbound queue. It must run inside a Tokio runtime.
//! - [`SessionTransport::connect`] subscribes and flushes the buffer in order.
//!   It is safe to call again after an error or a lost subscription.
//! - [`SessionTransport::disconnect`] is the terminal teardown. It never fails,
//!   may be called any number of times and cancels a `connect()` in flight.
//!
//! Transport failures surface as [`ConnectionStatus`] changes and log lines.
//! Only an explicit `connect()` returns an error. Nothing here retries on its
//! own; reconnecting is the caller's decision.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{broadcast, mpsc, Mutex, Notify};
use tokio::task::JoinHandle;

use crate::applier::{ApplyOutcome, RemoteUpdateApplier};
use crate::channel::ChannelId;
use crate::document::{CrdtDocument, DocumentError, SharedDocument};
use crate::observer::LocalChangeObserver;
use crate::protocol::{encode_update, UPDATE_EVENT};
use crate::queue::{OutboundQueue, DEFAULT_MAX_PENDING};
use crate::status::{ConnectionStatus, StatusEmitter};
use crate::transport::{Inbound, PubSubTransport, TransportError};

/// Session configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Buffered deltas before falling back to a full-state resync
    pub max_pending: usize,
    /// Upper bound for the connect + subscribe handshake
    pub connect_timeout: Duration,
    /// Publish the whole document after every successful connect
    pub announce_state_on_connect: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_pending: DEFAULT_MAX_PENDING,
            connect_timeout: Duration::from_secs(10),
            announce_state_on_connect: false,
        }
    }
}

/// Session errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("document is already bound to another session")]
    AlreadyBound,
    #[error("session has been disconnected")]
    Closed,
    #[error("sessions must be created inside a Tokio runtime")]
    NoRuntime,
    #[error("connect timed out after {0:?}")]
    Timeout(Duration),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Document(#[from] DocumentError),
}

type RemoteHandler = Arc<dyn Fn(&[u8]) + Send + Sync + 'static>;

/// Ordered outbound path shared by the session and its forwarder task.
struct Outbox<D> {
    channel: ChannelId,
    transport: Arc<dyn PubSubTransport>,
    document: Arc<D>,
    status: StatusEmitter,
    queue: Mutex<OutboundQueue>,
}

impl<D: CrdtDocument> Outbox<D> {
    /// Buffer `delta` and, when connected, flush everything in order.
    async fn push(&self, delta: Vec<u8>) {
        let mut queue = self.queue.lock().await;
        queue.enqueue(delta);
        if self.status.current() == ConnectionStatus::Connected {
            self.flush_locked(&mut queue).await;
        }
    }

    async fn flush(&self) -> usize {
        let mut queue = self.queue.lock().await;
        self.flush_locked(&mut queue).await
    }

    /// Send buffered updates until one fails. A failed delta stays at the
    /// front so the next flush retries it before anything newer.
    async fn flush_locked(&self, queue: &mut OutboundQueue) -> usize {
        let mut sent = 0;
        if queue.needs_full_state() {
            let state = self.document.encode_state();
            if let Err(e) = self.send(&state).await {
                log::warn!("Full-state publish to {} failed, will retry: {e}", self.channel);
                return sent;
            }
            queue.full_state_sent();
            sent += 1;
        }
        while let Some(delta) = queue.front() {
            match self.send(delta).await {
                Ok(()) => {
                    queue.pop_front();
                    sent += 1;
                }
                Err(e) => {
                    log::warn!(
                        "Publish to {} failed, {} updates kept for retry: {e}",
                        self.channel,
                        queue.len()
                    );
                    break;
                }
            }
        }
        sent
    }

    async fn send(&self, delta: &[u8]) -> Result<(), TransportError> {
        self.transport
            .publish(&self.channel, UPDATE_EVENT, encode_update(delta))
            .await
    }
}

struct Lifecycle<S> {
    observer: LocalChangeObserver<S>,
    forwarder: Option<JoinHandle<()>>,
    receiver: Option<JoinHandle<()>>,
    subscribed: bool,
    torn_down: bool,
}

impl<S> Lifecycle<S> {
    fn receiving(&self) -> bool {
        self.receiver.as_ref().is_some_and(|task| !task.is_finished())
    }

    fn abort_tasks(&mut self) {
        if let Some(task) = self.forwarder.take() {
            task.abort();
        }
        if let Some(task) = self.receiver.take() {
            task.abort();
        }
    }
}

/// Real-time sync provider for one shared document.
pub struct SessionTransport<D: CrdtDocument> {
    channel: ChannelId,
    transport: Arc<dyn PubSubTransport>,
    document: Arc<D>,
    config: SessionConfig,
    status: StatusEmitter,
    outbox: Arc<Outbox<D>>,
    handlers: Arc<StdMutex<Vec<RemoteHandler>>>,
    closing: AtomicBool,
    /// Woken by `disconnect()` to abandon a handshake in flight.
    cancel: Notify,
    /// Serializes `connect()` calls without blocking `disconnect()`.
    connecting: Mutex<()>,
    lifecycle: Mutex<Lifecycle<D::Subscription>>,
}

impl<D: CrdtDocument> SessionTransport<D> {
    /// Bind `document` to `channel` over `transport`.
    ///
    /// Fails with [`SessionError::AlreadyBound`] if another live session owns
    /// the document, and with [`SessionError::NoRuntime`] outside a Tokio
    /// runtime.
    pub fn new(
        document: Arc<D>,
        channel: ChannelId,
        transport: Arc<dyn PubSubTransport>,
        config: SessionConfig,
    ) -> Result<Self, SessionError> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| SessionError::NoRuntime)?;
        if !document.claim_session() {
            return Err(SessionError::AlreadyBound);
        }

        let (local_tx, local_rx) = mpsc::unbounded_channel();
        let observer = match LocalChangeObserver::install(document.as_ref(), local_tx) {
            Ok(observer) => observer,
            Err(e) => {
                document.release_session();
                return Err(e.into());
            }
        };

        let status = StatusEmitter::default();
        let outbox = Arc::new(Outbox {
            channel: channel.clone(),
            transport: transport.clone(),
            document: document.clone(),
            status: status.clone(),
            queue: Mutex::new(OutboundQueue::new(config.max_pending)),
        });
        let forwarder = runtime.spawn(forward_local(outbox.clone(), local_rx));

        Ok(Self {
            channel,
            transport,
            document,
            config,
            status,
            outbox,
            handlers: Arc::new(StdMutex::new(Vec::new())),
            closing: AtomicBool::new(false),
            cancel: Notify::new(),
            connecting: Mutex::new(()),
            lifecycle: Mutex::new(Lifecycle {
                observer,
                forwarder: Some(forwarder),
                receiver: None,
                subscribed: false,
                torn_down: false,
            }),
        })
    }

    /// Connect to the transport and subscribe to the channel.
    ///
    /// Idempotent while connected. On failure the status becomes
    /// [`ConnectionStatus::Error`] and the error is returned; calling again
    /// retries. A concurrent [`SessionTransport::disconnect`] abandons the
    /// handshake and this returns [`SessionError::Closed`].
    pub async fn connect(&self) -> Result<(), SessionError> {
        let _connecting = self.connecting.lock().await;
        let cancelled = self.cancel.notified();
        tokio::pin!(cancelled);
        if self.closing.load(Ordering::Acquire) {
            return Err(SessionError::Closed);
        }
        {
            let lifecycle = self.lifecycle.lock().await;
            if lifecycle.torn_down {
                return Err(SessionError::Closed);
            }
            if lifecycle.receiving() && self.status.current() == ConnectionStatus::Connected {
                return Ok(());
            }
        }

        self.status.set(ConnectionStatus::Connecting);
        let attempt = tokio::time::timeout(self.config.connect_timeout, self.open());
        let inbound = tokio::select! {
            result = attempt => result,
            () = &mut cancelled => {
                log::debug!("Connect to {} abandoned by disconnect", self.channel);
                self.release_subscription().await;
                return Err(SessionError::Closed);
            }
        };
        let inbound = match inbound {
            Ok(Ok(inbound)) => inbound,
            Ok(Err(_)) | Err(_) if self.closing.load(Ordering::Acquire) => {
                return Err(SessionError::Closed);
            }
            Ok(Err(e)) => {
                log::warn!("Connecting to {} failed: {e}", self.channel);
                self.status.set(ConnectionStatus::Error);
                return Err(e.into());
            }
            Err(_) => {
                log::warn!(
                    "Connecting to {} timed out after {:?}",
                    self.channel,
                    self.config.connect_timeout
                );
                self.status.set(ConnectionStatus::Error);
                return Err(SessionError::Timeout(self.config.connect_timeout));
            }
        };

        let mut lifecycle = self.lifecycle.lock().await;
        if lifecycle.torn_down || self.closing.load(Ordering::Acquire) {
            // disconnect() raced us; it owns the status.
            drop(lifecycle);
            self.release_subscription().await;
            return Err(SessionError::Closed);
        }

        lifecycle.subscribed = true;
        self.status.set(ConnectionStatus::Connected);
        if let Some(previous) = lifecycle.receiver.replace(self.spawn_receiver(inbound)) {
            previous.abort();
        }
        drop(lifecycle);
        log::info!("Session connected to {}", self.channel);

        if self.config.announce_state_on_connect {
            self.outbox.queue.lock().await.request_full_state();
        }
        let flushed = self.outbox.flush().await;
        if flushed > 0 {
            log::info!("Flushed {flushed} buffered updates to {}", self.channel);
        }
        Ok(())
    }

    async fn release_subscription(&self) {
        if let Err(e) = self.transport.unsubscribe(&self.channel).await {
            log::debug!("Unsubscribe from {} after cancelled connect failed: {e}", self.channel);
        }
    }

    async fn open(&self) -> Result<Inbound, TransportError> {
        self.transport.connect().await?;
        self.transport.subscribe(&self.channel).await
    }

    /// Send a delta to peers.
    ///
    /// Before the first successful connect (or while disconnected) the delta
    /// is buffered and goes out, in order, on the next connect. After
    /// [`SessionTransport::disconnect`] it is discarded.
    pub async fn publish(&self, delta: Vec<u8>) {
        if self.closing.load(Ordering::Acquire) {
            log::debug!("Discarding publish on closed session {}", self.channel);
            return;
        }
        self.outbox.push(delta).await;
    }

    /// Register a callback run once per applied inbound update with the
    /// decoded delta.
    pub fn on_remote_update<F>(&self, handler: F)
    where
        F: Fn(&[u8]) + Send + Sync + 'static,
    {
        self.handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(handler));
    }

    /// Unsubscribe, detach the document listener and stop all background
    /// work. Safe to call repeatedly and without a prior `connect()`.
    pub async fn disconnect(&self) {
        self.closing.store(true, Ordering::Release);
        self.cancel.notify_waiters();
        let mut lifecycle = self.lifecycle.lock().await;
        if lifecycle.torn_down {
            return;
        }

        lifecycle.observer.detach();
        lifecycle.abort_tasks();
        if lifecycle.subscribed {
            if let Err(e) = self.transport.unsubscribe(&self.channel).await {
                log::debug!("Unsubscribe from {} failed during teardown: {e}", self.channel);
            }
            lifecycle.subscribed = false;
        }
        lifecycle.torn_down = true;
        drop(lifecycle);

        let dropped = {
            let mut queue = self.outbox.queue.lock().await;
            let pending = queue.len();
            queue.clear();
            pending
        };
        if dropped > 0 {
            log::info!("Discarded {dropped} unsent updates for {}", self.channel);
        }
        self.document.release_session();
        self.status.set(ConnectionStatus::Disconnected);
        log::info!("Session disconnected from {}", self.channel);
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status.current()
    }

    /// Observe status transitions from now on.
    pub fn subscribe_status(&self) -> broadcast::Receiver<ConnectionStatus> {
        self.status.subscribe()
    }

    pub fn channel(&self) -> &ChannelId {
        &self.channel
    }

    pub fn document(&self) -> &Arc<D> {
        &self.document
    }

    /// Number of deltas waiting to be published.
    pub async fn pending_len(&self) -> usize {
        self.outbox.queue.lock().await.len()
    }

    /// Whether a full-state resync is waiting to be published.
    pub async fn needs_resync(&self) -> bool {
        self.outbox.queue.lock().await.needs_full_state()
    }

    fn spawn_receiver(&self, mut inbound: Inbound) -> JoinHandle<()> {
        let applier = RemoteUpdateApplier::new(self.document.clone());
        let handlers = self.handlers.clone();
        let status = self.status.clone();
        let channel = self.channel.clone();
        tokio::spawn(async move {
            while let Some(message) = inbound.recv().await {
                if let ApplyOutcome::Applied(delta) = applier.apply(&message) {
                    let handlers: Vec<RemoteHandler> = handlers
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .clone();
                    for handler in &handlers {
                        handler(&delta);
                    }
                }
            }
            if status.transition(ConnectionStatus::Connected, ConnectionStatus::Disconnected) {
                log::warn!("Lost subscription to {channel}; local edits will be buffered");
            }
        })
    }
}

/// Move observed local deltas into the outbound queue for the session's
/// whole life, connected or not.
async fn forward_local<D: CrdtDocument>(
    outbox: Arc<Outbox<D>>,
    mut local_rx: mpsc::UnboundedReceiver<Vec<u8>>,
) {
    while let Some(delta) = local_rx.recv().await {
        outbox.push(delta).await;
    }
}

impl SessionTransport<SharedDocument> {
    /// Session on the document's own channel.
    pub fn for_document(
        document: Arc<SharedDocument>,
        transport: Arc<dyn PubSubTransport>,
        config: SessionConfig,
    ) -> Result<Self, SessionError> {
        let channel = document.channel().clone();
        Self::new(document, channel, transport, config)
    }
}

impl<D: CrdtDocument> Drop for SessionTransport<D> {
    fn drop(&mut self) {
        let lifecycle = self.lifecycle.get_mut();
        if lifecycle.torn_down {
            return;
        }
        lifecycle.observer.detach();
        lifecycle.abort_tasks();
        self.document.release_session();
    }
}
