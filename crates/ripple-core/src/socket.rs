//! Event socket: one duplex connection seen as named events.
//!
//! A [`Socket`] serializes outgoing events into [`Envelope`]s, routes
//! incoming envelopes to the handler registered for their event name and
//! correlates acknowledgments. It writes [`Outbound`] items to a channel
//! whose receiving end is driven by a transport.

use crate::ack::{AckCallback, AckTable};
use dashmap::DashMap;
use ripple_protocol::envelope::{EventKind, DISCONNECT};
use ripple_protocol::{codec, Envelope, ProtocolError};
use serde_json::Value;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};
use uuid::Uuid;

/// Ordered event arguments.
pub type Args = Vec<Value>;

/// Result returned by event handlers.
pub type HandlerResult = anyhow::Result<()>;

/// Handler for one event name.
///
/// The responder is present only when the inbound envelope asked for an ack.
pub type Handler = Arc<dyn Fn(Args, Option<AckResponder>) -> HandlerResult + Send + Sync>;

/// Handler for events nobody registered for.
pub type FallbackHandler =
    Arc<dyn Fn(&str, Args, Option<AckResponder>) -> HandlerResult + Send + Sync>;

type CloseHook = Box<dyn FnOnce(&str) + Send>;

/// Socket errors.
#[derive(Debug, Error)]
pub enum SocketError {
    /// The transport is no longer open.
    #[error("Socket closed")]
    Closed,

    /// The envelope could not be encoded.
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

/// Errors of [`Socket::request`].
#[derive(Debug, Error)]
pub enum AckError {
    /// The connection closed before the reply arrived.
    #[error("Connection closed before the ack arrived")]
    Closed,

    /// No reply within the given time.
    #[error("Ack timed out after {0:?}")]
    Timeout(Duration),

    /// The request could not be sent.
    #[error("Emit failed: {0}")]
    Emit(#[from] SocketError),
}

/// Items a socket hands to its transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// One encoded envelope.
    Text(String),
    /// Close the transport with the given reason.
    Close(String),
}

/// Receiving end of a socket's outbound queue.
pub type OutboundRx = mpsc::UnboundedReceiver<Outbound>;

/// Event handler registry.
///
/// One handler per event name; registering again replaces the previous one.
/// The registry can be shared by several sockets, which is how a client keeps
/// its handlers across reconnects.
#[derive(Default)]
pub struct Handlers {
    by_event: DashMap<String, Handler>,
    fallback: RwLock<Option<FallbackHandler>>,
}

impl Handlers {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the handler for `event`, replacing any previous one.
    pub fn on<F>(&self, event: impl Into<String>, handler: F)
    where
        F: Fn(Args, Option<AckResponder>) -> HandlerResult + Send + Sync + 'static,
    {
        self.by_event.insert(event.into(), Arc::new(handler));
    }

    /// Get the handler for `event`.
    #[must_use]
    pub fn get(&self, event: &str) -> Option<Handler> {
        self.by_event.get(event).map(|h| Arc::clone(h.value()))
    }

    /// Check if a handler is registered for `event`.
    #[must_use]
    pub fn contains(&self, event: &str) -> bool {
        self.by_event.contains_key(event)
    }

    /// Register the handler for events without a dedicated handler.
    pub fn on_unknown<F>(&self, handler: F)
    where
        F: Fn(&str, Args, Option<AckResponder>) -> HandlerResult + Send + Sync + 'static,
    {
        *self.fallback.write().unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(handler));
    }

    /// Remove every handler, the fallback included.
    pub fn clear(&self) {
        self.by_event.clear();
        *self.fallback.write().unwrap_or_else(PoisonError::into_inner) = None;
    }

    fn fallback(&self) -> Option<FallbackHandler> {
        self.fallback
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Replies to an inbound envelope that carried an ack id.
///
/// Sending consumes the responder, so a reply goes out at most once.
pub struct AckResponder {
    socket: Socket,
    ack_id: String,
}

impl AckResponder {
    /// The correlation id being answered.
    #[must_use]
    pub fn ack_id(&self) -> &str {
        &self.ack_id
    }

    /// Send the reply: a new envelope whose event name is the ack id.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket is closed.
    pub fn send(self, args: Args) -> Result<(), SocketError> {
        self.socket
            .send_envelope(&Envelope::ack_reply(self.ack_id, args))
    }
}

impl fmt::Debug for AckResponder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AckResponder")
            .field("connection", &self.socket.id())
            .field("ack_id", &self.ack_id)
            .finish()
    }
}

/// A connection wrapper.
///
/// Cloning is cheap; all clones refer to the same connection.
#[derive(Clone)]
pub struct Socket {
    inner: Arc<SocketInner>,
}

struct SocketInner {
    id: String,
    tx: mpsc::UnboundedSender<Outbound>,
    handlers: Arc<Handlers>,
    owns_handlers: bool,
    acks: AckTable,
    open: AtomicBool,
    closed: CancellationToken,
    close_hook: Mutex<Option<CloseHook>>,
}

impl Socket {
    /// Create a socket with a fresh id and its own handler registry.
    ///
    /// The registry is cleared once the socket closes, which releases
    /// anything the handlers captured (often the socket itself).
    #[must_use]
    pub fn new() -> (Self, OutboundRx) {
        Self::build(Uuid::new_v4().to_string(), Arc::new(Handlers::new()), true)
    }

    /// Create a socket with a fresh id sharing `handlers`.
    #[must_use]
    pub fn with_handlers(handlers: Arc<Handlers>) -> (Self, OutboundRx) {
        Self::with_id(Uuid::new_v4().to_string(), handlers)
    }

    /// Create a socket with an explicit id.
    #[must_use]
    pub fn with_id(id: impl Into<String>, handlers: Arc<Handlers>) -> (Self, OutboundRx) {
        Self::build(id.into(), handlers, false)
    }

    fn build(id: String, handlers: Arc<Handlers>, owns_handlers: bool) -> (Self, OutboundRx) {
        let (tx, rx) = mpsc::unbounded_channel();
        let socket = Self {
            inner: Arc::new(SocketInner {
                id,
                tx,
                handlers,
                owns_handlers,
                acks: AckTable::new(),
                open: AtomicBool::new(true),
                closed: CancellationToken::new(),
                close_hook: Mutex::new(None),
            }),
        };
        (socket, rx)
    }

    /// Get the connection id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Check if the transport is still open.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.inner.open.load(Ordering::SeqCst)
    }

    /// The handler registry of this socket.
    #[must_use]
    pub fn handlers(&self) -> &Arc<Handlers> {
        &self.inner.handlers
    }

    /// Number of ack waiters still pending.
    #[must_use]
    pub fn pending_acks(&self) -> usize {
        self.inner.acks.pending()
    }

    /// Register the handler for `event`, replacing any previous one.
    pub fn on<F>(&self, event: impl Into<String>, handler: F)
    where
        F: Fn(Args, Option<AckResponder>) -> HandlerResult + Send + Sync + 'static,
    {
        self.inner.handlers.on(event, handler);
    }

    /// Register the handler for events without a dedicated handler.
    pub fn on_unknown<F>(&self, handler: F)
    where
        F: Fn(&str, Args, Option<AckResponder>) -> HandlerResult + Send + Sync + 'static,
    {
        self.inner.handlers.on_unknown(handler);
    }

    /// Emit an event without asking for an acknowledgment.
    ///
    /// # Errors
    ///
    /// Returns [`SocketError::Closed`] if the transport is no longer open.
    pub fn emit(&self, event: &str, args: Args) -> Result<(), SocketError> {
        self.send_envelope(&Envelope::new(event, args))
    }

    /// Emit an event and register `callback` for the peer's acknowledgment.
    ///
    /// The callback fires at most once, with the reply's arguments. It never
    /// fires if the connection closes first. Returns the correlation id.
    ///
    /// # Errors
    ///
    /// Returns [`SocketError::Closed`] if the transport is no longer open; no
    /// waiter is registered in that case.
    pub fn emit_with_ack<F>(
        &self,
        event: &str,
        args: Args,
        callback: F,
    ) -> Result<String, SocketError>
    where
        F: FnOnce(Args) + Send + 'static,
    {
        if !self.is_open() {
            return Err(SocketError::Closed);
        }

        let ack_id = self.inner.acks.next_id();
        let text = codec::encode(&Envelope::with_ack(event, args, ack_id.clone()))?;

        let callback: AckCallback = Box::new(callback);
        self.inner.acks.register(ack_id.clone(), callback);

        // close() may have discarded the table between the check and the insert
        if !self.is_open() {
            self.inner.acks.take(&ack_id);
            return Err(SocketError::Closed);
        }

        if let Err(e) = self.send_text(text) {
            self.inner.acks.take(&ack_id);
            return Err(e);
        }

        trace!(connection = %self.id(), event = %event, ack = %ack_id, "Emitted with ack");
        Ok(ack_id)
    }

    /// Emit an event and wait for its acknowledgment.
    ///
    /// On timeout the waiter is removed, so a late reply is ignored.
    ///
    /// # Errors
    ///
    /// Returns [`AckError::Timeout`] if no reply arrives in time,
    /// [`AckError::Closed`] if the connection closes first.
    pub async fn request(
        &self,
        event: &str,
        args: Args,
        timeout: Duration,
    ) -> Result<Args, AckError> {
        let (tx, rx) = oneshot::channel();
        let ack_id = self.emit_with_ack(event, args, move |reply| {
            let _ = tx.send(reply);
        })?;

        tokio::select! {
            reply = rx => reply.map_err(|_| AckError::Closed),
            () = tokio::time::sleep(timeout) => {
                self.inner.acks.take(&ack_id);
                debug!(connection = %self.id(), ack = %ack_id, "Ack timed out");
                Err(AckError::Timeout(timeout))
            }
        }
    }

    /// Encode and queue an envelope.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket is closed or encoding fails.
    pub fn send_envelope(&self, envelope: &Envelope) -> Result<(), SocketError> {
        if !self.is_open() {
            return Err(SocketError::Closed);
        }
        let text = codec::encode(envelope)?;
        self.send_text(text)
    }

    /// Queue an already encoded envelope.
    ///
    /// Used by fan-out paths that encode once for many recipients.
    ///
    /// # Errors
    ///
    /// Returns [`SocketError::Closed`] if the socket is closed.
    pub fn send_text(&self, text: String) -> Result<(), SocketError> {
        if !self.is_open() {
            return Err(SocketError::Closed);
        }
        self.inner
            .tx
            .send(Outbound::Text(text))
            .map_err(|_| SocketError::Closed)
    }

    /// Process one raw message from the transport.
    ///
    /// Malformed input is logged and dropped. Dispatch order: keepalive
    /// probe, pending ack waiter, registered handler, fallback.
    pub fn receive(&self, raw: &str) {
        match codec::decode(raw) {
            Ok(envelope) => self.dispatch(envelope),
            Err(e) => {
                warn!(connection = %self.id(), error = %e, "Dropping malformed envelope");
            }
        }
    }

    fn dispatch(&self, envelope: Envelope) {
        let kind = envelope.kind();
        let Envelope {
            event,
            data,
            ack_id,
        } = envelope;

        if kind == EventKind::KeepaliveProbe {
            trace!(connection = %self.id(), "Keepalive probe");
            if let Err(e) = self.send_envelope(&Envelope::pong()) {
                debug!(connection = %self.id(), error = %e, "Keepalive response not sent");
            }
            return;
        }

        if let Some(callback) = self.inner.acks.take(&event) {
            trace!(connection = %self.id(), ack = %event, "Ack received");
            self.guarded(&event, move || {
                callback(data);
                Ok(())
            });
            return;
        }

        if let Some(handler) = self.inner.handlers.get(&event) {
            let responder = ack_id.map(|ack_id| self.responder(ack_id));
            self.guarded(&event, || handler(data, responder));
            return;
        }

        match kind {
            EventKind::KeepaliveResponse => {
                trace!(connection = %self.id(), "Keepalive response");
            }
            EventKind::Connect => {
                trace!(connection = %self.id(), "Connect announcement without handler");
            }
            _ => match self.inner.handlers.fallback() {
                Some(fallback) => {
                    let responder = ack_id.map(|ack_id| self.responder(ack_id));
                    self.guarded(&event, || fallback(&event, data, responder));
                }
                None => {
                    debug!(connection = %self.id(), event = %event, "Unknown event");
                }
            },
        }
    }

    /// Fire a local-only event on this socket's handlers.
    pub fn dispatch_local(&self, event: &str, args: Args) {
        if let Some(handler) = self.inner.handlers.get(event) {
            self.guarded(event, || handler(args, None));
        }
    }

    fn responder(&self, ack_id: String) -> AckResponder {
        AckResponder {
            socket: self.clone(),
            ack_id,
        }
    }

    /// Run handler code so that neither an error nor a panic escapes.
    fn guarded<F>(&self, event: &str, f: F)
    where
        F: FnOnce() -> HandlerResult,
    {
        match panic::catch_unwind(AssertUnwindSafe(f)) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(connection = %self.id(), event = %event, error = %e, "Handler failed");
            }
            Err(_) => {
                warn!(connection = %self.id(), event = %event, "Handler panicked");
            }
        }
    }

    /// Close the connection.
    ///
    /// Only the first call has an effect: it discards all pending ack waiters
    /// without invoking them, asks the transport to close, fires the local
    /// `disconnect` event with `reason` and runs the close hook. A socket
    /// created with [`Socket::new`] drops its handlers afterwards.
    pub fn close(&self, reason: &str) {
        if !self.inner.open.swap(false, Ordering::SeqCst) {
            return;
        }

        self.inner.closed.cancel();
        let discarded = self.inner.acks.discard_all();
        let _ = self.inner.tx.send(Outbound::Close(reason.to_string()));

        debug!(
            connection = %self.id(),
            reason = %reason,
            discarded_acks = discarded,
            "Socket closed"
        );

        self.dispatch_local(DISCONNECT, vec![Value::String(reason.to_string())]);
        if self.inner.owns_handlers {
            self.inner.handlers.clear();
        }

        let hook = self
            .inner
            .close_hook
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(hook) = hook {
            hook(self.id());
        }
    }

    /// Wait until the socket is closed.
    pub async fn closed(&self) {
        self.inner.closed.cancelled().await;
    }

    /// Send a keepalive probe every `interval` while the transport is open.
    ///
    /// The task stops on its own as soon as the socket closes.
    pub fn spawn_keepalive(&self, interval: Duration) -> JoinHandle<()> {
        let socket = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // the first tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    () = socket.inner.closed.cancelled() => break,
                    _ = ticker.tick() => {
                        if !socket.is_open() || socket.send_envelope(&Envelope::ping()).is_err() {
                            break;
                        }
                    }
                }
            }

            trace!(connection = %socket.id(), "Keepalive stopped");
        })
    }

    /// Install the hook run once after the `disconnect` event.
    pub(crate) fn set_close_hook<F>(&self, hook: F)
    where
        F: FnOnce(&str) + Send + 'static,
    {
        *self
            .inner
            .close_hook
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(Box::new(hook));
    }
}

impl fmt::Debug for Socket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Socket")
            .field("id", &self.id())
            .field("open", &self.is_open())
            .field("pending_acks", &self.pending_acks())
            .finish()
    }
}
