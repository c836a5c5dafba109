//! The per-process server instance.
//!
//! A [`Server`] owns the connection set and room registry of one process,
//! plus an optional [`RelayAdapter`]. Transports hand it each accepted
//! duplex connection through [`Server::accept`].

use crate::relay::{Bus, RelayAdapter, RelayConfig};
use crate::room::{RoomConfig, RoomRegistry};
use crate::socket::{Args, HandlerResult, OutboundRx, Socket};
use ripple_protocol::{BusMessage, Envelope};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, PoisonError, RwLock};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Reason given to connections closed by [`Server::shutdown`].
pub const SHUTDOWN_REASON: &str = "server shutting down";

/// Server errors.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Too many connections.
    #[error("Connection limit reached ({0})")]
    ConnectionLimit(usize),

    /// The server is shutting down.
    #[error("Server is shutting down")]
    ShuttingDown,

    /// A relay adapter is already installed.
    #[error("Relay adapter already set")]
    AdapterAlreadySet,
}

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Room registry limits.
    pub rooms: RoomConfig,
    /// Keepalive probe interval for accepted connections.
    pub keepalive_interval: Option<Duration>,
    /// Maximum concurrent connections.
    pub max_connections: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            rooms: RoomConfig::default(),
            keepalive_interval: None,
            max_connections: 10_000,
        }
    }
}

type ConnectionHandler = Arc<dyn Fn(&Server, &Socket) -> HandlerResult + Send + Sync>;

/// The server instance of one process.
///
/// Cloning is cheap; all clones refer to the same server.
#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

struct ServerInner {
    registry: Arc<RoomRegistry>,
    adapter: OnceLock<RelayAdapter>,
    on_connection: RwLock<Option<ConnectionHandler>>,
    shutting_down: AtomicBool,
    /// Connection slots in use, released by each socket's close hook.
    slots: Arc<AtomicUsize>,
    config: ServerConfig,
}

impl Server {
    /// Create a server with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(ServerConfig::default())
    }

    /// Create a server with custom configuration.
    #[must_use]
    pub fn with_config(config: ServerConfig) -> Self {
        Self {
            inner: Arc::new(ServerInner {
                registry: Arc::new(RoomRegistry::with_config(config.rooms.clone())),
                adapter: OnceLock::new(),
                on_connection: RwLock::new(None),
                shutting_down: AtomicBool::new(false),
                slots: Arc::new(AtomicUsize::new(0)),
                config,
            }),
        }
    }

    /// Attach a pub/sub bus so broadcasts reach every process.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns an error if an adapter is already installed.
    pub fn use_adapter(&self, bus: Arc<dyn Bus>, config: RelayConfig) -> Result<(), ServerError> {
        if self.inner.adapter.get().is_some() {
            return Err(ServerError::AdapterAlreadySet);
        }
        let adapter = RelayAdapter::start(bus, &self.inner.registry, config);
        // a losing adapter stops its tasks when dropped
        self.inner
            .adapter
            .set(adapter)
            .map_err(|_| ServerError::AdapterAlreadySet)
    }

    /// Register the callback run for every accepted connection.
    ///
    /// This is where event handlers are installed on the new socket. An error
    /// or panic in the callback is logged; the connection stays open.
    pub fn on_connection<F>(&self, handler: F)
    where
        F: Fn(&Server, &Socket) -> HandlerResult + Send + Sync + 'static,
    {
        *self
            .inner
            .on_connection
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(handler));
    }

    /// Accept a new connection.
    ///
    /// Registers the socket, announces its id with the `connect` event, runs
    /// the connection callback and starts the keepalive if configured. The
    /// socket unregisters itself (leaving all rooms) when it closes. The
    /// returned receiver must be driven by the transport.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection limit is reached or the server is
    /// shutting down.
    pub fn accept(&self) -> Result<(Socket, OutboundRx), ServerError> {
        if self.inner.shutting_down.load(Ordering::SeqCst) {
            return Err(ServerError::ShuttingDown);
        }
        let max = self.inner.config.max_connections;
        let slots = Arc::clone(&self.inner.slots);
        if slots
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |used| {
                (used < max).then_some(used + 1)
            })
            .is_err()
        {
            warn!(max, "Connection limit reached");
            return Err(ServerError::ConnectionLimit(max));
        }

        let (socket, outbound) = Socket::new();

        let registry = Arc::downgrade(&self.inner.registry);
        socket.set_close_hook(move |id| {
            slots.fetch_sub(1, Ordering::SeqCst);
            if let Some(registry) = registry.upgrade() {
                registry.unregister(id);
            }
        });
        self.inner.registry.register(socket.clone());

        if let Err(e) = socket.send_envelope(&Envelope::connect(socket.id())) {
            debug!(connection = %socket.id(), error = %e, "Connect announcement not sent");
        }

        let handler = self
            .inner
            .on_connection
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(handler) = handler {
            match panic::catch_unwind(AssertUnwindSafe(|| handler(self, &socket))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(connection = %socket.id(), error = %e, "Connection handler failed");
                }
                Err(_) => {
                    warn!(connection = %socket.id(), "Connection handler panicked");
                }
            }
        }

        if let Some(interval) = self.inner.config.keepalive_interval {
            if tokio::runtime::Handle::try_current().is_ok() {
                socket.spawn_keepalive(interval);
            } else {
                warn!(connection = %socket.id(), "No runtime, keepalive disabled");
            }
        }

        info!(
            connection = %socket.id(),
            connections = self.inner.registry.connection_count(),
            "Connection accepted"
        );
        Ok((socket, outbound))
    }

    /// Broadcast to every member of a room on every process.
    pub fn to_room(&self, room: &str, event: &str, args: Args) {
        self.broadcast(BusMessage::to_room(room, event, args));
    }

    /// Broadcast to every member of a room on every process except one connection.
    pub fn to_room_except(&self, room: &str, event: &str, except: &str, args: Args) {
        self.broadcast(BusMessage::to_room(room, event, args).except(except));
    }

    /// Broadcast to every connection on every process.
    pub fn to_all(&self, event: &str, args: Args) {
        self.broadcast(BusMessage::to_all(event, args));
    }

    /// Broadcast to every connection on every process except one.
    pub fn to_all_except(&self, event: &str, except: &str, args: Args) {
        self.broadcast(BusMessage::to_all(event, args).except(except));
    }

    /// Emit to one connection of this process.
    pub fn to_connection(&self, connection_id: &str, event: &str, args: Args) -> bool {
        self.inner
            .registry
            .emit_to_connection(connection_id, event, args)
    }

    fn broadcast(&self, message: BusMessage) {
        match self.inner.adapter.get() {
            Some(adapter) => adapter.broadcast(message),
            None => {
                self.inner.registry.deliver(&message);
            }
        }
    }

    /// The room registry of this process.
    #[must_use]
    pub fn rooms(&self) -> &Arc<RoomRegistry> {
        &self.inner.registry
    }

    /// The relay adapter, if one is installed.
    #[must_use]
    pub fn adapter(&self) -> Option<&RelayAdapter> {
        self.inner.adapter.get()
    }

    /// Number of open connections.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.inner.registry.connection_count()
    }

    /// Get the configuration.
    #[must_use]
    pub fn config(&self) -> &ServerConfig {
        &self.inner.config
    }

    /// Shut down: stop the bus relay first, then close every connection.
    pub async fn shutdown(&self) {
        if self.inner.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Shutting down server");

        if let Some(adapter) = self.inner.adapter.get() {
            adapter.shutdown().await;
        }

        let sockets = self.inner.registry.sockets();
        let count = sockets.len();
        for socket in sockets {
            socket.close(SHUTDOWN_REASON);
        }

        info!(closed = count, "Server shut down");
    }
}

impl Default for Server {
    fn default() -> Self {
        Self::new()
    }
}
