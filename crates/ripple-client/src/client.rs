//! The client stub.

use ripple_core::{AckError, AckResponder, Args, HandlerResult, Handlers, Socket, SocketError};
use ripple_protocol::envelope::CONNECT;
use ripple_transport::{drive, TransportError};
use serde_json::Value;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Reason of the `disconnect` event when the peer gives none.
pub const CLOSE_REASON: &str = "Connection closed";

/// Client errors.
#[derive(Debug, Error)]
pub enum ClientError {
    /// No open connection.
    #[error("Not connected")]
    NotConnected,

    /// Dialing or the transport failed.
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// The event could not be sent.
    #[error("Socket error: {0}")]
    Socket(#[from] SocketError),

    /// The acknowledgment did not arrive.
    #[error("Ack error: {0}")]
    Ack(#[from] AckError),
}

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Keepalive probe interval; `None` disables the keepalive.
    pub keepalive_interval: Option<Duration>,
    /// Maximum incoming message size in bytes.
    pub max_message_size: usize,
    /// Timeout of [`Client::request`].
    pub request_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            keepalive_interval: None,
            max_message_size: 64 * 1024,
            request_timeout: Duration::from_secs(10),
        }
    }
}

type ConnectHandler = Arc<dyn Fn(Args, Option<AckResponder>) -> HandlerResult + Send + Sync>;

struct Session {
    socket: Socket,
    driver: JoinHandle<()>,
}

/// Peer-side endpoint of the event protocol.
///
/// Reconnection is manual: after the transport closes, call
/// [`reconnect`](Self::reconnect). Handlers survive reconnection; ack
/// waiters of the old connection are discarded with it.
///
/// Cloning is cheap; all clones refer to the same client.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    url: String,
    config: ClientConfig,
    handlers: Arc<Handlers>,
    session: Mutex<Option<Session>>,
    dialing: tokio::sync::Mutex<()>,
    server_id: Arc<RwLock<Option<String>>>,
    on_connect: Arc<RwLock<Option<ConnectHandler>>>,
}

impl Client {
    /// Create a client for `url` with default configuration.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self::with_config(url, ClientConfig::default())
    }

    /// Create a client with custom configuration. Nothing is dialed yet.
    #[must_use]
    pub fn with_config(url: impl Into<String>, config: ClientConfig) -> Self {
        let handlers = Arc::new(Handlers::new());
        let server_id: Arc<RwLock<Option<String>>> = Arc::new(RwLock::new(None));
        let on_connect: Arc<RwLock<Option<ConnectHandler>>> = Arc::new(RwLock::new(None));

        // record the id the server announces, then run the user's handler
        let id_slot = Arc::clone(&server_id);
        let user_handler = Arc::clone(&on_connect);
        handlers.on(CONNECT, move |args: Args, ack| {
            let announced = args
                .first()
                .and_then(|payload| payload.get("id"))
                .and_then(Value::as_str)
                .map(str::to_string);
            if let Some(id) = &announced {
                debug!(id = %id, "Server assigned connection id");
            }
            *id_slot.write().unwrap_or_else(PoisonError::into_inner) = announced;

            let user = user_handler
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .clone();
            match user {
                Some(handler) => handler(args, ack),
                None => Ok(()),
            }
        });

        Self {
            inner: Arc::new(ClientInner {
                url: url.into(),
                config,
                handlers,
                session: Mutex::new(None),
                dialing: tokio::sync::Mutex::new(()),
                server_id,
                on_connect,
            }),
        }
    }

    /// The URL this client dials.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.inner.url
    }

    /// Connection id announced by the server, once known.
    #[must_use]
    pub fn id(&self) -> Option<String> {
        self.inner
            .server_id
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Check if the transport is open.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.socket().is_some_and(|s| s.is_open())
    }

    /// Register the handler for `event`, replacing any previous one.
    ///
    /// Handlers apply to the current and every future connection.
    pub fn on<F>(&self, event: impl Into<String>, handler: F)
    where
        F: Fn(Args, Option<AckResponder>) -> HandlerResult + Send + Sync + 'static,
    {
        let event = event.into();
        if event == CONNECT {
            *self
                .inner
                .on_connect
                .write()
                .unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(handler));
        } else {
            self.inner.handlers.on(event, handler);
        }
    }

    /// Register the handler for events without a dedicated handler.
    pub fn on_unknown<F>(&self, handler: F)
    where
        F: Fn(&str, Args, Option<AckResponder>) -> HandlerResult + Send + Sync + 'static,
    {
        self.inner.handlers.on_unknown(handler);
    }

    /// Open the connection. Does nothing if it is already open.
    ///
    /// # Errors
    ///
    /// Returns an error if dialing fails.
    pub async fn connect(&self) -> Result<(), ClientError> {
        let _dialing = self.inner.dialing.lock().await;
        if self.is_open() {
            return Ok(());
        }
        self.dial().await
    }

    /// Dial the same URL again if the connection is not open.
    ///
    /// # Errors
    ///
    /// Returns an error if dialing fails.
    pub async fn reconnect(&self) -> Result<(), ClientError> {
        let _dialing = self.inner.dialing.lock().await;
        if self.is_open() {
            debug!(url = %self.inner.url, "Already connected, reconnect skipped");
            return Ok(());
        }
        info!(url = %self.inner.url, "Reconnecting");
        self.dial().await
    }

    /// Close the current connection, if open, and dial again.
    ///
    /// # Errors
    ///
    /// Returns an error if dialing fails.
    pub async fn new_connection(&self) -> Result<(), ClientError> {
        let _dialing = self.inner.dialing.lock().await;
        self.shutdown_session().await;
        self.dial().await
    }

    /// Close the connection and wait for the transport to finish.
    pub async fn close(&self) {
        let _dialing = self.inner.dialing.lock().await;
        self.shutdown_session().await;
    }

    /// Emit an event.
    ///
    /// # Errors
    ///
    /// Returns an error if there is no open connection.
    pub fn emit(&self, event: &str, args: Args) -> Result<(), ClientError> {
        Ok(self.open_socket()?.emit(event, args)?)
    }

    /// Emit an event and register `callback` for the acknowledgment.
    ///
    /// The callback fires at most once, and never if the connection closes
    /// first.
    ///
    /// # Errors
    ///
    /// Returns an error if there is no open connection.
    pub fn emit_with_ack<F>(&self, event: &str, args: Args, callback: F) -> Result<(), ClientError>
    where
        F: FnOnce(Args) + Send + 'static,
    {
        self.open_socket()?.emit_with_ack(event, args, callback)?;
        Ok(())
    }

    /// Emit an event and wait for its acknowledgment with the configured timeout.
    ///
    /// # Errors
    ///
    /// Returns an error if there is no open connection, the connection closes
    /// first or the timeout elapses.
    pub async fn request(&self, event: &str, args: Args) -> Result<Args, ClientError> {
        self.request_with_timeout(event, args, self.inner.config.request_timeout)
            .await
    }

    /// Emit an event and wait at most `timeout` for its acknowledgment.
    ///
    /// # Errors
    ///
    /// See [`request`](Self::request).
    pub async fn request_with_timeout(
        &self,
        event: &str,
        args: Args,
        timeout: Duration,
    ) -> Result<Args, ClientError> {
        let socket = self.open_socket()?;
        Ok(socket.request(event, args, timeout).await?)
    }

    fn socket(&self) -> Option<Socket> {
        self.inner
            .session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|session| session.socket.clone())
    }

    fn open_socket(&self) -> Result<Socket, ClientError> {
        self.socket()
            .filter(Socket::is_open)
            .ok_or(ClientError::NotConnected)
    }

    async fn dial(&self) -> Result<(), ClientError> {
        let url = &self.inner.url;
        let mut conn = ripple_transport::connect(url, self.inner.config.max_message_size)
            .await
            .map_err(|e| {
                warn!(url = %url, error = %e, "Connection failed");
                e
            })?;

        *self
            .inner
            .server_id
            .write()
            .unwrap_or_else(PoisonError::into_inner) = None;

        let (socket, outbound) = Socket::with_handlers(Arc::clone(&self.inner.handlers));
        if let Some(interval) = self.inner.config.keepalive_interval {
            socket.spawn_keepalive(interval);
        }

        let driven = socket.clone();
        let driver = tokio::spawn(async move {
            drive(&mut conn, &driven, outbound, CLOSE_REASON).await;
        });

        let previous = self
            .inner
            .session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(Session { socket, driver });
        if let Some(previous) = previous {
            previous.socket.close(CLOSE_REASON);
        }

        info!(url = %url, "Connected");
        Ok(())
    }

    async fn shutdown_session(&self) {
        let session = self
            .inner
            .session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(session) = session {
            session.socket.close(CLOSE_REASON);
            if let Err(e) = session.driver.await {
                warn!(error = %e, "Connection task failed");
            }
            debug!(url = %self.inner.url, "Connection closed");
        }
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("url", &self.inner.url)
            .field("id", &self.id())
            .field("open", &self.is_open())
            .finish()
    }
}
