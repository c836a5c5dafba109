//! HTTP boundary of the Ripple server.
//!
//! Routes WebSocket upgrades into the event server and answers health checks.

use crate::chat;
use crate::config::Config;
use crate::metrics::{self, Metered};
use anyhow::{anyhow, Context, Result};
use axum::{
    extract::{
        ws::{WebSocket, WebSocketUpgrade},
        ConnectInfo, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use ripple_core::{Bus, Server};
use ripple_transport::{drive, Connection, UpgradedConnection};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

/// Reason of the `disconnect` event when a client goes away without one.
pub const DISCONNECT_REASON: &str = "client disconnected";

const STATS_INTERVAL: Duration = Duration::from_secs(5);

/// Shared server state.
pub struct AppState {
    /// The event server.
    pub server: Server,
    /// Server configuration.
    pub config: Config,
}

/// Run the HTTP/WebSocket server until Ctrl-C.
///
/// # Errors
///
/// Returns an error if the bus cannot be attached or no port can be bound.
pub async fn run_server(config: Config) -> Result<()> {
    let server = Server::with_config(config.server_config());
    attach_bus(&server, &config)?;
    chat::install(&server);

    if config.metrics.enabled {
        match metrics::start_metrics_server(config.metrics.port) {
            Ok(()) => spawn_stats_exporter(server.clone()),
            Err(e) => error!("Failed to start metrics server: {}", e),
        }
    }

    let listener = bind(&config).await?;
    let shutdown = shutdown_signal(server.clone());
    serve(listener, server, config, shutdown).await
}

/// Serve on `listener` until `shutdown` completes.
///
/// # Errors
///
/// Returns an error if the HTTP server fails.
pub async fn serve<F>(
    listener: TcpListener,
    server: Server,
    config: Config,
    shutdown: F,
) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = listener.local_addr()?;
    info!("Ripple server listening on {}", addr);
    info!(
        "WebSocket endpoint: ws://{}{}",
        addr, config.transport.websocket_path
    );

    let app = router(Arc::new(AppState { server, config }));
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown)
        .await?;

    info!("Ripple server stopped");
    Ok(())
}

/// Build the HTTP router.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route(&state.config.transport.websocket_path, get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state)
}

/// Bind the first free port of the configured range.
async fn bind(config: &Config) -> Result<TcpListener> {
    let mut last_error = None;
    for addr in config.bind_addrs()? {
        match TcpListener::bind(addr).await {
            Ok(listener) => return Ok(listener),
            Err(e) => {
                warn!("Port {} is in use or cannot be opened, trying next port", addr.port());
                last_error = Some(e);
            }
        }
    }
    match last_error {
        Some(e) => Err(e).context("No port available"),
        None => Err(anyhow!("No address to bind")),
    }
}

fn attach_bus(server: &Server, config: &Config) -> Result<()> {
    let Some(url) = config.bus.url.as_deref() else {
        info!("No bus configured, broadcasts stay on this process");
        return Ok(());
    };
    server.use_adapter(open_bus(url)?, config.relay_config())?;
    if let Some(adapter) = server.adapter() {
        info!(bus = adapter.bus_name(), "Relaying broadcasts through the bus");
    }
    Ok(())
}

#[cfg(feature = "redis")]
fn open_bus(url: &str) -> Result<Arc<dyn Bus>> {
    let bus = ripple_core::RedisBus::open(url).context("Invalid bus URL")?;
    Ok(Arc::new(bus))
}

#[cfg(not(feature = "redis"))]
fn open_bus(_url: &str) -> Result<Arc<dyn Bus>> {
    Err(anyhow!("A bus URL is configured but the redis feature is disabled"))
}

fn spawn_stats_exporter(server: Server) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(STATS_INTERVAL);
        loop {
            ticker.tick().await;
            metrics::export_stats(&server);
        }
    });
}

async fn shutdown_signal(server: Server) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
    server.shutdown().await;
}

/// Health check handler. Reports the bus relay when one is attached.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let bus = state.server.adapter().map(|adapter| {
        serde_json::json!({
            "name": adapter.bus_name(),
            "connected": adapter.is_connected()
        })
    });
    axum::Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "connections": state.server.connection_count(),
        "bus": bus
    }))
}

/// WebSocket upgrade handler.
async fn ws_handler(
    ws: WebSocketUpgrade,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    State(state): State<Arc<AppState>>,
) -> Response {
    if state.server.connection_count() >= state.config.limits.max_connections {
        metrics::record_error("connection_limit");
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }
    let remote = connect_info.map(|ConnectInfo(addr)| addr);
    ws.max_message_size(state.config.limits.max_message_size)
        .on_upgrade(move |socket| handle_websocket(socket, remote, state))
}

/// Handle a WebSocket connection.
async fn handle_websocket(ws: WebSocket, remote: Option<SocketAddr>, state: Arc<AppState>) {
    let mut conn = Metered::new(UpgradedConnection::new(
        ws,
        remote,
        state.config.limits.max_message_size,
    ));

    let (socket, outbound) = match state.server.accept() {
        Ok(accepted) => accepted,
        Err(e) => {
            warn!(remote = ?remote, error = %e, "Connection rejected");
            metrics::record_error("rejected");
            if let Err(e) = conn.close(&e.to_string()).await {
                debug!(error = %e, "Close after rejection failed");
            }
            return;
        }
    };

    debug!(connection = %socket.id(), remote = ?remote, "WebSocket connected");
    drive(&mut conn, &socket, outbound, DISCONNECT_REASON).await;
    debug!(connection = %socket.id(), "WebSocket disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;
    use ripple_client::{Client, ClientConfig};
    use ripple_core::{MemoryBus, RelayConfig};
    use serde_json::json;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;
    use tokio::sync::{mpsc, oneshot};

    const WAIT: Duration = Duration::from_secs(5);

    fn test_config() -> Config {
        let mut config: Config = toml::from_str(
            r#"
            host = "127.0.0.1"
            port = 0

            [keepalive]
            interval_ms = 0

            [metrics]
            enabled = false
        "#,
        )
        .unwrap();
        config.bus.url = None;
        config
    }

    struct Running {
        server: Server,
        addr: SocketAddr,
        stop: Option<oneshot::Sender<()>>,
        task: tokio::task::JoinHandle<Result<()>>,
    }

    async fn start(config: Config) -> Running {
        let server = Server::with_config(config.server_config());
        chat::install(&server);
        let listener = bind(&config).await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (stop, stopped) = oneshot::channel::<()>();
        let stopping = server.clone();
        let task = tokio::spawn(serve(listener, server.clone(), config, async move {
            let _ = stopped.await;
            stopping.shutdown().await;
        }));

        Running {
            server,
            addr,
            stop: Some(stop),
            task,
        }
    }

    fn client(addr: SocketAddr) -> Client {
        Client::with_config(
            format!("ws://{addr}/ws"),
            ClientConfig {
                keepalive_interval: None,
                ..ClientConfig::default()
            },
        )
    }

    async fn get_health(addr: SocketAddr) -> String {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"GET /health HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        response
    }

    #[tokio::test]
    async fn test_health() {
        let running = start(test_config()).await;

        let response = get_health(running.addr).await;
        assert!(response.starts_with("HTTP/1.1 200"));
        assert!(response.contains(r#""status":"ok""#));
        assert!(response.contains(r#""bus":null"#));
    }

    #[tokio::test]
    async fn test_health_reports_bus() {
        let running = start(test_config()).await;
        running
            .server
            .use_adapter(Arc::new(MemoryBus::new()), RelayConfig::default())
            .unwrap();
        let adapter = running.server.adapter().unwrap();
        tokio::time::timeout(WAIT, async {
            while !adapter.is_connected() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        let response = get_health(running.addr).await;
        assert!(response.contains(r#""name":"memory""#));
        assert!(response.contains(r#""connected":true"#));
    }

    #[tokio::test]
    async fn test_chat_over_websocket() {
        let running = start(test_config()).await;

        let alice = client(running.addr);
        let (hello_tx, mut hello_rx) = mpsc::unbounded_channel();
        alice.on("hello", move |args, _| {
            hello_tx.send(args)?;
            Ok(())
        });
        let (msg_tx, mut msg_rx) = mpsc::unbounded_channel();
        alice.on("message", move |args, _| {
            msg_tx.send(args)?;
            Ok(())
        });
        alice.connect().await.unwrap();

        let hello = tokio::time::timeout(WAIT, hello_rx.recv()).await.unwrap().unwrap();
        assert_eq!(hello, vec![json!("world")]);

        let joined = alice
            .request("join", vec![json!("lobby"), json!("alice")])
            .await
            .unwrap();
        assert_eq!(joined, vec![json!("lobby")]);

        let bob = client(running.addr);
        bob.connect().await.unwrap();
        bob.request("join", vec![json!("lobby"), json!("bob")])
            .await
            .unwrap();
        let status = bob
            .request("message", vec![json!("hi"), json!("bob"), json!("lobby")])
            .await
            .unwrap();
        assert_eq!(status, vec![json!("ok")]);

        let relayed = tokio::time::timeout(WAIT, msg_rx.recv()).await.unwrap().unwrap();
        assert_eq!(relayed, vec![json!("hi"), json!("bob")]);
        assert_eq!(running.server.rooms().member_count("lobby"), 2);
    }

    #[tokio::test]
    async fn test_connection_limit() {
        let mut config = test_config();
        config.limits.max_connections = 1;
        let running = start(config).await;

        let first = client(running.addr);
        first.connect().await.unwrap();
        tokio::time::timeout(WAIT, async {
            while running.server.connection_count() < 1 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        let second = client(running.addr);
        assert!(second.connect().await.is_err());
        assert_eq!(running.server.connection_count(), 1);
    }

    #[tokio::test]
    async fn test_graceful_shutdown_closes_clients() {
        let mut running = start(test_config()).await;

        let alice = client(running.addr);
        let (tx, mut rx) = mpsc::unbounded_channel();
        alice.on("disconnect", move |args, _| {
            tx.send(args)?;
            Ok(())
        });
        alice.connect().await.unwrap();
        alice.request("join", vec![json!("lobby"), json!("alice")])
            .await
            .unwrap();

        running.stop.take().unwrap().send(()).unwrap();

        let reason = tokio::time::timeout(WAIT, rx.recv()).await.unwrap().unwrap();
        assert_eq!(reason, vec![json!("server shutting down")]);
        tokio::time::timeout(WAIT, running.task).await.unwrap().unwrap().unwrap();
        assert_eq!(running.server.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_bind_reports_taken_port() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut config = test_config();
        config.port = taken.local_addr().unwrap().port();
        config.port_attempts = 1;

        assert!(bind(&config).await.is_err());
    }
}
