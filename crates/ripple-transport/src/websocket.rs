//! WebSocket transport implementation.
//!
//! This module provides a standalone WebSocket listener and a client dialer
//! using tokio-tungstenite.

use crate::traits::{close_reason, Connection, Transport, TransportError};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use ripple_protocol::codec::MAX_FRAME_SIZE;
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{accept_async, connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

/// WebSocket transport configuration.
#[derive(Debug, Clone)]
pub struct WebSocketConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// Maximum message size in bytes.
    pub max_message_size: usize,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 3000)),
            max_message_size: 64 * 1024,
        }
    }
}

/// WebSocket transport.
pub struct WebSocketTransport {
    listener: TcpListener,
    config: WebSocketConfig,
}

impl WebSocketTransport {
    /// Create a new WebSocket transport.
    ///
    /// # Errors
    ///
    /// Returns an error if binding to the address fails.
    pub async fn new(config: WebSocketConfig) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(config.bind_addr).await?;
        info!("WebSocket transport listening on {}", config.bind_addr);
        Ok(Self { listener, config })
    }

    /// Create a new WebSocket transport with default limits.
    ///
    /// # Errors
    ///
    /// Returns an error if binding fails.
    pub async fn bind(addr: SocketAddr) -> Result<Self, TransportError> {
        Self::new(WebSocketConfig {
            bind_addr: addr,
            ..Default::default()
        })
        .await
    }

    /// Get the local address this transport is bound to.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.local_addr().ok()
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn accept(&self) -> Result<Box<dyn Connection>, TransportError> {
        let (stream, addr) = self.listener.accept().await?;
        debug!("Accepted TCP connection from {}", addr);

        let ws_stream = accept_async(stream).await.map_err(|e| {
            error!("WebSocket handshake failed: {}", e);
            TransportError::Handshake(e.to_string())
        })?;

        debug!("WebSocket handshake completed with {}", addr);
        Ok(Box::new(WebSocketConnection::new(
            ws_stream,
            Some(addr.to_string()),
            self.config.max_message_size,
        )))
    }

    fn name(&self) -> &'static str {
        "websocket"
    }
}

/// Dial a WebSocket server, e.g. `ws://127.0.0.1:3000/ws`.
///
/// # Errors
///
/// Returns an error if the connection or the handshake fails.
pub async fn connect(
    url: &str,
    max_message_size: usize,
) -> Result<WebSocketConnection<MaybeTlsStream<TcpStream>>, TransportError> {
    let (ws_stream, _response) = connect_async(url).await.map_err(|e| match e {
        WsError::Io(io) => TransportError::Io(io),
        other => TransportError::Handshake(other.to_string()),
    })?;
    debug!(url = %url, "WebSocket connected");
    Ok(WebSocketConnection::new(
        ws_stream,
        Some(url.to_string()),
        max_message_size,
    ))
}

/// A WebSocket connection over any byte stream.
pub struct WebSocketConnection<S> {
    stream: WebSocketStream<S>,
    remote_addr: Option<String>,
    is_open: bool,
    peer_reason: Option<String>,
    max_message_size: usize,
}

impl<S> WebSocketConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Wrap an established WebSocket stream.
    #[must_use]
    pub fn new(
        stream: WebSocketStream<S>,
        remote_addr: Option<String>,
        max_message_size: usize,
    ) -> Self {
        Self {
            stream,
            remote_addr,
            is_open: true,
            peer_reason: None,
            max_message_size: max_message_size.min(MAX_FRAME_SIZE),
        }
    }

    fn accept_text(&self, text: String) -> Option<String> {
        if text.len() > self.max_message_size {
            warn!(
                "Message too large: {} bytes (max: {})",
                text.len(),
                self.max_message_size
            );
            return None;
        }
        Some(text)
    }
}

#[async_trait]
impl<S> Connection for WebSocketConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn recv(&mut self) -> Result<Option<String>, TransportError> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => {
                    if let Some(text) = self.accept_text(text) {
                        return Ok(Some(text));
                    }
                }
                Some(Ok(Message::Binary(data))) => match String::from_utf8(data) {
                    Ok(text) => {
                        if let Some(text) = self.accept_text(text) {
                            return Ok(Some(text));
                        }
                    }
                    Err(_) => warn!("Dropping non-UTF-8 binary message"),
                },
                // tungstenite queues the pong for a ping and flushes it itself
                Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => {}
                Some(Ok(Message::Close(frame))) => {
                    debug!(frame = ?frame, "Received close frame");
                    self.peer_reason = frame
                        .map(|f| f.reason.to_string())
                        .filter(|reason| !reason.is_empty());
                    self.is_open = false;
                    return Ok(None);
                }
                Some(Err(WsError::ConnectionClosed | WsError::AlreadyClosed)) | None => {
                    debug!("WebSocket stream ended");
                    self.is_open = false;
                    return Ok(None);
                }
                Some(Err(e)) => {
                    error!("WebSocket error: {}", e);
                    self.is_open = false;
                    return Err(TransportError::ReceiveFailed(e.to_string()));
                }
            }
        }
    }

    async fn send(&mut self, text: String) -> Result<(), TransportError> {
        if !self.is_open {
            return Err(TransportError::ConnectionClosed);
        }
        self.stream
            .send(Message::Text(text))
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    async fn close(&mut self, reason: &str) -> Result<(), TransportError> {
        if !std::mem::replace(&mut self.is_open, false) {
            return Ok(());
        }
        let frame = CloseFrame {
            code: CloseCode::Normal,
            reason: close_reason(reason).into(),
        };
        match self.stream.close(Some(frame)).await {
            Ok(()) | Err(WsError::ConnectionClosed | WsError::AlreadyClosed) => Ok(()),
            Err(e) => Err(TransportError::SendFailed(e.to_string())),
        }
    }

    fn remote_addr(&self) -> Option<String> {
        self.remote_addr.clone()
    }

    fn peer_close_reason(&self) -> Option<&str> {
        self.peer_reason.as_deref()
    }

    fn is_open(&self) -> bool {
        self.is_open
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_websocket_config_default() {
        let config = WebSocketConfig::default();
        assert_eq!(config.bind_addr.port(), 3000);
        assert_eq!(config.max_message_size, 64 * 1024);
    }

    #[tokio::test]
    async fn test_text_roundtrip_and_close() {
        let transport = WebSocketTransport::bind(SocketAddr::from(([127, 0, 0, 1], 0)))
            .await
            .unwrap();
        let url = format!("ws://{}", transport.local_addr().unwrap());

        let server = tokio::spawn(async move {
            let mut conn = transport.accept().await.unwrap();
            let text = conn.recv().await.unwrap().unwrap();
            conn.send(text).await.unwrap();
            conn.recv().await.unwrap()
        });

        let mut client = connect(&url, 64 * 1024).await.unwrap();
        client.send(r#"{"event":"echo","data":[1]}"#.to_string()).await.unwrap();
        let echoed = client.recv().await.unwrap();
        assert_eq!(echoed.as_deref(), Some(r#"{"event":"echo","data":[1]}"#));

        client.close("done").await.unwrap();
        assert!(!client.is_open());
        assert_eq!(server.await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_oversized_message_dropped() {
        let transport = WebSocketTransport::new(WebSocketConfig {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            max_message_size: 16,
        })
        .await
        .unwrap();
        let url = format!("ws://{}", transport.local_addr().unwrap());

        let server = tokio::spawn(async move {
            let mut conn = transport.accept().await.unwrap();
            conn.recv().await.unwrap()
        });

        let mut client = connect(&url, 64 * 1024).await.unwrap();
        client.send("x".repeat(64)).await.unwrap();
        client.send("small".to_string()).await.unwrap();

        assert_eq!(server.await.unwrap().as_deref(), Some("small"));
    }

    #[tokio::test]
    async fn test_ping_answered_by_single_pong() {
        let transport = WebSocketTransport::bind(SocketAddr::from(([127, 0, 0, 1], 0)))
            .await
            .unwrap();
        let url = format!("ws://{}", transport.local_addr().unwrap());

        let server = tokio::spawn(async move {
            let mut conn = transport.accept().await.unwrap();
            let text = conn.recv().await.unwrap();
            conn.send("reply".to_string()).await.unwrap();
            text
        });

        let (mut peer, _) = connect_async(&url).await.unwrap();
        peer.send(Message::Ping(b"hb".to_vec())).await.unwrap();
        peer.send(Message::Text("after".to_string())).await.unwrap();

        assert_eq!(server.await.unwrap().as_deref(), Some("after"));
        assert_eq!(
            peer.next().await.unwrap().unwrap(),
            Message::Pong(b"hb".to_vec())
        );
        assert_eq!(
            peer.next().await.unwrap().unwrap(),
            Message::Text("reply".to_string())
        );
    }
}
