//! Connections handed over by an HTTP upgrade.
//!
//! The upgrade handshake itself is done by axum; this wraps the resulting
//! WebSocket as a [`Connection`].

use crate::traits::{close_reason, Connection, TransportError};
use async_trait::async_trait;
use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket};
use ripple_protocol::codec::MAX_FRAME_SIZE;
use std::net::SocketAddr;
use tracing::{debug, warn};

/// A WebSocket accepted through `axum`'s `WebSocketUpgrade`.
pub struct UpgradedConnection {
    socket: WebSocket,
    remote_addr: Option<SocketAddr>,
    is_open: bool,
    peer_reason: Option<String>,
    max_message_size: usize,
}

impl UpgradedConnection {
    /// Wrap an upgraded WebSocket.
    #[must_use]
    pub fn new(
        socket: WebSocket,
        remote_addr: Option<SocketAddr>,
        max_message_size: usize,
    ) -> Self {
        Self {
            socket,
            remote_addr,
            is_open: true,
            peer_reason: None,
            max_message_size: max_message_size.min(MAX_FRAME_SIZE),
        }
    }
}

#[async_trait]
impl Connection for UpgradedConnection {
    async fn recv(&mut self) -> Result<Option<String>, TransportError> {
        loop {
            match self.socket.recv().await {
                Some(Ok(Message::Text(text))) => {
                    if text.len() > self.max_message_size {
                        warn!(
                            size = text.len(),
                            max = self.max_message_size,
                            "Dropping oversized message"
                        );
                        continue;
                    }
                    return Ok(Some(text));
                }
                Some(Ok(Message::Binary(data))) => {
                    if data.len() > self.max_message_size {
                        warn!(
                            size = data.len(),
                            max = self.max_message_size,
                            "Dropping oversized message"
                        );
                        continue;
                    }
                    match String::from_utf8(data) {
                        Ok(text) => return Ok(Some(text)),
                        Err(_) => warn!("Dropping non-UTF-8 binary message"),
                    }
                }
                // axum answers protocol pings itself
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                Some(Ok(Message::Close(frame))) => {
                    debug!(frame = ?frame, "Received close frame");
                    self.peer_reason = frame
                        .map(|f| f.reason.to_string())
                        .filter(|reason| !reason.is_empty());
                    self.is_open = false;
                    return Ok(None);
                }
                Some(Err(e)) => {
                    self.is_open = false;
                    return Err(TransportError::ReceiveFailed(e.to_string()));
                }
                None => {
                    self.is_open = false;
                    return Ok(None);
                }
            }
        }
    }

    async fn send(&mut self, text: String) -> Result<(), TransportError> {
        if !self.is_open {
            return Err(TransportError::ConnectionClosed);
        }
        self.socket
            .send(Message::Text(text))
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    async fn close(&mut self, reason: &str) -> Result<(), TransportError> {
        if !std::mem::replace(&mut self.is_open, false) {
            return Ok(());
        }
        let frame = CloseFrame {
            code: close_code::NORMAL,
            reason: close_reason(reason).into(),
        };
        self.socket
            .send(Message::Close(Some(frame)))
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    fn remote_addr(&self) -> Option<String> {
        self.remote_addr.map(|addr| addr.to_string())
    }

    fn peer_close_reason(&self) -> Option<&str> {
        self.peer_reason.as_deref()
    }

    fn is_open(&self) -> bool {
        self.is_open
    }
}
