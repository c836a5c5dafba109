//! Transport abstraction traits for Ripple.
//!
//! A transport delivers whole text messages in order over one duplex
//! connection. Framing, the handshake and keepalive at the protocol level
//! belong to the implementation.

use async_trait::async_trait;
use thiserror::Error;

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection was closed.
    #[error("Connection closed")]
    ConnectionClosed,

    /// The opening handshake failed.
    #[error("Handshake failed: {0}")]
    Handshake(String),

    /// Failed to send data.
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// Failed to receive data.
    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A transport that can accept connections.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Accept a new connection.
    ///
    /// This method waits until a new connection is available or an error occurs.
    async fn accept(&self) -> Result<Box<dyn Connection>, TransportError>;

    /// Get the transport name (e.g., "websocket").
    fn name(&self) -> &'static str;
}

/// An active duplex connection.
#[async_trait]
pub trait Connection: Send {
    /// Receive the next text message.
    ///
    /// Returns `None` if the connection was closed cleanly. Messages that
    /// cannot be carried as text are dropped by the implementation.
    async fn recv(&mut self) -> Result<Option<String>, TransportError>;

    /// Send one text message.
    async fn send(&mut self, text: String) -> Result<(), TransportError>;

    /// Close the connection gracefully with a reason.
    async fn close(&mut self, reason: &str) -> Result<(), TransportError>;

    /// Get the remote address of the connection, if available.
    fn remote_addr(&self) -> Option<String> {
        None
    }

    /// Reason the peer gave when it closed the connection, if any.
    fn peer_close_reason(&self) -> Option<&str> {
        None
    }

    /// Check if the connection is still open.
    fn is_open(&self) -> bool;
}

/// Maximum length of a WebSocket close reason in bytes.
pub(crate) const MAX_CLOSE_REASON: usize = 123;

/// Truncate a close reason to fit a close frame.
pub(crate) fn close_reason(reason: &str) -> String {
    let mut end = reason.len().min(MAX_CLOSE_REASON);
    while !reason.is_char_boundary(end) {
        end -= 1;
    }
    reason[..end].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_close_reason_truncation() {
        assert_eq!(close_reason("client disconnected"), "client disconnected");

        let long = "\u{e9}".repeat(100);
        let truncated = close_reason(&long);
        assert!(truncated.len() <= MAX_CLOSE_REASON);
        assert!(truncated.chars().all(|c| c == '\u{e9}'));
    }
}
