//! # ripple-transport
//!
//! Duplex transports for the Ripple event socket.
//!
//! The core works on text messages; this crate moves them over a network:
//!
//! - **WebSocket** - standalone listener and client dialer (tokio-tungstenite)
//! - **Upgrade** - connections handed over by an axum WebSocket upgrade
//!
//! [`drive`] pumps one [`Connection`] against one [`Socket`](ripple_core::Socket)
//! until either side closes.
//!
//! ```rust,ignore
//! use ripple_transport::{drive, Transport};
//!
//! let mut conn = transport.accept().await?;
//! let (socket, outbound) = server.accept()?;
//! drive(conn.as_mut(), &socket, outbound, "client disconnected").await;
//! ```

pub mod bridge;
pub mod traits;
pub mod upgrade;

#[cfg(feature = "websocket")]
pub mod websocket;

pub use bridge::drive;
pub use traits::{Connection, Transport, TransportError};
pub use upgrade::UpgradedConnection;

#[cfg(feature = "websocket")]
pub use websocket::{connect, WebSocketConfig, WebSocketConnection, WebSocketTransport};
