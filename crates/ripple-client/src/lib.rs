//! # ripple-client
//!
//! Peer-side implementation of the Ripple event protocol over WebSocket.
//!
//! ```rust,ignore
//! use ripple_client::Client;
//! use serde_json::json;
//!
//! let client = Client::new("ws://127.0.0.1:3000/ws");
//! client.on("message", |args, _ack| {
//!     println!("{args:?}");
//!     Ok(())
//! });
//! client.connect().await?;
//!
//! let room = client.request("join", vec![json!("lobby"), json!("alice")]).await?;
//! ```

mod client;

pub use client::{Client, ClientConfig, ClientError, CLOSE_REASON};
pub use ripple_core::{AckResponder, Args, HandlerResult};
