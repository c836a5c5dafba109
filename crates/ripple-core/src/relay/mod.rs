//! Cross-process broadcast relay.
//!
//! Several server processes each own a [`RoomRegistry`](crate::RoomRegistry).
//! The [`RelayAdapter`] publishes every broadcast to a pub/sub [`Bus`] and
//! delivers to local connections only when the message comes back from the
//! bus, so every process (the origin included) sees each broadcast exactly
//! once.

mod adapter;
mod memory;
#[cfg(feature = "redis")]
mod redis;

pub use adapter::{RelayAdapter, RelayConfig, RelayStats};
pub use memory::MemoryBus;
#[cfg(feature = "redis")]
pub use self::redis::RedisBus;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use thiserror::Error;

/// Bus errors.
#[derive(Debug, Error)]
pub enum BusError {
    /// The bus cannot be reached. A failed publish was not accepted.
    #[error("Bus unavailable: {0}")]
    Unavailable(String),

    /// The publish was sent but never confirmed; it may still be delivered.
    #[error("Publish unconfirmed: {0}")]
    Unconfirmed(String),
}

/// One message received from the bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusEvent {
    /// Channel the message was published on.
    pub channel: String,
    /// Raw payload.
    pub payload: String,
}

/// Stream of bus messages. It ends (or yields an error) when the
/// subscription is lost.
pub type BusStream = BoxStream<'static, Result<BusEvent, BusError>>;

/// An external publish/subscribe message bus.
#[async_trait]
pub trait Bus: Send + Sync + 'static {
    /// Publish a payload on a channel.
    async fn publish(&self, channel: &str, payload: String) -> Result<(), BusError>;

    /// Open a subscription on channel patterns (trailing `*` wildcard).
    async fn subscribe(&self, patterns: &[&str]) -> Result<BusStream, BusError>;

    /// Get the bus name (e.g., "memory", "redis").
    fn name(&self) -> &'static str;
}
