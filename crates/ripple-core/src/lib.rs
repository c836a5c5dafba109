//! # ripple-core
//!
//! Core building blocks of the Ripple realtime engine.
//!
//! - **Socket** - wraps one duplex transport, routes named events to handlers
//!   and correlates acknowledgments
//! - **RoomRegistry** - connection/room membership and targeted fan-out
//! - **RelayAdapter** - relays broadcasts through a pub/sub [`Bus`] so several
//!   server processes share one room namespace
//! - **Server** - the per-process instance that owns all of the above
//!
//! ## Architecture
//!
//! ```text
//! transport ──▶ Socket::receive ──▶ handler / ack waiter
//!                                       │
//!                                       ▼
//!                                 RoomRegistry ◀── RelayAdapter ◀── Bus
//!                                       │               ▲
//!                                       ▼               │
//!                                 Socket::emit     broadcast()
//! ```
//!
//! The core never touches a network socket itself: a [`Socket`] writes
//! [`Outbound`] items into a channel and is fed raw text through
//! [`Socket::receive`]. The transport crate drives both ends.

mod ack;
pub mod backoff;
pub mod relay;
pub mod room;
pub mod server;
pub mod socket;

pub use backoff::Backoff;
pub use relay::{
    Bus, BusError, BusEvent, BusStream, MemoryBus, RelayAdapter, RelayConfig, RelayStats,
};
pub use room::{RoomConfig, RoomError, RoomRegistry, RoomStats};
pub use server::{Server, ServerConfig, ServerError, SHUTDOWN_REASON};
pub use socket::{
    AckError, AckResponder, Args, FallbackHandler, Handler, HandlerResult, Handlers, Outbound,
    OutboundRx, Socket, SocketError,
};

#[cfg(feature = "redis")]
pub use relay::RedisBus;
