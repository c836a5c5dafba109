//! # ripple-protocol
//!
//! Wire protocol definitions for the Ripple realtime event socket.
//!
//! Two payloads are defined here:
//!
//! - [`Envelope`] - the unit exchanged once per duplex message between peers:
//!   `{"event": string, "data": [...], "ackId": string?}`
//! - [`BusMessage`] - the unit relayed between server processes over the
//!   pub/sub bus: `{"eventName": string, "data": [...], "roomId": string?}`
//!
//! Acknowledgments reuse the generic envelope: replying to an envelope whose
//! `ackId` was `X` means sending a new envelope with `event = X`.
//!
//! ## Example
//!
//! ```rust
//! use ripple_protocol::{codec, Envelope};
//! use serde_json::json;
//!
//! let envelope = Envelope::with_ack("message", vec![json!("hi")], "ack_0");
//!
//! let encoded = codec::encode(&envelope).unwrap();
//! let decoded = codec::decode(&encoded).unwrap();
//! assert_eq!(envelope, decoded);
//! ```

pub mod bus;
pub mod codec;
pub mod envelope;

pub use bus::{BusMessage, ALL_CHANNEL, SUBSCRIBE_PATTERNS};
pub use codec::{decode, encode, ProtocolError};
pub use envelope::{classify, Envelope, EventKind};
