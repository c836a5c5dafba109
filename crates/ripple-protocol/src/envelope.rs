//! Event envelopes for the Ripple protocol.
//!
//! An envelope carries an event name, an ordered argument list and an
//! optional acknowledgment correlation id. Argument order is preserved
//! end-to-end.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// Synthetic event sent by the server right after the handshake.
pub const CONNECT: &str = "connect";

/// Synthetic local-only event fired once when the transport closes.
pub const DISCONNECT: &str = "disconnect";

/// Synthetic local-only event fired on the client when the transport fails.
pub const ERROR: &str = "error";

/// Keepalive probe.
pub const PING: &str = "ping";

/// Keepalive response.
pub const PONG: &str = "pong";

/// How an event name is treated at the wire boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// Keepalive probe, answered immediately with [`PONG`].
    KeepaliveProbe,
    /// Keepalive response.
    KeepaliveResponse,
    /// Handshake announcement carrying the connection id.
    Connect,
    /// Reserved for local synthesis; never valid on the wire.
    LocalOnly,
    /// Application-defined event (or an ack reply).
    Application,
}

/// Classify an event name.
#[must_use]
pub fn classify(event: &str) -> EventKind {
    match event {
        PING => EventKind::KeepaliveProbe,
        PONG => EventKind::KeepaliveResponse,
        CONNECT => EventKind::Connect,
        DISCONNECT | ERROR => EventKind::LocalOnly,
        _ => EventKind::Application,
    }
}

/// The wire unit exchanged once per duplex message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Event name (or the ack id being answered).
    pub event: String,

    /// Ordered argument list.
    ///
    /// Older peers answer acks with a bare value or omit `data` entirely, so
    /// decoding accepts a scalar (wrapped into a one-element list) and
    /// `null`/absent (empty list).
    #[serde(default, deserialize_with = "lenient_args")]
    pub data: Vec<Value>,

    /// Correlation id the receiver should answer to.
    #[serde(rename = "ackId", default, skip_serializing_if = "Option::is_none")]
    pub ack_id: Option<String>,
}

fn lenient_args<'de, D>(deserializer: D) -> Result<Vec<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::Null => Vec::new(),
        Value::Array(items) => items,
        other => vec![other],
    })
}

impl Envelope {
    /// Create an envelope without an ack id.
    #[must_use]
    pub fn new(event: impl Into<String>, data: Vec<Value>) -> Self {
        Self {
            event: event.into(),
            data,
            ack_id: None,
        }
    }

    /// Create an envelope that asks the receiver to acknowledge it.
    #[must_use]
    pub fn with_ack(event: impl Into<String>, data: Vec<Value>, ack_id: impl Into<String>) -> Self {
        Self {
            event: event.into(),
            data,
            ack_id: Some(ack_id.into()),
        }
    }

    /// Create the reply to an envelope that carried `ack_id`.
    #[must_use]
    pub fn ack_reply(ack_id: impl Into<String>, data: Vec<Value>) -> Self {
        Self::new(ack_id, data)
    }

    /// Create a keepalive probe.
    #[must_use]
    pub fn ping() -> Self {
        Self::new(PING, Vec::new())
    }

    /// Create a keepalive response.
    #[must_use]
    pub fn pong() -> Self {
        Self::new(PONG, Vec::new())
    }

    /// Create the handshake announcement for a connection.
    #[must_use]
    pub fn connect(connection_id: &str) -> Self {
        Self::new(CONNECT, vec![serde_json::json!({ "id": connection_id })])
    }

    /// Classify this envelope's event name.
    #[must_use]
    pub fn kind(&self) -> EventKind {
        classify(&self.event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_classify() {
        assert_eq!(classify("ping"), EventKind::KeepaliveProbe);
        assert_eq!(classify("pong"), EventKind::KeepaliveResponse);
        assert_eq!(classify("connect"), EventKind::Connect);
        assert_eq!(classify("disconnect"), EventKind::LocalOnly);
        assert_eq!(classify("error"), EventKind::LocalOnly);
        assert_eq!(classify("chat"), EventKind::Application);
        assert_eq!(classify("ack_3"), EventKind::Application);
    }

    #[test]
    fn test_ack_id_omitted_when_absent() {
        let env = Envelope::new("chat", vec![json!("hi")]);
        let text = serde_json::to_string(&env).unwrap();
        assert_eq!(text, r#"{"event":"chat","data":["hi"]}"#);

        let env = Envelope::with_ack("chat", vec![json!("hi")], "ack_0");
        let text = serde_json::to_string(&env).unwrap();
        assert_eq!(text, r#"{"event":"chat","data":["hi"],"ackId":"ack_0"}"#);
    }

    #[test]
    fn test_lenient_data() {
        let env: Envelope = serde_json::from_str(r#"{"event":"ping"}"#).unwrap();
        assert!(env.data.is_empty());

        let env: Envelope = serde_json::from_str(r#"{"event":"ack_1","data":"ok"}"#).unwrap();
        assert_eq!(env.data, vec![json!("ok")]);

        let env: Envelope =
            serde_json::from_str(r#"{"event":"x","data":null,"ackId":null}"#).unwrap();
        assert!(env.data.is_empty());
        assert!(env.ack_id.is_none());
    }

    #[test]
    fn test_connect_payload() {
        let env = Envelope::connect("abc");
        assert_eq!(env.kind(), EventKind::Connect);
        assert_eq!(env.data, vec![json!({"id": "abc"})]);
    }
}
