//! Messages relayed between server processes over the pub/sub bus.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Bus channel for global broadcasts.
pub const ALL_CHANNEL: &str = "all";

/// Prefix of room-scoped bus channels.
pub const ROOM_CHANNEL_PREFIX: &str = "room:";

/// Patterns a relay subscriber listens on; together they cover both channel forms.
pub const SUBSCRIBE_PATTERNS: [&str; 2] = ["room:*", ALL_CHANNEL];

/// A broadcast relayed through the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BusMessage {
    /// Event name delivered to the recipients.
    pub event_name: String,
    /// Ordered argument list.
    #[serde(default)]
    pub data: Vec<Value>,
    /// Target room; absent for a global broadcast.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_id: Option<String>,
    /// Connection that must not receive the broadcast (usually the sender).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub except_id: Option<String>,
}

impl BusMessage {
    /// Create a broadcast to every connection.
    #[must_use]
    pub fn to_all(event_name: impl Into<String>, data: Vec<Value>) -> Self {
        Self {
            event_name: event_name.into(),
            data,
            room_id: None,
            except_id: None,
        }
    }

    /// Create a broadcast to one room.
    #[must_use]
    pub fn to_room(
        room_id: impl Into<String>,
        event_name: impl Into<String>,
        data: Vec<Value>,
    ) -> Self {
        Self {
            event_name: event_name.into(),
            data,
            room_id: Some(room_id.into()),
            except_id: None,
        }
    }

    /// Exclude one connection from delivery.
    #[must_use]
    pub fn except(mut self, connection_id: impl Into<String>) -> Self {
        self.except_id = Some(connection_id.into());
        self
    }

    /// The bus channel this message is published on.
    #[must_use]
    pub fn channel(&self) -> String {
        match &self.room_id {
            Some(room) => room_channel(room),
            None => ALL_CHANNEL.to_string(),
        }
    }
}

/// Bus channel name for a room.
#[must_use]
pub fn room_channel(room_id: &str) -> String {
    format!("{ROOM_CHANNEL_PREFIX}{room_id}")
}

/// Match a bus channel against a subscription pattern.
///
/// Only the trailing `*` wildcard is supported, which is all the relay uses.
#[must_use]
pub fn pattern_matches(pattern: &str, channel: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => channel.starts_with(prefix),
        None => pattern == channel,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_channel_naming() {
        assert_eq!(BusMessage::to_all("chat", vec![]).channel(), "all");
        assert_eq!(BusMessage::to_room("lobby", "chat", vec![]).channel(), "room:lobby");
    }

    #[test]
    fn test_wire_field_names() {
        let msg = BusMessage::to_room("lobby", "chat", vec![json!("hi")]).except("c1");
        let text = serde_json::to_string(&msg).unwrap();
        assert_eq!(
            text,
            r#"{"eventName":"chat","data":["hi"],"roomId":"lobby","exceptId":"c1"}"#
        );

        let global = serde_json::to_string(&BusMessage::to_all("chat", vec![])).unwrap();
        assert_eq!(global, r#"{"eventName":"chat","data":[]}"#);
    }

    #[test]
    fn test_pattern_matches() {
        assert!(SUBSCRIBE_PATTERNS.iter().any(|p| pattern_matches(p, "room:lobby")));
        assert!(SUBSCRIBE_PATTERNS.iter().any(|p| pattern_matches(p, "all")));
        assert!(!SUBSCRIBE_PATTERNS.iter().any(|p| pattern_matches(p, "allx")));
        assert!(!SUBSCRIBE_PATTERNS.iter().any(|p| pattern_matches(p, "metrics")));
        assert!(pattern_matches("*", "anything"));
    }
}
