//! JSON codec for envelopes and bus messages.
//!
//! Every duplex message carries exactly one envelope, so there is no length
//! prefix: a text frame is a complete JSON document.

use thiserror::Error;

use crate::bus::BusMessage;
use crate::envelope::{Envelope, EventKind};

/// Maximum encoded message size (16 MiB).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Protocol errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Message exceeds maximum size.
    #[error("Frame size {0} exceeds maximum {MAX_FRAME_SIZE}")]
    FrameTooLarge(usize),

    /// Malformed JSON or a field of the wrong type.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A reserved local-only event name arrived on the wire.
    #[error("Reserved event on the wire: {0}")]
    ReservedEvent(String),

    /// Structurally valid JSON that violates the protocol.
    #[error("Invalid message: {0}")]
    Invalid(String),
}

/// Encode an envelope to its wire text.
///
/// # Errors
///
/// Returns an error if the envelope is too large or encoding fails.
pub fn encode(envelope: &Envelope) -> Result<String, ProtocolError> {
    let text = serde_json::to_string(envelope)?;
    if text.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(text.len()));
    }
    Ok(text)
}

/// Decode and validate an inbound envelope.
///
/// # Errors
///
/// Returns an error if the text is too large, is not a valid envelope, names
/// no event, or uses a local-only reserved event name.
pub fn decode(raw: &str) -> Result<Envelope, ProtocolError> {
    if raw.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(raw.len()));
    }

    let envelope: Envelope = serde_json::from_str(raw)?;

    if envelope.event.is_empty() {
        return Err(ProtocolError::Invalid("empty event name".into()));
    }
    if envelope.kind() == EventKind::LocalOnly {
        return Err(ProtocolError::ReservedEvent(envelope.event));
    }
    if matches!(envelope.ack_id.as_deref(), Some("")) {
        return Err(ProtocolError::Invalid("empty ack id".into()));
    }

    Ok(envelope)
}

/// Encode a bus message.
///
/// # Errors
///
/// Returns an error if encoding fails.
pub fn encode_bus(message: &BusMessage) -> Result<String, ProtocolError> {
    Ok(serde_json::to_string(message)?)
}

/// Decode and validate a bus message.
///
/// # Errors
///
/// Returns an error if the payload is not a valid bus message.
pub fn decode_bus(raw: &str) -> Result<BusMessage, ProtocolError> {
    let message: BusMessage = serde_json::from_str(raw)?;

    if message.event_name.is_empty() {
        return Err(ProtocolError::Invalid("empty eventName".into()));
    }
    if matches!(message.room_id.as_deref(), Some("")) {
        return Err(ProtocolError::Invalid("empty roomId".into()));
    }

    Ok(message)
}
