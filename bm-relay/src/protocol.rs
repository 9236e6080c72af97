//! JSON wire protocol for the relay.
//!
//! Every WebSocket text frame carries an ordered batch of messages:
//! ```text
//! [ { "t": type, "r": room, "p": source, "d"?: destination, "v": value }, … ]
//! ```
//!
//! `v` is an opaque string. The relay only decodes it for the types it
//! interprets itself (poses, ranges, content, control requests); everything
//! else is forwarded byte for byte.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Message type names understood by the relay.
pub mod types {
    // Instant: forwarded, never stored.
    pub const CHAT_MESSAGE: &str = "m_chat";
    pub const PARTICIPANT_TRACKLIMITS: &str = "m_track_limits";
    pub const YARN_PHONE: &str = "YARN_PHONE";
    pub const CALL_REMOTE: &str = "call_remote";
    pub const LEFT_CONTENT_REMOVE_REQUEST: &str = "left_content_remove";

    // Stored: forwarded and kept for replay to late joiners.
    pub const PARTICIPANT_INFO: &str = "p_info";
    pub const PARTICIPANT_TRACKSTATES: &str = "p_trackstates";
    pub const AFK_CHANGED: &str = "afk_changed";
    pub const MAIN_SCREEN_CARRIER: &str = "main_screen_carrier";
    pub const MY_CONTENT: &str = "my_content";

    // Participant states: recorded, delivered by range.
    pub const PARTICIPANT_PHYSICS: &str = "p_physics";
    pub const PARTICIPANT_POSE: &str = "mp";
    pub const PARTICIPANT_MOUSE: &str = "mm";
    pub const PARTICIPANT_ON_STAGE: &str = "p_on_stage";

    // Content.
    pub const CONTENT_UPDATE_REQUEST: &str = "content_update";
    pub const CONTENT_INFO_UPDATE: &str = "content_info_update";
    pub const CONTENT_UPDATE_REQUEST_BY_ID: &str = "content_update_by_id";
    pub const CONTENT_REMOVE_REQUEST: &str = "content_remove";

    // Range exit notices.
    pub const PARTICIPANT_OUT: &str = "participant_out";
    pub const MOUSE_OUT: &str = "mouse_out";
    pub const CONTENT_OUT: &str = "content_out";

    // Control.
    pub const ROOM_PROP: &str = "room_prop";
    pub const REQUEST: &str = "request";
    pub const REQUEST_TO: &str = "request_to";
    pub const REQUEST_RANGE: &str = "req_range";
    pub const REQUEST_PARTICIPANT_STATES: &str = "req_p_states";
    pub const SET_PERIOD: &str = "set_period";
    pub const PARTICIPANT_LEFT: &str = "m_participant_left";
}

/// One relay message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Type tag.
    #[serde(default)]
    pub t: String,
    /// Room id. Cleared on outbound messages the room is implicit for.
    #[serde(default)]
    pub r: String,
    /// Source participant id. Empty for server-originated or anonymised relays.
    #[serde(default)]
    pub p: String,
    /// Destination participant id (absent = all other participants).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub d: Option<String>,
    /// Serialized payload.
    #[serde(default)]
    pub v: String,
}

impl Message {
    pub fn new(t: impl Into<String>, p: impl Into<String>, v: impl Into<String>) -> Self {
        Self {
            t: t.into(),
            r: String::new(),
            p: p.into(),
            d: None,
            v: v.into(),
        }
    }

    /// Create a server-originated message (empty source).
    pub fn from_server(t: impl Into<String>, v: impl Into<String>) -> Self {
        Self::new(t, String::new(), v)
    }

    /// Create a message whose value is `value` JSON-encoded.
    pub fn with_json<T: Serialize + ?Sized>(
        t: impl Into<String>,
        p: impl Into<String>,
        value: &T,
    ) -> Result<Self, ProtocolError> {
        let v = serde_json::to_string(value)
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))?;
        Ok(Self::new(t, p, v))
    }

    /// Check the fields every inbound message must carry.
    pub fn validate(&self) -> Result<(), ProtocolError> {
        if self.t.is_empty() {
            return Err(ProtocolError::MissingField("t"));
        }
        if self.r.is_empty() {
            return Err(ProtocolError::MissingField("r"));
        }
        if self.p.is_empty() {
            return Err(ProtocolError::MissingField("p"));
        }
        Ok(())
    }

    /// Decode the JSON payload as `T`.
    pub fn payload<T: DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        serde_json::from_str(&self.v).map_err(|e| ProtocolError::InvalidPayload {
            msg_type: self.t.clone(),
            reason: e.to_string(),
        })
    }
}

/// Inbound frames may hold a single message or a batch.
#[derive(Deserialize)]
#[serde(untagged)]
enum Inbound {
    Batch(Vec<Message>),
    Single(Message),
}

/// Decode one text frame into its ordered batch.
pub fn decode_batch(text: &str) -> Result<Vec<Message>, ProtocolError> {
    let inbound: Inbound = serde_json::from_str(text)
        .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
    Ok(match inbound {
        Inbound::Batch(batch) => batch,
        Inbound::Single(msg) => vec![msg],
    })
}

/// Encode an ordered batch into one text frame.
pub fn encode_batch(batch: &[Message]) -> Result<String, ProtocolError> {
    serde_json::to_string(batch).map_err(|e| ProtocolError::SerializationError(e.to_string()))
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    SerializationError(String),
    #[error("Deserialization error: {0}")]
    DeserializationError(String),
    #[error("Message is missing required field '{0}'")]
    MissingField(&'static str),
    #[error("Invalid payload for '{msg_type}': {reason}")]
    InvalidPayload { msg_type: String, reason: String },
    #[error("Unknown message type '{0}'")]
    UnknownType(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_single_message() {
        let batch = decode_batch(r#"{"t":"m_chat","r":"room","p":"alice","v":"\"hi\""}"#).unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].t, "m_chat");
        assert_eq!(batch[0].r, "room");
        assert_eq!(batch[0].p, "alice");
        assert_eq!(batch[0].d, None);
        assert_eq!(batch[0].v, "\"hi\"");
    }

    #[test]
    fn test_decode_batch_preserves_order() {
        let text = r#"[
            {"t":"mp","r":"r1","p":"a","v":"[1,2]"},
            {"t":"m_chat","r":"r1","p":"a","d":"b","v":"\"x\""}
        ]"#;
        let batch = decode_batch(text).unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].t, "mp");
        assert_eq!(batch[1].d.as_deref(), Some("b"));
    }

    #[test]
    fn test_decode_garbage_fails() {
        assert!(matches!(
            decode_batch("not json"),
            Err(ProtocolError::DeserializationError(_))
        ));
    }

    #[test]
    fn test_encode_omits_missing_destination() {
        let text = encode_batch(&[Message::new("m_chat", "a", "1")]).unwrap();
        assert!(!text.contains("\"d\""));
        assert!(text.starts_with('['));
    }

    #[test]
    fn test_validate_missing_fields() {
        let mut msg = Message::new("m_chat", "a", "");
        assert_eq!(msg.validate(), Err(ProtocolError::MissingField("r")));
        msg.r = "room".into();
        assert!(msg.validate().is_ok());
        msg.p.clear();
        assert_eq!(msg.validate(), Err(ProtocolError::MissingField("p")));
        msg.p = "a".into();
        msg.t.clear();
        assert_eq!(msg.validate(), Err(ProtocolError::MissingField("t")));
    }

    #[test]
    fn test_payload_decode() {
        let msg = Message::new(types::REQUEST_TO, "a", r#"["b","c"]"#);
        let ids: Vec<String> = msg.payload().unwrap();
        assert_eq!(ids, vec!["b", "c"]);

        let bad = Message::new(types::SET_PERIOD, "a", "{");
        assert!(matches!(
            bad.payload::<f64>(),
            Err(ProtocolError::InvalidPayload { .. })
        ));
    }

    #[test]
    fn test_with_json() {
        let msg = Message::with_json(types::CONTENT_OUT, "", &["c1", "c2"]).unwrap();
        assert_eq!(msg.v, r#"["c1","c2"]"#);
        assert!(msg.p.is_empty());
    }
}
