//! Wire message schema (C1): `u32 length (big-endian) || JSON body`.
use serde::{Deserialize, Serialize};

/// Message kinds exchanged between nodes.
///
/// An unrecognized `type` string fails to deserialize into this enum, which
/// is exactly the "unknown types must be dropped" rule from the design doc:
/// [`crate::connection::Connection::read_message`] treats the resulting
/// decode error as a dropped frame rather than a fatal one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MessageType {
    Request,
    Reply,
    Election,
    Answer,
    Coordinator,
    Heartbeat,
}

/// A single frame's JSON body.
///
/// `timestamp` doubles as the Lamport clock value for every message, and as
/// the request's priority key (`request_clock`) for `REQUEST` specifically.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub sender: u32,
    #[serde(rename = "type")]
    pub kind: MessageType,
    pub timestamp: u64,
}

impl Message {
    pub fn new(sender: u32, kind: MessageType, timestamp: u64) -> Self {
        Self {
            sender,
            kind,
            timestamp,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_json() {
        let msg = Message::new(2, MessageType::Request, 17);
        let encoded = serde_json::to_vec(&msg).unwrap();
        let decoded: Message = serde_json::from_slice(&encoded).unwrap();
        assert_eq!(decoded.sender, 2);
        assert_eq!(decoded.kind, MessageType::Request);
        assert_eq!(decoded.timestamp, 17);
    }

    #[test]
    fn serializes_type_as_uppercase_tag() {
        let msg = Message::new(1, MessageType::Heartbeat, 1);
        let encoded = serde_json::to_string(&msg).unwrap();
        assert!(encoded.contains("\"type\":\"HEARTBEAT\""));
    }

    #[test]
    fn unknown_type_fails_to_parse() {
        let raw = r#"{"sender":1,"type":"BOGUS","timestamp":1}"#;
        let result: Result<Message, _> = serde_json::from_str(raw);
        assert!(result.is_err());
    }
}
