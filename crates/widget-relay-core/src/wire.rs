//! Wire format for relay frames
//!
//! Every frame is a JSON object tagged by `type`. Parsing produces a closed
//! set of variants before anything is dispatched; frames that fail to parse
//! are the caller's to drop.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::RelayResult;
use crate::types::PeerId;

// ----------------------------------------------------------------------------
// Wire Messages
// ----------------------------------------------------------------------------

/// A frame exchanged with the relay endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum WireMessage {
    /// Authoritative full value of `name` for peer `uuid`
    Change {
        uuid: PeerId,
        name: String,
        #[serde(default)]
        value: Value,
    },
    /// Structural delta against the receiver's last known value
    Delta {
        uuid: PeerId,
        name: String,
        delta: Value,
    },
    /// A peer joined the channel
    Connect { uuid: PeerId },
    /// A peer left the channel
    Disconnect { uuid: PeerId },
}

impl WireMessage {
    /// Parse a text frame
    pub fn decode(frame: &str) -> RelayResult<Self> {
        Ok(serde_json::from_str(frame)?)
    }

    /// Serialize to a text frame
    pub fn encode(&self) -> RelayResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Peer the frame is about
    pub fn peer(&self) -> &PeerId {
        match self {
            WireMessage::Change { uuid, .. }
            | WireMessage::Delta { uuid, .. }
            | WireMessage::Connect { uuid }
            | WireMessage::Disconnect { uuid } => uuid,
        }
    }

    /// State name for `change`/`delta` frames
    pub fn state_name(&self) -> Option<&str> {
        match self {
            WireMessage::Change { name, .. } | WireMessage::Delta { name, .. } => Some(name),
            _ => None,
        }
    }

    /// Tag as it appears on the wire
    pub fn kind(&self) -> &'static str {
        match self {
            WireMessage::Change { .. } => "change",
            WireMessage::Delta { .. } => "delta",
            WireMessage::Connect { .. } => "connect",
            WireMessage::Disconnect { .. } => "disconnect",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_change_frame_layout() {
        let msg = WireMessage::Change {
            uuid: PeerId::new("L"),
            name: "pos".to_string(),
            value: json!({"x": 1}),
        };
        let encoded: Value = serde_json::from_str(&msg.encode().unwrap()).unwrap();
        assert_eq!(
            encoded,
            json!({"type": "change", "uuid": "L", "name": "pos", "value": {"x": 1}})
        );
    }

    #[test]
    fn test_decode_all_kinds() {
        let delta = WireMessage::decode(r#"{"type":"delta","uuid":"R","name":"pos","delta":{"x":[0,5]}}"#)
            .unwrap();
        assert_eq!(delta.kind(), "delta");
        assert_eq!(delta.state_name(), Some("pos"));

        let connect = WireMessage::decode(r#"{"type":"connect","uuid":"R"}"#).unwrap();
        assert_eq!(connect, WireMessage::Connect { uuid: PeerId::new("R") });

        let disconnect = WireMessage::decode(r#"{"type":"disconnect","uuid":"R"}"#).unwrap();
        assert_eq!(disconnect.peer().as_str(), "R");
        assert_eq!(disconnect.state_name(), None);
    }

    #[test]
    fn test_change_without_value_carries_null() {
        let msg = WireMessage::decode(r#"{"type":"change","uuid":"R","name":"pos"}"#).unwrap();
        assert_eq!(
            msg,
            WireMessage::Change {
                uuid: PeerId::new("R"),
                name: "pos".to_string(),
                value: Value::Null,
            }
        );
    }

    #[test]
    fn test_malformed_frames_are_rejected() {
        assert!(WireMessage::decode("not json").is_err());
        assert!(WireMessage::decode("[1,2,3]").is_err());
        assert!(WireMessage::decode("null").is_err());
        assert!(WireMessage::decode(r#"{"type":"hello","uuid":"R"}"#).is_err());
        assert!(WireMessage::decode(r#"{"type":"change","name":"pos"}"#).is_err());
    }
}
