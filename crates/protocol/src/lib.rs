//! Signal envelope types and the text-frame codec for the room relay.
//!
//! Wire shape is always `{type, data}`; `data`'s shape depends on `type`.
//! Serde's adjacently-tagged representation (`tag = "type", content = "data"`)
//! maps onto this directly.

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub mod error;

pub use error::RelayError;

/// The identity+metadata a peer advertises on join. Stored verbatim, never
/// mutated by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientDescriptor {
    #[serde(rename = "clientId")]
    pub client_id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
    #[serde(rename = "createdAt")]
    pub created_at: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resume: Option<bool>,
}

impl ClientDescriptor {
    pub fn is_resume(&self) -> bool {
        self.resume.unwrap_or(false)
    }
}

/// Point-to-point signaling payload. Arbitrary extra fields (SDP, ICE
/// candidates, application payload) pass through untouched via `extra`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessagePayload {
    #[serde(rename = "clientId")]
    pub client_id: String,
    #[serde(rename = "targetClientId")]
    pub target_client_id: String,
    #[serde(rename = "sessionId")]
    pub session_id: String,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

/// The discriminated union of all signal envelope subtypes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "lowercase")]
pub enum Signal {
    /// Server -> client, once after upgrade. Carries the room's stored
    /// password hash, or `null` if the room was created without one.
    Connected(Option<String>),
    Join(ClientDescriptor),
    Leave(ClientDescriptor),
    Message(MessagePayload),
    /// Server -> client liveness probe. No data.
    Ping,
    /// Client -> server liveness reply. No data.
    Pong,
}

impl Signal {
    pub fn type_name(&self) -> &'static str {
        match self {
            Signal::Connected(_) => "connected",
            Signal::Join(_) => "join",
            Signal::Leave(_) => "leave",
            Signal::Message(_) => "message",
            Signal::Ping => "ping",
            Signal::Pong => "pong",
        }
    }
}

const KNOWN_TYPES: &[&str] = &["connected", "join", "leave", "message", "ping", "pong"];

/// Decode a text frame into a [`Signal`].
///
/// Distinguishes a non-JSON/missing-`type` frame (`MalformedFrame`) from a
/// well-formed envelope carrying an unrecognized `type` (`UnknownSignalType`),
/// per the codec's error taxonomy. Neither closes the session; the caller
/// logs and drops.
pub fn decode(text: &str) -> Result<Signal, RelayError> {
    let value: Value = serde_json::from_str(text)
        .map_err(|e| RelayError::MalformedFrame(format!("invalid JSON: {e}")))?;

    let type_name = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| RelayError::MalformedFrame("missing \"type\" field".into()))?;

    if !KNOWN_TYPES.contains(&type_name) {
        return Err(RelayError::UnknownSignalType(type_name.to_string()));
    }

    serde_json::from_value(value)
        .map_err(|e| RelayError::MalformedFrame(format!("bad \"data\" for {type_name}: {e}")))
}

/// Encode a [`Signal`] to its wire text frame.
pub fn encode(signal: &Signal) -> String {
    // A `Signal` always serializes to a JSON object; building it by hand
    // would only duplicate the enum's own tagging rules.
    serde_json::to_string(signal).unwrap_or_else(|_| "{}".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_join() {
        let text = r#"{"type":"join","data":{"clientId":"a","name":"A","createdAt":1}}"#;
        let signal = decode(text).expect("should decode");
        match signal {
            Signal::Join(desc) => {
                assert_eq!(desc.client_id, "a");
                assert_eq!(desc.name, "A");
                assert!(!desc.is_resume());
            },
            other => panic!("expected Join, got {other:?}"),
        }
    }

    #[test]
    fn decodes_resume_join() {
        let text = r#"{"type":"join","data":{"clientId":"b","name":"B","createdAt":2,"resume":true}}"#;
        let signal = decode(text).expect("should decode");
        match signal {
            Signal::Join(desc) => assert!(desc.is_resume()),
            other => panic!("expected Join, got {other:?}"),
        }
    }

    #[test]
    fn decodes_ping_pong_without_data() {
        assert!(matches!(decode(r#"{"type":"ping"}"#), Ok(Signal::Ping)));
        assert!(matches!(decode(r#"{"type":"pong"}"#), Ok(Signal::Pong)));
    }

    #[test]
    fn decodes_message_with_extra_payload_fields() {
        let text = r#"{"type":"message","data":{"clientId":"b","targetClientId":"a","sessionId":"s1","payload":"hi"}}"#;
        let signal = decode(text).expect("should decode");
        match signal {
            Signal::Message(payload) => {
                assert_eq!(payload.target_client_id, "a");
                assert_eq!(payload.extra.get("payload").and_then(Value::as_str), Some("hi"));
            },
            other => panic!("expected Message, got {other:?}"),
        }
    }

    #[test]
    fn rejects_non_json() {
        assert!(matches!(decode("not json"), Err(RelayError::MalformedFrame(_))));
    }

    #[test]
    fn rejects_missing_type() {
        assert!(matches!(decode(r#"{"data":1}"#), Err(RelayError::MalformedFrame(_))));
    }

    #[test]
    fn rejects_unknown_type() {
        assert!(matches!(
            decode(r#"{"type":"bogus"}"#),
            Err(RelayError::UnknownSignalType(t)) if t == "bogus"
        ));
    }

    #[test]
    fn round_trips_connected_null() {
        let signal = Signal::Connected(None);
        let text = encode(&signal);
        assert_eq!(text, r#"{"type":"connected","data":null}"#);
    }
}
