//! JSON wire protocol spoken between session clients and the relay.
//!
//! Every frame is a JSON object carrying a `type` discriminator. Binary
//! payloads (snapshots, update fragments, awareness updates) travel as
//! standard base64 text fields:
//! ```text
//! {"type":"request_sync"}
//! {"type":"sync","ydoc_b64":"AQLkz..."}
//! {"type":"update","update_b64":"AQHx..."}
//! {"type":"ping","timestamp":1718000000000}
//! ```
//!
//! The relay fans frames out to the other peers of a room; it never
//! reorders frames on a single connection.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Close code sent by the relay when it evicts every peer of a room
/// (for example after the backing project data was replaced).
pub const EVICTION_CLOSE_CODE: u16 = 4000;
/// Close code for anonymous connections without a valid share credential.
pub const ANONYMOUS_REJECTED_CLOSE_CODE: u16 = 4001;
/// Close code for authenticated users that are not members of the group.
pub const NOT_A_MEMBER_CLOSE_CODE: u16 = 4003;

/// One connected user as reported by the relay roster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RosterUser {
    pub id: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub color: String,
    #[serde(rename = "colorLight", default)]
    pub color_light: String,
}

impl RosterUser {
    /// Display name derived from the email local part (`"Guest"` when empty).
    pub fn display_name(&self) -> String {
        match self.email.split('@').next() {
            Some(local) if !local.is_empty() => local.to_string(),
            _ => "Guest".to_string(),
        }
    }
}

/// Chat payload. Outbound frames only carry `message`; the relay stamps
/// the sender metadata before fanning it out.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ChatMessage {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    /// Seconds since the epoch, as stamped by the relay.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<f64>,
}

/// Voice-call signaling envelope. The payload is opaque to the core.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct VoiceSignal {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_user: Option<String>,
    #[serde(default)]
    pub signal_data: Value,
}

/// Top-level protocol frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WireMessage {
    /// Ask the relay for the bootstrap state of the room.
    RequestSync,
    /// Full-state snapshot of the room document.
    Sync { ydoc_b64: String },
    /// Literal content for a room that has no replicated state yet.
    Initial {
        #[serde(default)]
        content: String,
    },
    /// Incremental update fragment.
    Update { update_b64: String },
    /// Encoded awareness entries.
    Awareness { update_b64: String },
    /// Drop every awareness entry owned by `user_id`.
    RemoveAwareness { user_id: String },
    /// Full roster of connected users.
    Connection {
        #[serde(default)]
        users: Vec<RosterUser>,
    },
    ChatMessage(ChatMessage),
    VoiceRoomUpdate {
        #[serde(default)]
        participants: Vec<Value>,
    },
    VoiceSignal(VoiceSignal),
    JoinVoice,
    LeaveVoice,
    /// Round-trip probe; the relay echoes `timestamp` unmodified.
    Ping { timestamp: u64 },
    Pong { timestamp: u64 },
    /// Relay-side rejection of a single frame.
    Error {
        #[serde(default)]
        message: String,
    },
}

impl WireMessage {
    pub fn sync(snapshot: &[u8]) -> Self {
        Self::Sync {
            ydoc_b64: encode_b64(snapshot),
        }
    }

    pub fn update(fragment: &[u8]) -> Self {
        Self::Update {
            update_b64: encode_b64(fragment),
        }
    }

    pub fn awareness(update: &[u8]) -> Self {
        Self::Awareness {
            update_b64: encode_b64(update),
        }
    }

    /// The `type` discriminator, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::RequestSync => "request_sync",
            Self::Sync { .. } => "sync",
            Self::Initial { .. } => "initial",
            Self::Update { .. } => "update",
            Self::Awareness { .. } => "awareness",
            Self::RemoveAwareness { .. } => "remove_awareness",
            Self::Connection { .. } => "connection",
            Self::ChatMessage(_) => "chat_message",
            Self::VoiceRoomUpdate { .. } => "voice_room_update",
            Self::VoiceSignal(_) => "voice_signal",
            Self::JoinVoice => "join_voice",
            Self::LeaveVoice => "leave_voice",
            Self::Ping { .. } => "ping",
            Self::Pong { .. } => "pong",
            Self::Error { .. } => "error",
        }
    }

    /// Serialize to a JSON text frame.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Deserialize from a JSON text frame.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }
}

pub fn encode_b64(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

pub fn decode_b64(text: &str) -> Result<Vec<u8>, ProtocolError> {
    Ok(STANDARD.decode(text)?)
}

/// Protocol errors.
#[derive(Debug, Clone, Error)]
pub enum ProtocolError {
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("invalid base64 payload: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("invalid binary payload: {0}")]
    Payload(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_unit_variant_discriminator() {
        let encoded = WireMessage::RequestSync.encode().unwrap();
        assert_eq!(encoded, r#"{"type":"request_sync"}"#);
    }

    #[test]
    fn test_update_payload_is_base64() {
        let msg = WireMessage::update(&[1, 2, 3, 250]);
        let value: Value = serde_json::from_str(&msg.encode().unwrap()).unwrap();
        assert_eq!(value["type"], "update");
        assert_eq!(value["update_b64"], "AQID+g==");
    }

    #[test]
    fn test_decode_connection_roster() {
        let text = json!({
            "type": "connection",
            "users": [
                {
                    "id": "7",
                    "email": "ada@example.com",
                    "color": "#30bced",
                    "colorLight": "#30bced33"
                },
                {
                    "id": "anon_SwiftFalcon",
                    "email": "SwiftFalcon",
                    "color": "#6eeb83",
                    "colorLight": "#6eeb8333"
                }
            ]
        })
        .to_string();

        match WireMessage::decode(&text).unwrap() {
            WireMessage::Connection { users } => {
                assert_eq!(users.len(), 2);
                assert_eq!(users[0].color_light, "#30bced33");
                assert_eq!(users[0].display_name(), "ada");
                assert_eq!(users[1].id, "anon_SwiftFalcon");
            }
            other => panic!("Expected connection, got {other:?}"),
        }
    }

    #[test]
    fn test_display_name_falls_back_to_guest() {
        let user = RosterUser {
            id: "1".into(),
            email: String::new(),
            color: String::new(),
            color_light: String::new(),
        };
        assert_eq!(user.display_name(), "Guest");
    }

    #[test]
    fn test_decode_inbound_chat() {
        let text = json!({
            "type": "chat_message",
            "message": "hi",
            "user_id": "3",
            "user_email": "bo@x.io",
            "color": "#fff",
            "timestamp": 12.5
        })
        .to_string();
        match WireMessage::decode(&text).unwrap() {
            WireMessage::ChatMessage(chat) => {
                assert_eq!(chat.message, "hi");
                assert_eq!(chat.user_id.as_deref(), Some("3"));
                assert_eq!(chat.timestamp, Some(12.5));
            }
            other => panic!("Expected chat, got {other:?}"),
        }
    }

    #[test]
    fn test_outbound_chat_omits_relay_fields() {
        let msg = WireMessage::ChatMessage(ChatMessage {
            message: "hello".into(),
            ..ChatMessage::default()
        });
        assert_eq!(
            msg.encode().unwrap(),
            r#"{"type":"chat_message","message":"hello"}"#
        );
    }

    #[test]
    fn test_initial_without_content() {
        let msg = WireMessage::decode(r#"{"type":"initial"}"#).unwrap();
        assert_eq!(
            msg,
            WireMessage::Initial {
                content: String::new()
            }
        );
    }

    #[test]
    fn test_pong_timestamp_verbatim() {
        let msg = WireMessage::decode(r#"{"type":"pong","timestamp":1718000000123}"#).unwrap();
        assert_eq!(
            msg,
            WireMessage::Pong {
                timestamp: 1_718_000_000_123
            }
        );
    }

    #[test]
    fn test_voice_signal_payload_untouched() {
        let text = json!({
            "type": "voice_signal",
            "from_user": "4",
            "signal_data": {"sdp": "v=0", "kind": "offer"}
        })
        .to_string();
        match WireMessage::decode(&text).unwrap() {
            WireMessage::VoiceSignal(signal) => {
                assert_eq!(signal.from_user.as_deref(), Some("4"));
                assert_eq!(signal.signal_data["kind"], "offer");
            }
            other => panic!("Expected voice signal, got {other:?}"),
        }
    }

    #[test]
    fn test_unknown_type_is_error() {
        assert!(WireMessage::decode(r#"{"type":"teleport"}"#).is_err());
    }

    #[test]
    fn test_missing_required_field_is_error() {
        assert!(WireMessage::decode(r#"{"type":"update"}"#).is_err());
        assert!(WireMessage::decode("not json").is_err());
    }

    #[test]
    fn test_decode_b64_rejects_garbage() {
        assert!(matches!(
            decode_b64("%%%"),
            Err(ProtocolError::Base64(_))
        ));
        assert_eq!(decode_b64("AQID").unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn test_kind_matches_discriminator() {
        let messages = vec![
            WireMessage::RequestSync,
            WireMessage::sync(&[1]),
            WireMessage::awareness(&[2]),
            WireMessage::RemoveAwareness { user_id: "1".into() },
            WireMessage::JoinVoice,
            WireMessage::Ping { timestamp: 1 },
        ];
        for msg in messages {
            let value: Value = serde_json::from_str(&msg.encode().unwrap()).unwrap();
            assert_eq!(value["type"], msg.kind());
        }
    }
}
