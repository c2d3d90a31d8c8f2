//! Message protocol definitions
//!
//! Every frame, in both directions, is a JSON envelope
//! `{ "type": ..., "payload": { ... }, "timestamp": <epoch ms> }`.
//! Serde's adjacently tagged enums map `type`/`payload` onto one variant
//! per message kind, so dispatch is an exhaustive match.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::AppError;
use crate::store::{Attachment, MessageKind, StoredMessage};
use crate::types::{now_millis, ConnId, MessageId, RoomId, UserId};

/// Envelope types a client may send
pub const INBOUND_TYPES: &[&str] = &[
    "presence",
    "join_room",
    "leave_room",
    "chat",
    "message_edit",
    "message_delete",
    "message_reaction",
    "typing",
    "webrtc",
    "call_end",
    "call_reject",
    "pong",
];

/// Online/offline status carried by presence frames
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceStatus {
    Online,
    Offline,
}

/// Payload of an inbound `presence` frame
#[derive(Debug, Clone, Deserialize)]
pub struct PresencePayload {
    pub user_id: UserId,
    #[serde(default)]
    pub username: Option<String>,
    pub status: PresenceStatus,
}

/// Payload of an inbound `chat` frame
#[derive(Debug, Clone, Deserialize)]
pub struct ChatPayload {
    pub room_id: RoomId,
    #[serde(default)]
    pub user_id: Option<UserId>,
    pub content: String,
    #[serde(default, rename = "type")]
    pub kind: MessageKind,
    #[serde(flatten)]
    pub attachment: Attachment,
}

/// WebRTC signaling sub-type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalKind {
    Offer,
    Answer,
    IceCandidate,
}

/// Offer/answer/ICE payload, relayed verbatim to the target user
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebRtcSignal {
    #[serde(rename = "type")]
    pub kind: SignalKind,
    pub from_user_id: UserId,
    pub to_user_id: UserId,
    #[serde(default)]
    pub data: Value,
}

/// Client → Server message
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Announce identity and online/offline status
    Presence(PresencePayload),
    /// Enter a room (leaving any previous one)
    JoinRoom { room_id: RoomId },
    /// Leave the current room
    LeaveRoom {},
    /// Send a chat message to the current room
    Chat(ChatPayload),
    /// Edit one of your own messages
    MessageEdit {
        message_id: MessageId,
        room_id: RoomId,
        content: String,
    },
    /// Delete one of your own messages
    MessageDelete {
        message_id: MessageId,
        room_id: RoomId,
    },
    /// React to a message (not persisted)
    MessageReaction {
        message_id: MessageId,
        room_id: RoomId,
        reaction: String,
    },
    /// Typing indicator started/stopped
    Typing { room_id: RoomId, is_typing: bool },
    /// Offer/answer/ICE candidate for a peer
    Webrtc(WebRtcSignal),
    /// Hang up any call the sender takes part in
    CallEnd {
        #[serde(default)]
        user_id: Option<UserId>,
    },
    /// Decline a pending call
    CallReject { caller_id: UserId },
    /// Heartbeat reply
    Pong {},
}

impl ClientMessage {
    /// Envelope type name, for logging
    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::Presence(_) => "presence",
            ClientMessage::JoinRoom { .. } => "join_room",
            ClientMessage::LeaveRoom {} => "leave_room",
            ClientMessage::Chat(_) => "chat",
            ClientMessage::MessageEdit { .. } => "message_edit",
            ClientMessage::MessageDelete { .. } => "message_delete",
            ClientMessage::MessageReaction { .. } => "message_reaction",
            ClientMessage::Typing { .. } => "typing",
            ClientMessage::Webrtc(_) => "webrtc",
            ClientMessage::CallEnd { .. } => "call_end",
            ClientMessage::CallReject { .. } => "call_reject",
            ClientMessage::Pong {} => "pong",
        }
    }
}

/// Inbound envelope before the payload is checked against its type
#[derive(Debug, Deserialize)]
struct RawEnvelope {
    #[serde(rename = "type")]
    kind: String,
    payload: Value,
}

/// Decode one inbound text frame
///
/// Malformed JSON or a non-object payload is `InvalidFormat`; an
/// unrecognized `type` is `UnknownType`; a recognized type whose payload
/// does not fit is `InvalidPayload`.
pub fn decode(text: &str) -> Result<ClientMessage, AppError> {
    let raw: RawEnvelope = serde_json::from_str(text).map_err(|_| AppError::InvalidFormat)?;

    if !raw.payload.is_object() {
        return Err(AppError::InvalidFormat);
    }
    if !INBOUND_TYPES.contains(&raw.kind.as_str()) {
        return Err(AppError::UnknownType(raw.kind));
    }

    let kind = raw.kind;
    serde_json::from_value(json!({ "type": kind, "payload": raw.payload })).map_err(|e| {
        AppError::InvalidPayload {
            kind,
            reason: e.to_string(),
        }
    })
}

/// Entry of the `online_users` snapshot
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OnlineUser {
    pub user_id: UserId,
    pub username: String,
    pub status: PresenceStatus,
}

/// Entry of a room roster
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RoomUser {
    pub user_id: UserId,
    pub username: String,
}

/// Chat message as fanned out to a room
#[derive(Debug, Clone, Serialize)]
pub struct ChatBroadcast {
    #[serde(flatten)]
    pub message: StoredMessage,
    pub username: String,
}

/// Server → Client message
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Connection accepted
    Connected {
        message: String,
        connection_id: ConnId,
        server_time: DateTime<Utc>,
    },
    /// A user came online or went offline
    Presence {
        user_id: UserId,
        username: String,
        status: PresenceStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        room_id: Option<RoomId>,
    },
    /// Snapshot of identified users, sent on identification
    OnlineUsers { users: Vec<OnlineUser> },
    /// Roster of a room
    RoomUsers { room_id: RoomId, users: Vec<RoomUser> },
    /// Join confirmation with the roster
    RoomJoined { room_id: RoomId, users: Vec<RoomUser> },
    /// Leave confirmation
    RoomLeft { room_id: RoomId },
    /// Someone entered the room
    UserJoined {
        user_id: UserId,
        username: String,
        room_id: RoomId,
    },
    /// Someone left the room
    UserLeft {
        user_id: UserId,
        username: String,
        room_id: RoomId,
    },
    /// Chat message (live or history replay)
    Chat(ChatBroadcast),
    /// Persist acknowledgment to the sender
    ChatSent { message_id: MessageId },
    MessageEdited {
        message_id: MessageId,
        room_id: RoomId,
        content: String,
        edited_at: DateTime<Utc>,
    },
    MessageDeleted {
        message_id: MessageId,
        room_id: RoomId,
    },
    MessageReaction {
        message_id: MessageId,
        room_id: RoomId,
        reaction: String,
        user_id: UserId,
        username: String,
    },
    /// Typing indicator of another room member
    Typing {
        room_id: RoomId,
        user_id: UserId,
        username: String,
        is_typing: bool,
    },
    /// Relayed signaling payload
    Webrtc(WebRtcSignal),
    IncomingCall {
        from_user_id: UserId,
        from_username: String,
    },
    CallActive {
        caller_id: UserId,
        callee_id: UserId,
    },
    CallEnded { ended_by: UserId, reason: String },
    CallRejected { rejected_by: UserId, username: String },
    /// Signaling target has no live connection
    WebrtcError { reason: String, to_user_id: UserId },
    /// Heartbeat probe
    Ping {},
    /// Error occurred
    Error { code: ErrorCode, message: String },
}

impl ServerMessage {
    /// Serialize into a wire envelope stamped with the current time
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        let mut value = serde_json::to_value(self)?;
        if let Value::Object(map) = &mut value {
            map.insert("timestamp".to_string(), Value::from(now_millis()));
        }
        serde_json::to_string(&value)
    }

    /// Build an `error` frame from a business error
    pub fn error(err: AppError) -> Self {
        err.into()
    }
}

/// Error codes for ServerMessage::Error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Malformed envelope or payload
    InvalidMessage,
    /// Envelope type not handled
    UnknownType,
    /// Action needs a presence announcement first
    IdentityRequired,
    /// Action needs (this) room membership
    NotInRoom,
    /// Payload claims another identity
    InvalidSender,
    /// Referenced message does not exist
    MessageNotFound,
    /// Referenced message belongs to someone else
    Forbidden,
    /// Store failed, nothing was broadcast
    StoreUnavailable,
    /// Anything else
    Internal,
}

/// Convert AppError to ServerMessage for client notification
impl From<AppError> for ServerMessage {
    fn from(err: AppError) -> Self {
        let (code, message) = match &err {
            AppError::InvalidFormat => {
                (ErrorCode::InvalidMessage, "Invalid message format".to_string())
            }
            AppError::UnknownType(kind) => {
                (ErrorCode::UnknownType, format!("Unknown message type: {}", kind))
            }
            AppError::InvalidPayload { .. } => (ErrorCode::InvalidMessage, err.to_string()),
            AppError::IdentityRequired => {
                (ErrorCode::IdentityRequired, "Authentication required".to_string())
            }
            AppError::NotInRoom => (ErrorCode::NotInRoom, "You are not in a room".to_string()),
            AppError::WrongRoom => {
                (ErrorCode::NotInRoom, "You are not in this room".to_string())
            }
            AppError::InvalidSender => (ErrorCode::InvalidSender, "Invalid sender".to_string()),
            AppError::MessageNotFound => {
                (ErrorCode::MessageNotFound, "Message not found".to_string())
            }
            AppError::NotMessageAuthor => (
                ErrorCode::Forbidden,
                "You can only modify your own messages".to_string(),
            ),
            AppError::StoreFailed(operation) => (
                ErrorCode::StoreUnavailable,
                format!("Failed to {} message", operation),
            ),
            // Fatal errors are not typically converted (connection closes)
            _ => (ErrorCode::Internal, "Internal error".to_string()),
        };
        ServerMessage::Error { code, message }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_presence() {
        let json = r#"{"type":"presence","payload":{"user_id":"u1","username":"Alice","status":"online"},"timestamp":1}"#;
        match decode(json).unwrap() {
            ClientMessage::Presence(p) => {
                assert_eq!(p.user_id, UserId::from("u1"));
                assert_eq!(p.username.as_deref(), Some("Alice"));
                assert_eq!(p.status, PresenceStatus::Online);
            }
            other => panic!("Wrong variant: {:?}", other),
        }
    }

    #[test]
    fn test_decode_empty_payload_variants() {
        assert!(matches!(
            decode(r#"{"type":"leave_room","payload":{}}"#).unwrap(),
            ClientMessage::LeaveRoom {}
        ));
        assert!(matches!(
            decode(r#"{"type":"pong","payload":{}}"#).unwrap(),
            ClientMessage::Pong {}
        ));
        assert!(matches!(
            decode(r#"{"type":"call_end","payload":{}}"#).unwrap(),
            ClientMessage::CallEnd { user_id: None }
        ));
    }

    #[test]
    fn test_decode_chat_defaults_to_text() {
        let json = r#"{"type":"chat","payload":{"room_id":3,"content":"hi"}}"#;
        match decode(json).unwrap() {
            ClientMessage::Chat(chat) => {
                assert_eq!(chat.room_id, RoomId(3));
                assert_eq!(chat.kind, MessageKind::Text);
                assert!(chat.attachment.file_name.is_none());
            }
            other => panic!("Wrong variant: {:?}", other),
        }
    }

    #[test]
    fn test_decode_webrtc_keeps_inner_type() {
        let json = r#"{"type":"webrtc","payload":{"type":"ice_candidate","from_user_id":"a","to_user_id":"b","data":{"candidate":"x"}}}"#;
        match decode(json).unwrap() {
            ClientMessage::Webrtc(signal) => {
                assert_eq!(signal.kind, SignalKind::IceCandidate);
                assert_eq!(signal.data["candidate"], "x");
            }
            other => panic!("Wrong variant: {:?}", other),
        }
    }

    #[test]
    fn test_decode_rejects_bad_envelopes() {
        assert!(matches!(decode("not json"), Err(AppError::InvalidFormat)));
        assert!(matches!(
            decode(r#"{"type":"chat","payload":"hi"}"#),
            Err(AppError::InvalidFormat)
        ));
        assert!(matches!(
            decode(r#"{"type":"chat"}"#),
            Err(AppError::InvalidFormat)
        ));
        match decode(r#"{"type":"dance","payload":{}}"#) {
            Err(AppError::UnknownType(kind)) => assert_eq!(kind, "dance"),
            other => panic!("Expected unknown type, got {:?}", other),
        }
        assert!(matches!(
            decode(r#"{"type":"join_room","payload":{"room":1}}"#),
            Err(AppError::InvalidPayload { .. })
        ));
    }

    #[test]
    fn test_encode_envelope_shape() {
        let msg = ServerMessage::ChatSent { message_id: 7 };
        let value: Value = serde_json::from_str(&msg.encode().unwrap()).unwrap();

        assert_eq!(value["type"], "chat_sent");
        assert_eq!(value["payload"]["message_id"], 7);
        assert!(value["timestamp"].is_i64());
    }

    #[test]
    fn test_ping_has_object_payload() {
        let value: Value = serde_json::from_str(&ServerMessage::Ping {}.encode().unwrap()).unwrap();
        assert_eq!(value["type"], "ping");
        assert!(value["payload"].is_object());
    }

    #[test]
    fn test_error_conversion() {
        let msg: ServerMessage = AppError::UnknownType("dance".into()).into();
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], "error");
        assert_eq!(value["payload"]["code"], "unknown_type");
        assert_eq!(value["payload"]["message"], "Unknown message type: dance");

        let msg: ServerMessage = AppError::StoreFailed("send").into();
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["payload"]["message"], "Failed to send message");
    }
}
