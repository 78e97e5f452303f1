//! WebSocket Protocol Types
//!
//! Every frame is a JSON envelope `{kind, payload, serverTimestamp,
//! correlationId?}`. `kind` selects the payload shape; client frames omit
//! `serverTimestamp`.

use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;
use crate::models::{DurableMessage, now_millis};

use super::ConnectionId;

/// Messages sent from client to server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "kind",
    content = "payload",
    rename_all = "snake_case",
    rename_all_fields = "camelCase"
)]
pub enum ClientMessage {
    /// Submit a user message; starts a generation for the conversation.
    UserMessage {
        conversation_id: String,
        content: String,
    },
    /// Join a project room (leaves the current one, if any).
    JoinRoom { project_id: String },
    LeaveRoom,
    /// Fetch history merged with any in-flight content and start receiving
    /// its deltas.
    LoadConversation { conversation_id: String },
    Ping,
}

/// Active session advertised to a connection joining a room.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub conversation_id: String,
    pub message_id: String,
    pub user_id: String,
    pub created_at: i64,
}

/// Messages sent from server to client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "kind",
    content = "payload",
    rename_all = "snake_case",
    rename_all_fields = "camelCase"
)]
pub enum ServerMessage {
    /// First frame on every connection.
    Connected { connection_id: ConnectionId },
    RoomJoined {
        project_id: String,
        active_sessions: Vec<SessionSummary>,
    },
    RoomLeft,
    /// Reply to `user_message`: both ids are fixed for the rest of the run.
    UserMessageAccepted {
        conversation_id: String,
        user_message_id: String,
        message_id: String,
    },
    /// Incremental assistant output. `done` is set once, after the full
    /// message is durable.
    Delta {
        conversation_id: String,
        message_id: String,
        content: String,
        done: bool,
    },
    SessionStatus {
        conversation_id: String,
        active: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        accumulated_content: Option<String>,
    },
    /// Replaces (never appends to) the client's copy of these message ids.
    ConversationSnapshot {
        conversation_id: String,
        messages: Vec<DurableMessage>,
    },
    /// `conversation_id` is absent for connection-scoped protocol errors.
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        conversation_id: Option<String>,
        reason: String,
    },
    Pong,
}

/// Outbound frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    #[serde(flatten)]
    pub message: ServerMessage,
    pub server_timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

impl Envelope {
    pub fn new(message: ServerMessage) -> Self {
        Self::reply(message, None)
    }

    pub fn reply(message: ServerMessage, correlation_id: Option<String>) -> Self {
        Self {
            message,
            server_timestamp: now_millis(),
            correlation_id,
        }
    }
}

/// Inbound frame.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientEnvelope {
    #[serde(flatten)]
    pub message: ClientMessage,
    #[serde(default)]
    pub correlation_id: Option<String>,
}

impl ClientEnvelope {
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_user_message() {
        let env = ClientEnvelope::parse(
            r#"{"kind":"user_message","payload":{"conversationId":"c1","content":"hi"},"correlationId":"r1"}"#,
        )
        .unwrap();
        assert_eq!(env.correlation_id.as_deref(), Some("r1"));
        match env.message {
            ClientMessage::UserMessage {
                conversation_id,
                content,
            } => {
                assert_eq!(conversation_id, "c1");
                assert_eq!(content, "hi");
            }
            other => panic!("Expected UserMessage, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_payloadless_kinds() {
        let env = ClientEnvelope::parse(r#"{"kind":"ping"}"#).unwrap();
        assert_eq!(env.message, ClientMessage::Ping);
        assert!(env.correlation_id.is_none());

        let env = ClientEnvelope::parse(r#"{"kind":"leave_room","correlationId":"x"}"#).unwrap();
        assert_eq!(env.message, ClientMessage::LeaveRoom);
        assert_eq!(env.correlation_id.as_deref(), Some("x"));
    }

    #[test]
    fn test_parse_join_and_load() {
        let env =
            ClientEnvelope::parse(r#"{"kind":"join_room","payload":{"projectId":"p1"}}"#).unwrap();
        assert_eq!(
            env.message,
            ClientMessage::JoinRoom {
                project_id: "p1".into()
            }
        );

        let env = ClientEnvelope::parse(
            r#"{"kind":"load_conversation","payload":{"conversationId":"c9"}}"#,
        )
        .unwrap();
        assert_eq!(
            env.message,
            ClientMessage::LoadConversation {
                conversation_id: "c9".into()
            }
        );
    }

    #[test]
    fn test_malformed_frames_are_protocol_errors() {
        for text in [
            "not json",
            r#"{"kind":"teleport","payload":{}}"#,
            r#"{"kind":"user_message","payload":{"content":"missing conversation"}}"#,
            r#"{"payload":{"conversationId":"c1","content":"no kind"}}"#,
        ] {
            assert!(
                matches!(ClientEnvelope::parse(text), Err(ProtocolError::Malformed(_))),
                "{text} should be rejected"
            );
        }
    }

    #[test]
    fn test_delta_envelope_shape() {
        let env = Envelope {
            message: ServerMessage::Delta {
                conversation_id: "c1".into(),
                message_id: "m1".into(),
                content: "Hel".into(),
                done: false,
            },
            server_timestamp: 1_700_000_000_000,
            correlation_id: None,
        };
        let json = serde_json::to_value(&env).unwrap();
        assert_eq!(json["kind"], "delta");
        assert_eq!(json["payload"]["conversationId"], "c1");
        assert_eq!(json["payload"]["messageId"], "m1");
        assert_eq!(json["payload"]["content"], "Hel");
        assert_eq!(json["payload"]["done"], false);
        assert_eq!(json["serverTimestamp"], 1_700_000_000_000i64);
        assert!(json.get("correlationId").is_none());
    }

    #[test]
    fn test_optional_fields_are_omitted() {
        let json = serde_json::to_value(Envelope::new(ServerMessage::Error {
            conversation_id: None,
            reason: "protocol_error: malformed message".into(),
        }))
        .unwrap();
        assert_eq!(json["kind"], "error");
        assert!(json["payload"].get("conversationId").is_none());

        let json = serde_json::to_value(Envelope::new(ServerMessage::SessionStatus {
            conversation_id: "c1".into(),
            active: false,
            accumulated_content: None,
        }))
        .unwrap();
        assert_eq!(json["payload"]["active"], false);
        assert!(json["payload"].get("accumulatedContent").is_none());
    }

    #[test]
    fn test_reply_echoes_correlation_id() {
        let json =
            serde_json::to_value(Envelope::reply(ServerMessage::Pong, Some("req-7".into())))
                .unwrap();
        assert_eq!(json["kind"], "pong");
        assert_eq!(json["correlationId"], "req-7");
        assert!(json["serverTimestamp"].as_i64().unwrap() > 0);
    }
}
