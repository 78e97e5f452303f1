//! Error taxonomy for the streaming core.
//!
//! Every variant maps to a stable wire `reason` via [`reason`](HubError::reason)
//! so clients can branch on the prefix without parsing prose.

use std::time::Duration;

use thiserror::Error;

use crate::ws::ConnectionId;

/// Transport-level failure on a single connection. Recovered locally by
/// dropping the connection.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("connection {0} is not registered")]
    Unknown(ConnectionId),
    #[error("outbound queue for connection {0} is full")]
    QueueFull(ConnectionId),
    #[error("connection {0} is closed")]
    Closed(ConnectionId),
}

/// Failure of the generation collaborator. Terminates the session without
/// persisting anything.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GenerationError {
    #[error("generation backend request failed: {0}")]
    Backend(String),
    #[error("generation backend returned status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("malformed chunk from generation backend: {0}")]
    Decode(String),
    #[error("generation did not finish within {0:?}")]
    Timeout(Duration),
    #[error("generation stream ended without a terminal chunk")]
    Truncated,
    #[error("streaming session for conversation {0} is no longer active")]
    SessionGone(String),
}

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("stored message {id} is invalid: {detail}")]
    Corrupt { id: String, detail: String },
}

/// Malformed or out-of-order client input. Answered with a connection-scoped
/// `error`; never touches a session.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("malformed message: {0}")]
    Malformed(String),
    #[error("binary frames are not supported")]
    BinaryFrame,
    #[error("join a project room before sending messages")]
    NoRoom,
    #[error("message content is empty")]
    EmptyContent,
}

/// Returned by `SessionTable::try_create` when the conversation already has a
/// streaming session in any phase.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("conversation {conversation_id} is already generating message {message_id}")]
pub struct SessionConflict {
    pub conversation_id: String,
    pub message_id: String,
}

/// Everything a hub operation can fail with.
#[derive(Debug, Error)]
pub enum HubError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Busy(#[from] SessionConflict),
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}

impl GenerationError {
    pub fn reason(&self) -> String {
        match self {
            GenerationError::Timeout(_) => "generation_timeout".to_string(),
            other => format!("generation_failed: {other}"),
        }
    }
}

impl PersistenceError {
    pub fn reason(&self) -> String {
        format!("persistence_failed: {self}")
    }
}

impl ProtocolError {
    pub fn reason(&self) -> String {
        format!("protocol_error: {self}")
    }
}

impl HubError {
    pub fn reason(&self) -> String {
        match self {
            HubError::Connection(e) => format!("connection_error: {e}"),
            HubError::Protocol(e) => e.reason(),
            HubError::Busy(_) => "conversation_busy".to_string(),
            HubError::Persistence(e) => e.reason(),
        }
    }
}
