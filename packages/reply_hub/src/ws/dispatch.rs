//! Message dispatcher: decoded client envelopes → hub operations.
//!
//! Every failure becomes an `error` envelope for the sending connection;
//! nothing here tears the connection down.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use tracing::{debug, warn};

use crate::error::{HubError, ProtocolError};
use crate::hub::StreamHub;

use super::ConnectionId;
use super::protocol::{ClientEnvelope, ClientMessage, ServerMessage};

/// Protocol-error replies per connection before further ones are dropped
/// silently. Keeps a misbehaving client from using errors as an echo.
const MAX_PROTOCOL_ERROR_REPLIES: u32 = 10;

/// Per-connection context shared by the socket loop and the dispatcher.
pub(crate) struct ConnectionContext {
    pub connection_id: ConnectionId,
    pub hub: Arc<StreamHub>,
    protocol_errors: AtomicU32,
}

impl ConnectionContext {
    pub(crate) fn new(connection_id: ConnectionId, hub: Arc<StreamHub>) -> Self {
        Self {
            connection_id,
            hub,
            protocol_errors: AtomicU32::new(0),
        }
    }

    fn reply(&self, message: ServerMessage, correlation_id: Option<String>) {
        if let Err(e) = self
            .hub
            .registry()
            .send_to(self.connection_id, message, correlation_id)
        {
            debug!(conn_id = %self.connection_id, error = %e, "Reply not delivered");
        }
    }

    fn reply_error(
        &self,
        conversation_id: Option<String>,
        err: &HubError,
        correlation_id: Option<String>,
    ) {
        if let HubError::Protocol(_) = err {
            self.hub.metrics().protocol_error();
            let prev = self.protocol_errors.fetch_add(1, Ordering::Relaxed);
            if prev >= MAX_PROTOCOL_ERROR_REPLIES {
                return;
            }
        }
        self.reply(
            ServerMessage::Error {
                conversation_id,
                reason: err.reason(),
            },
            correlation_id,
        );
    }
}

/// Decode one text frame and dispatch it.
pub(crate) async fn handle_text_frame(ctx: &ConnectionContext, text: &str) {
    match ClientEnvelope::parse(text) {
        Ok(envelope) => dispatch_client_message(ctx, envelope).await,
        Err(e) => {
            warn!(conn_id = %ctx.connection_id, error = %e, "Invalid client message");
            reject_frame(ctx, e);
        }
    }
}

/// Answer a frame that could not be decoded.
pub(crate) fn reject_frame(ctx: &ConnectionContext, err: ProtocolError) {
    ctx.reply_error(None, &err.into(), None);
}

pub(crate) async fn dispatch_client_message(ctx: &ConnectionContext, envelope: ClientEnvelope) {
    let ClientEnvelope {
        message,
        correlation_id,
    } = envelope;
    let hub = &ctx.hub;
    let id = ctx.connection_id;

    match message {
        ClientMessage::UserMessage {
            conversation_id,
            content,
        } => {
            if let Err(e) = hub
                .submit_user_message(id, &conversation_id, &content, correlation_id.clone())
                .await
            {
                ctx.reply_error(Some(conversation_id), &e, correlation_id);
            }
        }
        ClientMessage::JoinRoom { project_id } => {
            if let Err(e) = hub.join_room(id, &project_id, correlation_id.clone()) {
                ctx.reply_error(None, &e, correlation_id);
            }
        }
        ClientMessage::LeaveRoom => {
            if let Err(e) = hub.leave_room(id, correlation_id.clone()) {
                ctx.reply_error(None, &e, correlation_id);
            }
        }
        ClientMessage::LoadConversation { conversation_id } => {
            if let Err(e) = hub
                .load_conversation(id, &conversation_id, correlation_id.clone())
                .await
            {
                ctx.reply_error(Some(conversation_id), &e, correlation_id);
            }
        }
        ClientMessage::Ping => ctx.reply(ServerMessage::Pong, correlation_id),
    }
}
