//! Generation Driver
//!
//! One task per in-flight generation. Runs the generator under the
//! configured deadline, appends and fans out each delta, then either makes
//! the content durable and removes the session, or fails it and removes it
//! without persisting.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::error::GenerationError;
use crate::generation::{Delta, GenerationRequest, Generator};
use crate::metrics::ServerMetrics;
use crate::models::{DurableMessage, Role, tool_calls_metadata};
use crate::repository::{InsertOutcome, MessageStore};
use crate::ws::{ConnectionRegistry, Envelope, RoomKey, ServerMessage, deliver_all};

use super::SessionTable;

/// Collaborators shared by every driver task.
#[derive(Clone)]
pub(crate) struct DriverContext {
    pub sessions: Arc<SessionTable>,
    pub registry: Arc<ConnectionRegistry>,
    pub store: Arc<dyn MessageStore>,
    pub generator: Arc<dyn Generator>,
    pub metrics: Arc<ServerMetrics>,
    pub timeout: Option<Duration>,
}

pub(crate) struct GenerationJob {
    pub conversation_id: String,
    pub message_id: String,
    pub room: RoomKey,
    pub request: GenerationRequest,
}

pub(crate) async fn drive_generation(ctx: DriverContext, job: GenerationJob) {
    let GenerationJob {
        conversation_id,
        message_id,
        room,
        request,
    } = job;

    let mut saw_terminal = false;
    let result = {
        let mut on_delta = |delta: Delta| -> Result<(), GenerationError> {
            if saw_terminal {
                return Ok(());
            }
            let envelope = (!delta.content.is_empty()).then(|| {
                Envelope::new(ServerMessage::Delta {
                    conversation_id: conversation_id.clone(),
                    message_id: message_id.clone(),
                    content: delta.content.clone(),
                    done: false,
                })
            });
            // resolved before the session lock; the registry is never locked
            // inside it
            let room_members = match envelope {
                Some(_) => ctx.registry.room_outbounds(&room),
                None => Vec::new(),
            };
            ctx.sessions
                .append_with(&conversation_id, &message_id, &delta, |attached| {
                    let Some(envelope) = &envelope else {
                        return;
                    };
                    if attached.is_empty() {
                        deliver_all(&room_members, envelope);
                    } else {
                        deliver_all(attached.iter().copied(), envelope);
                    }
                })
                .ok_or_else(|| GenerationError::SessionGone(conversation_id.clone()))?;
            saw_terminal = delta.done;
            if envelope.is_some() {
                ctx.metrics.delta_forwarded();
            }
            Ok(())
        };

        let stream = ctx.generator.stream(request, &mut on_delta);
        match ctx.timeout {
            Some(limit) => match tokio::time::timeout(limit, stream).await {
                Ok(result) => result,
                Err(_) => Err(GenerationError::Timeout(limit)),
            },
            None => stream.await,
        }
    };

    let run = Run {
        ctx: &ctx,
        conversation_id: &conversation_id,
        message_id: &message_id,
        room: &room,
    };
    match (result, saw_terminal) {
        (Ok(()), true) => run.complete().await,
        (Err(e), true) => {
            warn!(
                conversation = %conversation_id,
                error = %e,
                "Generator errored after its terminal chunk, completing anyway"
            );
            run.complete().await;
        }
        (Ok(()), false) => run.fail(GenerationError::Truncated.reason()),
        (Err(e), false) => {
            warn!(conversation = %conversation_id, message = %message_id, error = %e, "Generation failed");
            run.fail(e.reason());
        }
    }
}

struct Run<'a> {
    ctx: &'a DriverContext,
    conversation_id: &'a str,
    message_id: &'a str,
    room: &'a RoomKey,
}

impl Run<'_> {
    /// Active → Completing → removed. The record stays in the table until
    /// the durable write has returned.
    async fn complete(&self) {
        let Some(session) = self
            .ctx
            .sessions
            .begin_completion(self.conversation_id, self.message_id)
        else {
            debug!(conversation = %self.conversation_id, "Session vanished before completion");
            return;
        };

        let message = DurableMessage {
            id: self.message_id.to_string(),
            conversation_id: self.conversation_id.to_string(),
            role: Role::Assistant,
            content: session.accumulated_content,
            created_at: session.created_at,
            metadata: tool_calls_metadata(&session.tool_calls),
        };

        match self.ctx.store.insert_message(&message).await {
            Ok(outcome) => {
                if outcome == InsertOutcome::AlreadyExists {
                    info!(message = %self.message_id, "Assistant message already persisted");
                }
                let attached = self
                    .ctx
                    .sessions
                    .remove(self.conversation_id, self.message_id)
                    .map(|s| s.attached)
                    .unwrap_or_default();
                self.ctx.registry.send_to_connections(
                    &attached,
                    self.room,
                    ServerMessage::Delta {
                        conversation_id: self.conversation_id.to_string(),
                        message_id: self.message_id.to_string(),
                        content: String::new(),
                        done: true,
                    },
                );
                self.announce_inactive();
                self.ctx.metrics.session_completed();
                info!(
                    conversation = %self.conversation_id,
                    message = %self.message_id,
                    chars = message.content.len(),
                    "Generation completed"
                );
            }
            Err(e) => {
                error!(
                    conversation = %self.conversation_id,
                    message = %self.message_id,
                    error = %e,
                    "Failed to persist assistant message"
                );
                self.ctx.metrics.persistence_error();
                self.fail(e.reason());
            }
        }
    }

    /// Failed → removed. Attached connections hear about it before the
    /// record disappears.
    fn fail(&self, reason: String) {
        let Some(attached) = self
            .ctx
            .sessions
            .mark_failed(self.conversation_id, self.message_id)
        else {
            return;
        };
        self.ctx.registry.send_to_connections(
            &attached,
            self.room,
            ServerMessage::Error {
                conversation_id: Some(self.conversation_id.to_string()),
                reason,
            },
        );
        self.ctx
            .sessions
            .remove(self.conversation_id, self.message_id);
        self.announce_inactive();
        self.ctx.metrics.session_failed();
    }

    fn announce_inactive(&self) {
        self.ctx.registry.broadcast_to_room(
            self.room,
            ServerMessage::SessionStatus {
                conversation_id: self.conversation_id.to_string(),
                active: false,
                accumulated_content: None,
            },
        );
    }
}
