//! Stream Hub
//!
//! Composition root of the streaming core. Owns the connection registry,
//! the session table and the collaborators, and exposes the operations the
//! connection dispatcher calls.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::HubConfig;
use crate::error::{ConnectionError, HubError, ProtocolError};
use crate::generation::{GenerationRequest, Generator, PromptMessage};
use crate::metrics::ServerMetrics;
use crate::models::{DurableMessage, Role, now_millis};
use crate::repository::MessageStore;
use crate::streaming::{
    ConversationView, DriverContext, GenerationJob, NewSession, ReconnectionCoordinator,
    SessionTable, drive_generation,
};
use crate::ws::{
    ConnectionId, ConnectionIdentity, ConnectionRegistry, Envelope, ServerMessage, SessionSummary,
};

/// Ids assigned to an accepted user message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submitted {
    pub user_message_id: String,
    pub message_id: String,
}

pub struct StreamHub {
    registry: Arc<ConnectionRegistry>,
    sessions: Arc<SessionTable>,
    store: Arc<dyn MessageStore>,
    generator: Arc<dyn Generator>,
    coordinator: ReconnectionCoordinator,
    metrics: Arc<ServerMetrics>,
    config: HubConfig,
}

impl StreamHub {
    pub fn new(
        store: Arc<dyn MessageStore>,
        generator: Arc<dyn Generator>,
        config: HubConfig,
        metrics: Arc<ServerMetrics>,
    ) -> Self {
        let sessions = Arc::new(SessionTable::new());
        let registry = Arc::new(ConnectionRegistry::new(
            Arc::clone(&sessions),
            Arc::clone(&metrics),
        ));
        let coordinator = ReconnectionCoordinator::new(Arc::clone(&sessions), Arc::clone(&store));
        Self {
            registry,
            sessions,
            store,
            generator,
            coordinator,
            metrics,
            config,
        }
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    pub fn metrics(&self) -> &Arc<ServerMetrics> {
        &self.metrics
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn sessions(&self) -> &Arc<SessionTable> {
        &self.sessions
    }

    /// Register a connection and greet it with `connected`.
    pub fn connect(
        &self,
        identity: ConnectionIdentity,
        tx: mpsc::Sender<Envelope>,
        close: CancellationToken,
    ) -> ConnectionId {
        let id = self.registry.register(identity, tx, close);
        self.metrics.connection_opened();
        if let Err(e) = self
            .registry
            .send_to(id, ServerMessage::Connected { connection_id: id }, None)
        {
            debug!(conn_id = %id, error = %e, "Greeting not delivered");
        }
        id
    }

    pub fn disconnect(&self, id: ConnectionId) {
        if self.registry.unregister(id) {
            self.metrics.connection_closed();
        }
    }

    pub fn join_room(
        &self,
        id: ConnectionId,
        project_id: &str,
        correlation_id: Option<String>,
    ) -> Result<(), HubError> {
        let room = self.registry.join_room(id, project_id)?;
        let active_sessions = self
            .sessions
            .active_in_room(&room)
            .into_iter()
            .map(|s| SessionSummary {
                conversation_id: s.conversation_id,
                message_id: s.message_id,
                user_id: s.user_id,
                created_at: s.created_at,
            })
            .collect();
        info!(conn_id = %id, room = %room, "Joined room");
        self.registry.send_to(
            id,
            ServerMessage::RoomJoined {
                project_id: project_id.to_string(),
                active_sessions,
            },
            correlation_id,
        )?;
        Ok(())
    }

    pub fn leave_room(&self, id: ConnectionId, correlation_id: Option<String>) -> Result<(), HubError> {
        if let Some(room) = self.registry.leave_room(id)? {
            info!(conn_id = %id, room = %room, "Left room");
        }
        self.registry
            .send_to(id, ServerMessage::RoomLeft, correlation_id)?;
        Ok(())
    }

    pub async fn load_conversation(
        &self,
        id: ConnectionId,
        conversation_id: &str,
        correlation_id: Option<String>,
    ) -> Result<ConversationView, HubError> {
        let identity = self
            .registry
            .identity(id)
            .ok_or(ConnectionError::Unknown(id))?;
        let outbound = self
            .registry
            .outbound(id)
            .ok_or(ConnectionError::Unknown(id))?;
        let view = self
            .coordinator
            .load_for_connection(conversation_id, &identity, &outbound, correlation_id)
            .await
            .inspect_err(|_| self.metrics.persistence_error())?;
        Ok(view)
    }

    /// Accept a user message and start generating the reply.
    ///
    /// The sender must have joined a room. A conversation that already has a
    /// session in any phase rejects the message and nothing is persisted.
    pub async fn submit_user_message(
        &self,
        id: ConnectionId,
        conversation_id: &str,
        content: &str,
        correlation_id: Option<String>,
    ) -> Result<Submitted, HubError> {
        if content.trim().is_empty() {
            return Err(ProtocolError::EmptyContent.into());
        }
        let identity = self
            .registry
            .identity(id)
            .ok_or(ConnectionError::Unknown(id))?;
        let room = self.registry.room_of(id).ok_or(ProtocolError::NoRoom)?;
        let origin = self
            .registry
            .outbound(id)
            .ok_or(ConnectionError::Unknown(id))?;

        let now = now_millis();
        let message_id = uuid::Uuid::now_v7().to_string();
        self.sessions
            .try_create(NewSession {
                conversation_id: conversation_id.to_string(),
                user_id: identity.user_id.clone(),
                room: room.clone(),
                message_id: message_id.clone(),
                created_at: now,
                origin: Some(origin),
            })
            .inspect_err(|conflict| {
                self.metrics.session_rejected();
                info!(
                    conn_id = %id,
                    conversation = %conversation_id,
                    running = %conflict.message_id,
                    "Rejected user message, conversation busy"
                );
            })?;

        let user_message = DurableMessage {
            id: uuid::Uuid::now_v7().to_string(),
            conversation_id: conversation_id.to_string(),
            role: Role::User,
            content: content.to_string(),
            created_at: now,
            metadata: None,
        };
        let history = match self.persist_user_message(&user_message).await {
            Ok(history) => history,
            Err(e) => {
                warn!(conversation = %conversation_id, error = %e, "Could not accept user message");
                self.metrics.persistence_error();
                self.sessions.remove(conversation_id, &message_id);
                return Err(e.into());
            }
        };

        let submitted = Submitted {
            user_message_id: user_message.id,
            message_id: message_id.clone(),
        };
        if let Err(e) = self.registry.send_to(
            id,
            ServerMessage::UserMessageAccepted {
                conversation_id: conversation_id.to_string(),
                user_message_id: submitted.user_message_id.clone(),
                message_id: message_id.clone(),
            },
            correlation_id,
        ) {
            // the generation still runs for the room
            debug!(conn_id = %id, error = %e, "Acceptance not delivered");
        }
        self.registry.broadcast_to_room(
            &room,
            ServerMessage::SessionStatus {
                conversation_id: conversation_id.to_string(),
                active: true,
                accumulated_content: None,
            },
        );
        self.metrics.session_started();
        info!(
            conn_id = %id,
            conversation = %conversation_id,
            message = %message_id,
            user = %identity.user_id,
            "Generation started"
        );

        let job = GenerationJob {
            conversation_id: conversation_id.to_string(),
            message_id: message_id.clone(),
            room,
            request: GenerationRequest {
                conversation_id: conversation_id.to_string(),
                message_id,
                history,
            },
        };
        tokio::spawn(drive_generation(self.driver_context(), job));

        Ok(submitted)
    }

    async fn persist_user_message(
        &self,
        message: &DurableMessage,
    ) -> Result<Vec<PromptMessage>, crate::error::PersistenceError> {
        self.store.insert_message(message).await?;
        let history = self.store.find_messages(&message.conversation_id).await?;
        Ok(history
            .into_iter()
            .map(|m| PromptMessage {
                role: m.role,
                content: m.content,
            })
            .collect())
    }

    fn driver_context(&self) -> DriverContext {
        DriverContext {
            sessions: Arc::clone(&self.sessions),
            registry: Arc::clone(&self.registry),
            store: Arc::clone(&self.store),
            generator: Arc::clone(&self.generator),
            metrics: Arc::clone(&self.metrics),
            timeout: self.config.generation_timeout,
        }
    }
}
