//! Reconnection Coordinator
//!
//! Serves `load_conversation`: durable history merged with whatever the
//! conversation's in-flight session has accumulated, followed by live
//! deltas. The snapshot is queued while the session table is locked, so it
//! always precedes the first delta the connection receives.

use std::sync::Arc;

use tracing::{debug, info};

use crate::error::PersistenceError;
use crate::models::{DurableMessage, Role, tool_calls_metadata};
use crate::repository::MessageStore;
use crate::ws::{ConnectionIdentity, Envelope, Outbound, ServerMessage};

use super::{SessionSnapshot, SessionTable};

/// What a loading connection was sent.
#[derive(Debug, Clone, PartialEq)]
pub struct ConversationView {
    pub conversation_id: String,
    pub messages: Vec<DurableMessage>,
    /// In-flight session the connection is now attached to.
    pub session: Option<SessionSnapshot>,
}

impl ConversationView {
    fn envelopes(&self, correlation_id: Option<String>) -> [Envelope; 2] {
        [
            Envelope::reply(
                ServerMessage::ConversationSnapshot {
                    conversation_id: self.conversation_id.clone(),
                    messages: self.messages.clone(),
                },
                correlation_id,
            ),
            Envelope::new(ServerMessage::SessionStatus {
                conversation_id: self.conversation_id.clone(),
                active: self.session.is_some(),
                accumulated_content: self
                    .session
                    .as_ref()
                    .map(|s| s.accumulated_content.clone()),
            }),
        ]
    }
}

/// Overlay an in-flight session on durable history.
///
/// A missing in-progress id gets a synthetic assistant entry stamped with
/// the session's creation time; a durable entry that is shorter than the
/// session content has its content replaced and keeps its timestamp.
pub fn merge_history(
    mut history: Vec<DurableMessage>,
    session: Option<&SessionSnapshot>,
) -> Vec<DurableMessage> {
    let Some(session) = session else {
        return history;
    };
    match history.iter_mut().find(|m| m.id == session.message_id) {
        Some(existing) => {
            if session.accumulated_content.len() > existing.content.len() {
                existing.content = session.accumulated_content.clone();
            }
        }
        None => history.push(DurableMessage {
            id: session.message_id.clone(),
            conversation_id: session.conversation_id.clone(),
            role: Role::Assistant,
            content: session.accumulated_content.clone(),
            created_at: session.created_at,
            metadata: tool_calls_metadata(&session.tool_calls),
        }),
    }
    history
}

pub struct ReconnectionCoordinator {
    sessions: Arc<SessionTable>,
    store: Arc<dyn MessageStore>,
}

impl ReconnectionCoordinator {
    pub fn new(sessions: Arc<SessionTable>, store: Arc<dyn MessageStore>) -> Self {
        Self { sessions, store }
    }

    /// Send `conversation_snapshot` then `session_status` to `connection`
    /// and attach it to the conversation's session, if one is running in the
    /// connection's tenant. Safe to repeat: the client replaces messages by id.
    pub async fn load_for_connection(
        &self,
        conversation_id: &str,
        identity: &ConnectionIdentity,
        connection: &Outbound,
        correlation_id: Option<String>,
    ) -> Result<ConversationView, PersistenceError> {
        let history = self.store.find_messages(conversation_id).await?;

        let view = self
            .sessions
            .attach_with(conversation_id, connection, &identity.tenant_id, |session| {
                let view = ConversationView {
                    conversation_id: conversation_id.to_string(),
                    messages: merge_history(history, session),
                    session: session.cloned(),
                };
                for envelope in view.envelopes(correlation_id) {
                    if let Err(e) = connection.deliver(envelope) {
                        debug!(conn_id = %connection.id(), error = %e, "Snapshot not delivered");
                        break;
                    }
                }
                view
            });

        // unregister flags the connection dead before sweeping attachments,
        // so an attach that raced past the sweep is undone here
        if view.session.is_some() && !connection.is_alive() {
            self.sessions.detach(conversation_id, connection.id());
        }

        info!(
            conn_id = %connection.id(),
            conversation = %conversation_id,
            user = %identity.user_id,
            messages = view.messages.len(),
            in_flight = view.session.is_some(),
            "Conversation loaded"
        );
        Ok(view)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generation::Delta;
    use crate::metrics::ServerMetrics;
    use crate::repository::test_helpers;
    use crate::streaming::{NewSession, SessionPhase};
    use crate::ws::{ConnectionRegistry, RoomKey};
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    fn durable(id: &str, role: Role, content: &str, created_at: i64) -> DurableMessage {
        DurableMessage {
            id: id.to_string(),
            conversation_id: "c1".to_string(),
            role,
            content: content.to_string(),
            created_at,
            metadata: None,
        }
    }

    fn snapshot(message_id: &str, content: &str) -> SessionSnapshot {
        SessionSnapshot {
            conversation_id: "c1".into(),
            user_id: "u1".into(),
            room: RoomKey::new("t", "p"),
            message_id: message_id.into(),
            accumulated_content: content.into(),
            tool_calls: Vec::new(),
            created_at: 500,
            last_delta_at: 600,
            attached: Vec::new(),
            phase: SessionPhase::Active,
        }
    }

    // ── merge_history ───────────────────────────────────────────────────

    #[test]
    fn test_merge_without_session_is_identity() {
        let history = vec![durable("u1", Role::User, "hi", 1)];
        assert_eq!(merge_history(history.clone(), None), history);
    }

    #[test]
    fn test_merge_appends_synthetic_message() {
        let history = vec![durable("u1", Role::User, "hi", 1)];
        let merged = merge_history(history, Some(&snapshot("m1", "Hello")));

        assert_eq!(merged.len(), 2);
        let synthetic = &merged[1];
        assert_eq!(synthetic.id, "m1");
        assert_eq!(synthetic.role, Role::Assistant);
        assert_eq!(synthetic.content, "Hello");
        assert_eq!(synthetic.created_at, 500);
    }

    #[test]
    fn test_merge_replaces_shorter_durable_content() {
        let history = vec![durable("m1", Role::Assistant, "Hel", 42)];
        let merged = merge_history(history, Some(&snapshot("m1", "Hello")));
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].content, "Hello");
        assert_eq!(merged[0].created_at, 42);
    }

    #[test]
    fn test_merge_keeps_longer_durable_content() {
        let history = vec![durable("m1", Role::Assistant, "Hello world", 42)];
        let merged = merge_history(history, Some(&snapshot("m1", "Hello")));
        assert_eq!(merged[0].content, "Hello world");
    }

    #[test]
    fn test_merge_is_idempotent() {
        let history = vec![durable("u1", Role::User, "hi", 1)];
        let session = snapshot("m1", "Hello");
        let once = merge_history(history, Some(&session));
        let twice = merge_history(once.clone(), Some(&session));
        assert_eq!(
            serde_json::to_string(&once).unwrap(),
            serde_json::to_string(&twice).unwrap()
        );
    }

    // ── load_for_connection ─────────────────────────────────────────────

    struct Fixture {
        sessions: Arc<SessionTable>,
        registry: ConnectionRegistry,
        coordinator: ReconnectionCoordinator,
        store: Arc<dyn MessageStore>,
    }

    async fn fixture() -> Fixture {
        let sessions = Arc::new(SessionTable::new());
        let store: Arc<dyn MessageStore> = Arc::new(test_helpers::test_repository().await);
        Fixture {
            registry: ConnectionRegistry::new(
                Arc::clone(&sessions),
                Arc::new(ServerMetrics::new()),
            ),
            coordinator: ReconnectionCoordinator::new(Arc::clone(&sessions), Arc::clone(&store)),
            sessions,
            store,
        }
    }

    fn connect(
        reg: &ConnectionRegistry,
    ) -> (ConnectionIdentity, Outbound, mpsc::Receiver<Envelope>) {
        connect_as(reg, "t")
    }

    fn connect_as(
        reg: &ConnectionRegistry,
        tenant: &str,
    ) -> (ConnectionIdentity, Outbound, mpsc::Receiver<Envelope>) {
        let identity = ConnectionIdentity {
            user_id: "u1".into(),
            tenant_id: tenant.into(),
        };
        let (tx, rx) = mpsc::channel(16);
        let id = reg.register(identity.clone(), tx, CancellationToken::new());
        (identity, reg.outbound(id).unwrap(), rx)
    }

    fn start_session(sessions: &SessionTable) {
        sessions
            .try_create(NewSession {
                conversation_id: "c1".into(),
                user_id: "u1".into(),
                room: RoomKey::new("t", "p"),
                message_id: "m1".into(),
                created_at: 500,
                origin: None,
            })
            .unwrap();
    }

    #[tokio::test]
    async fn test_load_sends_snapshot_then_status() {
        let fx = fixture().await;
        fx.store
            .insert_message(&durable("u1", Role::User, "hi", 1))
            .await
            .unwrap();
        start_session(&fx.sessions);
        fx.sessions
            .append_with("c1", "m1", &Delta::text("Hello"), |_| ())
            .unwrap();

        let (who, conn, mut rx) = connect(&fx.registry);
        let view = fx
            .coordinator
            .load_for_connection("c1", &who, &conn, Some("req-1".into()))
            .await
            .unwrap();
        assert_eq!(view.messages.len(), 2);

        let first = rx.try_recv().unwrap();
        assert_eq!(first.correlation_id.as_deref(), Some("req-1"));
        match first.message {
            ServerMessage::ConversationSnapshot { messages, .. } => {
                assert_eq!(messages[1].content, "Hello");
            }
            other => panic!("Expected ConversationSnapshot, got {other:?}"),
        }
        match rx.try_recv().unwrap().message {
            ServerMessage::SessionStatus {
                active,
                accumulated_content,
                ..
            } => {
                assert!(active);
                assert_eq!(accumulated_content.as_deref(), Some("Hello"));
            }
            other => panic!("Expected SessionStatus, got {other:?}"),
        }

        let attached = fx.sessions.get("c1").unwrap().attached;
        assert_eq!(attached, vec![conn.id()]);
    }

    #[tokio::test]
    async fn test_load_without_session_reports_inactive() {
        let fx = fixture().await;
        fx.store
            .insert_message(&durable("u1", Role::User, "hi", 1))
            .await
            .unwrap();

        let (who, conn, mut rx) = connect(&fx.registry);
        let view = fx
            .coordinator
            .load_for_connection("c1", &who, &conn, None)
            .await
            .unwrap();
        assert!(view.session.is_none());
        assert_eq!(view.messages.len(), 1);

        rx.try_recv().unwrap();
        match rx.try_recv().unwrap().message {
            ServerMessage::SessionStatus {
                active,
                accumulated_content,
                ..
            } => {
                assert!(!active);
                assert!(accumulated_content.is_none());
            }
            other => panic!("Expected SessionStatus, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_repeated_load_is_byte_identical() {
        let fx = fixture().await;
        start_session(&fx.sessions);
        fx.sessions
            .append_with("c1", "m1", &Delta::text("Hel"), |_| ())
            .unwrap();
        let (who, conn, _rx) = connect(&fx.registry);

        let a = fx
            .coordinator
            .load_for_connection("c1", &who, &conn, None)
            .await
            .unwrap();
        let b = fx
            .coordinator
            .load_for_connection("c1", &who, &conn, None)
            .await
            .unwrap();
        assert_eq!(
            serde_json::to_string(&a.messages).unwrap(),
            serde_json::to_string(&b.messages).unwrap()
        );
        // attaching twice does not duplicate the connection
        assert_eq!(fx.sessions.get("c1").unwrap().attached.len(), 1);
    }

    #[tokio::test]
    async fn test_failed_session_is_invisible() {
        let fx = fixture().await;
        start_session(&fx.sessions);
        fx.sessions
            .append_with("c1", "m1", &Delta::text("partial"), |_| ())
            .unwrap();
        fx.sessions.mark_failed("c1", "m1").unwrap();

        let (who, conn, _rx) = connect(&fx.registry);
        let view = fx
            .coordinator
            .load_for_connection("c1", &who, &conn, None)
            .await
            .unwrap();
        assert!(view.messages.is_empty());
        assert!(view.session.is_none());
    }

    #[tokio::test]
    async fn test_dead_connection_does_not_stay_attached() {
        let fx = fixture().await;
        start_session(&fx.sessions);
        let (who, conn, _rx) = connect(&fx.registry);
        fx.registry.unregister(conn.id());

        fx.coordinator
            .load_for_connection("c1", &who, &conn, None)
            .await
            .unwrap();
        assert!(fx.sessions.get("c1").unwrap().attached.is_empty());
    }

    #[tokio::test]
    async fn test_other_tenant_gets_no_overlay() {
        let fx = fixture().await;
        start_session(&fx.sessions);
        fx.sessions
            .append_with("c1", "m1", &Delta::text("secret"), |_| ())
            .unwrap();

        let (who, conn, mut rx) = connect_as(&fx.registry, "globex");
        let view = fx
            .coordinator
            .load_for_connection("c1", &who, &conn, None)
            .await
            .unwrap();
        assert!(view.session.is_none());
        assert!(view.messages.is_empty());
        assert!(fx.sessions.get("c1").unwrap().attached.is_empty());

        match rx.try_recv().unwrap().message {
            ServerMessage::ConversationSnapshot { messages, .. } => assert!(messages.is_empty()),
            other => panic!("Expected ConversationSnapshot, got {other:?}"),
        }
        match rx.try_recv().unwrap().message {
            ServerMessage::SessionStatus {
                active,
                accumulated_content,
                ..
            } => {
                assert!(!active);
                assert!(accumulated_content.is_none());
            }
            other => panic!("Expected SessionStatus, got {other:?}"),
        }
    }
}
