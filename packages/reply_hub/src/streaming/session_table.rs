//! In-memory table of in-flight generations, keyed by conversation id.
//!
//! One `parking_lot::Mutex` guards the whole table. It is held only for map
//! mutation and, in [`SessionTable::append_with`] and
//! [`SessionTable::attach_with`], for a caller-supplied non-blocking enqueue.
//! Attached connections are kept as [`Outbound`] handles so that enqueue never
//! reaches back into the registry. Nothing here awaits.

use std::collections::{BTreeMap, HashMap};

use parking_lot::Mutex;
use serde::Serialize;

use crate::error::SessionConflict;
use crate::generation::Delta;
use crate::models::{ToolCall, now_millis};
use crate::ws::{ConnectionId, Outbound, RoomKey};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    /// Accepting deltas.
    Active,
    /// Terminal delta seen; the durable write is in flight.
    Completing,
    /// Generation failed; hidden from new attachments until removed.
    Failed,
}

/// Everything needed to open a session.
#[derive(Debug, Clone)]
pub struct NewSession {
    pub conversation_id: String,
    pub user_id: String,
    pub room: RoomKey,
    pub message_id: String,
    pub created_at: i64,
    /// Attached from the start so the sender sees its own deltas.
    pub origin: Option<Outbound>,
}

#[derive(Debug)]
struct StreamingSession {
    user_id: String,
    room: RoomKey,
    in_progress_message_id: String,
    accumulated_content: String,
    tool_calls: Vec<ToolCall>,
    created_at: i64,
    last_delta_at: i64,
    attached: BTreeMap<ConnectionId, Outbound>,
    phase: SessionPhase,
}

/// Point-in-time copy of a session, safe to use after the lock is released.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSnapshot {
    pub conversation_id: String,
    pub user_id: String,
    pub room: RoomKey,
    pub message_id: String,
    pub accumulated_content: String,
    pub tool_calls: Vec<ToolCall>,
    pub created_at: i64,
    pub last_delta_at: i64,
    pub attached: Vec<ConnectionId>,
    pub phase: SessionPhase,
}

impl StreamingSession {
    fn snapshot(&self, conversation_id: &str) -> SessionSnapshot {
        SessionSnapshot {
            conversation_id: conversation_id.to_string(),
            user_id: self.user_id.clone(),
            room: self.room.clone(),
            message_id: self.in_progress_message_id.clone(),
            accumulated_content: self.accumulated_content.clone(),
            tool_calls: self.tool_calls.clone(),
            created_at: self.created_at,
            last_delta_at: self.last_delta_at,
            attached: self.attached.keys().copied().collect(),
            phase: self.phase,
        }
    }
}

#[derive(Default)]
pub struct SessionTable {
    sessions: Mutex<HashMap<String, StreamingSession>>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert-if-absent. Any existing session, whatever its phase, is a
    /// conflict.
    pub fn try_create(&self, new: NewSession) -> Result<SessionSnapshot, SessionConflict> {
        let mut sessions = self.sessions.lock();
        if let Some(existing) = sessions.get(&new.conversation_id) {
            return Err(SessionConflict {
                conversation_id: new.conversation_id,
                message_id: existing.in_progress_message_id.clone(),
            });
        }

        let session = StreamingSession {
            user_id: new.user_id,
            room: new.room,
            in_progress_message_id: new.message_id,
            accumulated_content: String::new(),
            tool_calls: Vec::new(),
            created_at: new.created_at,
            last_delta_at: new.created_at,
            attached: new.origin.into_iter().map(|o| (o.id(), o)).collect(),
            phase: SessionPhase::Active,
        };
        let snapshot = session.snapshot(&new.conversation_id);
        sessions.insert(new.conversation_id, session);
        Ok(snapshot)
    }

    /// Append a delta to an Active session and run `f` with the attached
    /// connections while the table lock is still held, so whatever `f`
    /// enqueues is ordered against concurrent [`SessionTable::attach_with`]
    /// snapshots. `None` when the session is gone, has moved on, or belongs
    /// to a different generation.
    pub fn append_with<R>(
        &self,
        conversation_id: &str,
        message_id: &str,
        delta: &Delta,
        f: impl FnOnce(&[&Outbound]) -> R,
    ) -> Option<R> {
        let mut sessions = self.sessions.lock();
        let session = sessions.get_mut(conversation_id)?;
        if session.in_progress_message_id != message_id || session.phase != SessionPhase::Active {
            return None;
        }
        session.accumulated_content.push_str(&delta.content);
        session.tool_calls.extend(delta.tool_calls.iter().cloned());
        session.last_delta_at = now_millis();
        let attached: Vec<&Outbound> = session.attached.values().collect();
        Some(f(&attached))
    }

    /// Active → Completing. Returns the final content to persist.
    pub fn begin_completion(
        &self,
        conversation_id: &str,
        message_id: &str,
    ) -> Option<SessionSnapshot> {
        let mut sessions = self.sessions.lock();
        let session = sessions.get_mut(conversation_id)?;
        if session.in_progress_message_id != message_id || session.phase != SessionPhase::Active {
            return None;
        }
        session.phase = SessionPhase::Completing;
        Some(session.snapshot(conversation_id))
    }

    /// Mark Failed so no new connection attaches, returning who is attached.
    pub fn mark_failed(&self, conversation_id: &str, message_id: &str) -> Option<Vec<ConnectionId>> {
        let mut sessions = self.sessions.lock();
        let session = sessions.get_mut(conversation_id)?;
        if session.in_progress_message_id != message_id {
            return None;
        }
        session.phase = SessionPhase::Failed;
        Some(session.attached.keys().copied().collect())
    }

    /// Remove the session if it still belongs to `message_id`.
    pub fn remove(&self, conversation_id: &str, message_id: &str) -> Option<SessionSnapshot> {
        let mut sessions = self.sessions.lock();
        if sessions.get(conversation_id)?.in_progress_message_id != message_id {
            return None;
        }
        sessions
            .remove(conversation_id)
            .map(|s| s.snapshot(conversation_id))
    }

    /// Attach `connection` to the conversation's session and run `f` with the
    /// post-attach snapshot while the table lock is still held. Deltas
    /// appended after this call therefore reach the connection only after
    /// whatever `f` enqueued. `f` sees `None` when there is no session, it
    /// has Failed, or it belongs to another tenant.
    pub fn attach_with<R>(
        &self,
        conversation_id: &str,
        connection: &Outbound,
        tenant_id: &str,
        f: impl FnOnce(Option<&SessionSnapshot>) -> R,
    ) -> R {
        let mut sessions = self.sessions.lock();
        match sessions.get_mut(conversation_id) {
            Some(session)
                if session.phase != SessionPhase::Failed && session.room.tenant_id == tenant_id =>
            {
                session
                    .attached
                    .insert(connection.id(), connection.clone());
                let snapshot = session.snapshot(conversation_id);
                f(Some(&snapshot))
            }
            _ => f(None),
        }
    }

    pub fn detach(&self, conversation_id: &str, connection_id: ConnectionId) -> bool {
        let mut sessions = self.sessions.lock();
        sessions
            .get_mut(conversation_id)
            .is_some_and(|s| s.attached.remove(&connection_id).is_some())
    }

    /// Drop `connection_id` from every session. Returns how many sessions it
    /// was attached to.
    pub fn detach_everywhere(&self, connection_id: ConnectionId) -> usize {
        let mut sessions = self.sessions.lock();
        sessions
            .values_mut()
            .filter_map(|s| s.attached.remove(&connection_id))
            .count()
    }

    pub fn get(&self, conversation_id: &str) -> Option<SessionSnapshot> {
        self.sessions
            .lock()
            .get(conversation_id)
            .map(|s| s.snapshot(conversation_id))
    }

    /// Active sessions in a room, oldest first.
    pub fn active_in_room(&self, room: &RoomKey) -> Vec<SessionSnapshot> {
        let sessions = self.sessions.lock();
        let mut found: Vec<SessionSnapshot> = sessions
            .iter()
            .filter(|(_, s)| &s.room == room && s.phase == SessionPhase::Active)
            .map(|(id, s)| s.snapshot(id))
            .collect();
        found.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.conversation_id.cmp(&b.conversation_id))
        });
        found
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }
}
