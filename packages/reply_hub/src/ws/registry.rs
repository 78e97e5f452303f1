//! Connection Registry
//!
//! Owns every live connection and the room → connections reverse index
//! behind one `parking_lot::Mutex`. Fan-out takes a membership snapshot under
//! the lock and delivers after releasing it; delivery is a `try_send` onto the
//! connection's bounded queue and never blocks. The registry lock is never
//! taken while the session table lock is held.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::ConnectionError;
use crate::metrics::ServerMetrics;
use crate::streaming::SessionTable;

use super::protocol::{Envelope, ServerMessage};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Who is on the other end of a connection, as asserted by upstream glue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionIdentity {
    pub user_id: String,
    pub tenant_id: String,
}

/// A project room. Rooms are scoped to a tenant so equal project ids in
/// different tenants never share traffic.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RoomKey {
    pub tenant_id: String,
    pub project_id: String,
}

impl RoomKey {
    pub fn new(tenant_id: impl Into<String>, project_id: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            project_id: project_id.into(),
        }
    }
}

impl fmt::Display for RoomKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.tenant_id, self.project_id)
    }
}

/// Delivery handle for one connection. Cloned out of the registry so sends
/// happen without holding the registry lock.
#[derive(Clone)]
pub struct Outbound {
    id: ConnectionId,
    tx: mpsc::Sender<Envelope>,
    alive: Arc<AtomicBool>,
    close: CancellationToken,
    metrics: Arc<ServerMetrics>,
}

impl Outbound {
    pub(crate) fn new(
        id: ConnectionId,
        tx: mpsc::Sender<Envelope>,
        close: CancellationToken,
        metrics: Arc<ServerMetrics>,
    ) -> Self {
        Self {
            id,
            tx,
            alive: Arc::new(AtomicBool::new(true)),
            close,
            metrics,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// Non-blocking enqueue. A full queue evicts the connection: it is
    /// flagged dead and its close token cancelled so the connection task
    /// tears it down.
    pub fn deliver(&self, envelope: Envelope) -> Result<(), ConnectionError> {
        if !self.is_alive() {
            self.metrics.message_dropped();
            return Err(ConnectionError::Closed(self.id));
        }
        match self.tx.try_send(envelope) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.metrics.message_dropped();
                if self.mark_dead() {
                    warn!(conn_id = %self.id, "Outbound queue full, disconnecting slow client");
                    self.metrics.connection_evicted();
                }
                Err(ConnectionError::QueueFull(self.id))
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.metrics.message_dropped();
                self.mark_dead();
                Err(ConnectionError::Closed(self.id))
            }
        }
    }

    /// Returns true if this call flipped the flag.
    fn mark_dead(&self) -> bool {
        let was_alive = self.alive.swap(false, Ordering::SeqCst);
        self.close.cancel();
        was_alive
    }
}

impl fmt::Debug for Outbound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Outbound")
            .field("id", &self.id)
            .field("alive", &self.is_alive())
            .finish()
    }
}

struct ConnectionEntry {
    identity: ConnectionIdentity,
    room: Option<RoomKey>,
    outbound: Outbound,
}

#[derive(Default)]
struct RegistryInner {
    connections: HashMap<ConnectionId, ConnectionEntry>,
    rooms: HashMap<RoomKey, HashSet<ConnectionId>>,
}

impl RegistryInner {
    fn leave_current_room(&mut self, id: ConnectionId) -> Option<RoomKey> {
        let previous = self.connections.get_mut(&id)?.room.take()?;
        if let Some(members) = self.rooms.get_mut(&previous) {
            members.remove(&id);
            if members.is_empty() {
                self.rooms.remove(&previous);
            }
        }
        Some(previous)
    }
}

pub struct ConnectionRegistry {
    inner: Mutex<RegistryInner>,
    next_id: AtomicU64,
    sessions: Arc<SessionTable>,
    metrics: Arc<ServerMetrics>,
}

impl ConnectionRegistry {
    pub fn new(sessions: Arc<SessionTable>, metrics: Arc<ServerMetrics>) -> Self {
        Self {
            inner: Mutex::new(RegistryInner::default()),
            next_id: AtomicU64::new(1),
            sessions,
            metrics,
        }
    }

    pub fn register(
        &self,
        identity: ConnectionIdentity,
        tx: mpsc::Sender<Envelope>,
        close: CancellationToken,
    ) -> ConnectionId {
        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let outbound = Outbound::new(id, tx, close, Arc::clone(&self.metrics));
        self.inner.lock().connections.insert(
            id,
            ConnectionEntry {
                identity,
                room: None,
                outbound,
            },
        );
        debug!(conn_id = %id, "Connection registered");
        id
    }

    /// Idempotent. Returns false if the connection was already gone.
    pub fn unregister(&self, id: ConnectionId) -> bool {
        let removed = {
            let mut inner = self.inner.lock();
            inner.leave_current_room(id);
            inner.connections.remove(&id)
        };
        let Some(entry) = removed else {
            return false;
        };
        // flag first: a concurrent attach that lands after the sweep below
        // sees the flag and undoes itself
        entry.outbound.alive.store(false, Ordering::SeqCst);
        let detached = self.sessions.detach_everywhere(id);
        debug!(conn_id = %id, detached, "Connection unregistered");
        true
    }

    /// Join `project_id` in the connection's tenant, leaving any previous
    /// room. Returns the new room.
    pub fn join_room(&self, id: ConnectionId, project_id: &str) -> Result<RoomKey, ConnectionError> {
        let mut inner = self.inner.lock();
        let tenant_id = inner
            .connections
            .get(&id)
            .ok_or(ConnectionError::Unknown(id))?
            .identity
            .tenant_id
            .clone();
        let room = RoomKey::new(tenant_id, project_id);

        inner.leave_current_room(id);
        inner.rooms.entry(room.clone()).or_default().insert(id);
        if let Some(entry) = inner.connections.get_mut(&id) {
            entry.room = Some(room.clone());
        }
        Ok(room)
    }

    /// Returns the room that was left, if any.
    pub fn leave_room(&self, id: ConnectionId) -> Result<Option<RoomKey>, ConnectionError> {
        let mut inner = self.inner.lock();
        if !inner.connections.contains_key(&id) {
            return Err(ConnectionError::Unknown(id));
        }
        Ok(inner.leave_current_room(id))
    }

    pub fn room_of(&self, id: ConnectionId) -> Option<RoomKey> {
        self.inner.lock().connections.get(&id)?.room.clone()
    }

    pub fn identity(&self, id: ConnectionId) -> Option<ConnectionIdentity> {
        self.inner
            .lock()
            .connections
            .get(&id)
            .map(|e| e.identity.clone())
    }

    pub fn outbound(&self, id: ConnectionId) -> Option<Outbound> {
        self.inner
            .lock()
            .connections
            .get(&id)
            .map(|e| e.outbound.clone())
    }

    pub fn room_members(&self, room: &RoomKey) -> Vec<ConnectionId> {
        let inner = self.inner.lock();
        let mut members: Vec<ConnectionId> = inner
            .rooms
            .get(room)
            .map(|m| m.iter().copied().collect())
            .unwrap_or_default();
        members.sort();
        members
    }

    /// Delivery handles for every member of `room`.
    pub fn room_outbounds(&self, room: &RoomKey) -> Vec<Outbound> {
        let inner = self.inner.lock();
        match inner.rooms.get(room) {
            Some(members) => members
                .iter()
                .filter_map(|id| inner.connections.get(id))
                .map(|e| e.outbound.clone())
                .collect(),
            None => Vec::new(),
        }
    }

    pub fn connection_count(&self) -> usize {
        self.inner.lock().connections.len()
    }

    /// Unicast. Fails if the connection is unknown or could not take the
    /// message.
    pub fn send_to(
        &self,
        id: ConnectionId,
        message: ServerMessage,
        correlation_id: Option<String>,
    ) -> Result<(), ConnectionError> {
        let outbound = self.outbound(id).ok_or(ConnectionError::Unknown(id))?;
        outbound.deliver(Envelope::reply(message, correlation_id))
    }

    /// Send to every member of `room`. Returns how many connections took
    /// the message.
    pub fn broadcast_to_room(&self, room: &RoomKey, message: ServerMessage) -> usize {
        deliver_all(&self.room_outbounds(room), &Envelope::new(message))
    }

    /// Send to exactly `ids`; an empty target set falls back to the whole
    /// room. Unknown ids are skipped.
    pub fn send_to_connections(
        &self,
        ids: &[ConnectionId],
        room: &RoomKey,
        message: ServerMessage,
    ) -> usize {
        if ids.is_empty() {
            return self.broadcast_to_room(room, message);
        }
        let targets: Vec<Outbound> = {
            let inner = self.inner.lock();
            ids.iter()
                .filter_map(|id| inner.connections.get(id))
                .map(|e| e.outbound.clone())
                .collect()
        };
        deliver_all(&targets, &Envelope::new(message))
    }
}

/// Offer `envelope` to each target. Returns how many took it.
pub fn deliver_all<'a>(
    targets: impl IntoIterator<Item = &'a Outbound>,
    envelope: &Envelope,
) -> usize {
    targets
        .into_iter()
        .filter(|target| target.deliver(envelope.clone()).is_ok())
        .count()
}
