//! Server metrics for observability
//!
//! Counters for connections, streaming sessions and delivery, exposed as a
//! JSON snapshot on `/api/metrics` and summarized by `/health`.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Server-wide metrics
#[derive(Debug, Default)]
pub struct ServerMetrics {
    // Connection metrics
    /// Currently registered WebSocket connections
    pub active_connections: AtomicU64,
    /// Total connections since server start
    pub total_connections: AtomicU64,
    /// Connections force-disconnected because their outbound queue filled up
    pub connections_evicted: AtomicU64,

    // Session metrics
    pub sessions_started: AtomicU64,
    /// Sessions whose content reached the database
    pub sessions_completed: AtomicU64,
    /// Sessions terminated without persisting
    pub sessions_failed: AtomicU64,
    /// User messages rejected because the conversation was busy
    pub sessions_rejected: AtomicU64,

    // Message metrics
    /// Delta fan-out operations (one per non-empty chunk)
    pub deltas_forwarded: AtomicU64,
    /// Envelopes that could not be queued for a connection
    pub messages_dropped: AtomicU64,

    // Error metrics
    pub persistence_errors: AtomicU64,
    pub protocol_errors: AtomicU64,

    /// Server start time (for uptime calculation)
    start_time: Option<Instant>,
}

impl ServerMetrics {
    pub fn new() -> Self {
        Self {
            start_time: Some(Instant::now()),
            ..Default::default()
        }
    }

    // Connection tracking
    pub fn connection_opened(&self) {
        self.active_connections.fetch_add(1, Ordering::Relaxed);
        self.total_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn connection_evicted(&self) {
        self.connections_evicted.fetch_add(1, Ordering::Relaxed);
    }

    // Session tracking
    pub fn session_started(&self) {
        self.sessions_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn session_completed(&self) {
        self.sessions_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn session_failed(&self) {
        self.sessions_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn session_rejected(&self) {
        self.sessions_rejected.fetch_add(1, Ordering::Relaxed);
    }

    // Message tracking
    pub fn delta_forwarded(&self) {
        self.deltas_forwarded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn message_dropped(&self) {
        self.messages_dropped.fetch_add(1, Ordering::Relaxed);
    }

    // Error tracking
    pub fn persistence_error(&self) {
        self.persistence_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn protocol_error(&self) {
        self.protocol_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Get uptime in seconds
    pub fn uptime_secs(&self) -> u64 {
        self.start_time.map(|t| t.elapsed().as_secs()).unwrap_or(0)
    }

    /// Create a snapshot of all metrics
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            uptime_secs: self.uptime_secs(),
            connections: ConnectionMetrics {
                active: self.active_connections.load(Ordering::Relaxed),
                total: self.total_connections.load(Ordering::Relaxed),
                evicted: self.connections_evicted.load(Ordering::Relaxed),
            },
            sessions: SessionMetrics {
                started: self.sessions_started.load(Ordering::Relaxed),
                completed: self.sessions_completed.load(Ordering::Relaxed),
                failed: self.sessions_failed.load(Ordering::Relaxed),
                rejected: self.sessions_rejected.load(Ordering::Relaxed),
            },
            messages: MessageMetrics {
                deltas_forwarded: self.deltas_forwarded.load(Ordering::Relaxed),
                dropped: self.messages_dropped.load(Ordering::Relaxed),
            },
            errors: ErrorMetrics {
                persistence: self.persistence_errors.load(Ordering::Relaxed),
                protocol: self.protocol_errors.load(Ordering::Relaxed),
            },
        }
    }
}

/// Serializable snapshot of metrics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub uptime_secs: u64,
    pub connections: ConnectionMetrics,
    pub sessions: SessionMetrics,
    pub messages: MessageMetrics,
    pub errors: ErrorMetrics,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionMetrics {
    pub active: u64,
    pub total: u64,
    pub evicted: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMetrics {
    pub started: u64,
    pub completed: u64,
    pub failed: u64,
    pub rejected: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageMetrics {
    pub deltas_forwarded: u64,
    pub dropped: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorMetrics {
    pub persistence: u64,
    pub protocol: u64,
}

/// Health status
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: String,
    pub connections: u64,
    pub active_sessions: u64,
    pub uptime_secs: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_tracking() {
        let metrics = ServerMetrics::new();

        metrics.connection_opened();
        metrics.connection_opened();
        metrics.connection_closed();
        metrics.connection_evicted();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.connections.active, 1);
        assert_eq!(snapshot.connections.total, 2);
        assert_eq!(snapshot.connections.evicted, 1);
    }

    #[test]
    fn test_session_tracking() {
        let metrics = ServerMetrics::new();

        metrics.session_started();
        metrics.session_started();
        metrics.session_completed();
        metrics.session_failed();
        metrics.session_rejected();

        let s = metrics.snapshot().sessions;
        assert_eq!((s.started, s.completed, s.failed, s.rejected), (2, 1, 1, 1));
    }

    #[test]
    fn test_snapshot_serializes() {
        let metrics = ServerMetrics::new();
        metrics.delta_forwarded();
        metrics.message_dropped();
        metrics.persistence_error();

        let json = serde_json::to_value(metrics.snapshot()).unwrap();
        assert_eq!(json["messages"]["deltas_forwarded"], 1);
        assert_eq!(json["messages"]["dropped"], 1);
        assert_eq!(json["errors"]["persistence"], 1);
        assert_eq!(json["errors"]["protocol"], 0);
    }
}
