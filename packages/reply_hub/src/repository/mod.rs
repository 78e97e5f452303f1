// Repository layer: durable conversation messages behind the narrow
// `MessageStore` seam the streaming core depends on.

use async_trait::async_trait;
use sqlx::sqlite::SqlitePool;

use crate::error::PersistenceError;
use crate::models::DurableMessage;

mod messages;

#[cfg(test)]
pub(crate) mod test_helpers;

/// Result of an insert-once write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// A row with the same id was already present. Callers treat this as
    /// success.
    AlreadyExists,
}

/// Persistence collaborator for durable messages.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// History for one conversation, oldest first (creation time, then
    /// insertion order).
    async fn find_messages(
        &self,
        conversation_id: &str,
    ) -> Result<Vec<DurableMessage>, PersistenceError>;

    /// Insert keyed by `message.id`; never overwrites.
    async fn insert_message(
        &self,
        message: &DurableMessage,
    ) -> Result<InsertOutcome, PersistenceError>;
}

#[derive(Clone)]
pub struct MessageRepository {
    pub(crate) pool: SqlitePool,
}

impl MessageRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}
