use async_trait::async_trait;
use sqlx::Row;
use sqlx::sqlite::SqliteRow;

use crate::error::PersistenceError;
use crate::models::{DurableMessage, Role};

use super::{InsertOutcome, MessageRepository, MessageStore};

fn message_from_row(r: &SqliteRow) -> Result<DurableMessage, PersistenceError> {
    let id: String = r.try_get("id")?;
    let role: String = r.try_get("role")?;
    let role = Role::parse(&role).ok_or_else(|| PersistenceError::Corrupt {
        id: id.clone(),
        detail: format!("unknown role {role:?}"),
    })?;
    let metadata = r
        .try_get::<Option<String>, _>("metadata_json")?
        .map(|raw| serde_json::from_str(&raw))
        .transpose()
        .map_err(|e| PersistenceError::Corrupt {
            id: id.clone(),
            detail: format!("metadata is not JSON: {e}"),
        })?;

    Ok(DurableMessage {
        conversation_id: r.try_get("conversation_id")?,
        content: r.try_get("content")?,
        created_at: r.try_get("created_at")?,
        id,
        role,
        metadata,
    })
}

#[async_trait]
impl MessageStore for MessageRepository {
    async fn find_messages(
        &self,
        conversation_id: &str,
    ) -> Result<Vec<DurableMessage>, PersistenceError> {
        let rows = sqlx::query(
            r#"
            SELECT id, conversation_id, role, content, created_at, metadata_json
            FROM messages
            WHERE conversation_id = ?
            ORDER BY created_at ASC, rowid ASC
            "#,
        )
        .bind(conversation_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(message_from_row).collect()
    }

    async fn insert_message(
        &self,
        message: &DurableMessage,
    ) -> Result<InsertOutcome, PersistenceError> {
        let metadata_json = message.metadata.as_ref().map(|m| m.to_string());

        let result = sqlx::query(
            r#"
            INSERT INTO messages (id, conversation_id, role, content, created_at, metadata_json)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO NOTHING
            "#,
        )
        .bind(&message.id)
        .bind(&message.conversation_id)
        .bind(message.role.as_str())
        .bind(&message.content)
        .bind(message.created_at)
        .bind(metadata_json)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            Ok(InsertOutcome::AlreadyExists)
        } else {
            Ok(InsertOutcome::Inserted)
        }
    }
}
