use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};
use uuid::Uuid;

/// An uploaded file (image or PDF), content-addressed on disk, associated
/// with one conversation. Substituted into the conversation's prompt via a
/// `{{attachment:<id>}}` token at execution time (SPEC_FULL.md §4.1, §9).
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Attachment {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub content_hash: String,
    pub original_filename: String,
    pub mime_type: String,
    pub byte_size: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateAttachment {
    pub conversation_id: Uuid,
    pub content_hash: String,
    pub original_filename: String,
    pub mime_type: String,
    pub byte_size: i64,
}

impl Attachment {
    pub async fn find_by_conversation_id(
        pool: &SqlitePool,
        conversation_id: Uuid,
    ) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as!(
            Attachment,
            r#"SELECT id as "id!: Uuid", conversation_id as "conversation_id!: Uuid",
                      content_hash, original_filename, mime_type, byte_size,
                      created_at as "created_at!: DateTime<Utc>"
               FROM attachments WHERE conversation_id = $1 ORDER BY created_at ASC"#,
            conversation_id
        )
        .fetch_all(pool)
        .await
    }

    pub async fn find_by_id(pool: &SqlitePool, id: Uuid) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as!(
            Attachment,
            r#"SELECT id as "id!: Uuid", conversation_id as "conversation_id!: Uuid",
                      content_hash, original_filename, mime_type, byte_size,
                      created_at as "created_at!: DateTime<Utc>"
               FROM attachments WHERE id = $1"#,
            id
        )
        .fetch_optional(pool)
        .await
    }

    pub async fn create(
        pool: &SqlitePool,
        data: &CreateAttachment,
        id: Uuid,
    ) -> Result<Self, sqlx::Error> {
        sqlx::query_as!(
            Attachment,
            r#"INSERT INTO attachments (id, conversation_id, content_hash, original_filename, mime_type, byte_size)
               VALUES ($1, $2, $3, $4, $5, $6)
               RETURNING id as "id!: Uuid", conversation_id as "conversation_id!: Uuid",
                         content_hash, original_filename, mime_type, byte_size,
                         created_at as "created_at!: DateTime<Utc>""#,
            id,
            data.conversation_id,
            data.content_hash,
            data.original_filename,
            data.mime_type,
            data.byte_size,
        )
        .fetch_one(pool)
        .await
    }

    /// Garbage-collected when the owning conversation's task is deleted; the
    /// conversation itself is never deleted while its task lives, so this is
    /// only ever invoked transitively through `Task::delete`'s cascade.
    pub async fn delete_by_conversation_id(
        pool: &SqlitePool,
        conversation_id: Uuid,
    ) -> Result<u64, sqlx::Error> {
        let result = sqlx::query!(
            "DELETE FROM attachments WHERE conversation_id = $1",
            conversation_id
        )
        .execute(pool)
        .await?;
        Ok(result.rows_affected())
    }
}
