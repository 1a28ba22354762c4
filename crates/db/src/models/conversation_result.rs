use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};
use uuid::Uuid;

/// The parsed structured outcome of a successful execution. Bound 1:1 to a
/// conversation's execution log on successful `ResultParser::parse`
/// (SPEC_FULL.md §4.4); immutable once created.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct ConversationResult {
    pub execution_log_id: Uuid,
    pub subtype: String,
    pub is_error: bool,
    pub session_id: String,
    pub duration_ms: Option<i64>,
    pub duration_api_ms: Option<i64>,
    pub num_turns: Option<i64>,
    pub result: String,
    pub total_cost_usd: Option<f64>,
    /// Opaque nested record, stored as serialized JSON.
    pub usage: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct CreateConversationResult {
    pub execution_log_id: Uuid,
    pub subtype: String,
    pub is_error: bool,
    pub session_id: String,
    pub duration_ms: Option<i64>,
    pub duration_api_ms: Option<i64>,
    pub num_turns: Option<i64>,
    pub result: String,
    pub total_cost_usd: Option<f64>,
    pub usage: Option<serde_json::Value>,
}

impl ConversationResult {
    pub async fn find_by_execution_log_id(
        pool: &SqlitePool,
        execution_log_id: Uuid,
    ) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as!(
            ConversationResult,
            r#"SELECT execution_log_id as "execution_log_id!: Uuid", subtype, is_error, session_id,
                      duration_ms, duration_api_ms, num_turns, result, total_cost_usd, usage,
                      created_at as "created_at!: DateTime<Utc>"
               FROM conversation_results WHERE execution_log_id = $1"#,
            execution_log_id
        )
        .fetch_optional(pool)
        .await
    }

    /// Generic over the executor so callers in `crates/core` can run this
    /// inside the same transaction as `TaskConversation::mark_terminal`,
    /// `ExecutionLog::finalize`, and (on first success) `Task::set_session_id_if_unset`,
    /// as SPEC_FULL.md §5 requires for a success outcome.
    pub async fn create<'e, E>(executor: E, data: &CreateConversationResult) -> Result<Self, sqlx::Error>
    where
        E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
    {
        let usage = data
            .usage
            .as_ref()
            .map(|v| serde_json::to_string(v).unwrap_or_default());
        sqlx::query_as!(
            ConversationResult,
            r#"INSERT INTO conversation_results
                (execution_log_id, subtype, is_error, session_id, duration_ms, duration_api_ms,
                 num_turns, result, total_cost_usd, usage)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
               RETURNING execution_log_id as "execution_log_id!: Uuid", subtype, is_error, session_id,
                         duration_ms, duration_api_ms, num_turns, result, total_cost_usd, usage,
                         created_at as "created_at!: DateTime<Utc>""#,
            data.execution_log_id,
            data.subtype,
            data.is_error,
            data.session_id,
            data.duration_ms,
            data.duration_api_ms,
            data.num_turns,
            data.result,
            data.total_cost_usd,
            usage,
        )
        .fetch_one(executor)
        .await
    }
}
