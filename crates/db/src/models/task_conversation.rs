use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};
use strum_macros::{Display, EnumString};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum TaskConversationError {
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error("conversation not found")]
    NotFound,
    #[error("retry rejected: conversation is not the latest on its task, or is not in a retryable status")]
    RetryNotEligible,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ConversationStatus {
    #[default]
    Pending,
    Running,
    Success,
    Failed,
    Cancelled,
}

impl ConversationStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Failed | Self::Cancelled)
    }

    pub fn is_retryable(self) -> bool {
        matches!(self, Self::Failed | Self::Cancelled)
    }
}

/// One prompt+reply cycle — the atomic unit of scheduling and retry.
/// Conversations of a task form a totally ordered sequence by `created_at`;
/// `version` backs the optimistic-concurrency `claim_pending` primitive.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct TaskConversation {
    pub id: Uuid,
    pub task_id: Uuid,
    pub prompt: String,
    pub status: String,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub config_model: Option<String>,
    pub config_is_plan_mode: bool,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TaskConversation {
    pub fn status(&self) -> ConversationStatus {
        self.status.parse().unwrap_or_default()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateTaskConversation {
    pub task_id: Uuid,
    pub prompt: String,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub config_model: Option<String>,
    pub config_is_plan_mode: bool,
}

impl TaskConversation {
    pub async fn find_by_id(pool: &SqlitePool, id: Uuid) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as!(
            TaskConversation,
            r#"SELECT id as "id!: Uuid", task_id as "task_id!: Uuid", prompt, status,
                      scheduled_at as "scheduled_at: DateTime<Utc>",
                      config_model, config_is_plan_mode, version,
                      created_at as "created_at!: DateTime<Utc>",
                      updated_at as "updated_at!: DateTime<Utc>"
               FROM task_conversations WHERE id = $1"#,
            id
        )
        .fetch_optional(pool)
        .await
    }

    pub async fn find_by_task_id(
        pool: &SqlitePool,
        task_id: Uuid,
    ) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as!(
            TaskConversation,
            r#"SELECT id as "id!: Uuid", task_id as "task_id!: Uuid", prompt, status,
                      scheduled_at as "scheduled_at: DateTime<Utc>",
                      config_model, config_is_plan_mode, version,
                      created_at as "created_at!: DateTime<Utc>",
                      updated_at as "updated_at!: DateTime<Utc>"
               FROM task_conversations WHERE task_id = $1 ORDER BY created_at ASC"#,
            task_id
        )
        .fetch_all(pool)
        .await
    }

    /// The latest conversation on a task by creation time; only this one is
    /// retry-eligible (SPEC_FULL.md §4.5, testable property 7).
    pub async fn find_latest_by_task_id(
        pool: &SqlitePool,
        task_id: Uuid,
    ) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as!(
            TaskConversation,
            r#"SELECT id as "id!: Uuid", task_id as "task_id!: Uuid", prompt, status,
                      scheduled_at as "scheduled_at: DateTime<Utc>",
                      config_model, config_is_plan_mode, version,
                      created_at as "created_at!: DateTime<Utc>",
                      updated_at as "updated_at!: DateTime<Utc>"
               FROM task_conversations WHERE task_id = $1
               ORDER BY created_at DESC LIMIT 1"#,
            task_id
        )
        .fetch_optional(pool)
        .await
    }

    /// Candidate conversations for the scheduler's dispatch tick: pending,
    /// due (or unscheduled), whose parent task has no other in-flight
    /// execution, ordered `(scheduled_at NULLS FIRST, created_at)`.
    ///
    /// Per-task serialization (invariant #2 / testable property 2) must hold
    /// *within* a single candidate set, not just against rows that are
    /// already `running`: if a task has two due `pending` conversations,
    /// only the earliest-created one is returned here, never both — the
    /// `c.id = (SELECT ... ORDER BY ... LIMIT 1)` clause picks exactly the
    /// row `claim_pending` would race to dispatch first for that task, so
    /// the sibling conversation simply never appears as a candidate until
    /// the first has left `pending`.
    pub async fn find_dispatch_candidates(
        pool: &SqlitePool,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as!(
            TaskConversation,
            r#"SELECT c.id as "id!: Uuid", c.task_id as "task_id!: Uuid", c.prompt, c.status,
                      c.scheduled_at as "scheduled_at: DateTime<Utc>",
                      c.config_model, c.config_is_plan_mode, c.version,
                      c.created_at as "created_at!: DateTime<Utc>",
                      c.updated_at as "updated_at!: DateTime<Utc>"
               FROM task_conversations c
               WHERE c.status = 'pending'
                 AND (c.scheduled_at IS NULL OR c.scheduled_at <= $1)
                 AND NOT EXISTS (
                     SELECT 1 FROM task_conversations other
                     WHERE other.task_id = c.task_id AND other.status = 'running'
                 )
                 AND c.id = (
                     SELECT p.id FROM task_conversations p
                     WHERE p.task_id = c.task_id
                       AND p.status = 'pending'
                       AND (p.scheduled_at IS NULL OR p.scheduled_at <= $1)
                     ORDER BY (p.scheduled_at IS NOT NULL), p.scheduled_at ASC, p.created_at ASC
                     LIMIT 1
                 )
               ORDER BY (c.scheduled_at IS NOT NULL), c.scheduled_at ASC, c.created_at ASC
               LIMIT $2"#,
            now,
            limit,
        )
        .fetch_all(pool)
        .await
    }

    pub async fn create(
        pool: &SqlitePool,
        data: &CreateTaskConversation,
        id: Uuid,
    ) -> Result<Self, sqlx::Error> {
        let status = ConversationStatus::default().to_string();
        sqlx::query_as!(
            TaskConversation,
            r#"INSERT INTO task_conversations
                (id, task_id, prompt, status, scheduled_at, config_model, config_is_plan_mode, version)
               VALUES ($1, $2, $3, $4, $5, $6, $7, 0)
               RETURNING id as "id!: Uuid", task_id as "task_id!: Uuid", prompt, status,
                         scheduled_at as "scheduled_at: DateTime<Utc>",
                         config_model, config_is_plan_mode, version,
                         created_at as "created_at!: DateTime<Utc>",
                         updated_at as "updated_at!: DateTime<Utc>""#,
            id,
            data.task_id,
            data.prompt,
            status,
            data.scheduled_at,
            data.config_model,
            data.config_is_plan_mode,
        )
        .fetch_one(pool)
        .await
    }

    /// `claimPendingConversation`: the scheduler's atomic `pending` →
    /// `running` transition (invariant #2). Guarded by `version` so two
    /// dispatcher ticks racing on the same row cannot both win the claim.
    /// Returns `None` if the row no longer matches (already claimed, status
    /// changed, or version stale) — this is an expected outcome, not an error.
    pub async fn claim_pending(
        pool: &SqlitePool,
        conv_id: Uuid,
        expected_version: i64,
    ) -> Result<Option<Self>, sqlx::Error> {
        let running = ConversationStatus::Running.to_string();
        let pending = ConversationStatus::Pending.to_string();
        sqlx::query_as!(
            TaskConversation,
            r#"UPDATE task_conversations
               SET status = $1, version = version + 1
               WHERE id = $2 AND status = $3 AND version = $4
               RETURNING id as "id!: Uuid", task_id as "task_id!: Uuid", prompt, status,
                         scheduled_at as "scheduled_at: DateTime<Utc>",
                         config_model, config_is_plan_mode, version,
                         created_at as "created_at!: DateTime<Utc>",
                         updated_at as "updated_at!: DateTime<Utc>""#,
            running,
            conv_id,
            pending,
            expected_version,
        )
        .fetch_optional(pool)
        .await
    }

    /// Transition to a terminal status. Part of `finalizeExecution`; callers
    /// in `crates/core` wrap this together with the owning `ExecutionLog`
    /// update (and, on first success, `Task::set_session_id_if_unset`) in a
    /// single transaction per SPEC_FULL.md §5.
    /// Generic over the executor so callers in `crates/core` can run this
    /// inside the same transaction as `ExecutionLog::finalize` and, on first
    /// success, `Task::set_session_id_if_unset` (SPEC_FULL.md §5).
    pub async fn mark_terminal<'e, E>(executor: E, id: Uuid, status: ConversationStatus) -> Result<(), sqlx::Error>
    where
        E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
    {
        debug_assert!(status.is_terminal());
        let status = status.to_string();
        sqlx::query!(
            "UPDATE task_conversations SET status = $2, version = version + 1 WHERE id = $1",
            id,
            status,
        )
        .execute(executor)
        .await?;
        Ok(())
    }

    /// `retry-eligibility` (SPEC_FULL.md §8, property 7): succeeds iff this
    /// conversation is the latest of its task AND its status is failed or
    /// cancelled. Does not itself create the clone; callers insert a fresh
    /// `pending` conversation carrying the same prompt/config on success.
    pub async fn check_retry_eligible(
        pool: &SqlitePool,
        conv_id: Uuid,
    ) -> Result<Self, TaskConversationError> {
        let conv = Self::find_by_id(pool, conv_id)
            .await?
            .ok_or(TaskConversationError::NotFound)?;
        let latest = Self::find_latest_by_task_id(pool, conv.task_id)
            .await?
            .ok_or(TaskConversationError::NotFound)?;
        if latest.id == conv.id && conv.status().is_retryable() {
            Ok(conv)
        } else {
            Err(TaskConversationError::RetryNotEligible)
        }
    }
}
