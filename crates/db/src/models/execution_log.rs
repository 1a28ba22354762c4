use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};
use strum_macros::{Display, EnumString};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ExecutionLogStatus {
    #[default]
    Running,
    Success,
    Failed,
    Cancelled,
}

impl ExecutionLogStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Running)
    }
}

/// The audit record of one attempt to run one conversation. Per the log
/// storage duality redesign in SPEC_FULL.md §9, `log_path` is a pointer into
/// an append-only byte store keyed by this row's id (see `crates/services`),
/// not an inline column — so there is no 64 KiB-per-line ceiling here.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct ExecutionLog {
    pub id: Uuid,
    pub conversation_id: Uuid,
    /// The exact container launch command, with secret env values masked.
    pub launch_command: String,
    pub container_id: Option<String>,
    pub log_path: String,
    pub status: String,
    pub exit_code: Option<i64>,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl ExecutionLog {
    pub fn status(&self) -> ExecutionLogStatus {
        self.status.parse().unwrap_or_default()
    }
}

impl ExecutionLog {
    pub async fn find_by_id(pool: &SqlitePool, id: Uuid) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as!(
            ExecutionLog,
            r#"SELECT id as "id!: Uuid", conversation_id as "conversation_id!: Uuid",
                      launch_command, container_id, log_path, status, exit_code, error,
                      started_at as "started_at!: DateTime<Utc>",
                      finished_at as "finished_at: DateTime<Utc>",
                      created_at as "created_at!: DateTime<Utc>"
               FROM execution_logs WHERE id = $1"#,
            id
        )
        .fetch_optional(pool)
        .await
    }

    pub async fn find_by_conversation_id(
        pool: &SqlitePool,
        conversation_id: Uuid,
    ) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as!(
            ExecutionLog,
            r#"SELECT id as "id!: Uuid", conversation_id as "conversation_id!: Uuid",
                      launch_command, container_id, log_path, status, exit_code, error,
                      started_at as "started_at!: DateTime<Utc>",
                      finished_at as "finished_at: DateTime<Utc>",
                      created_at as "created_at!: DateTime<Utc>"
               FROM execution_logs WHERE conversation_id = $1 ORDER BY started_at ASC"#,
            conversation_id
        )
        .fetch_all(pool)
        .await
    }

    /// Any execution left `running` with no live worker — the restart
    /// reconciliation target (SPEC_FULL.md §4.6.1).
    pub async fn find_running(pool: &SqlitePool) -> Result<Vec<Self>, sqlx::Error> {
        let running = ExecutionLogStatus::Running.to_string();
        sqlx::query_as!(
            ExecutionLog,
            r#"SELECT id as "id!: Uuid", conversation_id as "conversation_id!: Uuid",
                      launch_command, container_id, log_path, status, exit_code, error,
                      started_at as "started_at!: DateTime<Utc>",
                      finished_at as "finished_at: DateTime<Utc>",
                      created_at as "created_at!: DateTime<Utc>"
               FROM execution_logs WHERE status = $1"#,
            running
        )
        .fetch_all(pool)
        .await
    }

    /// Intentionally not wrapped in a transaction: a concurrently-running
    /// live-stream subscriber may `find_by_id` this row on a separate
    /// connection the instant it commits, and SQLite's per-connection
    /// snapshotting means a transaction would delay that visibility until
    /// commit anyway — so there is nothing to gain by wrapping a single
    /// insert, and a bare statement makes the row visible sooner. Mirrors
    /// the teacher's `ExecutionProcess::create`.
    pub async fn create(
        pool: &SqlitePool,
        id: Uuid,
        conversation_id: Uuid,
        launch_command: &str,
        log_path: &str,
    ) -> Result<Self, sqlx::Error> {
        let status = ExecutionLogStatus::default().to_string();
        sqlx::query_as!(
            ExecutionLog,
            r#"INSERT INTO execution_logs (id, conversation_id, launch_command, log_path, status, started_at)
               VALUES ($1, $2, $3, $4, $5, $6)
               RETURNING id as "id!: Uuid", conversation_id as "conversation_id!: Uuid",
                         launch_command, container_id, log_path, status, exit_code, error,
                         started_at as "started_at!: DateTime<Utc>",
                         finished_at as "finished_at: DateTime<Utc>",
                         created_at as "created_at!: DateTime<Utc>""#,
            id,
            conversation_id,
            launch_command,
            log_path,
            status,
            Utc::now(),
        )
        .fetch_one(pool)
        .await
    }

    /// The launch command depends on the rewritten (attachment-substituted)
    /// prompt, which is only known after the workspace is prepared — so the
    /// row is created with a placeholder and patched once the real masked
    /// transcript is built (SPEC_FULL.md §4.5 step 4).
    pub async fn set_launch_command(
        pool: &SqlitePool,
        id: Uuid,
        launch_command: &str,
    ) -> Result<(), sqlx::Error> {
        sqlx::query!(
            "UPDATE execution_logs SET launch_command = $2 WHERE id = $1",
            id,
            launch_command,
        )
        .execute(pool)
        .await?;
        Ok(())
    }

    pub async fn set_container_id(
        pool: &SqlitePool,
        id: Uuid,
        container_id: &str,
    ) -> Result<(), sqlx::Error> {
        sqlx::query!(
            "UPDATE execution_logs SET container_id = $2 WHERE id = $1",
            id,
            container_id,
        )
        .execute(pool)
        .await?;
        Ok(())
    }

    /// `finalizeExecution`'s ExecutionLog half: closes out a terminal status,
    /// exit code, and optional error string. Callers in `crates/core` run
    /// this together with `TaskConversation::mark_terminal` (and, on first
    /// success, `Task::set_session_id_if_unset`) inside one transaction.
    /// Generic over the executor so callers in `crates/core` can run this
    /// inside the same transaction as `TaskConversation::mark_terminal` and
    /// `Task::set_session_id_if_unset`, as SPEC_FULL.md §5 requires for
    /// `finalizeExecution`.
    pub async fn finalize<'e, E>(
        executor: E,
        id: Uuid,
        status: ExecutionLogStatus,
        exit_code: Option<i64>,
        error: Option<&str>,
    ) -> Result<(), sqlx::Error>
    where
        E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
    {
        debug_assert!(status.is_terminal());
        let status = status.to_string();
        sqlx::query!(
            r#"UPDATE execution_logs
               SET status = $2, exit_code = $3, error = $4, finished_at = $5
               WHERE id = $1"#,
            id,
            status,
            exit_code,
            error,
            Utc::now(),
        )
        .execute(executor)
        .await?;
        Ok(())
    }
}
