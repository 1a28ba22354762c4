use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};
use strum_macros::{Display, EnumString};
use uuid::Uuid;

/// SPEC_FULL.md deliberately narrows the teacher's five-state Task status
/// (which includes an `in_review` state for kanban workflow) down to the
/// four states spec.md names. See DESIGN.md.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Todo,
    InProgress,
    Done,
    Cancelled,
}

/// A unit of work, scoped to a project and a dev environment, executed as an
/// ordered sequence of conversations.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub project_id: Uuid,
    pub dev_environment_id: Uuid,
    pub title: String,
    /// Unset until the first successful `WorkspaceManager::prepare` (invariant #3).
    pub workspace_path: Option<String>,
    /// Unset until the first successful `ConversationResult` (invariant #4).
    pub session_id: Option<String>,
    pub start_branch: String,
    /// Derived lazily the first time a work branch is needed; stable thereafter.
    pub work_branch: Option<String>,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn status(&self) -> TaskStatus {
        self.status.parse().unwrap_or_default()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateTask {
    pub project_id: Uuid,
    pub dev_environment_id: Uuid,
    pub title: String,
    pub start_branch: String,
}

impl Task {
    pub async fn find_by_id(pool: &SqlitePool, id: Uuid) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as!(
            Task,
            r#"SELECT id as "id!: Uuid", project_id as "project_id!: Uuid",
                      dev_environment_id as "dev_environment_id!: Uuid", title,
                      workspace_path, session_id, start_branch, work_branch, status,
                      created_at as "created_at!: DateTime<Utc>",
                      updated_at as "updated_at!: DateTime<Utc>"
               FROM tasks WHERE id = $1"#,
            id
        )
        .fetch_optional(pool)
        .await
    }

    pub async fn find_by_project_id(
        pool: &SqlitePool,
        project_id: Uuid,
    ) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as!(
            Task,
            r#"SELECT id as "id!: Uuid", project_id as "project_id!: Uuid",
                      dev_environment_id as "dev_environment_id!: Uuid", title,
                      workspace_path, session_id, start_branch, work_branch, status,
                      created_at as "created_at!: DateTime<Utc>",
                      updated_at as "updated_at!: DateTime<Utc>"
               FROM tasks WHERE project_id = $1 ORDER BY created_at DESC"#,
            project_id
        )
        .fetch_all(pool)
        .await
    }

    pub async fn create(pool: &SqlitePool, data: &CreateTask, id: Uuid) -> Result<Self, sqlx::Error> {
        let status = TaskStatus::default().to_string();
        sqlx::query_as!(
            Task,
            r#"INSERT INTO tasks (id, project_id, dev_environment_id, title, start_branch, status)
               VALUES ($1, $2, $3, $4, $5, $6)
               RETURNING id as "id!: Uuid", project_id as "project_id!: Uuid",
                         dev_environment_id as "dev_environment_id!: Uuid", title,
                         workspace_path, session_id, start_branch, work_branch, status,
                         created_at as "created_at!: DateTime<Utc>",
                         updated_at as "updated_at!: DateTime<Utc>""#,
            id,
            data.project_id,
            data.dev_environment_id,
            data.title,
            data.start_branch,
            status,
        )
        .fetch_one(pool)
        .await
    }

    /// Set exactly once, on first successful workspace preparation (invariant #3).
    /// Callers are responsible for only calling this when `workspace_path` is
    /// currently `NULL`; the `WHERE` clause enforces it is never overwritten.
    pub async fn set_workspace_path_if_unset(
        pool: &SqlitePool,
        id: Uuid,
        workspace_path: &str,
    ) -> Result<(), sqlx::Error> {
        sqlx::query!(
            r#"UPDATE tasks SET workspace_path = $2 WHERE id = $1 AND workspace_path IS NULL"#,
            id,
            workspace_path,
        )
        .execute(pool)
        .await?;
        Ok(())
    }

    pub async fn set_work_branch_if_unset(
        pool: &SqlitePool,
        id: Uuid,
        work_branch: &str,
    ) -> Result<(), sqlx::Error> {
        sqlx::query!(
            r#"UPDATE tasks SET work_branch = $2 WHERE id = $1 AND work_branch IS NULL"#,
            id,
            work_branch,
        )
        .execute(pool)
        .await?;
        Ok(())
    }

    /// Set at most once: to the `session_id` of the first successful
    /// `ConversationResult` (invariant #4, testable property "session-id
    /// monotonicity" in SPEC_FULL.md §8).
    /// Generic over the executor so callers in `crates/core` can run this
    /// inside the same transaction as `TaskConversation::mark_terminal` and
    /// `ExecutionLog::finalize` (SPEC_FULL.md §5).
    pub async fn set_session_id_if_unset<'e, E>(executor: E, id: Uuid, session_id: &str) -> Result<(), sqlx::Error>
    where
        E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
    {
        sqlx::query!(
            r#"UPDATE tasks SET session_id = $2 WHERE id = $1 AND session_id IS NULL"#,
            id,
            session_id,
        )
        .execute(executor)
        .await?;
        Ok(())
    }

    pub async fn update_status(
        pool: &SqlitePool,
        id: Uuid,
        status: TaskStatus,
    ) -> Result<(), sqlx::Error> {
        let status = status.to_string();
        sqlx::query!("UPDATE tasks SET status = $2 WHERE id = $1", id, status)
            .execute(pool)
            .await?;
        Ok(())
    }

    pub async fn delete(pool: &SqlitePool, id: Uuid) -> Result<u64, sqlx::Error> {
        let result = sqlx::query!("DELETE FROM tasks WHERE id = $1", id)
            .execute(pool)
            .await?;
        Ok(result.rows_affected())
    }
}
