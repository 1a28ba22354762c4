use std::env;

use sqlx::{
    Error, SqlitePool,
    sqlite::SqlitePoolOptions,
};

pub mod models;

pub use models::{
    attachment, conversation_result, dev_environment, execution_log, project, task,
    task_conversation,
};

/// The sole TaskStore implementation: a SQLite-backed connection pool plus
/// the migrations that define the schema in SPEC_FULL.md §3.1.
///
/// SQLite rather than Postgres (the teacher's `db`/`services` crates target
/// Postgres while its `server` crate targets SQLite — an inconsistency in
/// the source). This core is single-process by design (no distributed
/// scheduling), so a networked multi-writer database buys nothing; SQLite
/// also preserves the "insert visible to an async follow-up query the
/// instant it commits" idiom used by `ExecutionLog::create` without needing
/// a second process to ever contend for the same row. See DESIGN.md.
#[derive(Clone)]
pub struct DBService {
    pub pool: SqlitePool,
}

impl DBService {
    /// Connect using `DATABASE_URL`, creating the database file if absent,
    /// and run all pending migrations.
    pub async fn new(database_url: &str) -> Result<DBService, Error> {
        let pool = SqlitePoolOptions::new()
            .max_connections(16)
            .connect(database_url)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(DBService { pool })
    }

    /// Convenience constructor reading `DATABASE_URL` from the process
    /// environment, matching the teacher's `DBService::new` shape.
    pub async fn from_env() -> Result<DBService, Error> {
        let database_url = env::var("DATABASE_URL")
            .unwrap_or_else(|_| "sqlite://./data/xsha.db?mode=rwc".to_string());
        Self::new(&database_url).await
    }
}

/// Shared fixtures for model tests that need a real, migrated database
/// rather than asserting against in-memory structs.
#[cfg(test)]
pub(crate) mod test_support {
    use sqlx::SqlitePool;
    use sqlx::sqlite::SqlitePoolOptions;
    use uuid::Uuid;

    use crate::models::dev_environment::{CreateDevEnvironment, DevEnvironment, DevEnvironmentKind};
    use crate::models::project::{CreateProject, Project, RepoProtocol};

    pub async fn pool() -> SqlitePool {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("open in-memory sqlite");
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .expect("run migrations");
        pool
    }

    pub async fn seed_project(pool: &SqlitePool) -> Project {
        let data = CreateProject {
            name: "demo".into(),
            repo_url: "https://example.invalid/demo.git".into(),
            repo_protocol: RepoProtocol::Https,
            credential_ref: None,
            system_prompt: None,
            default_branch: "main".into(),
        };
        Project::create(pool, &data, Uuid::new_v4()).await.expect("seed project")
    }

    pub async fn seed_dev_environment(pool: &SqlitePool) -> DevEnvironment {
        let data = CreateDevEnvironment {
            name: "default".into(),
            kind: DevEnvironmentKind::ClaudeCode,
            image: "agent:latest".into(),
            cpu_quota: 1.0,
            memory_mib: 512,
            env_vars: Default::default(),
            system_prompt: None,
            session_dir: "default".into(),
        };
        DevEnvironment::create(pool, &data, Uuid::new_v4()).await.expect("seed dev environment")
    }
}
