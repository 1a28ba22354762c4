use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};
use strum_macros::{Display, EnumString};
use uuid::Uuid;

/// Which agent binary a [`DevEnvironment`] launches. Drives command
/// construction in the executors crate (SPEC_FULL.md §4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[strum(serialize_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum DevEnvironmentKind {
    ClaudeCode,
    Opencode,
    GeminiCli,
}

/// A named runtime template: which agent, which container image, what
/// resource quota, and what environment it runs with.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct DevEnvironment {
    pub id: Uuid,
    pub name: String,
    pub kind: String,
    pub image: String,
    pub cpu_quota: f64,
    pub memory_mib: i64,
    /// Serialized JSON object; see `env_vars()` for the typed accessor.
    pub env_vars: String,
    pub system_prompt: Option<String>,
    pub session_dir: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DevEnvironment {
    pub fn kind(&self) -> Result<DevEnvironmentKind, strum::ParseError> {
        self.kind.parse()
    }

    pub fn env_vars(&self) -> BTreeMap<String, String> {
        serde_json::from_str(&self.env_vars).unwrap_or_default()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateDevEnvironment {
    pub name: String,
    pub kind: DevEnvironmentKind,
    pub image: String,
    pub cpu_quota: f64,
    pub memory_mib: i64,
    pub env_vars: BTreeMap<String, String>,
    pub system_prompt: Option<String>,
    pub session_dir: String,
}

impl DevEnvironment {
    pub async fn find_by_id(pool: &SqlitePool, id: Uuid) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as!(
            DevEnvironment,
            r#"SELECT id as "id!: Uuid", name, kind, image, cpu_quota, memory_mib,
                      env_vars, system_prompt, session_dir,
                      created_at as "created_at!: DateTime<Utc>",
                      updated_at as "updated_at!: DateTime<Utc>"
               FROM dev_environments WHERE id = $1"#,
            id
        )
        .fetch_optional(pool)
        .await
    }

    pub async fn create(
        pool: &SqlitePool,
        data: &CreateDevEnvironment,
        id: Uuid,
    ) -> Result<Self, sqlx::Error> {
        let kind = data.kind.to_string();
        let env_vars = serde_json::to_string(&data.env_vars).unwrap_or_else(|_| "{}".to_string());
        sqlx::query_as!(
            DevEnvironment,
            r#"INSERT INTO dev_environments (id, name, kind, image, cpu_quota, memory_mib, env_vars, system_prompt, session_dir)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
               RETURNING id as "id!: Uuid", name, kind, image, cpu_quota, memory_mib,
                         env_vars, system_prompt, session_dir,
                         created_at as "created_at!: DateTime<Utc>",
                         updated_at as "updated_at!: DateTime<Utc>""#,
            id,
            data.name,
            kind,
            data.image,
            data.cpu_quota,
            data.memory_mib,
            env_vars,
            data.system_prompt,
            data.session_dir,
        )
        .fetch_one(pool)
        .await
    }
}
