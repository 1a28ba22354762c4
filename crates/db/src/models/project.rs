use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};
use strum_macros::{Display, EnumString};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum ProjectError {
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error("project not found")]
    NotFound,
}

/// How [`Project::repo_url`] is cloned. Determines which `git2::RemoteCallbacks`
/// credential path the workspace manager wires up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum RepoProtocol {
    Https,
    Ssh,
}

/// Identifies a source repository plus the optional instructions the agent
/// is given for every task under it.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Project {
    pub id: Uuid,
    pub name: String,
    pub repo_url: String,
    pub repo_protocol: String,
    /// Opaque lookup key into a credential store; never the secret itself.
    pub credential_ref: Option<String>,
    pub system_prompt: Option<String>,
    pub default_branch: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Project {
    pub fn protocol(&self) -> Result<RepoProtocol, strum::ParseError> {
        self.repo_protocol.parse()
    }

    /// Slug used as the first path segment under `workspaceBaseDir`.
    pub fn slug(&self) -> String {
        utils::text::git_branch_id(&self.name, 48)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateProject {
    pub name: String,
    pub repo_url: String,
    pub repo_protocol: RepoProtocol,
    pub credential_ref: Option<String>,
    pub system_prompt: Option<String>,
    pub default_branch: String,
}

#[derive(Debug, Deserialize)]
pub struct UpdateProject {
    pub name: Option<String>,
    pub system_prompt: Option<String>,
    pub default_branch: Option<String>,
    pub credential_ref: Option<String>,
}

impl Project {
    pub async fn find_all(pool: &SqlitePool) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as!(
            Project,
            r#"SELECT id as "id!: Uuid", name, repo_url, repo_protocol,
                      credential_ref, system_prompt, default_branch,
                      created_at as "created_at!: DateTime<Utc>",
                      updated_at as "updated_at!: DateTime<Utc>"
               FROM projects ORDER BY created_at DESC"#
        )
        .fetch_all(pool)
        .await
    }

    pub async fn find_by_id(pool: &SqlitePool, id: Uuid) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as!(
            Project,
            r#"SELECT id as "id!: Uuid", name, repo_url, repo_protocol,
                      credential_ref, system_prompt, default_branch,
                      created_at as "created_at!: DateTime<Utc>",
                      updated_at as "updated_at!: DateTime<Utc>"
               FROM projects WHERE id = $1"#,
            id
        )
        .fetch_optional(pool)
        .await
    }

    pub async fn create(
        pool: &SqlitePool,
        data: &CreateProject,
        id: Uuid,
    ) -> Result<Self, sqlx::Error> {
        let protocol = data.repo_protocol.to_string();
        sqlx::query_as!(
            Project,
            r#"INSERT INTO projects (id, name, repo_url, repo_protocol, credential_ref, system_prompt, default_branch)
               VALUES ($1, $2, $3, $4, $5, $6, $7)
               RETURNING id as "id!: Uuid", name, repo_url, repo_protocol,
                         credential_ref, system_prompt, default_branch,
                         created_at as "created_at!: DateTime<Utc>",
                         updated_at as "updated_at!: DateTime<Utc>""#,
            id,
            data.name,
            data.repo_url,
            protocol,
            data.credential_ref,
            data.system_prompt,
            data.default_branch,
        )
        .fetch_one(pool)
        .await
    }

    pub async fn update(
        pool: &SqlitePool,
        id: Uuid,
        payload: &UpdateProject,
    ) -> Result<Self, ProjectError> {
        let existing = Self::find_by_id(pool, id).await?.ok_or(ProjectError::NotFound)?;
        let name = payload.name.clone().unwrap_or(existing.name);
        let system_prompt = payload.system_prompt.clone().or(existing.system_prompt);
        let default_branch = payload.default_branch.clone().unwrap_or(existing.default_branch);
        let credential_ref = payload.credential_ref.clone().or(existing.credential_ref);

        Ok(sqlx::query_as!(
            Project,
            r#"UPDATE projects SET name = $2, system_prompt = $3, default_branch = $4, credential_ref = $5
               WHERE id = $1
               RETURNING id as "id!: Uuid", name, repo_url, repo_protocol,
                         credential_ref, system_prompt, default_branch,
                         created_at as "created_at!: DateTime<Utc>",
                         updated_at as "updated_at!: DateTime<Utc>""#,
            id,
            name,
            system_prompt,
            default_branch,
            credential_ref,
        )
        .fetch_one(pool)
        .await?)
    }

    pub async fn delete(pool: &SqlitePool, id: Uuid) -> Result<u64, sqlx::Error> {
        let result = sqlx::query!("DELETE FROM projects WHERE id = $1", id)
            .execute(pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_round_trips() {
        assert_eq!(RepoProtocol::Https.to_string(), "https");
        assert_eq!("ssh".parse::<RepoProtocol>().unwrap(), RepoProtocol::Ssh);
    }
}
