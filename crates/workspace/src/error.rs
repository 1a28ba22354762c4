use thiserror::Error;

#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("git operation failed: {0}")]
    Git(#[from] git2::Error),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("credential resolution failed for ref `{0}`")]
    Credential(String),
    #[error("unresolved attachment token `{0}` in prompt")]
    UnresolvedAttachmentToken(String),
    #[error("project {0} has no credential configured but repo uses ssh/https auth")]
    MissingCredential(uuid::Uuid),
}
