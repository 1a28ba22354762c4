use std::path::{Path, PathBuf};

use async_trait::async_trait;
use secrecy::SecretString;

use crate::error::WorkspaceError;

/// Resolves a `Project.credential_ref` into the secret material `git2` needs
/// to authenticate a clone/fetch/push, without `crates/workspace` itself
/// knowing where credentials are actually kept — the same seam the teacher
/// keeps between `executors` and its `ExecutorApprovalService` (approval UI
/// is a trait object the executor calls into, never something it implements
/// itself).
#[async_trait]
pub trait CredentialResolver: Send + Sync {
    async fn resolve(&self, credential_ref: &str) -> Result<SecretString, WorkspaceError>;
}

/// Minimal resolver good enough to make `WorkspaceManager::prepare` runnable
/// end to end: one file per credential ref, under a configured directory,
/// containing the secret (token or passphrase-less key) as its sole content.
/// Not a secrets-manager integration — operators wanting one implement
/// [`CredentialResolver`] themselves.
pub struct FileCredentialResolver {
    base_dir: PathBuf,
}

impl FileCredentialResolver {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self { base_dir: base_dir.into() }
    }

    fn path_for(&self, credential_ref: &str) -> PathBuf {
        self.base_dir.join(credential_ref)
    }
}

#[async_trait]
impl CredentialResolver for FileCredentialResolver {
    async fn resolve(&self, credential_ref: &str) -> Result<SecretString, WorkspaceError> {
        let path: &Path = &self.path_for(credential_ref);
        let contents = tokio::fs::read_to_string(path)
            .await
            .map_err(|_| WorkspaceError::Credential(credential_ref.to_string()))?;
        Ok(SecretString::from(contents.trim().to_string()))
    }
}
