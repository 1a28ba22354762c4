pub mod credential;
pub mod error;
pub mod manager;

pub use credential::{CredentialResolver, FileCredentialResolver};
pub use error::WorkspaceError;
pub use manager::{CommitOutcome, WorkspaceManager};
