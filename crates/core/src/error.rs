use thiserror::Error;

use executors::{CommandBuildError, ParseError};
use services::{ContainerRunnerError, LogPipelineError};
use workspace::WorkspaceError;

/// Composes every failure an `Executor::run` can hit, per SPEC_FULL.md §7.1.
/// `is_preflight` distinguishes Preflight-fatal (raised before `Launch`) from
/// Container-fatal/Parse-fatal purely to decide the `ExecutionLog.error`
/// prefix — retry eligibility is governed solely by terminal status
/// (testable property 7), not by this distinction.
#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error(transparent)]
    Workspace(#[from] WorkspaceError),
    #[error(transparent)]
    Container(#[from] ContainerRunnerError),
    #[error(transparent)]
    LogPipeline(#[from] LogPipelineError),
    #[error(transparent)]
    CommandBuild(#[from] CommandBuildError),
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error("conversation preconditions not met (already claimed or not due)")]
    PreconditionFailed,
}

impl ExecutorError {
    /// Preflight-fatal iff it happened before the container was ever
    /// launched: workspace prep, attachment staging, command construction,
    /// or log-pipeline setup. Container launch/wait failures and database
    /// errors observed after that point are Container-fatal instead.
    pub fn is_preflight(&self) -> bool {
        matches!(
            self,
            ExecutorError::Workspace(_) | ExecutorError::CommandBuild(_) | ExecutorError::LogPipeline(_)
        )
    }
}
