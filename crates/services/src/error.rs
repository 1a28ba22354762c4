use thiserror::Error;

#[derive(Debug, Error)]
pub enum ContainerRunnerError {
    #[error("failed to spawn container CLI: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("container wait failed: {0}")]
    Wait(#[source] std::io::Error),
    #[error("failed to signal container {0} to stop")]
    Cancel(String),
    #[error("container {0} is not currently running")]
    NotRunning(String),
}

#[derive(Debug, Error)]
pub enum LogPipelineError {
    #[error("failed to open log file at {path}: {source}")]
    Open { path: String, #[source] source: std::io::Error },
    #[error("failed to write log chunk: {0}")]
    Write(#[source] std::io::Error),
}
