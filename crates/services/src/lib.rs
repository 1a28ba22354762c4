pub mod container_runner;
pub mod container_spec;
pub mod error;
pub mod log_pipeline;
pub mod notification;

pub use container_runner::{CliContainerRunner, ContainerRunner, ExitOutcome};
pub use container_spec::{ContainerSpec, MountMode};
pub use error::{ContainerRunnerError, LogPipelineError};
pub use log_pipeline::LogPipeline;
pub use notification::{NoopNotificationService, NotificationService, TaskFinished};
