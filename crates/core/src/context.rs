use std::sync::Arc;

use executors::ResultParser;
use services::{ContainerRunner, NotificationService};
use sqlx::SqlitePool;
use utils::Config;
use workspace::WorkspaceManager;

/// Everything an `Executor::run` needs but does not itself own: the shared
/// connection pool and every collaborator component from SPEC_FULL.md §2.
/// One instance is built at process start and shared (via `Arc`) across
/// every concurrently-running executor.
pub struct ExecutorContext {
    pub pool: SqlitePool,
    pub config: Config,
    pub workspace: Arc<WorkspaceManager>,
    pub runner: Arc<dyn ContainerRunner>,
    pub parser: Arc<ResultParser>,
    pub notifier: Arc<dyn NotificationService>,
}
