use std::sync::Arc;

use anyhow::Context;
use db::DBService;
use executors::ResultParser;
use services::{CliContainerRunner, NoopNotificationService};
use tokio_util::sync::CancellationToken;
use tracing::info;
use utils::Config;
use workspace::{FileCredentialResolver, WorkspaceManager};
use xsha_core::{ExecutorContext, Scheduler};

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();
}

/// Waits for either Ctrl-C or SIGTERM, matching the teacher's use of `nix`
/// for process lifecycle signals on unix platforms.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl-C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config = Config::from_env().context("loading configuration")?;
    info!(max_concurrent_tasks = config.max_concurrent_tasks, "starting xsha core");

    let db = DBService::new(&config.database_url).await.context("connecting to database")?;

    std::fs::create_dir_all(&config.workspace_base_dir).context("creating workspace base dir")?;
    std::fs::create_dir_all(&config.attachments_base_dir).context("creating attachments base dir")?;
    std::fs::create_dir_all(&config.logs_base_dir).context("creating logs base dir")?;
    std::fs::create_dir_all(&config.dev_sessions_base_dir).context("creating dev sessions base dir")?;

    let credential_resolver = Arc::new(FileCredentialResolver::new(config.dev_sessions_base_dir.join("credentials")));
    let workspace = Arc::new(WorkspaceManager::new(config.workspace_base_dir.clone(), credential_resolver));
    let runner = Arc::new(CliContainerRunner::new(config.container_runtime_binary.clone()));

    let ctx = Arc::new(ExecutorContext {
        pool: db.pool,
        config,
        workspace,
        runner,
        parser: Arc::new(ResultParser::new()),
        notifier: Arc::new(NoopNotificationService),
    });

    let scheduler = Arc::new(Scheduler::new(ctx));
    let reconciled = scheduler.reconcile_on_start().await.context("reconciling orphaned executions")?;
    if reconciled > 0 {
        info!(reconciled, "finalized orphaned running executions from a previous process");
    }

    let shutdown = CancellationToken::new();
    let dispatcher = tokio::spawn(scheduler.clone().run_forever(shutdown.clone()));

    shutdown_signal().await;
    info!("shutdown signal received, draining in-flight executions");
    shutdown.cancel();
    dispatcher.await.context("dispatcher task panicked")?;

    Ok(())
}
