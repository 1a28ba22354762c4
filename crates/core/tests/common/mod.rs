use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use db::models::{
    dev_environment::{CreateDevEnvironment, DevEnvironment, DevEnvironmentKind},
    project::{CreateProject, Project, RepoProtocol},
    task::{CreateTask, Task},
    task_conversation::{CreateTaskConversation, TaskConversation},
};
use executors::ResultParser;
use services::{ContainerRunner, ContainerSpec, ExitOutcome, LogPipeline, NoopNotificationService, NotificationService, TaskFinished};
use sqlx::SqlitePool;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use utils::{Config, ContainerInContainerMode};
use uuid::Uuid;
use workspace::{FileCredentialResolver, WorkspaceManager};
use xsha_core::{context::ExecutorContext, error::ExecutorError};

pub async fn setup_pool() -> SqlitePool {
    let pool = sqlx::sqlite::SqlitePoolOptions::new().connect("sqlite::memory:").await.unwrap();
    sqlx::migrate!("../db/migrations").run(&pool).await.unwrap();
    pool
}

pub fn init_source_repo(dir: &std::path::Path) {
    let repo = git2::Repository::init(dir).expect("init source repo");
    std::fs::write(dir.join("README.md"), "hello\n").unwrap();
    let mut index = repo.index().unwrap();
    index.add_path(std::path::Path::new("README.md")).unwrap();
    index.write().unwrap();
    let tree_id = index.write_tree().unwrap();
    let tree = repo.find_tree(tree_id).unwrap();
    let sig = git2::Signature::now("fixture", "fixture@example.com").unwrap();
    repo.commit(Some("HEAD"), &sig, &sig, "initial", &tree, &[]).unwrap();
    if repo.head().unwrap().shorthand() != Some("main") {
        let commit = repo.head().unwrap().peel_to_commit().unwrap();
        repo.branch("main", &commit, false).ok();
        repo.set_head("refs/heads/main").unwrap();
    }
}

pub async fn fixture_project(pool: &SqlitePool, repo_url: String) -> Project {
    let id = Uuid::new_v4();
    Project::create(
        pool,
        &CreateProject {
            name: "demo-project".to_string(),
            repo_url,
            repo_protocol: RepoProtocol::Https,
            credential_ref: None,
            system_prompt: None,
            default_branch: "main".to_string(),
        },
        id,
    )
    .await
    .unwrap()
}

pub async fn fixture_dev_environment(pool: &SqlitePool) -> DevEnvironment {
    let id = Uuid::new_v4();
    DevEnvironment::create(
        pool,
        &CreateDevEnvironment {
            name: "demo-env".to_string(),
            kind: DevEnvironmentKind::Opencode,
            image: "example.com/fake-agent:latest".to_string(),
            cpu_quota: 1.0,
            memory_mib: 512,
            env_vars: BTreeMap::new(),
            system_prompt: None,
            session_dir: "demo-env".to_string(),
        },
        id,
    )
    .await
    .unwrap()
}

pub async fn fixture_task(pool: &SqlitePool, project: &Project, dev_env: &DevEnvironment) -> Task {
    let id = Uuid::new_v4();
    Task::create(
        pool,
        &CreateTask {
            project_id: project.id,
            dev_environment_id: dev_env.id,
            title: "Add a contributing guide".to_string(),
            start_branch: project.default_branch.clone(),
        },
        id,
    )
    .await
    .unwrap()
}

pub async fn fixture_conversation(pool: &SqlitePool, task: &Task, prompt: &str) -> TaskConversation {
    let id = Uuid::new_v4();
    TaskConversation::create(
        pool,
        &CreateTaskConversation {
            task_id: task.id,
            prompt: prompt.to_string(),
            scheduled_at: None,
            config_model: None,
            config_is_plan_mode: false,
        },
        id,
    )
    .await
    .unwrap()
}

/// Scripted behavior for [`FakeContainerRunner`] — stands in for an actual
/// `docker run` invocation in tests that exercise `Executor::run` without a
/// container runtime. `Clone` because one runner instance is shared across
/// every conversation a test dispatches; each `launch()` runs its own copy.
#[derive(Clone)]
pub enum FakeScript {
    /// Emits one `type=result` JSON line and exits 0.
    SucceedWithResult { session_id: String, result_text: String },
    ExitNonZero(i32),
    /// Never resolves on its own; only `cancel()` (or the test's own
    /// cancellation token) unblocks the wait handle.
    HangUntilCancelled,
}

/// Mirrors `CliContainerRunner`'s own shape: one shared instance handles
/// every concurrent launch, tracking per-container cancel signals in a map
/// keyed by container name rather than assuming a single in-flight run.
pub struct FakeContainerRunner {
    script: FakeScript,
    waiters: dashmap::DashMap<String, Arc<Notify>>,
    pub cancel_called: Arc<Mutex<bool>>,
}

impl FakeContainerRunner {
    pub fn new(script: FakeScript) -> Self {
        Self { script, waiters: dashmap::DashMap::new(), cancel_called: Arc::new(Mutex::new(false)) }
    }
}

#[async_trait]
impl ContainerRunner for FakeContainerRunner {
    async fn launch(
        &self,
        spec: &ContainerSpec,
        pipeline: Arc<LogPipeline>,
    ) -> Result<(String, tokio::task::JoinHandle<ExitOutcome>), services::ContainerRunnerError> {
        let container_id = spec.container_name.clone();
        let cancel_signal = Arc::new(Notify::new());
        self.waiters.insert(container_id.clone(), cancel_signal.clone());
        let script = self.script.clone();

        let handle = tokio::spawn(async move {
            match script {
                FakeScript::SucceedWithResult { session_id, result_text } => {
                    let line = serde_json::json!({
                        "type": "result",
                        "subtype": "success",
                        "is_error": false,
                        "session_id": session_id,
                        "result": result_text,
                    });
                    pipeline.ingest_stdout(format!("{line}\n")).await;
                    ExitOutcome { exit_code: Some(0), cancelled: false, error: None }
                }
                FakeScript::ExitNonZero(code) => {
                    pipeline.ingest_stderr("agent crashed\n".to_string()).await;
                    ExitOutcome { exit_code: Some(code), cancelled: false, error: None }
                }
                FakeScript::HangUntilCancelled => {
                    tokio::select! {
                        _ = cancel_signal.notified() => ExitOutcome { exit_code: None, cancelled: true, error: None },
                        _ = tokio::time::sleep(Duration::from_secs(60)) => ExitOutcome::default(),
                    }
                }
            }
        });

        Ok((container_id, handle))
    }

    async fn cancel(&self, container_id: &str) -> Result<(), services::ContainerRunnerError> {
        *self.cancel_called.lock().unwrap() = true;
        if let Some(signal) = self.waiters.get(container_id) {
            signal.notify_one();
        }
        Ok(())
    }
}

pub struct RecordingNotificationService {
    pub events: Mutex<Vec<TaskFinished>>,
}

impl RecordingNotificationService {
    pub fn new() -> Self {
        Self { events: Mutex::new(Vec::new()) }
    }
}

#[async_trait]
impl NotificationService for RecordingNotificationService {
    async fn notify_task_finished(&self, event: TaskFinished) {
        self.events.lock().unwrap().push(event);
    }
}

pub fn test_config(base: &std::path::Path) -> Config {
    Config {
        max_concurrent_tasks: 5,
        workspace_base_dir: base.join("workspaces"),
        dev_sessions_base_dir: base.join("sessions"),
        attachments_base_dir: base.join("attachments"),
        execution_timeout: Duration::from_secs(5),
        shutdown_grace: Duration::from_secs(1),
        parser_max_log_lines: 1000,
        parser_timeout: Duration::from_secs(5),
        parser_strict_validation: false,
        container_in_container_mode: ContainerInContainerMode::Disable,
        database_url: "sqlite::memory:".to_string(),
        logs_base_dir: base.join("logs"),
        git_author_name: "xsha-agent".to_string(),
        git_author_email: "agent@xsha.local".to_string(),
        container_runtime_binary: "docker".to_string(),
    }
}

pub fn build_context(pool: SqlitePool, base: &std::path::Path, runner: Arc<dyn ContainerRunner>) -> Arc<ExecutorContext> {
    build_context_with_notifier(pool, base, runner, Arc::new(NoopNotificationService))
}

pub fn build_context_with_notifier(
    pool: SqlitePool,
    base: &std::path::Path,
    runner: Arc<dyn ContainerRunner>,
    notifier: Arc<dyn NotificationService>,
) -> Arc<ExecutorContext> {
    let config = test_config(base);
    std::fs::create_dir_all(&config.workspace_base_dir).unwrap();
    std::fs::create_dir_all(&config.attachments_base_dir).unwrap();
    std::fs::create_dir_all(&config.logs_base_dir).unwrap();
    let credential_dir = base.join("credentials");
    std::fs::create_dir_all(&credential_dir).unwrap();
    let resolver = Arc::new(FileCredentialResolver::new(credential_dir));
    let workspace = Arc::new(WorkspaceManager::new(config.workspace_base_dir.clone(), resolver));

    Arc::new(ExecutorContext {
        pool,
        config,
        workspace,
        runner,
        parser: Arc::new(ResultParser::new()),
        notifier,
    })
}

pub fn noop_token() -> CancellationToken {
    CancellationToken::new()
}

#[allow(dead_code)]
pub fn is_preflight_err(e: &ExecutorError) -> bool {
    e.is_preflight()
}
