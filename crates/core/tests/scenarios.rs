mod common;

use std::sync::Arc;

use common::{
    build_context, fixture_conversation, fixture_dev_environment, fixture_project, fixture_task, init_source_repo,
    noop_token, FakeContainerRunner, FakeScript, RecordingNotificationService,
};
use db::models::{
    conversation_result::ConversationResult,
    execution_log::{ExecutionLog, ExecutionLogStatus},
    task_conversation::{ConversationStatus, TaskConversation},
};
use xsha_core::executor::{self, ExecutorOutcome};

/// S1: a conversation that runs to a clean `result` object is marked
/// `success`, its `ExecutionLog` finalized with exit code 0, a
/// `ConversationResult` persisted, and (since this is the task's first
/// success) `Task.session_id` populated.
#[tokio::test]
async fn successful_run_persists_result_and_session_id() {
    let pool = common::setup_pool().await;
    let tmp = tempfile::tempdir().unwrap();
    let source = tempfile::tempdir().unwrap();
    common::init_source_repo(source.path());

    let project = fixture_project(&pool, source.path().display().to_string()).await;
    let dev_env = fixture_dev_environment(&pool).await;
    let task = fixture_task(&pool, &project, &dev_env).await;
    let conv = fixture_conversation(&pool, &task, "add a README section").await;
    let conv = TaskConversation::claim_pending(&pool, conv.id, conv.version).await.unwrap().expect("claim succeeds");

    let runner = Arc::new(FakeContainerRunner::new(FakeScript::SucceedWithResult {
        session_id: "sess-123".to_string(),
        result_text: "done".to_string(),
    }));
    let ctx = build_context(pool.clone(), tmp.path(), runner);

    let outcome = executor::run(ctx, conv.clone(), task.clone(), project, dev_env, noop_token()).await.unwrap();
    assert_eq!(outcome, ExecutorOutcome::Success);

    let reloaded_conv = TaskConversation::find_by_id(&pool, conv.id).await.unwrap().unwrap();
    assert_eq!(reloaded_conv.status(), ConversationStatus::Success);

    let reloaded_task = db::models::task::Task::find_by_id(&pool, task.id).await.unwrap().unwrap();
    assert_eq!(reloaded_task.session_id.as_deref(), Some("sess-123"));

    let logs = ExecutionLog::find_by_conversation_id(&pool, conv.id).await.unwrap();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].status(), ExecutionLogStatus::Success);
    assert_eq!(logs[0].exit_code, Some(0));
    assert!(!logs[0].launch_command.is_empty());

    let results = ConversationResult::find_by_execution_log_id(&pool, logs[0].id).await.unwrap();
    assert!(results.is_some());
    assert_eq!(results.unwrap().result, "done");
}

/// S2: a container exiting non-zero is a Container-fatal, retry-eligible
/// failure — not a Preflight-fatal one.
#[tokio::test]
async fn nonzero_exit_marks_conversation_failed() {
    let pool = common::setup_pool().await;
    let tmp = tempfile::tempdir().unwrap();
    let source = tempfile::tempdir().unwrap();
    init_source_repo(source.path());

    let project = fixture_project(&pool, source.path().display().to_string()).await;
    let dev_env = fixture_dev_environment(&pool).await;
    let task = fixture_task(&pool, &project, &dev_env).await;
    let conv = fixture_conversation(&pool, &task, "break the build").await;
    let conv = TaskConversation::claim_pending(&pool, conv.id, conv.version).await.unwrap().unwrap();

    let runner = Arc::new(FakeContainerRunner::new(FakeScript::ExitNonZero(1)));
    let ctx = build_context(pool.clone(), tmp.path(), runner);

    let outcome = executor::run(ctx, conv.clone(), task.clone(), project, dev_env, noop_token()).await.unwrap();
    assert_eq!(outcome, ExecutorOutcome::Failed);

    let reloaded = TaskConversation::find_by_id(&pool, conv.id).await.unwrap().unwrap();
    assert_eq!(reloaded.status(), ConversationStatus::Failed);
    assert!(reloaded.status().is_retryable());

    let logs = ExecutionLog::find_by_conversation_id(&pool, conv.id).await.unwrap();
    assert_eq!(logs[0].status(), ExecutionLogStatus::Failed);
    assert_eq!(logs[0].exit_code, Some(1));
    assert!(logs[0].error.is_some());
}

/// S3: cancelling the token mid-run stops the container and the run is
/// reported (and persisted) as `cancelled`, not `failed`.
#[tokio::test]
async fn cancellation_mid_run_marks_conversation_cancelled() {
    let pool = common::setup_pool().await;
    let tmp = tempfile::tempdir().unwrap();
    let source = tempfile::tempdir().unwrap();
    init_source_repo(source.path());

    let project = fixture_project(&pool, source.path().display().to_string()).await;
    let dev_env = fixture_dev_environment(&pool).await;
    let task = fixture_task(&pool, &project, &dev_env).await;
    let conv = fixture_conversation(&pool, &task, "long running task").await;
    let conv = TaskConversation::claim_pending(&pool, conv.id, conv.version).await.unwrap().unwrap();

    let runner = Arc::new(FakeContainerRunner::new(FakeScript::HangUntilCancelled));
    let cancel_flag = runner.cancel_called.clone();
    let ctx = build_context(pool.clone(), tmp.path(), runner);

    let token = tokio_util::sync::CancellationToken::new();
    let cancel_after = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        cancel_after.cancel();
    });

    let outcome = executor::run(ctx, conv.clone(), task.clone(), project, dev_env, token).await.unwrap();
    assert_eq!(outcome, ExecutorOutcome::Cancelled);
    assert!(*cancel_flag.lock().unwrap());

    let reloaded = TaskConversation::find_by_id(&pool, conv.id).await.unwrap().unwrap();
    assert_eq!(reloaded.status(), ConversationStatus::Cancelled);

    let logs = ExecutionLog::find_by_conversation_id(&pool, conv.id).await.unwrap();
    assert_eq!(logs[0].status(), ExecutionLogStatus::Cancelled);
}

/// The `notifier` fires exactly once per run, carrying the same
/// succeeded/failed verdict as the persisted status.
#[tokio::test]
async fn notifier_fires_with_matching_verdict() {
    let pool = common::setup_pool().await;
    let tmp = tempfile::tempdir().unwrap();
    let source = tempfile::tempdir().unwrap();
    init_source_repo(source.path());

    let project = fixture_project(&pool, source.path().display().to_string()).await;
    let dev_env = fixture_dev_environment(&pool).await;
    let task = fixture_task(&pool, &project, &dev_env).await;
    let conv = fixture_conversation(&pool, &task, "notify me").await;
    let conv = TaskConversation::claim_pending(&pool, conv.id, conv.version).await.unwrap().unwrap();

    let runner = Arc::new(FakeContainerRunner::new(FakeScript::ExitNonZero(7)));
    let notifier = Arc::new(RecordingNotificationService::new());
    let ctx = common::build_context_with_notifier(pool.clone(), tmp.path(), runner, notifier.clone());

    let outcome = executor::run(ctx, conv.clone(), task.clone(), project, dev_env, noop_token()).await.unwrap();
    assert_eq!(outcome, ExecutorOutcome::Failed);

    let events = notifier.events.lock().unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].task_id, task.id);
    assert_eq!(events[0].conversation_id, conv.id);
    assert!(!events[0].succeeded);
}
