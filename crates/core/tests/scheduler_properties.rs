mod common;

use std::sync::Arc;

use common::{fixture_conversation, fixture_dev_environment, fixture_project, fixture_task, init_source_repo};
use db::models::{
    execution_log::{ExecutionLog, ExecutionLogStatus},
    task_conversation::{ConversationStatus, TaskConversation},
};
use xsha_core::{CancelReason, Scheduler};

/// Invariant #2 (SPEC_FULL.md §5): at most one running conversation per
/// task. Two conversations queued on the same task must never both be
/// dispatched by the same tick — the second stays pending because
/// `find_dispatch_candidates` excludes tasks with an already-running
/// conversation.
#[tokio::test]
async fn at_most_one_conversation_per_task_is_dispatched() {
    let pool = common::setup_pool().await;
    let tmp = tempfile::tempdir().unwrap();
    let source = tempfile::tempdir().unwrap();
    init_source_repo(source.path());

    let project = fixture_project(&pool, source.path().display().to_string()).await;
    let dev_env = fixture_dev_environment(&pool).await;
    let task = fixture_task(&pool, &project, &dev_env).await;
    let first = fixture_conversation(&pool, &task, "first").await;
    let second = fixture_conversation(&pool, &task, "second").await;

    let runner = Arc::new(common::FakeContainerRunner::new(common::FakeScript::HangUntilCancelled));
    let ctx = common::build_context(pool.clone(), tmp.path(), runner);
    let scheduler = Arc::new(Scheduler::new(ctx));

    let dispatched = scheduler.tick().await.unwrap();
    assert_eq!(dispatched, 1);
    assert_eq!(scheduler.in_flight_count(), 1);

    // Give the spawned executor a moment to claim and transition the row.
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    let reloaded_first = TaskConversation::find_by_id(&pool, first.id).await.unwrap().unwrap();
    let reloaded_second = TaskConversation::find_by_id(&pool, second.id).await.unwrap().unwrap();
    let statuses = [reloaded_first.status(), reloaded_second.status()];
    assert_eq!(statuses.iter().filter(|s| **s == ConversationStatus::Running).count(), 1);
    assert!(statuses.contains(&ConversationStatus::Pending));

    // A second tick must not dispatch the sibling conversation while the
    // first is still running on the same task.
    let dispatched_again = scheduler.tick().await.unwrap();
    assert_eq!(dispatched_again, 0);

    scheduler.cancel_task(task.id, CancelReason::Shutdown);
}

/// The concurrency cap bounds how many conversations a single tick will
/// claim, even when more are due across independent tasks.
#[tokio::test]
async fn tick_respects_the_concurrency_cap() {
    let pool = common::setup_pool().await;
    let tmp = tempfile::tempdir().unwrap();
    let source = tempfile::tempdir().unwrap();
    init_source_repo(source.path());

    let project = fixture_project(&pool, source.path().display().to_string()).await;
    let dev_env = fixture_dev_environment(&pool).await;

    for i in 0..4 {
        let task = fixture_task(&pool, &project, &dev_env).await;
        fixture_conversation(&pool, &task, &format!("task {i}")).await;
    }

    let runner = Arc::new(common::FakeContainerRunner::new(common::FakeScript::HangUntilCancelled));
    let ctx = common::build_context(pool.clone(), tmp.path(), runner);
    let mut config = ctx.config.clone();
    config.max_concurrent_tasks = 2;
    // Rebuild the context with the lowered cap; `ExecutorContext` fields are
    // public precisely so tests can do this without a setter.
    let ctx = Arc::new(xsha_core::ExecutorContext {
        pool: ctx.pool.clone(),
        config,
        workspace: ctx.workspace.clone(),
        runner: ctx.runner.clone(),
        parser: Arc::new(executors::ResultParser::new()),
        notifier: ctx.notifier.clone(),
    });
    let scheduler = Scheduler::new(ctx);

    let dispatched = scheduler.tick().await.unwrap();
    assert_eq!(dispatched, 2);
    assert_eq!(scheduler.in_flight_count(), 2);
}

/// Restart reconciliation (SPEC_FULL.md §4.6.1): an `execution_logs` row
/// still `running` at process start has no live worker behind it and is
/// conservatively finalized as `failed`.
#[tokio::test]
async fn reconcile_on_start_fails_orphaned_running_executions() {
    let pool = common::setup_pool().await;
    let tmp = tempfile::tempdir().unwrap();
    let source = tempfile::tempdir().unwrap();
    init_source_repo(source.path());

    let project = fixture_project(&pool, source.path().display().to_string()).await;
    let dev_env = fixture_dev_environment(&pool).await;
    let task = fixture_task(&pool, &project, &dev_env).await;
    let conv = fixture_conversation(&pool, &task, "orphan me").await;
    let conv = TaskConversation::claim_pending(&pool, conv.id, conv.version).await.unwrap().unwrap();
    let exec_id = uuid::Uuid::new_v4();
    ExecutionLog::create(&pool, exec_id, conv.id, "docker run ...", "orphan.log").await.unwrap();

    let runner = Arc::new(common::FakeContainerRunner::new(common::FakeScript::HangUntilCancelled));
    let ctx = common::build_context(pool.clone(), tmp.path(), runner);
    let scheduler = Scheduler::new(ctx);

    let reconciled = scheduler.reconcile_on_start().await.unwrap();
    assert_eq!(reconciled, 1);

    let log = ExecutionLog::find_by_id(&pool, exec_id).await.unwrap().unwrap();
    assert_eq!(log.status(), ExecutionLogStatus::Failed);
    let reloaded = TaskConversation::find_by_id(&pool, conv.id).await.unwrap().unwrap();
    assert_eq!(reloaded.status(), ConversationStatus::Failed);
}

/// `cancel_task` is a no-op when nothing is in flight for that task.
#[tokio::test]
async fn cancel_task_on_idle_task_is_a_harmless_no_op() {
    let pool = common::setup_pool().await;
    let tmp = tempfile::tempdir().unwrap();
    let runner = Arc::new(common::FakeContainerRunner::new(common::FakeScript::HangUntilCancelled));
    let ctx = common::build_context(pool, tmp.path(), runner);
    let scheduler = Scheduler::new(ctx);
    scheduler.cancel_task(uuid::Uuid::new_v4(), CancelReason::TaskDeleted);
}
