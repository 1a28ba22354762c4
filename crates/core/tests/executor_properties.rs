mod common;

use std::sync::Arc;

use common::{build_context, fixture_conversation, fixture_dev_environment, fixture_project, fixture_task, init_source_repo};
use db::models::task_conversation::{ConversationStatus, TaskConversation};
use proptest::prelude::*;
use xsha_core::executor::{self, ExecutorOutcome};

proptest! {
    /// Testable property 7 (SPEC_FULL.md §8): a terminal conversation is
    /// retry-eligible iff it failed or was cancelled — never on success,
    /// regardless of which exit code produced that terminal status.
    #[test]
    fn failure_and_cancellation_are_always_retryable_success_never_is(exit_code in 1i32..64) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async move {
            let pool = common::setup_pool().await;
            let tmp = tempfile::tempdir().unwrap();
            let source = tempfile::tempdir().unwrap();
            init_source_repo(source.path());

            let project = fixture_project(&pool, source.path().display().to_string()).await;
            let dev_env = fixture_dev_environment(&pool).await;
            let task = fixture_task(&pool, &project, &dev_env).await;
            let conv = fixture_conversation(&pool, &task, "flaky task").await;
            let conv = TaskConversation::claim_pending(&pool, conv.id, conv.version).await.unwrap().unwrap();

            let runner = Arc::new(common::FakeContainerRunner::new(common::FakeScript::ExitNonZero(exit_code)));
            let ctx = build_context(pool.clone(), tmp.path(), runner);

            let outcome = executor::run(ctx, conv.clone(), task, project, dev_env, common::noop_token()).await.unwrap();
            prop_assert_eq!(outcome, ExecutorOutcome::Failed);

            let reloaded = TaskConversation::find_by_id(&pool, conv.id).await.unwrap().unwrap();
            prop_assert_eq!(reloaded.status(), ConversationStatus::Failed);
            prop_assert!(reloaded.status().is_retryable());
            Ok(())
        })?;
    }
}

/// A preflight failure (here: an unresolved attachment token, which fails
/// before the container is ever launched) is classified as preflight-fatal
/// and never reaches the container runner.
#[tokio::test]
async fn unresolved_attachment_token_is_preflight_fatal_and_skips_container() {
    let pool = common::setup_pool().await;
    let tmp = tempfile::tempdir().unwrap();
    let source = tempfile::tempdir().unwrap();
    init_source_repo(source.path());

    let project = fixture_project(&pool, source.path().display().to_string()).await;
    let dev_env = fixture_dev_environment(&pool).await;
    let task = fixture_task(&pool, &project, &dev_env).await;
    let unresolved = uuid::Uuid::new_v4();
    let conv = fixture_conversation(&pool, &task, &format!("see {{{{attachment:{unresolved}}}}}")).await;
    let conv = TaskConversation::claim_pending(&pool, conv.id, conv.version).await.unwrap().unwrap();

    let runner = Arc::new(common::FakeContainerRunner::new(common::FakeScript::ExitNonZero(0)));
    let ctx = build_context(pool.clone(), tmp.path(), runner);

    let outcome = executor::run(ctx, conv.clone(), task, project, dev_env, common::noop_token()).await.unwrap();
    assert_eq!(outcome, ExecutorOutcome::Failed);

    let logs = db::models::execution_log::ExecutionLog::find_by_conversation_id(&pool, conv.id).await.unwrap();
    assert_eq!(logs.len(), 1);
    assert!(logs[0].container_id.is_none(), "container must never be launched on a preflight failure");
    assert!(logs[0].error.as_deref().unwrap_or_default().contains("attachment"));
}
