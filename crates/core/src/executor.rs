use std::{path::Path, sync::Arc};

use db::models::{
    attachment::Attachment,
    conversation_result::ConversationResult,
    dev_environment::DevEnvironment,
    execution_log::{ExecutionLog, ExecutionLogStatus},
    project::Project,
    task::Task,
    task_conversation::{ConversationStatus, TaskConversation},
};
use executors::{ParseError, ParsedResult, ParserConfig, build_launch_spec};
use services::{ContainerSpec, ExitOutcome, LogPipeline, MountMode, TaskFinished};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::{context::ExecutorContext, error::ExecutorError};

/// Terminal outcome of one `Executor::run` call. Distinct from the
/// conversation's persisted status only in name — kept as its own type so
/// `crates/core`'s tests can assert on it without re-parsing a DB row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutorOutcome {
    Success,
    Failed,
    Cancelled,
}

/// Executes one conversation end to end (SPEC_FULL.md §4.5). Pure
/// composition: holds no state beyond this call's stack. The caller (the
/// Scheduler) is responsible for having already performed the atomic
/// `pending` → `running` claim — `conv` arrives here already claimed — and
/// for registering `cancel_token` wherever task-deletion/timeout/shutdown
/// signals are raised.
pub async fn run(
    ctx: Arc<ExecutorContext>,
    conv: TaskConversation,
    task: Task,
    project: Project,
    dev_env: DevEnvironment,
    cancel_token: CancellationToken,
) -> Result<ExecutorOutcome, ExecutorError> {
    let exec_id = Uuid::new_v4();
    let log_rel = format!("{exec_id}.log");
    ExecutionLog::create(&ctx.pool, exec_id, conv.id, "", &log_rel).await?;

    let outcome = run_inner(&ctx, &conv, &task, &project, &dev_env, exec_id, &log_rel, &cancel_token).await;

    match &outcome {
        Ok(o) => info!(conversation_id = %conv.id, outcome = ?o, "conversation execution finished"),
        Err(e) => warn!(conversation_id = %conv.id, error = %e, "conversation execution errored"),
    }

    if let Ok(result) = &outcome {
        ctx.notifier
            .notify_task_finished(TaskFinished {
                task_id: task.id,
                conversation_id: conv.id,
                succeeded: *result == ExecutorOutcome::Success,
            })
            .await;
    }

    outcome
}

#[allow(clippy::too_many_arguments)]
async fn run_inner(
    ctx: &ExecutorContext,
    conv: &TaskConversation,
    task: &Task,
    project: &Project,
    dev_env: &DevEnvironment,
    exec_id: Uuid,
    log_rel: &str,
    cancel_token: &CancellationToken,
) -> Result<ExecutorOutcome, ExecutorError> {
    // Steps 2-3: preflight. A failure at any of these points is Preflight-fatal
    // (SPEC_FULL.md §7): the execution never reaches `Launch`.
    let workspace_abs = match ctx.workspace.prepare(&ctx.pool, task, project).await {
        Ok(p) => p,
        Err(e) => return fail_preflight(ctx, conv.id, exec_id, &format!("workspace prepare failed: {e}")).await,
    };

    let attachments = Attachment::find_by_conversation_id(&ctx.pool, conv.id).await?;
    let rewritten_prompt = match ctx
        .workspace
        .stage_attachments(conv, &attachments, &ctx.config.attachments_base_dir, &workspace_abs)
        .await
    {
        Ok(p) => p,
        Err(e) => return fail_preflight(ctx, conv.id, exec_id, &format!("attachment staging failed: {e}")).await,
    };

    // Step 4: build the container spec and persist its masked transcript.
    let launch_spec = match build_launch_spec(dev_env, task, conv, project.system_prompt.as_deref(), &rewritten_prompt) {
        Ok(s) => s,
        Err(e) => return fail_preflight(ctx, conv.id, exec_id, &format!("command build failed: {e}")).await,
    };

    let workspace_rel = task.workspace_path.clone().unwrap_or_default();
    let session_dir_abs = ctx.config.dev_sessions_base_dir.join(&dev_env.session_dir);
    let mount_mode = if ctx
        .config
        .container_in_container_mode
        .resolve(Path::new("/.dockerenv").exists())
    {
        MountMode::ContainerInContainer
    } else {
        MountMode::Host
    };
    let container_spec = ContainerSpec::new(
        launch_spec,
        task.id,
        conv.id,
        workspace_abs.clone(),
        session_dir_abs,
        workspace_rel,
        mount_mode,
    );

    let masked_transcript = container_spec.masked_transcript(&ctx.config.container_runtime_binary);
    ExecutionLog::set_launch_command(&ctx.pool, exec_id, &masked_transcript).await?;

    let log_abs = ctx.config.logs_base_dir.join(log_rel);
    let pipeline = match LogPipeline::create(log_abs).await {
        Ok(p) => Arc::new(p),
        Err(e) => return fail_preflight(ctx, conv.id, exec_id, &format!("log pipeline setup failed: {e}")).await,
    };

    // Step 5: launch, with a cancellation scope covering the entire wait.
    let (container_id, mut wait_handle) = match ctx.runner.launch(&container_spec, pipeline.clone()).await {
        Ok(v) => v,
        Err(e) => {
            pipeline.close().await.ok();
            return fail_preflight(ctx, conv.id, exec_id, &format!("container failed to start: {e}")).await;
        }
    };
    ExecutionLog::set_container_id(&ctx.pool, exec_id, &container_id).await?;

    let mut exit: ExitOutcome = tokio::select! {
        biased;
        _ = cancel_token.cancelled() => {
            if let Err(e) = ctx.runner.cancel(&container_id).await {
                warn!(error = %e, container_id, "failed to signal container cancellation");
            }
            match (&mut wait_handle).await {
                Ok(outcome) => outcome,
                Err(e) => ExitOutcome { exit_code: None, cancelled: false, error: Some(e.to_string()) },
            }
        }
        joined = &mut wait_handle => {
            match joined {
                Ok(outcome) => outcome,
                Err(e) => ExitOutcome { exit_code: None, cancelled: false, error: Some(e.to_string()) },
            }
        }
    };
    if cancel_token.is_cancelled() {
        exit.cancelled = true;
    }

    // Step 6-7: close the pipeline and clear attachments regardless of outcome.
    pipeline.close().await.ok();
    if let Err(e) = ctx.workspace.clear_attachments(&workspace_abs).await {
        warn!(conversation_id = %conv.id, error = %e, "failed to clear staged attachments (best effort)");
    }

    // Step 8: cancellation.
    if exit.cancelled {
        finalize_terminal(
            ctx,
            conv.id,
            exec_id,
            ExecutionLogStatus::Cancelled,
            ConversationStatus::Cancelled,
            exit.exit_code.map(i64::from),
            Some("cancelled"),
        )
        .await?;
        return Ok(ExecutorOutcome::Cancelled);
    }

    // Step 9: non-zero exit or runtime error.
    if exit.exit_code != Some(0) || exit.error.is_some() {
        let full_text = pipeline.read_full_text().await.unwrap_or_default();
        let error_msg = exit.error.clone().unwrap_or_else(|| tail(&full_text, 20));
        finalize_terminal(
            ctx,
            conv.id,
            exec_id,
            ExecutionLogStatus::Failed,
            ConversationStatus::Failed,
            exit.exit_code.map(i64::from),
            Some(&error_msg),
        )
        .await?;
        return Ok(ExecutorOutcome::Failed);
    }

    // Step 10: parse the result, bounded by `parserTimeout` (SPEC_FULL.md
    // §6). `ResultParser::parse` is synchronous CPU-bound work (string
    // scanning, regex, JSON parsing), so the ceiling can only be enforced by
    // running it on a blocking thread and racing the join against a timer —
    // the same shape the teacher's `local-deployment` crate uses to bound
    // its own process-stop wait, reused here instead of a no-op config field.
    let full_text = pipeline.read_full_text().await?;
    let parser_cfg = ParserConfig {
        max_log_lines: ctx.config.parser_max_log_lines,
        strict_validation: ctx.config.parser_strict_validation,
    };
    let parser = ctx.parser.clone();
    let parse_job = tokio::task::spawn_blocking(move || parser.parse(&full_text, &parser_cfg));
    let parsed: Result<ParsedResult, ParseError> = match tokio::time::timeout(ctx.config.parser_timeout, parse_job).await {
        Ok(Ok(result)) => result,
        Ok(Err(join_err)) => {
            warn!(conversation_id = %conv.id, error = %join_err, "result parser task panicked");
            Err(ParseError::NoStrategyMatched)
        }
        Err(_elapsed) => Err(ParseError::Timeout),
    };
    let parsed = match parsed {
        Ok(p) => p,
        Err(e) => {
            finalize_terminal(
                ctx,
                conv.id,
                exec_id,
                ExecutionLogStatus::Failed,
                ConversationStatus::Failed,
                exit.exit_code.map(i64::from),
                Some(&format!("result parse failed: {e}")),
            )
            .await?;
            return Ok(ExecutorOutcome::Failed);
        }
    };

    // Step 12: best-effort commit. Failure is a warning, not a fatal error
    // (SPEC_FULL.md §7, Commit-warning).
    let commit_message = commit_message_for(task, conv);
    match ctx
        .workspace
        .commit(&workspace_abs, &commit_message, &ctx.config.git_author_name, &ctx.config.git_author_email)
    {
        Ok(commit) => {
            if let Some(sha) = &commit.commit_sha {
                info!(conversation_id = %conv.id, commit = %sha, files = commit.files_changed, "committed workspace changes");
            }
        }
        Err(e) => warn!(conversation_id = %conv.id, error = %e, "commit failed; run still reported as success"),
    }

    // Steps 11 & 13: persist the result and mark success, in one transaction.
    let session_id = parsed.session_id.clone();
    let session_id_unset = task.session_id.is_none();
    let create = parsed.into_create(exec_id);
    finalize_success(ctx, conv.id, exec_id, task.id, session_id_unset, &session_id, &create).await?;

    Ok(ExecutorOutcome::Success)
}

async fn fail_preflight(
    ctx: &ExecutorContext,
    conv_id: Uuid,
    exec_id: Uuid,
    message: &str,
) -> Result<ExecutorOutcome, ExecutorError> {
    finalize_terminal(
        ctx,
        conv_id,
        exec_id,
        ExecutionLogStatus::Failed,
        ConversationStatus::Failed,
        None,
        Some(message),
    )
    .await?;
    Ok(ExecutorOutcome::Failed)
}

async fn finalize_terminal(
    ctx: &ExecutorContext,
    conv_id: Uuid,
    exec_id: Uuid,
    exec_status: ExecutionLogStatus,
    conv_status: ConversationStatus,
    exit_code: Option<i64>,
    error: Option<&str>,
) -> Result<(), sqlx::Error> {
    let mut tx = ctx.pool.begin().await?;
    ExecutionLog::finalize(&mut *tx, exec_id, exec_status, exit_code, error).await?;
    TaskConversation::mark_terminal(&mut *tx, conv_id, conv_status).await?;
    tx.commit().await
}

#[allow(clippy::too_many_arguments)]
async fn finalize_success(
    ctx: &ExecutorContext,
    conv_id: Uuid,
    exec_id: Uuid,
    task_id: Uuid,
    session_id_unset: bool,
    session_id: &str,
    create: &db::models::conversation_result::CreateConversationResult,
) -> Result<(), sqlx::Error> {
    let mut tx = ctx.pool.begin().await?;
    ConversationResult::create(&mut *tx, create).await?;
    ExecutionLog::finalize(&mut *tx, exec_id, ExecutionLogStatus::Success, Some(0), None).await?;
    TaskConversation::mark_terminal(&mut *tx, conv_id, ConversationStatus::Success).await?;
    if session_id_unset {
        Task::set_session_id_if_unset(&mut *tx, task_id, session_id).await?;
    }
    tx.commit().await
}

fn tail(text: &str, n: usize) -> String {
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(n);
    lines[start..].join("\n")
}

/// "<conv.title or first N chars of prompt>" (SPEC_FULL.md §4.5 step 12) —
/// the data model puts a title on the Task, not the conversation, so this
/// falls back to the prompt prefix only if the task's own title is blank.
/// See DESIGN.md.
fn commit_message_for(task: &Task, conv: &TaskConversation) -> String {
    if !task.title.trim().is_empty() {
        task.title.clone()
    } else {
        conv.prompt.chars().take(72).collect()
    }
}
