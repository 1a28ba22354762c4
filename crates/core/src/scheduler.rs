use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use dashmap::DashMap;
use db::models::{
    dev_environment::DevEnvironment,
    execution_log::{ExecutionLog, ExecutionLogStatus},
    project::Project,
    task::Task,
    task_conversation::{ConversationStatus, TaskConversation},
};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::{context::ExecutorContext, executor};

const DISPATCH_BATCH_LIMIT: i64 = 32;
/// Fallback dispatcher cadence when nothing calls [`Scheduler::wake`] — the
/// common case is event-driven (a new conversation is created, a run
/// finishes), this is only a backstop against a missed wake.
const POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Why an in-flight execution was cancelled. Recorded on the `ExecutionLog`
/// row so the reason survives the process that issued it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    Manual,
    TaskDeleted,
    Timeout,
    Shutdown,
}

impl CancelReason {
    fn as_log_message(self) -> &'static str {
        match self {
            CancelReason::Manual => "cancelled by operator request",
            CancelReason::TaskDeleted => "cancelled: owning task was deleted",
            CancelReason::Timeout => "cancelled: exceeded execution timeout",
            CancelReason::Shutdown => "cancelled: scheduler shutting down",
        }
    }
}

/// One entry per in-flight execution, keyed by `task_id` — the per-task
/// serialization invariant (at most one running conversation per task) means
/// `task_id` alone always identifies the execution to cancel, without also
/// needing the conversation id.
struct CancelHandle {
    token: CancellationToken,
    reason: Mutex<Option<CancelReason>>,
}

/// Drives the dispatch loop described in SPEC_FULL.md §4.6: claims due,
/// eligible conversations up to the concurrency cap, runs each as an
/// `Executor`, and reconciles orphaned executions on startup.
pub struct Scheduler {
    ctx: Arc<ExecutorContext>,
    in_flight: Arc<AtomicUsize>,
    wake: Arc<Notify>,
    cancellations: Arc<DashMap<Uuid, Arc<CancelHandle>>>,
}

impl Scheduler {
    pub fn new(ctx: Arc<ExecutorContext>) -> Self {
        Self {
            ctx,
            in_flight: Arc::new(AtomicUsize::new(0)),
            wake: Arc::new(Notify::new()),
            cancellations: Arc::new(DashMap::new()),
        }
    }

    /// Nudge the dispatch loop to run a tick sooner than its next poll —
    /// called after a conversation is created or an execution finishes.
    pub fn wake(&self) {
        self.wake.notify_one();
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Restart reconciliation (SPEC_FULL.md §4.6.1): any `execution_logs` row
    /// still `running` when the process starts has no live worker behind it
    /// — this process just started. Per the heuristic-not-heartbeat design
    /// decision in SPEC_FULL.md §9, every such row is conservatively marked
    /// `failed` (retry-eligible) rather than attempting to re-attach to a
    /// container that may or may not still be alive.
    pub async fn reconcile_on_start(&self) -> Result<usize, sqlx::Error> {
        let orphaned = ExecutionLog::find_running(&self.ctx.pool).await?;
        let count = orphaned.len();
        for log in orphaned {
            warn!(execution_log_id = %log.id, conversation_id = %log.conversation_id, "reconciling orphaned execution from prior process lifetime");
            let mut tx = self.ctx.pool.begin().await?;
            ExecutionLog::finalize(
                &mut *tx,
                log.id,
                ExecutionLogStatus::Failed,
                None,
                Some("orphaned: no live worker found for this execution at process start"),
            )
            .await?;
            TaskConversation::mark_terminal(&mut *tx, log.conversation_id, ConversationStatus::Failed).await?;
            tx.commit().await?;
        }
        Ok(count)
    }

    /// Runs the dispatch loop until `shutdown` is cancelled. On shutdown,
    /// cancels every in-flight execution with [`CancelReason::Shutdown`] and
    /// waits up to `config.shutdown_grace` for them to wind down.
    pub async fn run_forever(self: Arc<Self>, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(POLL_INTERVAL) => {}
                _ = self.wake.notified() => {}
            }

            if let Err(e) = self.tick().await {
                warn!(error = %e, "dispatch tick failed");
            }
        }

        self.cancel_all(CancelReason::Shutdown);
        let deadline = tokio::time::Instant::now() + self.ctx.config.shutdown_grace;
        while self.in_flight_count() > 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        if self.in_flight_count() > 0 {
            warn!(remaining = self.in_flight_count(), "shutdown grace period elapsed with executions still in flight");
        }
    }

    /// One dispatch pass: claim as many due, eligible conversations as the
    /// remaining concurrency budget allows, and spawn an `Executor` for each.
    /// Returns the number of conversations actually dispatched.
    pub async fn tick(&self) -> Result<usize, sqlx::Error> {
        let cap = self.ctx.config.max_concurrent_tasks;
        let available = cap.saturating_sub(self.in_flight_count());
        if available == 0 {
            return Ok(0);
        }

        let candidates =
            TaskConversation::find_dispatch_candidates(&self.ctx.pool, chrono::Utc::now(), DISPATCH_BATCH_LIMIT).await?;

        // `find_dispatch_candidates` already returns at most one pending
        // conversation per task, but per-task serialization (invariant #2)
        // is load-bearing enough to double-guard here too: a task with an
        // execution already in flight (registered in `self.cancellations`
        // by a prior tick) or already claimed earlier *in this same pass*
        // must never be dispatched again.
        let mut claimed_this_tick: HashSet<Uuid> = HashSet::new();
        let mut dispatched = 0usize;
        for candidate in candidates {
            if dispatched >= available {
                break;
            }
            if self.cancellations.contains_key(&candidate.task_id) || !claimed_this_tick.insert(candidate.task_id) {
                continue;
            }
            // The atomic claim is the only place contention with another
            // tick (or another process, though this core is single-process)
            // is resolved: losing the race is a normal, silent no-op.
            let Some(claimed) = TaskConversation::claim_pending(&self.ctx.pool, candidate.id, candidate.version).await?
            else {
                continue;
            };

            match self.load_and_spawn(claimed).await {
                Ok(()) => dispatched += 1,
                Err(e) => warn!(error = %e, "failed to spawn claimed conversation"),
            }
        }

        Ok(dispatched)
    }

    async fn load_and_spawn(&self, conv: TaskConversation) -> Result<(), sqlx::Error> {
        let task = Task::find_by_id(&self.ctx.pool, conv.task_id).await?;
        let Some(task) = task else {
            return self.fail_unloadable(conv, "owning task no longer exists").await;
        };
        let project = Project::find_by_id(&self.ctx.pool, task.project_id).await?;
        let Some(project) = project else {
            return self.fail_unloadable(conv, "owning project no longer exists").await;
        };
        let dev_env = DevEnvironment::find_by_id(&self.ctx.pool, task.dev_environment_id).await?;
        let Some(dev_env) = dev_env else {
            return self.fail_unloadable(conv, "owning dev environment no longer exists").await;
        };

        let token = CancellationToken::new();
        let handle = Arc::new(CancelHandle { token: token.clone(), reason: Mutex::new(None) });
        self.cancellations.insert(task.id, handle.clone());
        self.in_flight.fetch_add(1, Ordering::SeqCst);

        let ctx = self.ctx.clone();
        let in_flight = self.in_flight.clone();
        let wake = self.wake.clone();
        let cancellations = self.cancellations.clone();
        let task_id = task.id;
        let conv_id = conv.id;
        let timeout = ctx.config.execution_timeout;

        let timeout_token = token.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(timeout) => {
                    if !timeout_token.is_cancelled() {
                        warn!(%task_id, %conv_id, "execution timed out, cancelling");
                        timeout_token.cancel();
                    }
                }
                _ = timeout_token.cancelled() => {}
            }
        });

        tokio::spawn(async move {
            let result = executor::run(ctx, conv, task, project, dev_env, token).await;
            if let Err(e) = result {
                warn!(%task_id, %conv_id, error = %e, "executor returned an error after attempting to finalize");
            }
            cancellations.remove(&task_id);
            in_flight.fetch_sub(1, Ordering::SeqCst);
            wake.notify_one();
        });

        Ok(())
    }

    async fn fail_unloadable(&self, conv: TaskConversation, reason: &str) -> Result<(), sqlx::Error> {
        warn!(conversation_id = %conv.id, reason, "dispatched conversation's dependencies vanished, marking failed");
        TaskConversation::mark_terminal(&self.ctx.pool, conv.id, ConversationStatus::Failed).await
    }

    /// Cancels the in-flight execution for `task_id`, if any. A no-op if the
    /// task has nothing running — callers (e.g. a task-delete handler) are
    /// not expected to check first.
    pub fn cancel_task(&self, task_id: Uuid, reason: CancelReason) {
        if let Some(entry) = self.cancellations.get(&task_id) {
            let mut recorded = entry.reason.lock().expect("cancel handle mutex poisoned");
            if recorded.is_none() {
                *recorded = Some(reason);
            }
            drop(recorded);
            entry.token.cancel();
            info!(%task_id, reason = reason.as_log_message(), "cancellation requested");
        }
    }

    fn cancel_all(&self, reason: CancelReason) {
        let task_ids: Vec<Uuid> = self.cancellations.iter().map(|e| *e.key()).collect();
        for task_id in task_ids {
            self.cancel_task(task_id, reason);
        }
    }

    /// Current in-flight task ids, for diagnostics.
    pub fn in_flight_tasks(&self) -> HashMap<Uuid, ()> {
        self.cancellations.iter().map(|e| (*e.key(), ())).collect()
    }
}
