use async_trait::async_trait;
use uuid::Uuid;

/// What the core reports to the outside world when a conversation finishes.
/// Dispatching the notification itself (email, webhook, desktop toast, ...)
/// is out of scope; this is only the consume-only signal boundary named in
/// SPEC_FULL.md §1.
#[derive(Debug, Clone, Copy)]
pub struct TaskFinished {
    pub task_id: Uuid,
    pub conversation_id: Uuid,
    pub succeeded: bool,
}

#[async_trait]
pub trait NotificationService: Send + Sync {
    async fn notify_task_finished(&self, event: TaskFinished);
}

/// Default no-op implementation; operators wire in a real sink by
/// implementing [`NotificationService`] themselves.
pub struct NoopNotificationService;

#[async_trait]
impl NotificationService for NoopNotificationService {
    async fn notify_task_finished(&self, _event: TaskFinished) {}
}
