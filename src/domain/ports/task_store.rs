use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::domain::errors::DomainResult;
use crate::domain::models::{
    CancelOutcome, HandoffRecord, NewTask, Task, TaskCompletion, TaskEvent, TaskFilter,
};

/// Persisted task rows with an atomic claim.
///
/// Every transition is guarded on the current status so a task in a terminal
/// status is never modified, even by a racing writer.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Insert a queued task built from a submission.
    async fn submit(&self, submission: NewTask) -> DomainResult<Task>;

    async fn get(&self, id: Uuid) -> DomainResult<Option<Task>>;

    async fn list(&self, filter: TaskFilter) -> DomainResult<Vec<Task>>;

    /// Atomically claim the highest-priority eligible queued task.
    ///
    /// Eligible tasks are queued, unpinned or pinned to `machine_id`, and
    /// match `project_filter` when one is given. Under any number of
    /// concurrent callers each task is handed to exactly one of them.
    async fn claim(
        &self,
        worker_id: &str,
        machine_id: Option<&str>,
        project_filter: Option<&str>,
    ) -> DomainResult<Option<Task>>;

    /// claimed -> running, recording the session that executes the task.
    async fn mark_running(
        &self,
        id: Uuid,
        session_id: &str,
        engine: &str,
        topic_id: &str,
    ) -> DomainResult<Task>;

    /// Point a running task at a replacement session after a handoff or reconnect.
    async fn update_session(&self, id: Uuid, session_id: &str, engine: &str) -> DomainResult<()>;

    /// running -> completed.
    async fn complete(&self, id: Uuid, completion: TaskCompletion) -> DomainResult<Task>;

    /// claimed|running -> failed.
    async fn fail(&self, id: Uuid, reason: &str) -> DomainResult<Task>;

    /// Cancel a task. Idempotent.
    async fn cancel(&self, id: Uuid) -> DomainResult<CancelOutcome>;

    /// Revert every claimed or running task on `machine_id` to queued,
    /// clearing its machine assignment. Returns the affected ids.
    async fn requeue_for_machine(&self, machine_id: &str, reason: &str) -> DomainResult<Vec<Uuid>>;

    /// Revert the claimed or running tasks held by one worker to queued.
    async fn requeue_for_worker(&self, worker_id: &str, reason: &str) -> DomainResult<Vec<Uuid>>;

    /// running -> timeout for tasks whose own deadline passed at `now`.
    async fn time_out_expired(&self, now: DateTime<Utc>) -> DomainResult<Vec<Uuid>>;

    /// running -> failed (`stale_recovery`) for tasks started before `started_before`.
    async fn fail_stale_running(&self, started_before: DateTime<Utc>) -> DomainResult<Vec<Uuid>>;

    /// claimed -> queued (`claim_expired`) for claims older than `claimed_before`.
    async fn requeue_expired_claims(&self, claimed_before: DateTime<Utc>) -> DomainResult<Vec<Uuid>>;

    async fn record_handoff(&self, record: &HandoffRecord) -> DomainResult<()>;

    async fn handoffs(&self, task_id: Uuid) -> DomainResult<Vec<HandoffRecord>>;

    /// Audit trail of a task, oldest first.
    async fn events(&self, task_id: Uuid) -> DomainResult<Vec<TaskEvent>>;
}
