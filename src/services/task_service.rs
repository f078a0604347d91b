//! Task submission and inspection.

use serde::Serialize;
use std::sync::Arc;
use uuid::Uuid;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{CancelOutcome, HandoffRecord, NewTask, Task, TaskEvent, TaskFilter};
use crate::domain::ports::TaskStore;

/// A task with its audit trail.
#[derive(Debug, Clone, Serialize)]
pub struct TaskDetails {
    pub task: Task,
    pub events: Vec<TaskEvent>,
    pub handoffs: Vec<HandoffRecord>,
}

/// Task operations used by the command layer.
pub struct TaskService {
    store: Arc<dyn TaskStore>,
}

impl TaskService {
    pub fn new(store: Arc<dyn TaskStore>) -> Self {
        Self { store }
    }

    /// Validate and enqueue a submission.
    pub async fn submit(&self, submission: NewTask) -> DomainResult<Task> {
        submission.validate()?;
        let task = self.store.submit(submission).await?;
        tracing::info!(
            task_id = %task.id,
            project = %task.project,
            priority = task.priority,
            machine_id = ?task.assigned_machine,
            "task submitted"
        );
        Ok(task)
    }

    pub async fn get(&self, id: Uuid) -> DomainResult<Task> {
        self.store.get(id).await?.ok_or(DomainError::TaskNotFound(id))
    }

    pub async fn details(&self, id: Uuid) -> DomainResult<TaskDetails> {
        let task = self.get(id).await?;
        let events = self.store.events(id).await?;
        let handoffs = self.store.handoffs(id).await?;
        Ok(TaskDetails { task, events, handoffs })
    }

    pub async fn list(&self, filter: TaskFilter) -> DomainResult<Vec<Task>> {
        self.store.list(filter).await
    }

    /// Cancel a task; cancelling a finished task reports what it finished as.
    pub async fn cancel(&self, id: Uuid) -> DomainResult<CancelOutcome> {
        self.store.cancel(id).await
    }
}
