use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::errors::DomainResult;
use crate::domain::models::TaskStatus;

/// Final outcome of a task handed to the result layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskReport {
    pub task_id: Uuid,
    pub status: TaskStatus,
    pub summary: Option<String>,
    pub files_changed: Vec<String>,
    pub pr_url: Option<String>,
}

/// Receives task outcomes (commit/PR creation lives behind this).
#[async_trait]
pub trait ResultReporter: Send + Sync {
    async fn report(&self, report: &TaskReport) -> DomainResult<()>;
}
