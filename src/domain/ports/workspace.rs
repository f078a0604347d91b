use async_trait::async_trait;
use std::path::PathBuf;

use crate::domain::errors::DomainResult;
use crate::domain::models::Task;

/// Produces a ready checkout for a task.
#[async_trait]
pub trait WorkspacePreparer: Send + Sync {
    /// Return the directory the engine should run in.
    async fn prepare(&self, task: &Task) -> DomainResult<PathBuf>;
}
