//! Local workspace preparation.
//!
//! Resolves each task's project to a directory under a workspace root.
//! Cloning, worktrees, and credential injection belong to an external
//! collaborator; this adapter only guarantees the directory exists.

use async_trait::async_trait;
use std::path::PathBuf;
use tracing::debug;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::Task;
use crate::domain::ports::WorkspacePreparer;

pub struct LocalWorkspacePreparer {
    root: PathBuf,
}

impl LocalWorkspacePreparer {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Directory name for a project; path separators and dot segments are rejected.
    fn project_dir(project: &str) -> DomainResult<String> {
        let name: String = project
            .trim()
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') { c } else { '_' })
            .collect();
        if name.is_empty() || name.chars().all(|c| c == '.') {
            return Err(DomainError::WorkspaceFailed(format!("invalid project name {project:?}")));
        }
        Ok(name)
    }
}

#[async_trait]
impl WorkspacePreparer for LocalWorkspacePreparer {
    async fn prepare(&self, task: &Task) -> DomainResult<PathBuf> {
        let path = self.root.join(Self::project_dir(&task.project)?);
        tokio::fs::create_dir_all(&path).await.map_err(|e| {
            DomainError::WorkspaceFailed(format!("cannot create {}: {e}", path.display()))
        })?;
        debug!(task_id = %task.id, path = %path.display(), "workspace ready");
        Ok(path)
    }
}
