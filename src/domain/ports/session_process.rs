//! Session process port - interface for spawned engine processes.

use async_trait::async_trait;
use futures::stream::BoxStream;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::domain::errors::DomainResult;
use crate::domain::models::TopicId;

/// What to run and where.
#[derive(Debug, Clone)]
pub struct SpawnRequest {
    pub workspace_path: PathBuf,
    pub prompt: String,
    pub engine: String,
    pub permission_mode: String,
    pub task_id: Option<Uuid>,
    pub topic_id: TopicId,
}

/// Exit status of an engine process; `None` when killed by a signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessExit {
    pub code: Option<i32>,
}

impl ProcessExit {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// A running engine process.
#[async_trait]
pub trait SessionProcess: Send + Sync {
    /// Opaque session id.
    fn id(&self) -> &str;

    /// Engine the process runs.
    fn engine(&self) -> &str;

    /// Write bytes to the process input. Writes are serialized.
    async fn write(&self, bytes: &[u8]) -> DomainResult<()>;

    /// Terminate the process. Calling it again, or after the process
    /// exited on its own, is a no-op.
    async fn terminate(&self) -> DomainResult<()>;

    fn is_terminated(&self) -> bool;
}

/// Handle returned by a successful spawn.
pub struct SpawnedProcess {
    pub handle: Arc<dyn SessionProcess>,
    /// Raw output chunks in arrival order; an `Err` means the transport dropped.
    pub output: BoxStream<'static, std::io::Result<Vec<u8>>>,
    pub exit: oneshot::Receiver<ProcessExit>,
}

impl std::fmt::Debug for SpawnedProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpawnedProcess")
            .field("session_id", &self.handle.id())
            .field("engine", &self.handle.engine())
            .finish_non_exhaustive()
    }
}

/// Starts engine processes.
#[async_trait]
pub trait SessionSpawner: Send + Sync {
    async fn spawn(&self, request: SpawnRequest) -> DomainResult<SpawnedProcess>;

    /// Whether this spawner knows how to launch `engine`.
    fn supports(&self, engine: &str) -> bool;
}
