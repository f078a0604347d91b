use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::errors::DomainResult;
use crate::domain::models::{Heartbeat, Machine, MachineStatus};

/// Tracks worker machines.
#[async_trait]
pub trait MachineRegistry: Send + Sync {
    /// Register or refresh a machine. The first heartbeat registers it.
    async fn heartbeat(&self, heartbeat: &Heartbeat) -> DomainResult<Machine>;

    async fn get(&self, id: &str) -> DomainResult<Option<Machine>>;

    async fn list(&self) -> DomainResult<Vec<Machine>>;

    async fn list_by_status(&self, status: MachineStatus) -> DomainResult<Vec<Machine>>;

    /// Mark machines whose last heartbeat is older than `cutoff` as offline.
    ///
    /// Returns the ids of machines that changed status; machines already
    /// offline are not reported again.
    async fn mark_stale_offline(&self, cutoff: DateTime<Utc>) -> DomainResult<Vec<String>>;
}
