//! Stale machine and stale task recovery.
//!
//! Runs independently of any worker. Every sweep is idempotent: a second
//! pass over the same state changes nothing.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tokio::sync::broadcast;
//! use taskwire::domain::models::RecoveryConfig;
//! use taskwire::services::RecoveryService;
//! # use taskwire::domain::ports::{MachineRegistry, TaskStore};
//!
//! # async fn example(store: Arc<dyn TaskStore>, registry: Arc<dyn MachineRegistry>) {
//! let service = RecoveryService::new(store, registry, RecoveryConfig::default());
//! let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
//! let handle = service.start(shutdown_rx);
//!
//! shutdown_tx.send(()).ok();
//! handle.await.ok();
//! # }
//! ```

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::domain::errors::DomainResult;
use crate::domain::models::{MachineStatus, RecoveryConfig, MACHINE_OFFLINE_REASON};
use crate::domain::ports::{MachineRegistry, TaskStore};

/// What one recovery pass changed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    pub machines_marked_offline: Vec<String>,
    pub tasks_requeued: Vec<Uuid>,
    pub tasks_timed_out: Vec<Uuid>,
    pub tasks_failed_stale: Vec<Uuid>,
    pub claims_requeued: Vec<Uuid>,
}

impl RecoveryReport {
    pub fn is_empty(&self) -> bool {
        self.machines_marked_offline.is_empty()
            && self.tasks_requeued.is_empty()
            && self.tasks_timed_out.is_empty()
            && self.tasks_failed_stale.is_empty()
            && self.claims_requeued.is_empty()
    }

    pub fn total_changes(&self) -> usize {
        self.machines_marked_offline.len()
            + self.tasks_requeued.len()
            + self.tasks_timed_out.len()
            + self.tasks_failed_stale.len()
            + self.claims_requeued.len()
    }
}

/// Reconciles stale tasks and machines.
#[derive(Clone)]
pub struct RecoveryService {
    store: Arc<dyn TaskStore>,
    registry: Arc<dyn MachineRegistry>,
    config: RecoveryConfig,
}

impl RecoveryService {
    pub fn new(store: Arc<dyn TaskStore>, registry: Arc<dyn MachineRegistry>, config: RecoveryConfig) -> Self {
        Self { store, registry, config }
    }

    pub async fn run_once(&self) -> DomainResult<RecoveryReport> {
        self.run_once_at(Utc::now()).await
    }

    /// Run every sweep as of `now`.
    ///
    /// Order: machine liveness (and requeue), per-task deadlines, stale
    /// running tasks, then orphaned claims.
    pub async fn run_once_at(&self, now: DateTime<Utc>) -> DomainResult<RecoveryReport> {
        let mut report = RecoveryReport::default();

        report.machines_marked_offline = self.sweep_machines(now).await?;
        report.tasks_requeued = self.requeue_offline_machines().await?;
        report.tasks_timed_out = self.store.time_out_expired(now).await?;
        report.tasks_failed_stale = self.sweep_stale_tasks(now).await?;
        report.claims_requeued = self.sweep_expired_claims(now).await?;

        if report.is_empty() {
            tracing::debug!("recovery pass found nothing to do");
        } else {
            tracing::info!(
                machines_offline = report.machines_marked_offline.len(),
                requeued = report.tasks_requeued.len(),
                timed_out = report.tasks_timed_out.len(),
                failed_stale = report.tasks_failed_stale.len(),
                claims_requeued = report.claims_requeued.len(),
                "recovery pass applied changes"
            );
        }
        Ok(report)
    }

    /// Mark machines whose heartbeat is older than the threshold as offline.
    pub async fn sweep_machines(&self, now: DateTime<Utc>) -> DomainResult<Vec<String>> {
        self.registry
            .mark_stale_offline(cutoff(now, self.config.heartbeat_threshold()))
            .await
    }

    /// Return every claimed/running task owned by an offline machine to the queue.
    pub async fn requeue_offline_machines(&self) -> DomainResult<Vec<Uuid>> {
        let mut requeued = Vec::new();
        for machine in self.registry.list_by_status(MachineStatus::Offline).await? {
            let ids = self.store.requeue_for_machine(&machine.id, MACHINE_OFFLINE_REASON).await?;
            if !ids.is_empty() {
                tracing::warn!(machine_id = %machine.id, count = ids.len(), "tasks of offline machine requeued");
            }
            requeued.extend(ids);
        }
        Ok(requeued)
    }

    /// Fail running tasks started before the stale timeout, whatever their machine.
    pub async fn sweep_stale_tasks(&self, now: DateTime<Utc>) -> DomainResult<Vec<Uuid>> {
        self.store
            .fail_stale_running(cutoff(now, self.config.stale_task_timeout()))
            .await
    }

    /// Requeue claims that never reached running.
    pub async fn sweep_expired_claims(&self, now: DateTime<Utc>) -> DomainResult<Vec<Uuid>> {
        self.store
            .requeue_expired_claims(cutoff(now, self.config.claim_timeout()))
            .await
    }

    /// Run recovery passes on the configured interval until shutdown.
    pub fn start(&self, mut shutdown_rx: broadcast::Receiver<()>) -> JoinHandle<()> {
        let service = self.clone();
        let interval_period = self.config.interval();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(interval_period);
            tracing::info!(interval_secs = interval_period.as_secs(), "recovery service started");

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if let Err(e) = service.run_once().await {
                            tracing::error!(error = %e, "recovery pass failed");
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        tracing::info!("received shutdown signal, stopping recovery service");
                        break;
                    }
                }
            }
        })
    }
}

/// `now - age`, saturating at the earliest representable instant.
fn cutoff(now: DateTime<Utc>, age: std::time::Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(age)
        .ok()
        .and_then(|age| now.checked_sub_signed(age))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_counts() {
        let mut report = RecoveryReport::default();
        assert!(report.is_empty());
        report.machines_marked_offline.push("m1".into());
        report.tasks_requeued.push(Uuid::new_v4());
        assert_eq!(report.total_changes(), 2);
    }

    #[test]
    fn test_cutoff() {
        let now = Utc::now();
        assert_eq!(cutoff(now, std::time::Duration::from_secs(120)), now - chrono::Duration::seconds(120));
        assert_eq!(cutoff(now, std::time::Duration::MAX), DateTime::<Utc>::MIN_UTC);
    }
}
