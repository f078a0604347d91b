//! Per-worker task execution loop.
//!
//! claim -> prepare workspace -> spawn -> stream -> report. The poll loop
//! claims while it holds a concurrency permit, and each claimed task runs in
//! its own tokio task. A separate heartbeat loop reports load to the machine
//! registry and stops sessions whose task was cancelled, timed out, or
//! taken away from this worker elsewhere.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, OwnedSemaphorePermit, RwLock, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{
    CancelOutcome, CloseReason, Heartbeat, Machine, Task, TaskCompletion, TaskStatus, TopicId,
    WorkerConfig,
};
use crate::domain::ports::{
    ChatSender, MachineRegistry, ResultReporter, TaskReport, TaskStore, WorkspacePreparer,
};
use crate::services::session_bridge::{SessionBridge, SessionEnd, SessionOutcome, SessionPlan};

/// Reason used when a worker hands its tasks back on shutdown.
pub const WORKER_SHUTDOWN_REASON: &str = "worker_shutdown";

/// How long shutdown waits for in-flight tasks to settle.
const SHUTDOWN_DRAIN: Duration = Duration::from_secs(15);

/// Settings for one worker.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub worker_id: String,
    pub machine_id: String,
    pub project_filter: Option<String>,
    pub max_concurrency: usize,
    pub poll_interval: Duration,
    pub heartbeat_interval: Duration,
    pub engine_priority: Vec<String>,
    pub permission_mode: String,
}

impl ExecutorConfig {
    pub fn from_worker(config: &WorkerConfig) -> Self {
        let machine_id = config.resolved_machine_id();
        Self {
            worker_id: format!("{}-{}", machine_id, std::process::id()),
            machine_id,
            project_filter: config.project_filter.clone(),
            max_concurrency: config.max_concurrency.max(1) as usize,
            poll_interval: config.poll_interval(),
            heartbeat_interval: config.heartbeat_interval(),
            engine_priority: config.engine_priority.clone(),
            permission_mode: config.permission_mode.clone(),
        }
    }
}

/// Claims and runs tasks for one machine.
#[derive(Clone)]
pub struct TaskExecutor {
    store: Arc<dyn TaskStore>,
    registry: Arc<dyn MachineRegistry>,
    bridge: Arc<SessionBridge>,
    workspace: Arc<dyn WorkspacePreparer>,
    reporter: Arc<dyn ResultReporter>,
    notifier: Arc<dyn ChatSender>,
    config: ExecutorConfig,
    semaphore: Arc<Semaphore>,
    running: Arc<RwLock<HashMap<Uuid, TopicId>>>,
    in_flight: Arc<RwLock<HashMap<Uuid, JoinHandle<()>>>>,
    /// Tasks this worker no longer owns; their outcome is not written back.
    released: Arc<RwLock<HashSet<Uuid>>>,
    shutting_down: Arc<AtomicBool>,
}

impl TaskExecutor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn TaskStore>,
        registry: Arc<dyn MachineRegistry>,
        bridge: Arc<SessionBridge>,
        workspace: Arc<dyn WorkspacePreparer>,
        reporter: Arc<dyn ResultReporter>,
        notifier: Arc<dyn ChatSender>,
        config: ExecutorConfig,
    ) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.max_concurrency));
        Self {
            store,
            registry,
            bridge,
            workspace,
            reporter,
            notifier,
            config,
            semaphore,
            running: Arc::new(RwLock::new(HashMap::new())),
            in_flight: Arc::new(RwLock::new(HashMap::new())),
            released: Arc::new(RwLock::new(HashSet::new())),
            shutting_down: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Tasks currently executing on this worker.
    pub async fn active_tasks(&self) -> Vec<Uuid> {
        self.in_flight.read().await.keys().copied().collect()
    }

    pub async fn active_count(&self) -> usize {
        self.in_flight.read().await.len()
    }

    /// Claim and launch at most one task. Returns its id when one was claimed.
    pub async fn tick(&self) -> DomainResult<Option<Uuid>> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Ok(None);
        }
        let Ok(permit) = Arc::clone(&self.semaphore).try_acquire_owned() else {
            return Ok(None);
        };

        let claimed = self
            .store
            .claim(
                &self.config.worker_id,
                Some(&self.config.machine_id),
                self.config.project_filter.as_deref(),
            )
            .await?;
        let Some(task) = claimed else {
            return Ok(None);
        };

        let task_id = task.id;
        info!(
            task_id = %task_id,
            project = %task.project,
            priority = task.priority,
            machine_id = %self.config.machine_id,
            "task claimed"
        );

        // Register before spawning so a fast task cannot remove itself first.
        let mut in_flight = self.in_flight.write().await;
        let this = self.clone();
        let handle = tokio::spawn(async move {
            this.execute_task(task, permit).await;
            this.in_flight.write().await.remove(&task_id);
            this.released.write().await.remove(&task_id);
        });
        in_flight.insert(task_id, handle);
        Ok(Some(task_id))
    }

    /// Claim until nothing is claimable or capacity is exhausted.
    pub async fn drain_queue(&self) -> DomainResult<usize> {
        let mut launched = 0;
        while self.tick().await?.is_some() {
            launched += 1;
        }
        Ok(launched)
    }

    /// Run one claimed task to completion.
    pub async fn execute_task(&self, task: Task, _permit: OwnedSemaphorePermit) {
        let task_id = task.id;
        let topic_id = task.routing_topic();

        let workspace_path = match self.workspace.prepare(&task).await {
            Ok(path) => path,
            Err(e) => {
                self.finish_failed(&task, &format!("workspace preparation failed: {e}"), None).await;
                return;
            }
        };

        let plan = SessionPlan {
            topic_id: topic_id.clone(),
            task_id: Some(task_id),
            prompt: task.description.clone(),
            workspace_path,
            engine_priority: self.engine_priority_for(&task).await,
            permission_mode: self.config.permission_mode.clone(),
            budget_usd: task.budget_usd,
        };

        // Registered before the spawn so shutdown and reconcile can close a
        // session that is still starting.
        self.running.write().await.insert(task_id, topic_id.clone());
        let started = match self.bridge.start(plan).await {
            Ok(started) => started,
            Err(e) => {
                self.running.write().await.remove(&task_id);
                if self.abandoned(task_id).await {
                    debug!(task_id = %task_id, error = %e, "spawn interrupted after task was given up");
                    return;
                }
                // Spawn failures need human remediation; no retry.
                self.finish_failed(&task, &format!("spawn failed: {e}"), None).await;
                return;
            }
        };

        let session = Arc::clone(started.session());
        if self.abandoned(task_id).await {
            debug!(task_id = %task_id, "task given up while spawning; stopping session");
            self.running.write().await.remove(&task_id);
            self.bridge.router().close(&topic_id, CloseReason::Cancelled).await;
            return;
        }
        if let Err(e) = self
            .store
            .mark_running(task_id, session.id(), session.engine(), &topic_id)
            .await
        {
            warn!(task_id = %task_id, error = %e, "task changed before it started; stopping session");
            self.running.write().await.remove(&task_id);
            self.bridge.router().close(&topic_id, CloseReason::Cancelled).await;
            return;
        }
        info!(
            task_id = %task_id,
            topic_id = %topic_id,
            session_id = %session.id(),
            engine = %session.engine(),
            "task running"
        );

        let outcome = self.bridge.drive(started).await;
        self.running.write().await.remove(&task_id);

        self.record_outcome(&task, outcome).await;
    }

    /// Whether this worker gave the task up, by shutdown or lost ownership.
    async fn abandoned(&self, task_id: Uuid) -> bool {
        self.shutting_down.load(Ordering::SeqCst) || self.released.read().await.contains(&task_id)
    }

    async fn engine_priority_for(&self, task: &Task) -> Vec<String> {
        // A registered machine's own list wins over the local default.
        match self.registry.get(&self.config.machine_id).await {
            Ok(Some(Machine { engine_priority, .. })) if !engine_priority.is_empty() => engine_priority,
            Ok(_) => self.config.engine_priority.clone(),
            Err(e) => {
                debug!(task_id = %task.id, error = %e, "machine lookup failed; using configured engines");
                self.config.engine_priority.clone()
            }
        }
    }

    async fn record_outcome(&self, task: &Task, outcome: SessionOutcome) {
        if self.released.read().await.contains(&task.id) {
            info!(task_id = %task.id, end = ?outcome.end, "task no longer owned by this worker; outcome discarded");
            return;
        }
        if self.shutting_down.load(Ordering::SeqCst) && outcome.end == SessionEnd::Cancelled {
            // Handed back to the queue on shutdown, not cancelled.
            return;
        }

        let task_id = task.id;
        info!(
            task_id = %task_id,
            cost_usd = outcome.cost_usd,
            budget_usd = ?task.budget_usd,
            handoffs = outcome.handoffs,
            "session cost"
        );

        match outcome.end {
            SessionEnd::Completed { summary } => {
                let completion = TaskCompletion {
                    summary: summary.clone(),
                    files_changed: outcome.files_changed.clone(),
                    pr_url: None,
                    engine: Some(outcome.engine.clone()),
                };
                match self.store.complete(task_id, completion).await {
                    Ok(_) => {
                        info!(task_id = %task_id, files_changed = outcome.files_changed.len(), "task completed");
                        self.report(TaskReport {
                            task_id,
                            status: TaskStatus::Completed,
                            summary,
                            files_changed: outcome.files_changed,
                            pr_url: None,
                        })
                        .await;
                    }
                    Err(e) => warn!(task_id = %task_id, error = %e, "completion not recorded"),
                }
            }
            SessionEnd::Failed { reason } => {
                self.finish_failed(task, &reason, Some(outcome.files_changed)).await;
            }
            SessionEnd::Cancelled => match self.store.cancel(task_id).await {
                Ok(CancelOutcome::Cancelled | CancelOutcome::AlreadyCancelled) => {
                    info!(task_id = %task_id, "task cancelled");
                    self.report(TaskReport {
                        task_id,
                        status: TaskStatus::Cancelled,
                        summary: None,
                        files_changed: outcome.files_changed,
                        pr_url: None,
                    })
                    .await;
                }
                Ok(CancelOutcome::AlreadyFinished(status)) => {
                    info!(task_id = %task_id, status = %status, "session stopped after task finished");
                }
                Err(e) => warn!(task_id = %task_id, error = %e, "cancellation not recorded"),
            },
        }
    }

    async fn finish_failed(&self, task: &Task, reason: &str, files_changed: Option<Vec<String>>) {
        let task_id = task.id;
        match self.store.fail(task_id, reason).await {
            Ok(_) => {
                error!(task_id = %task_id, reason = %reason, "task failed");
                let notice = format!("❌ Task {task_id} failed: {reason}");
                if let Err(e) = self.notifier.send(&task.routing_topic(), &notice).await {
                    warn!(task_id = %task_id, error = %e, "failure notice not delivered");
                }
                self.report(TaskReport {
                    task_id,
                    status: TaskStatus::Failed,
                    summary: Some(reason.to_string()),
                    files_changed: files_changed.unwrap_or_default(),
                    pr_url: None,
                })
                .await;
            }
            Err(DomainError::InvalidStateTransition { from, .. }) => {
                info!(task_id = %task_id, status = %from, reason = %reason, "task already settled; failure not applied");
            }
            Err(e) => warn!(task_id = %task_id, error = %e, "failure not recorded"),
        }
    }

    async fn report(&self, report: TaskReport) {
        if let Err(e) = self.reporter.report(&report).await {
            warn!(task_id = %report.task_id, error = %e, "result report failed");
        }
    }

    /// Cancel a task. Idempotent: cancelling twice, or after the session
    /// already exited, is not an error.
    pub async fn cancel(&self, task_id: Uuid) -> DomainResult<CancelOutcome> {
        let outcome = self.store.cancel(task_id).await?;
        self.stop_session(task_id, CloseReason::Cancelled).await;
        Ok(outcome)
    }

    async fn stop_session(&self, task_id: Uuid, reason: CloseReason) {
        let topic = self.running.read().await.get(&task_id).cloned();
        if let Some(topic_id) = topic {
            self.bridge.router().close(&topic_id, reason).await;
        }
    }

    /// Stop local sessions whose task reached a terminal state elsewhere, or
    /// that this worker no longer holds (requeued by recovery, possibly
    /// already claimed by another worker).
    pub async fn reconcile_cancellations(&self) -> DomainResult<usize> {
        let running: Vec<Uuid> = self.running.read().await.keys().copied().collect();
        let mut stopped = 0;
        for task_id in running {
            let Some(task) = self.store.get(task_id).await? else {
                continue;
            };
            if task.is_terminal() {
                info!(task_id = %task_id, status = %task.status, "task settled elsewhere; stopping session");
                let reason = if task.status == TaskStatus::Cancelled {
                    CloseReason::Cancelled
                } else {
                    CloseReason::Failed(task.error_reason.clone().unwrap_or_else(|| task.status.to_string()))
                };
                self.stop_session(task_id, reason).await;
                stopped += 1;
            } else if !self.holds(&task) {
                warn!(
                    task_id = %task_id,
                    status = %task.status,
                    claiming_worker_id = ?task.claiming_worker_id,
                    "task no longer held by this worker; stopping session"
                );
                self.released.write().await.insert(task_id);
                let reason = task.error_reason.clone().unwrap_or_else(|| "ownership lost".to_string());
                self.stop_session(task_id, CloseReason::Failed(reason)).await;
                stopped += 1;
            }
        }
        Ok(stopped)
    }

    /// Claimed or running under this worker's id.
    fn holds(&self, task: &Task) -> bool {
        matches!(task.status, TaskStatus::Claimed | TaskStatus::Running)
            && task.claiming_worker_id.as_deref() == Some(self.config.worker_id.as_str())
    }

    /// Send one heartbeat reflecting current load.
    pub async fn heartbeat(&self) -> DomainResult<Machine> {
        let active = u32::try_from(self.active_count().await).unwrap_or(u32::MAX);
        let capacity = u32::try_from(self.config.max_concurrency).unwrap_or(u32::MAX);
        let heartbeat = Heartbeat::from_load(
            self.config.machine_id.clone(),
            active,
            capacity,
            self.config.engine_priority.clone(),
        );
        self.registry.heartbeat(&heartbeat).await
    }

    /// Poll for work until shutdown.
    pub fn start_poll_loop(&self, mut shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            info!(
                worker_id = %this.config.worker_id,
                machine_id = %this.config.machine_id,
                max_concurrency = this.config.max_concurrency,
                "poll loop started"
            );
            loop {
                match this.drain_queue().await {
                    Ok(launched) if launched > 0 => debug!(launched, "tasks launched"),
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "claim failed"),
                }
                tokio::select! {
                    () = tokio::time::sleep(this.config.poll_interval) => {}
                    _ = shutdown.recv() => {
                        info!("poll loop shutting down");
                        break;
                    }
                }
            }
        })
    }

    /// Heartbeat and reconcile cancellations until shutdown.
    pub fn start_heartbeat_loop(&self, mut shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(this.config.heartbeat_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = this.heartbeat().await {
                            warn!(machine_id = %this.config.machine_id, error = %e, "heartbeat failed");
                        }
                        if let Err(e) = this.reconcile_cancellations().await {
                            warn!(error = %e, "cancellation reconcile failed");
                        }
                        this.bridge.router().sweep_closed().await;
                    }
                    _ = shutdown.recv() => {
                        info!("heartbeat loop shutting down");
                        break;
                    }
                }
            }
        })
    }

    /// Stop claiming, stop running sessions, and hand in-flight tasks back
    /// to the queue.
    pub async fn shutdown(&self) -> DomainResult<Vec<Uuid>> {
        self.shutting_down.store(true, Ordering::SeqCst);

        let running: Vec<(Uuid, TopicId)> = self
            .running
            .read()
            .await
            .iter()
            .map(|(id, topic)| (*id, topic.clone()))
            .collect();
        for (task_id, topic_id) in &running {
            debug!(task_id = %task_id, "stopping session for shutdown");
            self.bridge.router().close(topic_id, CloseReason::Cancelled).await;
        }

        let handles: Vec<JoinHandle<()>> = self.in_flight.write().await.drain().map(|(_, h)| h).collect();
        for handle in handles {
            if tokio::time::timeout(SHUTDOWN_DRAIN, handle).await.is_err() {
                warn!("in-flight task did not settle before shutdown");
            }
        }

        // Other workers may share this machine id; only our own claims go back.
        let requeued = self
            .store
            .requeue_for_worker(&self.config.worker_id, WORKER_SHUTDOWN_REASON)
            .await?;
        if !requeued.is_empty() {
            info!(count = requeued.len(), "in-flight tasks returned to the queue");
        }
        Ok(requeued)
    }
}
