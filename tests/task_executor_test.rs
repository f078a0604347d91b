//! Worker execution loop against a mock engine and a real store.

mod common;

use async_trait::async_trait;
use serde_json::json;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::Notify;
use uuid::Uuid;

use taskwire::adapters::chat::RecordingChatSender;
use taskwire::adapters::reporter::RecordingResultReporter;
use taskwire::adapters::sqlite::{SqliteMachineRegistry, SqliteTaskStore};
use taskwire::adapters::substrates::{MockScript, MockSpawner};
use taskwire::adapters::workspace::LocalWorkspacePreparer;
use taskwire::domain::errors::DomainResult;
use taskwire::domain::models::{
    BindingState, CancelOutcome, Heartbeat, MachineStatus, NewTask, Task, TaskStatus, TransportConfig,
    MACHINE_OFFLINE_REASON,
};
use taskwire::domain::ports::{
    ChatSender, MachineRegistry, SessionSpawner, SpawnRequest, SpawnedProcess, TaskStore,
};
use taskwire::services::{
    ChatterSuppressor, EngineFailoverController, ExecutorConfig, FailoverPolicy, SessionBridge,
    SuppressingChatSender, TaskExecutor, TopicRouter, TopicRouterConfig, WORKER_SHUTDOWN_REASON,
};

struct Worker {
    executor: TaskExecutor,
    store: Arc<SqliteTaskStore>,
    registry: Arc<SqliteMachineRegistry>,
    stack: common::BridgeStack,
    reporter: RecordingResultReporter,
    workspaces: TempDir,
}

fn executor_config() -> ExecutorConfig {
    ExecutorConfig {
        worker_id: "m1-worker".to_string(),
        machine_id: "m1".to_string(),
        project_filter: None,
        max_concurrency: 2,
        poll_interval: Duration::from_millis(20),
        heartbeat_interval: Duration::from_millis(50),
        engine_priority: common::engines(&["claude", "codex"]),
        permission_mode: "acceptEdits".to_string(),
    }
}

async fn worker(spawner: MockSpawner) -> Worker {
    common::setup_test_logging();
    let (_pool, store, registry) = common::memory_stores().await;
    let stack = common::bridge_stack(spawner, FailoverPolicy::default(), Some(store.clone() as Arc<dyn TaskStore>));
    let reporter = RecordingResultReporter::new();
    let workspaces = common::temp_dir();
    let executor = TaskExecutor::new(
        store.clone(),
        registry.clone(),
        stack.bridge.clone(),
        Arc::new(LocalWorkspacePreparer::new(workspaces.path())),
        Arc::new(reporter.clone()),
        stack.chat.clone(),
        executor_config(),
    );
    Worker { executor, store, registry, stack, reporter, workspaces }
}

/// Another executor on the same database, with its own router and engines.
fn sibling(w: &Worker, config: ExecutorConfig, spawner: MockSpawner) -> (TaskExecutor, common::BridgeStack) {
    let stack = common::bridge_stack(spawner, FailoverPolicy::default(), Some(w.store.clone() as Arc<dyn TaskStore>));
    let executor = TaskExecutor::new(
        w.store.clone(),
        w.registry.clone(),
        stack.bridge.clone(),
        Arc::new(LocalWorkspacePreparer::new(w.workspaces.path())),
        Arc::new(RecordingResultReporter::new()),
        stack.chat.clone(),
        config,
    );
    (executor, stack)
}

fn working_script() -> MockScript {
    MockScript::lines([json!({"type": "assistant", "text": "Working on it"}).to_string()]).held_open()
}

async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

async fn wait_for_status(store: &SqliteTaskStore, id: Uuid, status: TaskStatus) -> Task {
    eventually(&format!("task {id} to reach {status}"), move || async move {
        store.get(id).await.unwrap().is_some_and(|t| t.status == status)
    })
    .await;
    store.get(id).await.unwrap().unwrap()
}

async fn wait_idle(executor: &TaskExecutor) {
    eventually("executor to go idle", move || async move { executor.active_count().await == 0 }).await;
}

#[tokio::test]
async fn test_claimed_task_runs_to_completion() {
    let spawner = MockSpawner::new();
    spawner.push_script("claude", MockScript::completes_with("Pagination added.")).await;
    let w = worker(spawner).await;
    let submitted = w.store.submit(NewTask::new("api", "Add pagination")).await.unwrap();

    assert_eq!(w.executor.tick().await.unwrap(), Some(submitted.id));
    let task = wait_for_status(&w.store, submitted.id, TaskStatus::Completed).await;
    wait_idle(&w.executor).await;

    assert_eq!(task.result_summary.as_deref(), Some("Pagination added."));
    assert_eq!(task.engine.as_deref(), Some("claude"));
    assert_eq!(task.assigned_machine.as_deref(), Some("m1"));

    let spawns = w.stack.spawner.spawns().await;
    assert_eq!(spawns.len(), 1);
    assert_eq!(spawns[0].request.prompt, "Add pagination");
    assert_eq!(spawns[0].request.task_id, Some(submitted.id));
    assert!(spawns[0].request.workspace_path.starts_with(w.workspaces.path()));

    let reports = w.reporter.reports().await;
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].status, TaskStatus::Completed);

    let statuses: Vec<TaskStatus> = w.store.events(submitted.id).await.unwrap().iter().map(|e| e.to_status).collect();
    assert_eq!(
        statuses,
        vec![TaskStatus::Queued, TaskStatus::Claimed, TaskStatus::Running, TaskStatus::Completed]
    );
}

#[tokio::test]
async fn test_spawn_failure_fails_task_without_retry() {
    let spawner = MockSpawner::new();
    spawner.push_script("claude", MockScript::spawn_failure("binary not found")).await;
    let w = worker(spawner).await;
    let submitted = w.store.submit(NewTask::new("api", "Fix bug")).await.unwrap();

    w.executor.tick().await.unwrap();
    let task = wait_for_status(&w.store, submitted.id, TaskStatus::Failed).await;
    wait_idle(&w.executor).await;

    let reason = task.error_reason.unwrap_or_default();
    assert!(reason.contains("spawn failed"), "{reason}");
    assert!(reason.contains("binary not found"), "{reason}");
    assert_eq!(w.stack.spawner.spawn_count().await, 0, "the failed spawn is not recorded and not retried");

    let notices = w.stack.chat.texts_for(&submitted.routing_topic()).await;
    assert!(notices.iter().any(|n| n.contains("failed")), "{notices:?}");

    // The topic is free again.
    assert!(w.stack.router.session(&submitted.routing_topic()).await.is_none());
}

#[tokio::test]
async fn test_cancel_stops_running_session() {
    let spawner = MockSpawner::new();
    spawner.push_script("claude", working_script()).await;
    let w = worker(spawner).await;
    let submitted = w.store.submit(NewTask::new("api", "Long refactor")).await.unwrap();

    w.executor.tick().await.unwrap();
    wait_for_status(&w.store, submitted.id, TaskStatus::Running).await;

    assert_eq!(w.executor.cancel(submitted.id).await.unwrap(), CancelOutcome::Cancelled);
    wait_idle(&w.executor).await;

    let task = w.store.get(submitted.id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Cancelled);
    assert!(w.stack.spawner.spawns().await[0].was_terminated());
    assert!(w.reporter.reports().await.iter().any(|r| r.status == TaskStatus::Cancelled));

    // Cancelling again is a no-op.
    assert_eq!(w.executor.cancel(submitted.id).await.unwrap(), CancelOutcome::AlreadyCancelled);
}

#[tokio::test]
async fn test_cancel_from_elsewhere_is_reconciled() {
    let spawner = MockSpawner::new();
    spawner.push_script("claude", working_script()).await;
    let w = worker(spawner).await;
    let submitted = w.store.submit(NewTask::new("api", "Long refactor")).await.unwrap();

    w.executor.tick().await.unwrap();
    wait_for_status(&w.store, submitted.id, TaskStatus::Running).await;

    // Another process cancels through the shared store.
    w.store.cancel(submitted.id).await.unwrap();
    assert_eq!(w.executor.reconcile_cancellations().await.unwrap(), 1);
    wait_idle(&w.executor).await;

    assert_eq!(w.store.get(submitted.id).await.unwrap().unwrap().status, TaskStatus::Cancelled);
    assert!(w.stack.spawner.spawns().await[0].was_terminated());
}

#[tokio::test]
async fn test_concurrency_cap_and_busy_heartbeat() {
    let spawner = MockSpawner::with_default_script(working_script());
    let w = worker(spawner).await;
    for i in 0..3 {
        w.store.submit(NewTask::new("api", format!("task {i}"))).await.unwrap();
    }

    assert_eq!(w.executor.drain_queue().await.unwrap(), 2);
    assert_eq!(w.executor.tick().await.unwrap(), None);
    assert_eq!(w.executor.active_count().await, 2);

    let machine = w.executor.heartbeat().await.unwrap();
    assert_eq!(machine.status, MachineStatus::Busy);
    assert_eq!(machine.active_task_count, 2);
    assert_eq!(machine.max_concurrency, 2);

    let queued = w
        .store
        .list(taskwire::domain::models::TaskFilter {
            status: Some(TaskStatus::Queued),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(queued.len(), 1);

    w.executor.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_idle_heartbeat_registers_machine() {
    let w = worker(MockSpawner::new()).await;
    let machine = w.executor.heartbeat().await.unwrap();
    assert_eq!(machine.id, "m1");
    assert_eq!(machine.status, MachineStatus::Online);
    assert_eq!(machine.engine_priority, common::engines(&["claude", "codex"]));
    assert!(w.registry.get("m1").await.unwrap().is_some());
}

#[tokio::test]
async fn test_registered_engine_priority_wins() {
    let spawner = MockSpawner::new();
    let w = worker(spawner).await;
    w.registry
        .heartbeat(&Heartbeat::from_load("m1", 0, 2, common::engines(&["codex"])))
        .await
        .unwrap();
    let submitted = w.store.submit(NewTask::new("api", "Use codex")).await.unwrap();

    w.executor.tick().await.unwrap();
    let task = wait_for_status(&w.store, submitted.id, TaskStatus::Completed).await;
    assert_eq!(task.engine.as_deref(), Some("codex"));
    assert_eq!(w.stack.spawner.spawns().await[0].request.engine, "codex");
}

#[tokio::test]
async fn test_shutdown_requeues_in_flight_tasks() {
    let spawner = MockSpawner::with_default_script(working_script());
    let w = worker(spawner).await;
    let submitted = w.store.submit(NewTask::new("api", "Interrupted work")).await.unwrap();

    w.executor.tick().await.unwrap();
    wait_for_status(&w.store, submitted.id, TaskStatus::Running).await;

    let requeued = w.executor.shutdown().await.unwrap();
    assert_eq!(requeued, vec![submitted.id]);
    assert_eq!(w.executor.active_count().await, 0);

    let task = w.store.get(submitted.id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Queued);
    assert!(task.assigned_machine.is_none());
    assert_eq!(task.error_reason.as_deref(), Some(WORKER_SHUTDOWN_REASON));
    assert!(w.stack.spawner.spawns().await[0].was_terminated());

    // No new claims after shutdown.
    assert_eq!(w.executor.tick().await.unwrap(), None);
}

#[tokio::test]
async fn test_poll_loop_drains_queue() {
    let w = worker(MockSpawner::new()).await;
    let ids: Vec<Uuid> = {
        let mut ids = Vec::new();
        for i in 0..4 {
            ids.push(w.store.submit(NewTask::new("api", format!("job {i}"))).await.unwrap().id);
        }
        ids
    };

    let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);
    let handle = w.executor.start_poll_loop(shutdown_tx.subscribe());
    for id in &ids {
        wait_for_status(&w.store, *id, TaskStatus::Completed).await;
    }
    wait_idle(&w.executor).await;
    shutdown_tx.send(()).unwrap();
    tokio::time::timeout(Duration::from_secs(2), handle).await.unwrap().unwrap();
    assert_eq!(w.reporter.reports().await.len(), 4);
}

#[tokio::test]
async fn test_requeued_task_is_given_up_before_another_machine_runs_it() {
    let spawner = MockSpawner::new();
    spawner.push_script("claude", working_script()).await;
    let w = worker(spawner).await;
    let submitted = w.store.submit(NewTask::new("api", "Long refactor")).await.unwrap();
    let topic = submitted.routing_topic();

    w.executor.tick().await.unwrap();
    wait_for_status(&w.store, submitted.id, TaskStatus::Running).await;

    // Recovery declared m1 dead while its worker kept going.
    let requeued = w.store.requeue_for_machine("m1", MACHINE_OFFLINE_REASON).await.unwrap();
    assert_eq!(requeued, vec![submitted.id]);

    assert_eq!(w.executor.reconcile_cancellations().await.unwrap(), 1);
    wait_idle(&w.executor).await;
    assert!(w.stack.spawner.spawns().await[0].was_terminated());
    assert_ne!(w.stack.router.state(&topic).await, BindingState::Active);

    // The stopped session does not overwrite the requeue.
    let task = w.store.get(submitted.id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Queued);
    assert_eq!(task.error_reason.as_deref(), Some(MACHINE_OFFLINE_REASON));
    assert!(w.reporter.reports().await.is_empty());

    let (other, other_stack) = sibling(
        &w,
        ExecutorConfig {
            worker_id: "m2-worker".to_string(),
            machine_id: "m2".to_string(),
            ..executor_config()
        },
        MockSpawner::new(),
    );
    assert_eq!(other.tick().await.unwrap(), Some(submitted.id));
    let task = wait_for_status(&w.store, submitted.id, TaskStatus::Completed).await;
    wait_idle(&other).await;
    assert_eq!(task.assigned_machine.as_deref(), Some("m2"));
    assert_eq!(other_stack.spawner.spawn_count().await, 1);
    assert_eq!(w.stack.spawner.spawn_count().await, 1, "m1 never restarts the task");
    assert_eq!(w.executor.reconcile_cancellations().await.unwrap(), 0);
}

#[tokio::test]
async fn test_shutdown_leaves_other_workers_on_same_machine_alone() {
    let w = worker(MockSpawner::with_default_script(working_script())).await;
    let (other, other_stack) = sibling(
        &w,
        ExecutorConfig {
            worker_id: "m1-second".to_string(),
            ..executor_config()
        },
        MockSpawner::with_default_script(working_script()),
    );

    let mine = w.store.submit(NewTask::new("api", "mine")).await.unwrap();
    assert_eq!(w.executor.tick().await.unwrap(), Some(mine.id));
    let theirs = w.store.submit(NewTask::new("api", "theirs")).await.unwrap();
    assert_eq!(other.tick().await.unwrap(), Some(theirs.id));
    wait_for_status(&w.store, mine.id, TaskStatus::Running).await;
    wait_for_status(&w.store, theirs.id, TaskStatus::Running).await;

    let requeued = w.executor.shutdown().await.unwrap();
    assert_eq!(requeued, vec![mine.id]);

    let task = w.store.get(theirs.id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Running);
    assert_eq!(task.claiming_worker_id.as_deref(), Some("m1-second"));
    assert!(!other_stack.spawner.spawns().await[0].was_terminated());
    assert_eq!(other.active_count().await, 1);

    other.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_failure_notice_survives_armed_suppression() {
    let spawner = MockSpawner::new();
    spawner.push_script("claude", MockScript::spawn_failure("binary not found")).await;
    let w = worker(spawner).await;

    // Wired like the worker command: notices skip the suppressing host path.
    let suppressor = ChatterSuppressor::in_memory(Duration::from_secs(60));
    let host = SuppressingChatSender::new(w.stack.chat.clone(), suppressor.clone());
    let executor = TaskExecutor::new(
        w.store.clone(),
        w.registry.clone(),
        w.stack.bridge.clone(),
        Arc::new(LocalWorkspacePreparer::new(w.workspaces.path())),
        Arc::new(w.reporter.clone()),
        host.passthrough(),
        executor_config(),
    );

    let submitted = w.store.submit(NewTask::new("api", "Fix bug")).await.unwrap();
    let topic = submitted.routing_topic();
    suppressor.suppress_next(&topic, Duration::from_secs(60)).await;

    executor.tick().await.unwrap();
    wait_for_status(&w.store, submitted.id, TaskStatus::Failed).await;
    wait_idle(&executor).await;

    let notices = w.stack.chat.texts_for(&topic).await;
    assert!(notices.iter().any(|n| n.contains("failed")), "{notices:?}");
    assert_eq!(suppressor.pending().await, 1, "the entry is left for the host reply");

    host.send(&topic, "Reply received.").await.unwrap();
    assert_eq!(w.stack.chat.texts_for(&topic).await.len(), notices.len());
}

/// Holds every spawn until released.
struct GatedSpawner {
    inner: Arc<MockSpawner>,
    entered: Arc<Notify>,
    release: Arc<Notify>,
}

#[async_trait]
impl SessionSpawner for GatedSpawner {
    async fn spawn(&self, request: SpawnRequest) -> DomainResult<SpawnedProcess> {
        self.entered.notify_one();
        self.release.notified().await;
        self.inner.spawn(request).await
    }

    fn supports(&self, engine: &str) -> bool {
        self.inner.supports(engine)
    }
}

#[tokio::test]
async fn test_shutdown_stops_session_that_is_still_spawning() {
    common::setup_test_logging();
    let (_pool, store, registry) = common::memory_stores().await;
    let inner = Arc::new(MockSpawner::with_default_script(working_script()));
    let entered = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());
    let spawner = Arc::new(GatedSpawner {
        inner: inner.clone(),
        entered: entered.clone(),
        release: release.clone(),
    });
    let chat = Arc::new(RecordingChatSender::new());
    let router = TopicRouter::new(chat.clone(), TopicRouterConfig::default());
    let failover = Arc::new(EngineFailoverController::new(
        FailoverPolicy::default(),
        spawner.clone(),
        router.clone(),
        Some(store.clone() as Arc<dyn TaskStore>),
        50,
    ));
    let bridge = Arc::new(SessionBridge::new(spawner, router.clone(), failover, TransportConfig::default(), 50));
    let reporter = RecordingResultReporter::new();
    let workspaces = common::temp_dir();
    let executor = TaskExecutor::new(
        store.clone(),
        registry,
        bridge,
        Arc::new(LocalWorkspacePreparer::new(workspaces.path())),
        Arc::new(reporter.clone()),
        chat.clone(),
        executor_config(),
    );

    let submitted = store.submit(NewTask::new("api", "Slow start")).await.unwrap();
    executor.tick().await.unwrap();
    entered.notified().await;

    let stopping = executor.clone();
    let shutdown = tokio::spawn(async move { stopping.shutdown().await });
    tokio::time::sleep(Duration::from_millis(50)).await;
    release.notify_one();

    let requeued = tokio::time::timeout(Duration::from_secs(5), shutdown)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(requeued, vec![submitted.id]);

    let task = store.get(submitted.id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Queued);
    assert_eq!(task.error_reason.as_deref(), Some(WORKER_SHUTDOWN_REASON));

    let spawns = inner.spawns().await;
    assert_eq!(spawns.len(), 1);
    assert!(spawns[0].was_terminated());
    assert_ne!(router.state(&submitted.routing_topic()).await, BindingState::Active);
    assert!(reporter.reports().await.is_empty());
    let notices = chat.texts_for(&submitted.routing_topic()).await;
    assert!(!notices.iter().any(|n| n.contains("failed")), "{notices:?}");
}
