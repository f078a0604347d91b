//! Common test utilities for integration tests
//!
//! Shared fixtures for stores, sessions and the worker stack.

#![allow(dead_code)]

use sqlx::SqlitePool;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use uuid::Uuid;

use taskwire::adapters::chat::RecordingChatSender;
use taskwire::adapters::sqlite::{
    create_migrated_test_pool, initialize_database, PoolConfig, SqliteMachineRegistry,
    SqliteTaskStore,
};
use taskwire::adapters::substrates::MockSpawner;
use taskwire::domain::models::{NewTask, Task, TransportConfig};
use taskwire::domain::ports::{SpawnRequest, TaskStore};
use taskwire::services::{
    EngineFailoverController, FailoverPolicy, SessionBridge, TopicRouter, TopicRouterConfig,
};

/// Create a temporary directory for test isolation
pub fn temp_dir() -> TempDir {
    tempfile::tempdir().expect("Failed to create temp dir")
}

/// Initializes a test-writer subscriber; safe to call from every test.
pub fn setup_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

/// In-memory store and registry sharing one migrated pool.
pub async fn memory_stores() -> (SqlitePool, Arc<SqliteTaskStore>, Arc<SqliteMachineRegistry>) {
    let pool = create_migrated_test_pool().await.expect("test pool");
    (
        pool.clone(),
        Arc::new(SqliteTaskStore::new(pool.clone())),
        Arc::new(SqliteMachineRegistry::new(pool)),
    )
}

/// Open a separate WAL pool on a database file, as another process would.
pub async fn file_pool(path: &Path, max_connections: u32) -> SqlitePool {
    let config = PoolConfig {
        max_connections,
        min_connections: 1,
        ..PoolConfig::default()
    };
    initialize_database(&format!("sqlite:{}", path.display()), Some(config))
        .await
        .expect("file-backed pool")
}

pub fn db_path(dir: &TempDir) -> PathBuf {
    dir.path().join("taskwire.db")
}

/// Submit a task, claim it for `machine_id`, and mark it running.
pub async fn running_task(store: &dyn TaskStore, project: &str, machine_id: &str) -> Task {
    let submitted = store
        .submit(NewTask::new(project, format!("work on {project}")).with_machine(machine_id))
        .await
        .expect("submit");
    let claimed = store
        .claim(&format!("{machine_id}-worker"), Some(machine_id), Some(project))
        .await
        .expect("claim")
        .expect("a queued task");
    assert_eq!(claimed.id, submitted.id);
    store
        .mark_running(claimed.id, &format!("session-{}", Uuid::new_v4()), "claude", &claimed.routing_topic())
        .await
        .expect("mark running")
}

pub fn spawn_request(topic: &str, engine: &str, prompt: &str) -> SpawnRequest {
    SpawnRequest {
        workspace_path: PathBuf::from("."),
        prompt: prompt.to_string(),
        engine: engine.to_string(),
        permission_mode: "acceptEdits".to_string(),
        task_id: None,
        topic_id: topic.to_string(),
    }
}

pub fn engines(names: &[&str]) -> Vec<String> {
    names.iter().map(ToString::to_string).collect()
}

/// Router, failover controller and bridge wired to one mock spawner.
pub struct BridgeStack {
    pub spawner: Arc<MockSpawner>,
    pub chat: Arc<RecordingChatSender>,
    pub router: TopicRouter,
    pub failover: Arc<EngineFailoverController>,
    pub bridge: Arc<SessionBridge>,
}

pub fn bridge_stack(
    spawner: MockSpawner,
    policy: FailoverPolicy,
    store: Option<Arc<dyn TaskStore>>,
) -> BridgeStack {
    let spawner = Arc::new(spawner);
    let chat = Arc::new(RecordingChatSender::new());
    let router_config = TopicRouterConfig {
        outbound: taskwire::services::OutboundConfig {
            flush_interval: Duration::from_millis(20),
            max_message_len: 4000,
        },
        ..TopicRouterConfig::default()
    };
    let router = TopicRouter::new(chat.clone(), router_config);
    let failover = Arc::new(EngineFailoverController::new(
        policy,
        spawner.clone(),
        router.clone(),
        store,
        50,
    ));
    let transport = TransportConfig {
        max_reconnects: 1,
        initial_backoff_ms: 10,
        max_backoff_ms: 50,
    };
    let bridge = Arc::new(SessionBridge::new(spawner.clone(), router.clone(), failover.clone(), transport, 50));
    BridgeStack { spawner, chat, router, failover, bridge }
}
