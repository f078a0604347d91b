//! Engine failover end to end: bridge, controller, router and the task store.

mod common;

use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use taskwire::adapters::substrates::{MockScript, MockSpawner};
use taskwire::domain::models::TaskStatus;
use taskwire::domain::ports::TaskStore;
use taskwire::services::{FailoverPolicy, SessionEnd, SessionPlan};

const EXCERPT_CHARS: usize = 200;

fn policy() -> FailoverPolicy {
    FailoverPolicy {
        window: Duration::from_secs(60),
        signal_threshold: 3,
        retry_delay_threshold: Duration::from_secs(300),
        max_hops: 2,
        immediate_window: Duration::from_secs(30),
        excerpt_chars: EXCERPT_CHARS,
    }
}

fn rate_limit_line() -> String {
    json!({"type": "rate_limit", "retry_after_secs": 5, "message": "429 too many requests"}).to_string()
}

fn assistant_line(text: &str) -> String {
    json!({"type": "assistant", "text": text}).to_string()
}

/// Some assistant output followed by three rate-limit signals, then silence.
fn rate_limited_script() -> MockScript {
    let long_reply = format!("Edited src/lib.rs. {}", "Refactoring the parser module. ".repeat(20));
    MockScript::lines([
        assistant_line(&long_reply),
        rate_limit_line(),
        rate_limit_line(),
        rate_limit_line(),
    ])
    .held_open()
}

fn plan(topic: &str, task_id: Option<uuid::Uuid>, priority: &[&str]) -> SessionPlan {
    SessionPlan {
        topic_id: topic.to_string(),
        task_id,
        prompt: "Fix the flaky integration test".to_string(),
        workspace_path: PathBuf::from("."),
        engine_priority: common::engines(priority),
        permission_mode: "acceptEdits".to_string(),
        budget_usd: None,
    }
}

#[tokio::test]
async fn test_rate_limited_session_hands_off_once() {
    common::setup_test_logging();
    let (_pool, store, _registry) = common::memory_stores().await;
    let task = common::running_task(store.as_ref(), "api", "m1").await;
    let topic = task.routing_topic();

    let spawner = MockSpawner::new();
    spawner.push_script("claude", rate_limited_script()).await;
    spawner.push_script("codex", MockScript::completes_with("Test fixed on codex.")).await;
    let stack = common::bridge_stack(spawner, policy(), Some(store.clone() as Arc<dyn TaskStore>));

    let outcome = tokio::time::timeout(
        Duration::from_secs(10),
        stack.bridge.run(plan(&topic, Some(task.id), &["claude", "codex", "gemini"])),
    )
    .await
    .expect("session finished in time")
    .expect("session started");

    assert_eq!(outcome.end, SessionEnd::Completed { summary: Some("Test fixed on codex.".into()) });
    assert_eq!(outcome.engine, "codex");
    assert_eq!(outcome.handoffs, 1);

    let spawns = stack.spawner.spawns().await;
    assert_eq!(spawns.len(), 2, "exactly one replacement spawn");
    assert_eq!(spawns[0].request.engine, "claude");
    assert!(spawns[0].was_terminated(), "rate-limited process is killed");
    assert_eq!(spawns[1].request.engine, "codex");
    let prompt = &spawns[1].request.prompt;
    assert!(prompt.starts_with("[Session handoff]"));
    assert!(prompt.contains("claude"));
    assert!(prompt.ends_with("Fix the flaky integration test"));

    let handoffs = store.handoffs(task.id).await.unwrap();
    assert_eq!(handoffs.len(), 1);
    let record = &handoffs[0];
    assert_eq!(record.engine_from, "claude");
    assert_eq!(record.engine_to, "codex");
    assert_eq!(record.topic_id, topic);
    assert!(record.transcript_excerpt.chars().count() <= EXCERPT_CHARS);
    assert!(!record.transcript_excerpt.is_empty());
    assert!(prompt.contains(&record.transcript_excerpt));

    let stored = store.get(task.id).await.unwrap().unwrap();
    assert_eq!(stored.engine.as_deref(), Some("codex"));
    assert_eq!(stored.session_id.as_deref(), Some(spawns[1].session_id.as_str()));

    let texts = stack.chat.texts_for(&topic).await.concat();
    assert!(texts.contains("handing off to codex"));
    assert!(texts.contains("Test fixed on codex."));
}

#[tokio::test]
async fn test_replacement_limited_immediately_escalates() {
    let (_pool, store, _registry) = common::memory_stores().await;
    let task = common::running_task(store.as_ref(), "api", "m1").await;
    let topic = task.routing_topic();

    let spawner = MockSpawner::new();
    spawner.push_script("claude", rate_limited_script()).await;
    spawner
        .push_script("codex", MockScript::lines([rate_limit_line()]).held_open())
        .await;
    let stack = common::bridge_stack(spawner, policy(), Some(store.clone() as Arc<dyn TaskStore>));

    let outcome = tokio::time::timeout(
        Duration::from_secs(10),
        stack.bridge.run(plan(&topic, Some(task.id), &["claude", "codex", "gemini"])),
    )
    .await
    .expect("session finished in time")
    .expect("session started");

    match &outcome.end {
        SessionEnd::Failed { reason } => assert!(reason.contains("immediately"), "{reason}"),
        other => panic!("expected escalation, got {other:?}"),
    }
    assert_eq!(outcome.handoffs, 1);
    assert_eq!(stack.spawner.spawn_count().await, 2, "no third engine after escalation");
    assert_eq!(store.handoffs(task.id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_no_engine_left_fails_without_spawning() {
    let spawner = MockSpawner::new();
    spawner.push_script("claude", rate_limited_script()).await;
    let stack = common::bridge_stack(spawner, policy(), None);

    let outcome = tokio::time::timeout(Duration::from_secs(10), stack.bridge.run(plan("solo", None, &["claude"])))
        .await
        .expect("session finished in time")
        .expect("session started");

    match &outcome.end {
        SessionEnd::Failed { reason } => assert!(reason.contains("no engine left"), "{reason}"),
        other => panic!("expected failure, got {other:?}"),
    }
    assert_eq!(outcome.handoffs, 0);
    assert_eq!(stack.spawner.spawn_count().await, 1);
}

#[tokio::test]
async fn test_task_store_untouched_by_unbound_session() {
    // A session with no task behind it still hands off; nothing is persisted.
    let (_pool, store, _registry) = common::memory_stores().await;
    let spawner = MockSpawner::new();
    spawner.push_script("claude", rate_limited_script()).await;
    spawner.push_script("codex", MockScript::completes_with("done")).await;
    let stack = common::bridge_stack(spawner, policy(), Some(store.clone() as Arc<dyn TaskStore>));

    let outcome = stack.bridge.run(plan("chat-only", None, &["claude", "codex"])).await.unwrap();
    assert_eq!(outcome.engine, "codex");
    let running = store
        .list(taskwire::domain::models::TaskFilter {
            status: Some(TaskStatus::Running),
            ..Default::default()
        })
        .await
        .unwrap();
    assert!(running.is_empty());
}
