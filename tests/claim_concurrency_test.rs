//! Concurrent claimers against one file-backed database.
//!
//! Each claimer group gets its own connection pool, the way separate worker
//! processes on separate machines would open the shared store.

mod common;

use std::collections::HashSet;
use std::sync::Arc;
use uuid::Uuid;

use taskwire::adapters::sqlite::SqliteTaskStore;
use taskwire::domain::models::{NewTask, TaskFilter, TaskStatus};
use taskwire::domain::ports::TaskStore;

const POOLS: usize = 4;

async fn stores(dir: &tempfile::TempDir) -> Vec<Arc<SqliteTaskStore>> {
    let path = common::db_path(dir);
    let mut stores = Vec::with_capacity(POOLS);
    for _ in 0..POOLS {
        stores.push(Arc::new(SqliteTaskStore::new(common::file_pool(&path, 8).await)));
    }
    stores
}

/// `claimers` workers race for `tasks` queued tasks until the queue is empty.
async fn race(claimers: usize, tasks: usize) {
    let dir = common::temp_dir();
    let stores = stores(&dir).await;
    for i in 0..tasks {
        stores[0]
            .submit(NewTask::new("api", format!("task {i}")))
            .await
            .unwrap();
    }

    let mut handles = Vec::with_capacity(claimers);
    for c in 0..claimers {
        let store = Arc::clone(&stores[c % POOLS]);
        handles.push(tokio::spawn(async move {
            let worker = format!("worker-{c}");
            let machine = format!("machine-{}", c % POOLS);
            let mut won: Vec<Uuid> = Vec::new();
            while let Some(task) = store.claim(&worker, Some(&machine), None).await.unwrap() {
                assert_eq!(task.status, TaskStatus::Claimed);
                assert_eq!(task.claiming_worker_id.as_deref(), Some(worker.as_str()));
                won.push(task.id);
            }
            won
        }));
    }

    let mut all = Vec::new();
    for handle in handles {
        all.extend(handle.await.unwrap());
    }

    let unique: HashSet<Uuid> = all.iter().copied().collect();
    assert_eq!(all.len(), tasks, "every task claimed exactly once");
    assert_eq!(unique.len(), tasks, "no task handed to two claimers");

    let queued = stores[1]
        .list(TaskFilter { status: Some(TaskStatus::Queued), ..TaskFilter::default() })
        .await
        .unwrap();
    assert!(queued.is_empty());

    // One claim event per task, written by the winner.
    for id in unique {
        let events = stores[2].events(id).await.unwrap();
        let claims: Vec<_> = events.iter().filter(|e| e.to_status == TaskStatus::Claimed).collect();
        assert_eq!(claims.len(), 1);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_two_claimers_one_task() {
    race(2, 1).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_eight_claimers_drain_queue() {
    race(8, 40).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_fifty_claimers_drain_queue() {
    race(50, 100).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_fifty_claimers_single_task_has_one_winner() {
    let dir = common::temp_dir();
    let stores = stores(&dir).await;
    let submitted = stores[0].submit(NewTask::new("api", "only one")).await.unwrap();

    let mut handles = Vec::new();
    for c in 0..50 {
        let store = Arc::clone(&stores[c % POOLS]);
        handles.push(tokio::spawn(async move {
            store.claim(&format!("worker-{c}"), None, None).await.unwrap()
        }));
    }

    let mut winners = Vec::new();
    for handle in handles {
        if let Some(task) = handle.await.unwrap() {
            winners.push(task);
        }
    }
    assert_eq!(winners.len(), 1);
    assert_eq!(winners[0].id, submitted.id);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_pinned_tasks_only_go_to_their_machine() {
    let dir = common::temp_dir();
    let stores = stores(&dir).await;
    for i in 0..10 {
        let machine = if i % 2 == 0 { "machine-0" } else { "machine-1" };
        stores[0]
            .submit(NewTask::new("api", format!("pinned {i}")).with_machine(machine))
            .await
            .unwrap();
    }

    let mut handles = Vec::new();
    for c in 0..8 {
        let store = Arc::clone(&stores[c % POOLS]);
        let machine = format!("machine-{}", c % 2);
        handles.push(tokio::spawn(async move {
            let mut won = Vec::new();
            while let Some(task) = store.claim(&format!("w{c}"), Some(&machine), None).await.unwrap() {
                assert_eq!(task.assigned_machine.as_deref(), Some(machine.as_str()));
                won.push(task.id);
            }
            won
        }));
    }
    let mut total = 0;
    for handle in handles {
        total += handle.await.unwrap().len();
    }
    assert_eq!(total, 10);
}
