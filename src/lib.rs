//! taskwire: distributed task dispatch with interactive engine sessions.
//!
//! Tasks are queued in a shared store and claimed atomically by workers on
//! many machines. A worker runs each task as a coding-engine subprocess whose
//! streamed output is routed into a chat topic; replies in that topic flow
//! back into the session. Rate-limited sessions hand off to another engine,
//! and a recovery sweep returns work owned by vanished machines.
//!
//! # Architecture
//!
//! - **Domain** (`domain`): models, errors and the port traits
//! - **Services** (`services`): claiming, session streaming, routing, failover, recovery
//! - **Adapters** (`adapters`): SQLite stores, engine processes, chat senders
//! - **Infrastructure** (`infrastructure`): configuration, logging, project setup
//! - **CLI** (`cli`): the `taskwire` command
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use taskwire::adapters::sqlite::{create_migrated_test_pool, SqliteTaskStore};
//! use taskwire::domain::models::NewTask;
//! use taskwire::services::TaskService;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let pool = create_migrated_test_pool().await?;
//!     let tasks = TaskService::new(Arc::new(SqliteTaskStore::new(pool)));
//!     let task = tasks.submit(NewTask::new("api", "Add pagination to /users")).await?;
//!     println!("queued {}", task.id);
//!     Ok(())
//! }
//! ```

pub mod adapters;
pub mod cli;
pub mod domain;
pub mod infrastructure;
pub mod services;

pub use domain::errors::{DomainError, DomainResult};
pub use domain::models::{
    Config, Heartbeat, Machine, MachineStatus, NewTask, StreamMessage, Task, TaskStatus,
};
pub use domain::ports::{ChatSender, MachineRegistry, SessionSpawner, TaskStore};
pub use infrastructure::config::{ConfigError, ConfigLoader};
pub use services::{RecoveryService, SessionBridge, TaskExecutor, TopicRouter};
