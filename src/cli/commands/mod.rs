//! CLI command implementations.

pub mod init;
pub mod machine;
pub mod recover;
pub mod task;
pub mod worker;

use anyhow::{Context, Result};
use sqlx::SqlitePool;
use std::sync::Arc;

use crate::adapters::sqlite::{initialize_database, PoolConfig, SqliteMachineRegistry, SqliteTaskStore};
use crate::domain::models::Config;
use crate::domain::ports::{MachineRegistry, TaskStore};
use crate::infrastructure::config::ConfigLoader;

/// Loaded configuration plus the stores every command talks to.
pub struct CommandContext {
    pub config: Config,
    pub pool: SqlitePool,
    pub store: Arc<dyn TaskStore>,
    pub registry: Arc<dyn MachineRegistry>,
}

impl CommandContext {
    /// Load configuration and open (migrating if needed) the project database.
    pub async fn load() -> Result<Self> {
        let config = ConfigLoader::load().context("Failed to load configuration")?;
        Self::with_config(config).await
    }

    pub async fn with_config(config: Config) -> Result<Self> {
        let pool_config = PoolConfig {
            max_connections: config.database.max_connections,
            ..PoolConfig::default()
        };
        let pool = initialize_database(&config.database.url(), Some(pool_config))
            .await
            .with_context(|| format!("Failed to open database at {}", config.database.path))?;

        Ok(Self {
            store: Arc::new(SqliteTaskStore::new(pool.clone())),
            registry: Arc::new(SqliteMachineRegistry::new(pool.clone())),
            pool,
            config,
        })
    }
}
