//! Project setup: the `.taskwire/` directory, its config file and database.

use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

use crate::adapters::sqlite::initialize_database;

/// Default configuration template content
pub const DEFAULT_CONFIG_TEMPLATE: &str = r#"# taskwire configuration
# Override settings by editing this file, adding .taskwire/local.yaml,
# or setting environment variables with the TASKWIRE_ prefix.
#
# Example environment variables:
#   export TASKWIRE_WORKER__MACHINE_ID=build-01
#   export TASKWIRE_WORKER__MAX_CONCURRENCY=4
#   export TASKWIRE_LOGGING__LEVEL=debug

worker:
  # Defaults to the host name when unset
  # machine_id: build-01
  max_concurrency: 2
  poll_interval_ms: 2000
  heartbeat_interval_secs: 30
  engine_priority: [claude, codex, gemini]
  permission_mode: acceptEdits
  workspace_root: .taskwire/workspaces

database:
  path: .taskwire/taskwire.db
  max_connections: 10

logging:
  level: info
  format: pretty
  rotation: daily
  retention_days: 30

router:
  flush_interval_ms: 1500
  max_message_len: 4000
  closed_grace_secs: 10

suppression:
  ttl_secs: 60

failover:
  window_secs: 60
  signal_threshold: 3
  retry_delay_threshold_secs: 300
  max_hops: 3

recovery:
  interval_secs: 30
  heartbeat_threshold_secs: 120
  stale_task_timeout_secs: 14400
  claim_timeout_secs: 300

transport:
  max_reconnects: 1

# Console output unless a webhook is configured:
#   chat:
#     webhook_url: https://chat.example.com/hooks/taskwire
#     max_sends_per_second: 5
chat: {}
"#;

/// Setup paths and directories
#[derive(Debug, Clone)]
pub struct SetupPaths {
    pub root: PathBuf,
    pub config_dir: PathBuf,
    pub config_file: PathBuf,
    pub database_file: PathBuf,
    pub workspaces_dir: PathBuf,
    pub logs_dir: PathBuf,
}

impl SetupPaths {
    /// Paths for the current directory
    pub fn new() -> Result<Self> {
        let current_dir = std::env::current_dir().context("Failed to get current directory")?;
        Ok(Self::for_root(current_dir))
    }

    pub fn for_root(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let config_dir = root.join(".taskwire");
        Self {
            config_file: config_dir.join("config.yaml"),
            database_file: config_dir.join("taskwire.db"),
            workspaces_dir: config_dir.join("workspaces"),
            logs_dir: config_dir.join("logs"),
            config_dir,
            root,
        }
    }

    /// Check if the project is already initialized
    pub fn is_initialized(&self) -> bool {
        self.config_file.exists() && self.database_file.exists()
    }

    /// Directories created by `init`, in creation order.
    pub fn directories(&self) -> [&Path; 3] {
        [self.config_dir.as_path(), self.workspaces_dir.as_path(), self.logs_dir.as_path()]
    }
}

/// Create the project directories, returning those that did not exist.
pub fn create_directories(paths: &SetupPaths) -> Result<Vec<PathBuf>> {
    let mut created = Vec::new();
    for dir in paths.directories() {
        if !dir.exists() {
            fs::create_dir_all(dir).with_context(|| format!("Failed to create {}", dir.display()))?;
            created.push(dir.to_path_buf());
        }
    }
    Ok(created)
}

/// Write the default configuration file unless one exists.
pub fn create_config_file(paths: &SetupPaths, force: bool) -> Result<bool> {
    if paths.config_file.exists() && !force {
        return Ok(false);
    }
    fs::write(&paths.config_file, DEFAULT_CONFIG_TEMPLATE).context("Failed to write config file")?;
    Ok(true)
}

/// Create (if needed) and migrate the project database.
pub async fn initialize_project_database(paths: &SetupPaths) -> Result<()> {
    if let Some(parent) = paths.database_file.parent() {
        fs::create_dir_all(parent).context("Failed to create database directory")?;
    }
    let url = format!("sqlite:{}", paths.database_file.display());
    let pool = initialize_database(&url, None)
        .await
        .context("Failed to initialize database")?;
    pool.close().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::Config;
    use crate::infrastructure::config::ConfigLoader;

    #[test]
    fn test_template_is_a_valid_config() {
        let config: Config = serde_yaml::from_str(DEFAULT_CONFIG_TEMPLATE).unwrap();
        ConfigLoader::validate(&config).unwrap();
        assert_eq!(config.worker.engine_priority, vec!["claude", "codex", "gemini"]);
        assert!(config.chat.webhook_url.is_none());
    }

    #[tokio::test]
    async fn test_setup_creates_project_layout() {
        let dir = tempfile::tempdir().unwrap();
        let paths = SetupPaths::for_root(dir.path());
        assert!(!paths.is_initialized());

        let created = create_directories(&paths).unwrap();
        assert_eq!(created.len(), 3);
        assert!(create_config_file(&paths, false).unwrap());
        assert!(!create_config_file(&paths, false).unwrap());
        initialize_project_database(&paths).await.unwrap();

        assert!(paths.is_initialized());
        assert!(create_directories(&paths).unwrap().is_empty());
    }
}
