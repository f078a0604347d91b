use anyhow::{Context, Result};
use figment::providers::{Env, Format, Serialized, Yaml};
use figment::Figment;
use std::path::Path;
use thiserror::Error;

use crate::domain::models::config::Config;

/// Smallest outbound message size worth splitting into.
pub const MIN_MESSAGE_LEN: usize = 64;

/// Suppression entries shorter than this expire before a host can answer.
pub const MIN_SUPPRESSION_TTL_SECS: u64 = 10;

/// Configuration error types
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid max_concurrency: {0}. Must be at least 1")]
    InvalidConcurrency(u32),

    #[error("Engine priority list cannot be empty")]
    EmptyEnginePriority,

    #[error("Engine '{0}' is listed in engine_priority but has no engines entry")]
    UnknownEngine(String),

    #[error("Invalid flush_interval_ms: {0}. Must be positive")]
    InvalidFlushInterval(u64),

    #[error("Invalid max_message_len: {0}. Must be at least {MIN_MESSAGE_LEN}")]
    InvalidMessageLen(usize),

    #[error("Invalid suppression ttl_secs: {0}. Must be at least {MIN_SUPPRESSION_TTL_SECS}")]
    InvalidSuppressionTtl(u64),

    #[error("Invalid failover signal_threshold: {0}. Must be at least 1")]
    InvalidSignalThreshold(u32),

    #[error(
        "Invalid heartbeat threshold: {threshold}s must exceed the heartbeat interval of {interval}s"
    )]
    InvalidHeartbeatThreshold { threshold: u64, interval: u64 },

    #[error("Invalid log level: {0}. Must be one of: trace, debug, info, warn, error")]
    InvalidLogLevel(String),

    #[error("Invalid log format: {0}. Must be one of: json, pretty")]
    InvalidLogFormat(String),

    #[error("Invalid log rotation: {0}. Must be one of: daily, hourly, never")]
    InvalidLogRotation(String),

    #[error("Database path cannot be empty")]
    EmptyDatabasePath,

    #[error("Invalid max_connections: {0}. Must be at least 1")]
    InvalidMaxConnections(u32),
}

/// Configuration loader with hierarchical merging
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration relative to the working directory.
    ///
    /// Precedence (lowest to highest):
    /// 1. Programmatic defaults (Serialized)
    /// 2. .taskwire/config.yaml (project config, created by init)
    /// 3. .taskwire/local.yaml (machine-local overrides, optional)
    /// 4. Environment variables (TASKWIRE_* prefix, `__` separates sections)
    pub fn load() -> Result<Config> {
        Self::load_from_dir(".")
    }

    /// Load configuration using `root/.taskwire/` as the project directory.
    pub fn load_from_dir(root: impl AsRef<Path>) -> Result<Config> {
        let dir = root.as_ref().join(".taskwire");
        let config: Config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Yaml::file(dir.join("config.yaml")))
            .merge(Yaml::file(dir.join("local.yaml")))
            .merge(Env::prefixed("TASKWIRE_").split("__"))
            .extract()
            .context("Failed to extract configuration from figment")?;

        Self::validate(&config)?;
        Ok(config)
    }

    /// Load configuration from a specific file
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Config> {
        let config: Config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Yaml::file(path.as_ref()))
            .extract()
            .with_context(|| format!("Failed to load config from {}", path.as_ref().display()))?;

        Self::validate(&config)?;
        Ok(config)
    }

    /// Validate configuration after loading
    pub fn validate(config: &Config) -> Result<(), ConfigError> {
        let worker = &config.worker;
        if worker.max_concurrency == 0 {
            return Err(ConfigError::InvalidConcurrency(worker.max_concurrency));
        }
        if worker.engine_priority.is_empty() {
            return Err(ConfigError::EmptyEnginePriority);
        }
        if let Some(name) = worker
            .engine_priority
            .iter()
            .find(|name| config.engine(name).is_none())
        {
            return Err(ConfigError::UnknownEngine(name.clone()));
        }

        if config.database.path.is_empty() {
            return Err(ConfigError::EmptyDatabasePath);
        }
        if config.database.max_connections == 0 {
            return Err(ConfigError::InvalidMaxConnections(config.database.max_connections));
        }

        if config.router.flush_interval_ms == 0 {
            return Err(ConfigError::InvalidFlushInterval(config.router.flush_interval_ms));
        }
        if config.router.max_message_len < MIN_MESSAGE_LEN {
            return Err(ConfigError::InvalidMessageLen(config.router.max_message_len));
        }

        if config.suppression.ttl_secs < MIN_SUPPRESSION_TTL_SECS {
            return Err(ConfigError::InvalidSuppressionTtl(config.suppression.ttl_secs));
        }

        if config.failover.signal_threshold == 0 {
            return Err(ConfigError::InvalidSignalThreshold(config.failover.signal_threshold));
        }

        if config.recovery.heartbeat_threshold_secs <= worker.heartbeat_interval_secs {
            return Err(ConfigError::InvalidHeartbeatThreshold {
                threshold: config.recovery.heartbeat_threshold_secs,
                interval: worker.heartbeat_interval_secs,
            });
        }

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&config.logging.level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(config.logging.level.clone()));
        }

        let valid_log_formats = ["json", "pretty"];
        if !valid_log_formats.contains(&config.logging.format.as_str()) {
            return Err(ConfigError::InvalidLogFormat(config.logging.format.clone()));
        }

        let valid_rotations = ["daily", "hourly", "never"];
        if !valid_rotations.contains(&config.logging.rotation.as_str()) {
            return Err(ConfigError::InvalidLogRotation(config.logging.rotation.clone()));
        }

        Ok(())
    }
}
