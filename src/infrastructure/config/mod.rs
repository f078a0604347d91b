//! Configuration management infrastructure
//!
//! Hierarchical configuration using figment:
//! - defaults, then `.taskwire/config.yaml`, then `.taskwire/local.yaml`
//! - `TASKWIRE_*` environment overrides
//! - typed validation errors

pub mod loader;

pub use loader::{ConfigError, ConfigLoader};
