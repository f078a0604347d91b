//! Infrastructure layer module
//!
//! - Configuration loading and validation (figment)
//! - Logging setup (tracing-subscriber, tracing-appender)
//! - Project setup for `taskwire init`

pub mod config;
pub mod logging;
pub mod setup;
