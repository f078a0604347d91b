//! Domain layer for the taskwire dispatch system
//!
//! This module contains the core models, errors, and the port traits that
//! adapters implement.

pub mod errors;
pub mod models;
pub mod ports;

pub use errors::{DomainError, DomainResult};
