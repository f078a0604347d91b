//! Adapters implementing the domain ports against real systems.

pub mod chat;
pub mod reporter;
pub mod sqlite;
pub mod substrates;
pub mod workspace;
