//! Domain errors for the taskwire dispatch system.

use thiserror::Error;
use uuid::Uuid;

/// Domain-level errors that can occur in the taskwire system.
#[derive(Debug, Error)]
pub enum DomainError {
    #[error("Task not found: {0}")]
    TaskNotFound(Uuid),

    #[error("Machine not found: {0}")]
    MachineNotFound(String),

    #[error("Invalid state transition from {from} to {to}: {reason}")]
    InvalidStateTransition { from: String, to: String, reason: String },

    #[error("Unknown engine: {0}")]
    UnknownEngine(String),

    #[error("Validation failed: {0}")]
    ValidationFailed(String),

    #[error("Database error: {0}")]
    DatabaseError(String),

    #[error("Database busy: {0}")]
    DatabaseBusy(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Failed to spawn engine process: {0}")]
    SpawnFailed(String),

    #[error("Workspace preparation failed: {0}")]
    WorkspaceFailed(String),

    #[error("Session transport error: {0}")]
    Transport(String),

    #[error("Chat delivery failed: {0}")]
    DeliveryFailed(String),

    #[error("Execution failed: {0}")]
    ExecutionFailed(String),
}

pub type DomainResult<T> = Result<T, DomainError>;

impl DomainError {
    /// Whether retrying the same operation may succeed without intervention.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::DatabaseBusy(_))
    }
}

impl From<sqlx::Error> for DomainError {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db_err) = &err {
            let message = db_err.message();
            if message.contains("database is locked") || message.contains("database is busy") {
                return DomainError::DatabaseBusy(message.to_string());
            }
        }
        DomainError::DatabaseError(err.to_string())
    }
}

impl From<serde_json::Error> for DomainError {
    fn from(err: serde_json::Error) -> Self {
        DomainError::SerializationError(err.to_string())
    }
}

impl From<std::io::Error> for DomainError {
    fn from(err: std::io::Error) -> Self {
        DomainError::Transport(err.to_string())
    }
}
