//! Port trait definitions (Hexagonal Architecture)
//!
//! Adapters implement these traits; services depend only on them:
//! - TaskStore: persisted tasks with the atomic claim
//! - MachineRegistry: worker liveness and capacity
//! - SessionSpawner / SessionProcess: external engine processes
//! - ChatSender: outbound delivery to the chat surface
//! - SuppressionStore: backing store for the chatter suppressor
//! - WorkspacePreparer / ResultReporter: collaborators around one execution

pub mod chat;
pub mod machine_registry;
pub mod reporter;
pub mod session_process;
pub mod suppression;
pub mod task_store;
pub mod workspace;

pub use chat::ChatSender;
pub use machine_registry::MachineRegistry;
pub use reporter::{ResultReporter, TaskReport};
pub use session_process::{ProcessExit, SessionProcess, SessionSpawner, SpawnRequest, SpawnedProcess};
pub use suppression::SuppressionStore;
pub use task_store::TaskStore;
pub use workspace::WorkspacePreparer;
