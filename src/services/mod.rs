//! Services layer: task execution, session routing and recovery.

pub mod failover;
pub mod inbound;
pub mod outbound;
pub mod recovery;
pub mod session;
pub mod session_bridge;
pub mod stream_parser;
pub mod suppression;
pub mod task_executor;
pub mod task_service;
pub mod topic_router;

pub use failover::{
    handoff_document, select_next_engine, EngineFailoverController, FailoverDecision,
    FailoverPolicy, HandoffContext, Replacement, ReplacementKind,
};
pub use inbound::InboundDispatcher;
pub use outbound::{split_message, OutboundBuffer, OutboundConfig};
pub use recovery::{RecoveryReport, RecoveryService};
pub use session::{LiveSession, ReplyDelivery};
pub use session_bridge::{
    SessionBridge, SessionEnd, SessionOutcome, SessionPlan, StartedSession,
    BUDGET_EXCEEDED_REASON, TRANSPORT_LOST_REASON,
};
pub use stream_parser::{classify_line, StreamProtocolParser, ASK_USER_TOOL};
pub use suppression::{ChatterSuppressor, InMemorySuppressionStore, SuppressingChatSender};
pub use task_executor::{ExecutorConfig, TaskExecutor, WORKER_SHUTDOWN_REASON};
pub use task_service::{TaskDetails, TaskService};
pub use topic_router::{BindingSnapshot, RouterError, TopicRouter, TopicRouterConfig};
