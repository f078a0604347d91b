pub mod config;
pub mod machine;
pub mod session;
pub mod stream;
pub mod task;

pub use config::{
    ChatConfig, Config, DatabaseConfig, EngineConfig, FailoverConfig, LoggingConfig,
    RecoveryConfig, RouterConfig, SuppressionConfig, TransportConfig, WorkerConfig,
};
pub use machine::{Heartbeat, Machine, MachineStatus};
pub use session::{
    BindingState, CloseReason, HandoffRecord, TopicId, TranscriptEntry, TranscriptRole,
    TranscriptTail,
};
pub use stream::{
    tool_answer_frame, user_frame, PendingQuestion, QuestionOption, RateLimitSignal, StreamMessage,
};
pub use task::{
    CancelOutcome, NewTask, Task, TaskCompletion, TaskEvent, TaskFilter, TaskStatus,
    CLAIM_EXPIRED_REASON, DEADLINE_EXCEEDED_REASON, MACHINE_OFFLINE_REASON,
    STALE_RECOVERY_REASON,
};
