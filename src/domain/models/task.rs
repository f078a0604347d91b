//! Task domain model.
//!
//! A task is one natural-language coding request. It is claimed by exactly one
//! worker, executed as one (possibly handed-off) session, and ends in one of
//! the terminal statuses. Rows are never deleted, only transitioned.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::errors::{DomainError, DomainResult};

/// Audit reason recorded when the recovery sweep fails a running task.
pub const STALE_RECOVERY_REASON: &str = "stale_recovery";
/// Audit reason recorded when a task outlives its own deadline.
pub const DEADLINE_EXCEEDED_REASON: &str = "deadline_exceeded";
/// Audit reason recorded when a claim is never followed by a start.
pub const CLAIM_EXPIRED_REASON: &str = "claim_expired";
/// Audit reason recorded when a machine goes offline under a task.
pub const MACHINE_OFFLINE_REASON: &str = "machine_offline";

/// Status of a task in the dispatch pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting for a worker to claim it
    Queued,
    /// Claimed by a worker, session not started yet
    Claimed,
    /// An engine session is executing the task
    Running,
    /// Finished successfully
    Completed,
    /// Finished with an error
    Failed,
    /// Cancelled by a caller
    Cancelled,
    /// Exceeded its wall-clock deadline
    Timeout,
}

impl Default for TaskStatus {
    fn default() -> Self {
        Self::Queued
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 7] = [
        Self::Queued,
        Self::Claimed,
        Self::Running,
        Self::Completed,
        Self::Failed,
        Self::Cancelled,
        Self::Timeout,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Claimed => "claimed",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Timeout => "timeout",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "queued" => Some(Self::Queued),
            "claimed" => Some(Self::Claimed),
            "running" => Some(Self::Running),
            "completed" | "complete" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "cancelled" | "canceled" => Some(Self::Cancelled),
            "timeout" | "timed_out" => Some(Self::Timeout),
            _ => None,
        }
    }

    /// Terminal statuses are absorbing.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Cancelled | Self::Timeout
        )
    }

    /// Claimed or running: owned by a worker.
    pub fn is_in_flight(&self) -> bool {
        matches!(self, Self::Claimed | Self::Running)
    }

    /// Valid transitions from this status.
    pub fn valid_transitions(&self) -> &'static [TaskStatus] {
        match self {
            Self::Queued => &[Self::Claimed, Self::Cancelled],
            Self::Claimed => &[Self::Running, Self::Queued, Self::Failed, Self::Cancelled],
            Self::Running => &[
                Self::Completed,
                Self::Failed,
                Self::Cancelled,
                Self::Timeout,
                Self::Queued,
            ],
            Self::Completed | Self::Failed | Self::Cancelled | Self::Timeout => &[],
        }
    }

    pub fn can_transition_to(&self, new_status: Self) -> bool {
        self.valid_transitions().contains(&new_status)
    }

    /// Statuses from which `target` may be entered.
    pub fn sources_of(target: Self) -> Vec<TaskStatus> {
        Self::ALL
            .iter()
            .copied()
            .filter(|s| s.can_transition_to(target))
            .collect()
    }
}

/// A unit of coding work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Unique identifier
    pub id: Uuid,
    /// Project the task targets (repository name)
    pub project: String,
    /// Natural-language task description, used as the initial prompt
    pub description: String,
    /// Current status
    pub status: TaskStatus,
    /// Higher values are claimed first
    pub priority: i32,
    /// Spend ceiling in USD, if any
    pub budget_usd: Option<f64>,
    /// Machine the task is pinned to or currently runs on
    pub assigned_machine: Option<String>,
    /// Worker that claimed the task
    pub claiming_worker_id: Option<String>,
    /// Opaque id of the session executing the task
    pub session_id: Option<String>,
    /// Conversation thread the session streams into
    pub topic_id: Option<String>,
    /// Engine that last ran the task
    pub engine: Option<String>,
    /// Result summary reported by the engine
    pub result_summary: Option<String>,
    /// Why the task failed, timed out, or was re-queued
    pub error_reason: Option<String>,
    /// Files touched by the session
    pub files_changed: Vec<String>,
    /// Pull request created from the result, if any
    pub pr_url: Option<String>,
    /// Optional wall-clock execution limit
    pub timeout_secs: Option<u64>,
    /// Number of sessions spawned for this task
    pub attempt: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Build a queued task from a submission.
    pub fn from_submission(submission: NewTask) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            project: submission.project,
            description: submission.description,
            status: TaskStatus::Queued,
            priority: submission.priority,
            budget_usd: submission.budget_usd,
            assigned_machine: submission.machine_affinity,
            claiming_worker_id: None,
            session_id: None,
            topic_id: submission.topic_id,
            engine: None,
            result_summary: None,
            error_reason: None,
            files_changed: Vec::new(),
            pr_url: None,
            timeout_secs: submission.timeout_secs,
            attempt: 0,
            created_at: now,
            updated_at: now,
            claimed_at: None,
            started_at: None,
            completed_at: None,
        }
    }

    /// Topic the session for this task streams into.
    pub fn routing_topic(&self) -> String {
        self.topic_id
            .clone()
            .unwrap_or_else(|| format!("task:{}", self.id))
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Apply a status transition in memory, enforcing the lifecycle.
    pub fn transition_to(&mut self, new_status: TaskStatus) -> DomainResult<()> {
        if !self.status.can_transition_to(new_status) {
            return Err(DomainError::InvalidStateTransition {
                from: self.status.as_str().to_string(),
                to: new_status.as_str().to_string(),
                reason: if self.status.is_terminal() {
                    "task is in a terminal state".to_string()
                } else {
                    "transition not allowed".to_string()
                },
            });
        }

        let now = Utc::now();
        self.status = new_status;
        self.updated_at = now;

        match new_status {
            TaskStatus::Claimed => self.claimed_at = Some(now),
            TaskStatus::Running => self.started_at = Some(now),
            TaskStatus::Queued => {
                self.assigned_machine = None;
                self.claiming_worker_id = None;
                self.session_id = None;
                self.claimed_at = None;
                self.started_at = None;
            }
            s if s.is_terminal() => self.completed_at = Some(now),
            _ => {}
        }

        Ok(())
    }

    /// Whether the task's own deadline has passed.
    pub fn deadline_passed(&self, now: DateTime<Utc>) -> bool {
        match (self.timeout_secs, self.started_at) {
            (Some(secs), Some(started)) => {
                (now - started).num_seconds() >= i64::try_from(secs).unwrap_or(i64::MAX)
            }
            _ => false,
        }
    }
}

/// Payload of the task submission interface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewTask {
    pub project: String,
    pub description: String,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub budget_usd: Option<f64>,
    #[serde(default)]
    pub machine_affinity: Option<String>,
    #[serde(default)]
    pub topic_id: Option<String>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl NewTask {
    pub fn new(project: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            description: description.into(),
            priority: 0,
            budget_usd: None,
            machine_affinity: None,
            topic_id: None,
            timeout_secs: None,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_budget(mut self, budget_usd: f64) -> Self {
        self.budget_usd = Some(budget_usd);
        self
    }

    pub fn with_machine(mut self, machine_id: impl Into<String>) -> Self {
        self.machine_affinity = Some(machine_id.into());
        self
    }

    pub fn with_topic(mut self, topic_id: impl Into<String>) -> Self {
        self.topic_id = Some(topic_id.into());
        self
    }

    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    pub fn validate(&self) -> DomainResult<()> {
        if self.project.trim().is_empty() {
            return Err(DomainError::ValidationFailed(
                "Task project cannot be empty".to_string(),
            ));
        }
        if self.description.trim().is_empty() {
            return Err(DomainError::ValidationFailed(
                "Task description cannot be empty".to_string(),
            ));
        }
        if let Some(budget) = self.budget_usd {
            if !budget.is_finite() || budget <= 0.0 {
                return Err(DomainError::ValidationFailed(format!(
                    "Budget must be positive, got {budget}"
                )));
            }
        }
        if self.timeout_secs == Some(0) {
            return Err(DomainError::ValidationFailed(
                "Timeout must be at least one second".to_string(),
            ));
        }
        Ok(())
    }
}

/// Completion payload written when a session finishes successfully.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskCompletion {
    pub summary: Option<String>,
    pub files_changed: Vec<String>,
    pub pr_url: Option<String>,
    pub engine: Option<String>,
}

/// Audit row written for every status transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskEvent {
    pub task_id: Uuid,
    /// `None` for the submission event
    pub from_status: Option<TaskStatus>,
    pub to_status: TaskStatus,
    pub reason: Option<String>,
    /// Worker id, `recovery`, or `cli`
    pub actor: String,
    pub at: DateTime<Utc>,
}

/// Filter for listing tasks.
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub status: Option<TaskStatus>,
    pub project: Option<String>,
    pub machine: Option<String>,
    pub limit: Option<u32>,
}

/// Result of a cancellation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelOutcome {
    /// The task moved to cancelled
    Cancelled,
    /// It was already cancelled; nothing changed
    AlreadyCancelled,
    /// It had already finished with another terminal status
    AlreadyFinished(TaskStatus),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states_are_absorbing() {
        for status in TaskStatus::ALL {
            if status.is_terminal() {
                assert!(status.valid_transitions().is_empty(), "{status} must be absorbing");
            }
        }
    }

    #[test]
    fn test_happy_path_lifecycle() {
        let mut task = Task::from_submission(NewTask::new("web", "Fix the login form"));
        assert_eq!(task.status, TaskStatus::Queued);

        task.transition_to(TaskStatus::Claimed).unwrap();
        assert!(task.claimed_at.is_some());
        task.transition_to(TaskStatus::Running).unwrap();
        assert!(task.started_at.is_some());
        task.transition_to(TaskStatus::Completed).unwrap();
        assert!(task.completed_at.is_some());

        let err = task.transition_to(TaskStatus::Running).unwrap_err();
        assert!(matches!(err, DomainError::InvalidStateTransition { .. }));
    }

    #[test]
    fn test_requeue_clears_ownership() {
        let mut task = Task::from_submission(NewTask::new("web", "desc").with_machine("m1"));
        task.transition_to(TaskStatus::Claimed).unwrap();
        task.claiming_worker_id = Some("w1".into());
        task.transition_to(TaskStatus::Running).unwrap();
        task.transition_to(TaskStatus::Queued).unwrap();

        assert_eq!(task.assigned_machine, None);
        assert_eq!(task.claiming_worker_id, None);
        assert_eq!(task.started_at, None);
    }

    #[test]
    fn test_queued_cannot_skip_to_running() {
        let mut task = Task::from_submission(NewTask::new("web", "desc"));
        assert!(task.transition_to(TaskStatus::Running).is_err());
        assert_eq!(task.status, TaskStatus::Queued);
    }

    #[test]
    fn test_sources_of_cancelled() {
        let sources = TaskStatus::sources_of(TaskStatus::Cancelled);
        assert_eq!(
            sources,
            vec![TaskStatus::Queued, TaskStatus::Claimed, TaskStatus::Running]
        );
        assert_eq!(
            TaskStatus::sources_of(TaskStatus::Timeout),
            vec![TaskStatus::Running]
        );
    }

    #[test]
    fn test_status_round_trip_names() {
        for status in TaskStatus::ALL {
            assert_eq!(TaskStatus::from_str(status.as_str()), Some(status));
        }
        assert_eq!(TaskStatus::from_str("canceled"), Some(TaskStatus::Cancelled));
        assert_eq!(TaskStatus::from_str("bogus"), None);
    }

    #[test]
    fn test_routing_topic_defaults_to_task_id() {
        let task = Task::from_submission(NewTask::new("web", "desc"));
        assert_eq!(task.routing_topic(), format!("task:{}", task.id));

        let task = Task::from_submission(NewTask::new("web", "desc").with_topic("42"));
        assert_eq!(task.routing_topic(), "42");
    }

    #[test]
    fn test_submission_validation() {
        assert!(NewTask::new("web", "do it").validate().is_ok());
        assert!(NewTask::new("", "do it").validate().is_err());
        assert!(NewTask::new("web", "   ").validate().is_err());
        assert!(NewTask::new("web", "x").with_budget(-1.0).validate().is_err());
        assert!(NewTask::new("web", "x").with_timeout_secs(0).validate().is_err());
    }

    #[test]
    fn test_deadline_passed() {
        let mut task = Task::from_submission(NewTask::new("web", "x").with_timeout_secs(60));
        let now = Utc::now();
        assert!(!task.deadline_passed(now));
        task.started_at = Some(now - chrono::Duration::seconds(61));
        assert!(task.deadline_passed(now));
        task.timeout_secs = None;
        assert!(!task.deadline_passed(now));
    }
}
