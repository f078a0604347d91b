//! Implementation of the `taskwire task` commands.

use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use serde::Serialize;
use uuid::Uuid;

use crate::cli::commands::CommandContext;
use crate::cli::output::{format_task_table, format_time, output, CommandOutput};
use crate::domain::models::{CancelOutcome, NewTask, Task, TaskFilter, TaskStatus};
use crate::services::{TaskDetails, TaskService};

#[derive(Args, Debug)]
pub struct TaskArgs {
    #[command(subcommand)]
    pub command: TaskCommands,
}

#[derive(Subcommand, Debug)]
pub enum TaskCommands {
    /// Submit a new task to the queue
    Submit {
        /// Task description, used as the session's initial prompt
        description: String,

        /// Project (repository) the task targets
        #[arg(short, long)]
        project: String,

        /// Higher priorities are claimed first
        #[arg(long, default_value_t = 0, allow_hyphen_values = true)]
        priority: i32,

        /// Spend ceiling in USD
        #[arg(long)]
        budget: Option<f64>,

        /// Only this machine may claim the task
        #[arg(long)]
        machine: Option<String>,

        /// Conversation thread the session streams into
        #[arg(long)]
        topic: Option<String>,

        /// Wall-clock limit for the running session
        #[arg(long)]
        timeout_secs: Option<u64>,
    },

    /// List tasks
    List {
        /// Filter by status
        #[arg(short, long, value_parser = parse_status)]
        status: Option<TaskStatus>,

        /// Filter by project
        #[arg(short, long)]
        project: Option<String>,

        /// Maximum number of tasks to show
        #[arg(short, long, default_value_t = 50)]
        limit: u32,
    },

    /// Show a task with its history
    Show {
        /// Task ID
        id: Uuid,
    },

    /// Cancel a task (idempotent)
    Cancel {
        /// Task ID
        id: Uuid,
    },
}

fn parse_status(s: &str) -> Result<TaskStatus, String> {
    TaskStatus::from_str(&s.to_lowercase()).ok_or_else(|| {
        let valid: Vec<&str> = TaskStatus::ALL.iter().map(TaskStatus::as_str).collect();
        format!("unknown status '{s}', expected one of: {}", valid.join(", "))
    })
}

#[derive(Debug, Serialize)]
pub struct SubmitOutput {
    pub task_id: Uuid,
    pub project: String,
    pub status: TaskStatus,
    pub topic_id: String,
}

impl CommandOutput for SubmitOutput {
    fn to_human(&self) -> String {
        format!(
            "Task submitted.\n  ID: {}\n  Project: {}\n  Topic: {}",
            self.task_id, self.project, self.topic_id
        )
    }
}

#[derive(Debug, Serialize)]
pub struct TaskListOutput {
    pub tasks: Vec<Task>,
}

impl CommandOutput for TaskListOutput {
    fn to_human(&self) -> String {
        if self.tasks.is_empty() {
            return "No tasks found.".to_string();
        }
        format!("{}\nShowing {} task(s)", format_task_table(&self.tasks), self.tasks.len())
    }

    fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(&self.tasks).unwrap_or_default()
    }
}

impl CommandOutput for TaskDetails {
    fn to_human(&self) -> String {
        let task = &self.task;
        let mut lines = vec![
            "Task Details:".to_string(),
            format!("  ID: {}", task.id),
            format!("  Project: {}", task.project),
            format!("  Status: {}", task.status),
            format!("  Priority: {}", task.priority),
            format!("  Topic: {}", task.routing_topic()),
            format!("  Description: {}", task.description),
        ];
        let optional = [
            ("Machine", task.assigned_machine.clone()),
            ("Engine", task.engine.clone()),
            ("Session", task.session_id.clone()),
            ("Budget", task.budget_usd.map(|b| format!("${b:.2}"))),
            ("Timeout", task.timeout_secs.map(|s| format!("{s}s"))),
            ("Summary", task.result_summary.clone()),
            ("Error", task.error_reason.clone()),
            ("PR", task.pr_url.clone()),
        ];
        for (label, value) in optional {
            if let Some(value) = value {
                lines.push(format!("  {label}: {value}"));
            }
        }
        lines.push(format!("  Attempts: {}", task.attempt));
        lines.push(format!("  Created at: {}", format_time(&task.created_at)));
        if let Some(started_at) = task.started_at {
            lines.push(format!("  Started at: {}", format_time(&started_at)));
        }
        if let Some(completed_at) = task.completed_at {
            lines.push(format!("  Completed at: {}", format_time(&completed_at)));
        }

        if !task.files_changed.is_empty() {
            lines.push("  Files changed:".to_string());
            lines.extend(task.files_changed.iter().map(|f| format!("    - {f}")));
        }

        if !self.events.is_empty() {
            lines.push("  History:".to_string());
            for event in &self.events {
                let from = event.from_status.map_or("-".to_string(), |s| s.to_string());
                let reason = event.reason.as_deref().map(|r| format!(" ({r})")).unwrap_or_default();
                lines.push(format!(
                    "    {} {from} -> {} by {}{reason}",
                    format_time(&event.at),
                    event.to_status,
                    event.actor
                ));
            }
        }

        if !self.handoffs.is_empty() {
            lines.push("  Handoffs:".to_string());
            for handoff in &self.handoffs {
                lines.push(format!(
                    "    {} {} -> {}: {}",
                    format_time(&handoff.created_at),
                    handoff.engine_from,
                    handoff.engine_to,
                    handoff.reason
                ));
            }
        }
        lines.join("\n")
    }
}

#[derive(Debug, Serialize)]
pub struct CancelOutput {
    pub task_id: Uuid,
    pub outcome: CancelOutcome,
}

impl CommandOutput for CancelOutput {
    fn to_human(&self) -> String {
        match self.outcome {
            CancelOutcome::Cancelled => format!("Task {} cancelled.", self.task_id),
            CancelOutcome::AlreadyCancelled => format!("Task {} was already cancelled.", self.task_id),
            CancelOutcome::AlreadyFinished(status) => {
                format!("Task {} already finished as {status}; nothing to cancel.", self.task_id)
            }
        }
    }
}

pub async fn execute(args: TaskArgs, json_mode: bool) -> Result<()> {
    let ctx = CommandContext::load().await?;
    let service = TaskService::new(ctx.store.clone());

    match args.command {
        TaskCommands::Submit {
            description,
            project,
            priority,
            budget,
            machine,
            topic,
            timeout_secs,
        } => {
            let submission = NewTask {
                project,
                description,
                priority,
                budget_usd: budget,
                machine_affinity: machine,
                topic_id: topic,
                timeout_secs,
            };
            let task = service.submit(submission).await.context("Failed to submit task")?;
            output(
                &SubmitOutput {
                    task_id: task.id,
                    topic_id: task.routing_topic(),
                    project: task.project,
                    status: task.status,
                },
                json_mode,
            );
        }
        TaskCommands::List { status, project, limit } => {
            let filter = TaskFilter {
                status,
                project,
                machine: None,
                limit: Some(limit),
            };
            let tasks = service.list(filter).await.context("Failed to list tasks")?;
            output(&TaskListOutput { tasks }, json_mode);
        }
        TaskCommands::Show { id } => {
            let details = service.details(id).await.context("Failed to retrieve task")?;
            output(&details, json_mode);
        }
        TaskCommands::Cancel { id } => {
            let outcome = service.cancel(id).await.context("Failed to cancel task")?;
            output(&CancelOutput { task_id: id, outcome }, json_mode);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_status() {
        assert_eq!(parse_status("running"), Ok(TaskStatus::Running));
        assert_eq!(parse_status("TIMEOUT"), Ok(TaskStatus::Timeout));
        assert!(parse_status("paused").unwrap_err().contains("queued"));
    }

    #[test]
    fn test_cancel_output_is_idempotent_friendly() {
        let id = Uuid::new_v4();
        let out = CancelOutput { task_id: id, outcome: CancelOutcome::AlreadyFinished(TaskStatus::Completed) };
        assert!(out.to_human().contains("already finished as completed"));
        assert_eq!(out.to_json()["outcome"]["already_finished"], "completed");
    }
}
