//! SQLite implementation of the TaskStore.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Sqlite, SqlitePool, Transaction};
use tracing::{debug, info};
use uuid::Uuid;

use super::{
    format_datetime, parse_datetime, parse_json_or_default, parse_optional_datetime,
    parse_optional_uuid, parse_uuid, with_busy_retry,
};
use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{
    CancelOutcome, HandoffRecord, NewTask, Task, TaskCompletion, TaskEvent, TaskFilter,
    TaskStatus, CLAIM_EXPIRED_REASON, DEADLINE_EXCEEDED_REASON, STALE_RECOVERY_REASON,
};
use crate::domain::ports::TaskStore;

/// Actor recorded on audit rows written by recovery sweeps.
const RECOVERY_ACTOR: &str = "recovery";

/// Re-reads allowed when a row changes between read and guarded write.
const MAX_TRANSITION_ATTEMPTS: usize = 5;

/// Claim in one statement. The sub-select picks the first eligible row and
/// the outer `status = 'queued'` guard re-checks it under the write lock, so
/// a row taken by a concurrent claimer is never handed out twice.
const CLAIM_SQL: &str = r#"
UPDATE tasks
SET status = 'claimed',
    claiming_worker_id = ?1,
    assigned_machine = COALESCE(?2, assigned_machine),
    claimed_at = ?3,
    updated_at = ?3
WHERE id = (
    SELECT id FROM tasks
    WHERE status = 'queued'
      AND (assigned_machine IS NULL OR assigned_machine = ?2)
      AND (?4 IS NULL OR project = ?4)
    ORDER BY priority DESC, created_at ASC
    LIMIT 1
)
AND status = 'queued'
RETURNING *
"#;

#[derive(Clone)]
pub struct SqliteTaskStore {
    pool: SqlitePool,
}

impl SqliteTaskStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn try_claim(
        &self,
        worker_id: &str,
        machine_id: Option<&str>,
        project_filter: Option<&str>,
    ) -> DomainResult<Option<Task>> {
        let now = format_datetime(&Utc::now());
        let mut tx = self.pool.begin().await?;

        let row: Option<TaskRow> = sqlx::query_as(CLAIM_SQL)
            .bind(worker_id)
            .bind(machine_id)
            .bind(&now)
            .bind(project_filter)
            .fetch_optional(&mut *tx)
            .await?;

        let Some(row) = row else {
            tx.commit().await?;
            return Ok(None);
        };

        let task: Task = row.try_into()?;
        insert_event(&mut tx, task.id, Some(TaskStatus::Queued), TaskStatus::Claimed, None, worker_id, &now).await?;
        tx.commit().await?;
        Ok(Some(task))
    }

    /// Read, transition in memory, and write back guarded on the status read.
    ///
    /// `from` restricts which statuses the caller is willing to move out of;
    /// a row found in any other status yields `InvalidStateTransition`.
    async fn transition_with<F>(
        &self,
        id: Uuid,
        from: &[TaskStatus],
        to: TaskStatus,
        reason: Option<&str>,
        actor: &str,
        mutate: F,
    ) -> DomainResult<Task>
    where
        F: Fn(&mut Task) + Send + Sync,
    {
        for _ in 0..MAX_TRANSITION_ATTEMPTS {
            let mut task = self.get(id).await?.ok_or(DomainError::TaskNotFound(id))?;
            let previous = task.status;
            if !from.contains(&previous) {
                return Err(DomainError::InvalidStateTransition {
                    from: previous.as_str().to_string(),
                    to: to.as_str().to_string(),
                    reason: format!("task is {previous}"),
                });
            }
            task.transition_to(to)?;
            mutate(&mut task);

            let written = with_busy_retry(|| self.write_transition(&task, previous, reason, actor)).await?;
            if written {
                return Ok(task);
            }
            debug!(task_id = %id, "task changed concurrently, re-reading");
        }
        Err(DomainError::DatabaseBusy(format!("task {id} kept changing during update")))
    }

    async fn write_transition(
        &self,
        task: &Task,
        previous: TaskStatus,
        reason: Option<&str>,
        actor: &str,
    ) -> DomainResult<bool> {
        let files_json = serde_json::to_string(&task.files_changed)?;
        let now = format_datetime(&task.updated_at);
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"UPDATE tasks SET status = ?, assigned_machine = ?, claiming_worker_id = ?,
               session_id = ?, topic_id = ?, engine = ?, result_summary = ?, error_reason = ?,
               files_changed = ?, pr_url = ?, attempt = ?, updated_at = ?, claimed_at = ?,
               started_at = ?, completed_at = ?
               WHERE id = ? AND status = ?"#,
        )
        .bind(task.status.as_str())
        .bind(&task.assigned_machine)
        .bind(&task.claiming_worker_id)
        .bind(&task.session_id)
        .bind(&task.topic_id)
        .bind(&task.engine)
        .bind(&task.result_summary)
        .bind(&task.error_reason)
        .bind(&files_json)
        .bind(&task.pr_url)
        .bind(i64::from(task.attempt))
        .bind(&now)
        .bind(task.claimed_at.as_ref().map(format_datetime))
        .bind(task.started_at.as_ref().map(format_datetime))
        .bind(task.completed_at.as_ref().map(format_datetime))
        .bind(task.id.to_string())
        .bind(previous.as_str())
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            return Ok(false);
        }

        insert_event(&mut tx, task.id, Some(previous), task.status, reason, actor, &now).await?;
        tx.commit().await?;
        Ok(true)
    }

    async fn ids_where(&self, sql: &str, bind: &str) -> DomainResult<Vec<Uuid>> {
        let rows: Vec<(String,)> = sqlx::query_as(sql).bind(bind).fetch_all(&self.pool).await?;
        rows.iter().map(|(id,)| parse_uuid(id)).collect()
    }

    /// Apply a recovery transition to each candidate, skipping rows that
    /// moved on since they were selected.
    async fn sweep<F>(
        &self,
        candidates: Vec<Uuid>,
        from: &[TaskStatus],
        to: TaskStatus,
        reason: &str,
        mutate: F,
    ) -> DomainResult<Vec<Uuid>>
    where
        F: Fn(&mut Task) + Send + Sync,
    {
        let mut changed = Vec::new();
        for id in candidates {
            match self.transition_with(id, from, to, Some(reason), RECOVERY_ACTOR, &mutate).await {
                Ok(_) => changed.push(id),
                Err(DomainError::InvalidStateTransition { .. }) => {
                    debug!(task_id = %id, reason, "task no longer eligible, skipping");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(changed)
    }
}

async fn insert_event(
    tx: &mut Transaction<'_, Sqlite>,
    task_id: Uuid,
    from: Option<TaskStatus>,
    to: TaskStatus,
    reason: Option<&str>,
    actor: &str,
    at: &str,
) -> DomainResult<()> {
    sqlx::query(
        "INSERT INTO task_events (task_id, from_status, to_status, reason, actor, at) VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(task_id.to_string())
    .bind(from.map(|s| s.as_str()))
    .bind(to.as_str())
    .bind(reason)
    .bind(actor)
    .bind(at)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

#[async_trait]
impl TaskStore for SqliteTaskStore {
    async fn submit(&self, submission: NewTask) -> DomainResult<Task> {
        submission.validate()?;
        let task = Task::from_submission(submission);
        let created_at = format_datetime(&task.created_at);

        with_busy_retry(|| async {
            let mut tx = self.pool.begin().await?;
            sqlx::query(
                r#"INSERT INTO tasks (id, project, description, status, priority, budget_usd,
                   assigned_machine, topic_id, files_changed, timeout_secs, attempt, created_at, updated_at)
                   VALUES (?, ?, ?, ?, ?, ?, ?, ?, '[]', ?, 0, ?, ?)"#,
            )
            .bind(task.id.to_string())
            .bind(&task.project)
            .bind(&task.description)
            .bind(task.status.as_str())
            .bind(task.priority)
            .bind(task.budget_usd)
            .bind(&task.assigned_machine)
            .bind(&task.topic_id)
            .bind(task.timeout_secs.map(|s| i64::try_from(s).unwrap_or(i64::MAX)))
            .bind(&created_at)
            .bind(&created_at)
            .execute(&mut *tx)
            .await?;
            insert_event(&mut tx, task.id, None, TaskStatus::Queued, None, "submit", &created_at).await?;
            tx.commit().await?;
            Ok(())
        })
        .await?;

        info!(task_id = %task.id, project = %task.project, priority = task.priority, "task submitted");
        Ok(task)
    }

    async fn get(&self, id: Uuid) -> DomainResult<Option<Task>> {
        let row: Option<TaskRow> = sqlx::query_as("SELECT * FROM tasks WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.map(Task::try_from).transpose()
    }

    async fn list(&self, filter: TaskFilter) -> DomainResult<Vec<Task>> {
        let mut query = String::from("SELECT * FROM tasks WHERE 1=1");
        let mut bindings: Vec<String> = Vec::new();

        if let Some(status) = &filter.status {
            query.push_str(" AND status = ?");
            bindings.push(status.as_str().to_string());
        }
        if let Some(project) = &filter.project {
            query.push_str(" AND project = ?");
            bindings.push(project.clone());
        }
        if let Some(machine) = &filter.machine {
            query.push_str(" AND assigned_machine = ?");
            bindings.push(machine.clone());
        }

        query.push_str(" ORDER BY created_at DESC");
        if let Some(limit) = filter.limit {
            query.push_str(&format!(" LIMIT {limit}"));
        }

        let mut q = sqlx::query_as::<_, TaskRow>(&query);
        for binding in &bindings {
            q = q.bind(binding);
        }

        let rows: Vec<TaskRow> = q.fetch_all(&self.pool).await?;
        rows.into_iter().map(Task::try_from).collect()
    }

    async fn claim(
        &self,
        worker_id: &str,
        machine_id: Option<&str>,
        project_filter: Option<&str>,
    ) -> DomainResult<Option<Task>> {
        let claimed = with_busy_retry(|| self.try_claim(worker_id, machine_id, project_filter)).await?;
        if let Some(task) = &claimed {
            debug!(task_id = %task.id, worker_id, machine_id = ?machine_id, "task claimed");
        }
        Ok(claimed)
    }

    async fn mark_running(
        &self,
        id: Uuid,
        session_id: &str,
        engine: &str,
        topic_id: &str,
    ) -> DomainResult<Task> {
        let actor = self
            .get(id)
            .await?
            .and_then(|t| t.claiming_worker_id)
            .unwrap_or_else(|| "worker".to_string());
        self.transition_with(id, &[TaskStatus::Claimed], TaskStatus::Running, None, &actor, |task| {
            task.session_id = Some(session_id.to_string());
            task.engine = Some(engine.to_string());
            task.topic_id = Some(topic_id.to_string());
            task.attempt += 1;
        })
        .await
    }

    async fn update_session(&self, id: Uuid, session_id: &str, engine: &str) -> DomainResult<()> {
        let now = format_datetime(&Utc::now());
        let result = with_busy_retry(|| async {
            Ok(sqlx::query(
                r#"UPDATE tasks SET session_id = ?, engine = ?, attempt = attempt + 1, updated_at = ?
                   WHERE id = ? AND status = 'running'"#,
            )
            .bind(session_id)
            .bind(engine)
            .bind(&now)
            .bind(id.to_string())
            .execute(&self.pool)
            .await?)
        })
        .await?;

        if result.rows_affected() == 0 {
            let task = self.get(id).await?.ok_or(DomainError::TaskNotFound(id))?;
            return Err(DomainError::InvalidStateTransition {
                from: task.status.as_str().to_string(),
                to: TaskStatus::Running.as_str().to_string(),
                reason: "session can only be replaced while running".to_string(),
            });
        }
        Ok(())
    }

    async fn complete(&self, id: Uuid, completion: TaskCompletion) -> DomainResult<Task> {
        let actor = completion.engine.clone().unwrap_or_else(|| "worker".to_string());
        self.transition_with(id, &[TaskStatus::Running], TaskStatus::Completed, None, &actor, |task| {
            task.result_summary = completion.summary.clone();
            task.files_changed = completion.files_changed.clone();
            task.pr_url = completion.pr_url.clone();
            if completion.engine.is_some() {
                task.engine = completion.engine.clone();
            }
        })
        .await
    }

    async fn fail(&self, id: Uuid, reason: &str) -> DomainResult<Task> {
        self.transition_with(
            id,
            &[TaskStatus::Claimed, TaskStatus::Running],
            TaskStatus::Failed,
            Some(reason),
            "worker",
            |task| task.error_reason = Some(reason.to_string()),
        )
        .await
    }

    async fn cancel(&self, id: Uuid) -> DomainResult<CancelOutcome> {
        for _ in 0..MAX_TRANSITION_ATTEMPTS {
            let task = self.get(id).await?.ok_or(DomainError::TaskNotFound(id))?;
            match task.status {
                TaskStatus::Cancelled => return Ok(CancelOutcome::AlreadyCancelled),
                s if s.is_terminal() => return Ok(CancelOutcome::AlreadyFinished(s)),
                _ => {}
            }
            let result = self
                .transition_with(
                    id,
                    &[TaskStatus::Queued, TaskStatus::Claimed, TaskStatus::Running],
                    TaskStatus::Cancelled,
                    Some("cancelled"),
                    "cli",
                    |_| {},
                )
                .await;
            match result {
                Ok(_) => {
                    info!(task_id = %id, "task cancelled");
                    return Ok(CancelOutcome::Cancelled);
                }
                // Finished concurrently; report what it finished as.
                Err(DomainError::InvalidStateTransition { .. }) => continue,
                Err(e) => return Err(e),
            }
        }
        Err(DomainError::DatabaseBusy(format!("task {id} kept changing during cancel")))
    }

    async fn requeue_for_machine(&self, machine_id: &str, reason: &str) -> DomainResult<Vec<Uuid>> {
        let candidates = self
            .ids_where(
                "SELECT id FROM tasks WHERE assigned_machine = ? AND status IN ('claimed', 'running')",
                machine_id,
            )
            .await?;
        self.sweep(
            candidates,
            &[TaskStatus::Claimed, TaskStatus::Running],
            TaskStatus::Queued,
            reason,
            |task| task.error_reason = Some(reason.to_string()),
        )
        .await
    }

    async fn requeue_for_worker(&self, worker_id: &str, reason: &str) -> DomainResult<Vec<Uuid>> {
        let candidates = self
            .ids_where(
                "SELECT id FROM tasks WHERE claiming_worker_id = ? AND status IN ('claimed', 'running')",
                worker_id,
            )
            .await?;
        self.sweep(
            candidates,
            &[TaskStatus::Claimed, TaskStatus::Running],
            TaskStatus::Queued,
            reason,
            |task| task.error_reason = Some(reason.to_string()),
        )
        .await
    }

    async fn time_out_expired(&self, now: DateTime<Utc>) -> DomainResult<Vec<Uuid>> {
        let rows: Vec<TaskRow> = sqlx::query_as(
            "SELECT * FROM tasks WHERE status = 'running' AND timeout_secs IS NOT NULL AND started_at IS NOT NULL",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut candidates = Vec::new();
        for row in rows {
            let task = Task::try_from(row)?;
            if task.deadline_passed(now) {
                candidates.push(task.id);
            }
        }

        self.sweep(
            candidates,
            &[TaskStatus::Running],
            TaskStatus::Timeout,
            DEADLINE_EXCEEDED_REASON,
            |task| task.error_reason = Some(DEADLINE_EXCEEDED_REASON.to_string()),
        )
        .await
    }

    async fn fail_stale_running(&self, started_before: DateTime<Utc>) -> DomainResult<Vec<Uuid>> {
        let candidates = self
            .ids_where(
                "SELECT id FROM tasks WHERE status = 'running' AND started_at < ?",
                &format_datetime(&started_before),
            )
            .await?;
        self.sweep(
            candidates,
            &[TaskStatus::Running],
            TaskStatus::Failed,
            STALE_RECOVERY_REASON,
            |task| task.error_reason = Some(STALE_RECOVERY_REASON.to_string()),
        )
        .await
    }

    async fn requeue_expired_claims(&self, claimed_before: DateTime<Utc>) -> DomainResult<Vec<Uuid>> {
        let candidates = self
            .ids_where(
                "SELECT id FROM tasks WHERE status = 'claimed' AND claimed_at < ?",
                &format_datetime(&claimed_before),
            )
            .await?;
        self.sweep(
            candidates,
            &[TaskStatus::Claimed],
            TaskStatus::Queued,
            CLAIM_EXPIRED_REASON,
            |task| task.error_reason = Some(CLAIM_EXPIRED_REASON.to_string()),
        )
        .await
    }

    async fn record_handoff(&self, record: &HandoffRecord) -> DomainResult<()> {
        with_busy_retry(|| async {
            sqlx::query(
                r#"INSERT INTO handoffs (id, task_id, topic_id, engine_from, engine_to, reason,
                   transcript_excerpt, created_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?)"#,
            )
            .bind(record.id.to_string())
            .bind(record.task_id.map(|id| id.to_string()))
            .bind(&record.topic_id)
            .bind(&record.engine_from)
            .bind(&record.engine_to)
            .bind(&record.reason)
            .bind(&record.transcript_excerpt)
            .bind(format_datetime(&record.created_at))
            .execute(&self.pool)
            .await?;
            Ok(())
        })
        .await
    }

    async fn handoffs(&self, task_id: Uuid) -> DomainResult<Vec<HandoffRecord>> {
        let rows: Vec<HandoffRow> =
            sqlx::query_as("SELECT * FROM handoffs WHERE task_id = ? ORDER BY created_at ASC")
                .bind(task_id.to_string())
                .fetch_all(&self.pool)
                .await?;
        rows.into_iter().map(HandoffRecord::try_from).collect()
    }

    async fn events(&self, task_id: Uuid) -> DomainResult<Vec<TaskEvent>> {
        let rows: Vec<EventRow> = sqlx::query_as(
            "SELECT task_id, from_status, to_status, reason, actor, at FROM task_events WHERE task_id = ? ORDER BY id ASC",
        )
        .bind(task_id.to_string())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(TaskEvent::try_from).collect()
    }
}

fn parse_status(s: &str) -> DomainResult<TaskStatus> {
    TaskStatus::from_str(s)
        .ok_or_else(|| DomainError::SerializationError(format!("Invalid status: {s}")))
}

#[derive(sqlx::FromRow)]
struct TaskRow {
    id: String,
    project: String,
    description: String,
    status: String,
    priority: i64,
    budget_usd: Option<f64>,
    assigned_machine: Option<String>,
    claiming_worker_id: Option<String>,
    session_id: Option<String>,
    topic_id: Option<String>,
    engine: Option<String>,
    result_summary: Option<String>,
    error_reason: Option<String>,
    files_changed: Option<String>,
    pr_url: Option<String>,
    timeout_secs: Option<i64>,
    attempt: i64,
    created_at: String,
    updated_at: String,
    claimed_at: Option<String>,
    started_at: Option<String>,
    completed_at: Option<String>,
}

impl TryFrom<TaskRow> for Task {
    type Error = DomainError;

    fn try_from(row: TaskRow) -> Result<Self, Self::Error> {
        Ok(Task {
            id: parse_uuid(&row.id)?,
            project: row.project,
            description: row.description,
            status: parse_status(&row.status)?,
            priority: i32::try_from(row.priority)
                .map_err(|e| DomainError::SerializationError(e.to_string()))?,
            budget_usd: row.budget_usd,
            assigned_machine: row.assigned_machine,
            claiming_worker_id: row.claiming_worker_id,
            session_id: row.session_id,
            topic_id: row.topic_id,
            engine: row.engine,
            result_summary: row.result_summary,
            error_reason: row.error_reason,
            files_changed: parse_json_or_default(row.files_changed)?,
            pr_url: row.pr_url,
            timeout_secs: row.timeout_secs.and_then(|s| u64::try_from(s).ok()),
            attempt: u32::try_from(row.attempt).unwrap_or(u32::MAX),
            created_at: parse_datetime(&row.created_at)?,
            updated_at: parse_datetime(&row.updated_at)?,
            claimed_at: parse_optional_datetime(row.claimed_at)?,
            started_at: parse_optional_datetime(row.started_at)?,
            completed_at: parse_optional_datetime(row.completed_at)?,
        })
    }
}

#[derive(sqlx::FromRow)]
struct EventRow {
    task_id: String,
    from_status: Option<String>,
    to_status: String,
    reason: Option<String>,
    actor: String,
    at: String,
}

impl TryFrom<EventRow> for TaskEvent {
    type Error = DomainError;

    fn try_from(row: EventRow) -> Result<Self, Self::Error> {
        Ok(TaskEvent {
            task_id: parse_uuid(&row.task_id)?,
            from_status: row.from_status.as_deref().map(parse_status).transpose()?,
            to_status: parse_status(&row.to_status)?,
            reason: row.reason,
            actor: row.actor,
            at: parse_datetime(&row.at)?,
        })
    }
}

#[derive(sqlx::FromRow)]
struct HandoffRow {
    id: String,
    task_id: Option<String>,
    topic_id: String,
    engine_from: String,
    engine_to: String,
    reason: String,
    transcript_excerpt: String,
    created_at: String,
}

impl TryFrom<HandoffRow> for HandoffRecord {
    type Error = DomainError;

    fn try_from(row: HandoffRow) -> Result<Self, Self::Error> {
        Ok(HandoffRecord {
            id: parse_uuid(&row.id)?,
            task_id: parse_optional_uuid(row.task_id)?,
            topic_id: row.topic_id,
            engine_from: row.engine_from,
            engine_to: row.engine_to,
            reason: row.reason,
            transcript_excerpt: row.transcript_excerpt,
            created_at: parse_datetime(&row.created_at)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::sqlite::create_migrated_test_pool;

    async fn setup_test_store() -> SqliteTaskStore {
        let pool = create_migrated_test_pool().await.unwrap();
        SqliteTaskStore::new(pool)
    }

    #[tokio::test]
    async fn test_submit_and_get() {
        let store = setup_test_store().await;
        let task = store
            .submit(NewTask::new("web", "Fix the header").with_priority(3).with_budget(2.5))
            .await
            .unwrap();

        let loaded = store.get(task.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, TaskStatus::Queued);
        assert_eq!(loaded.priority, 3);
        assert_eq!(loaded.budget_usd, Some(2.5));
        assert!(loaded.files_changed.is_empty());
    }

    #[tokio::test]
    async fn test_submit_rejects_invalid() {
        let store = setup_test_store().await;
        let err = store.submit(NewTask::new("", "x")).await.unwrap_err();
        assert!(matches!(err, DomainError::ValidationFailed(_)));
    }

    #[tokio::test]
    async fn test_claim_orders_by_priority_then_age() {
        let store = setup_test_store().await;
        let low = store.submit(NewTask::new("web", "low")).await.unwrap();
        let high = store.submit(NewTask::new("web", "high").with_priority(5)).await.unwrap();
        let low2 = store.submit(NewTask::new("web", "low 2")).await.unwrap();

        let first = store.claim("w1", Some("m1"), None).await.unwrap().unwrap();
        let second = store.claim("w1", Some("m1"), None).await.unwrap().unwrap();
        let third = store.claim("w1", Some("m1"), None).await.unwrap().unwrap();
        assert_eq!(first.id, high.id);
        assert_eq!(second.id, low.id);
        assert_eq!(third.id, low2.id);
        assert!(store.claim("w1", Some("m1"), None).await.unwrap().is_none());

        assert_eq!(first.status, TaskStatus::Claimed);
        assert_eq!(first.claiming_worker_id.as_deref(), Some("w1"));
        assert_eq!(first.assigned_machine.as_deref(), Some("m1"));
        assert!(first.claimed_at.is_some());
    }

    #[tokio::test]
    async fn test_claim_respects_machine_affinity_and_project() {
        let store = setup_test_store().await;
        let pinned = store.submit(NewTask::new("api", "pinned").with_machine("m2")).await.unwrap();
        let other = store.submit(NewTask::new("web", "other project")).await.unwrap();

        assert!(store.claim("w1", Some("m1"), Some("api")).await.unwrap().is_none());
        assert!(store.claim("w1", None, Some("api")).await.unwrap().is_none());

        let claimed = store.claim("w2", Some("m2"), Some("api")).await.unwrap().unwrap();
        assert_eq!(claimed.id, pinned.id);

        let claimed = store.claim("w1", None, None).await.unwrap().unwrap();
        assert_eq!(claimed.id, other.id);
        assert_eq!(claimed.assigned_machine, None);
    }

    #[tokio::test]
    async fn test_full_lifecycle_writes_audit_trail() {
        let store = setup_test_store().await;
        let task = store.submit(NewTask::new("web", "do it")).await.unwrap();
        store.claim("w1", Some("m1"), None).await.unwrap().unwrap();
        let running = store.mark_running(task.id, "s1", "claude", "topic-1").await.unwrap();
        assert_eq!(running.attempt, 1);
        assert_eq!(running.session_id.as_deref(), Some("s1"));

        let done = store
            .complete(
                task.id,
                TaskCompletion {
                    summary: Some("Done".into()),
                    files_changed: vec!["src/lib.rs".into()],
                    pr_url: None,
                    engine: Some("claude".into()),
                },
            )
            .await
            .unwrap();
        assert_eq!(done.status, TaskStatus::Completed);

        let loaded = store.get(task.id).await.unwrap().unwrap();
        assert_eq!(loaded.files_changed, vec!["src/lib.rs".to_string()]);
        assert!(loaded.completed_at.is_some());

        let events = store.events(task.id).await.unwrap();
        let path: Vec<_> = events.iter().map(|e| e.to_status).collect();
        assert_eq!(
            path,
            vec![TaskStatus::Queued, TaskStatus::Claimed, TaskStatus::Running, TaskStatus::Completed]
        );
        assert_eq!(events[1].actor, "w1");
    }

    #[tokio::test]
    async fn test_terminal_tasks_are_never_modified() {
        let store = setup_test_store().await;
        let task = store.submit(NewTask::new("web", "x")).await.unwrap();
        store.claim("w1", None, None).await.unwrap();
        store.fail(task.id, "spawn_failed: no binary").await.unwrap();

        assert!(store.mark_running(task.id, "s", "claude", "t").await.is_err());
        assert!(store.complete(task.id, TaskCompletion::default()).await.is_err());
        assert!(store.fail(task.id, "again").await.is_err());
        assert!(store.update_session(task.id, "s2", "codex").await.is_err());
        assert_eq!(
            store.cancel(task.id).await.unwrap(),
            CancelOutcome::AlreadyFinished(TaskStatus::Failed)
        );

        let loaded = store.get(task.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, TaskStatus::Failed);
        assert_eq!(loaded.error_reason.as_deref(), Some("spawn_failed: no binary"));
    }

    #[tokio::test]
    async fn test_cancel_is_idempotent() {
        let store = setup_test_store().await;
        let task = store.submit(NewTask::new("web", "x")).await.unwrap();
        assert_eq!(store.cancel(task.id).await.unwrap(), CancelOutcome::Cancelled);
        assert_eq!(store.cancel(task.id).await.unwrap(), CancelOutcome::AlreadyCancelled);
        assert!(store.claim("w1", None, None).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_cancel_unknown_task() {
        let store = setup_test_store().await;
        let err = store.cancel(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, DomainError::TaskNotFound(_)));
    }

    #[tokio::test]
    async fn test_requeue_for_machine_clears_assignment() {
        let store = setup_test_store().await;
        let a = store.submit(NewTask::new("web", "a")).await.unwrap();
        let b = store.submit(NewTask::new("web", "b")).await.unwrap();
        store.claim("w1", Some("m1"), None).await.unwrap();
        store.claim("w1", Some("m1"), None).await.unwrap();
        store.mark_running(a.id, "s", "claude", "t").await.unwrap();

        let mut requeued = store.requeue_for_machine("m1", "machine_offline").await.unwrap();
        requeued.sort();
        let mut expected = vec![a.id, b.id];
        expected.sort();
        assert_eq!(requeued, expected);

        for id in [a.id, b.id] {
            let task = store.get(id).await.unwrap().unwrap();
            assert_eq!(task.status, TaskStatus::Queued);
            assert_eq!(task.assigned_machine, None);
            assert_eq!(task.claiming_worker_id, None);
        }
        assert!(store.requeue_for_machine("m1", "machine_offline").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_requeue_for_worker_leaves_other_workers_alone() {
        let store = setup_test_store().await;
        store.submit(NewTask::new("web", "first")).await.unwrap();
        store.submit(NewTask::new("web", "second")).await.unwrap();
        let mine = store.claim("w1", Some("m1"), None).await.unwrap().unwrap();
        let theirs = store.claim("w2", Some("m1"), None).await.unwrap().unwrap();
        store.mark_running(mine.id, "s1", "claude", "t1").await.unwrap();
        store.mark_running(theirs.id, "s2", "claude", "t2").await.unwrap();

        let requeued = store.requeue_for_worker("w1", "worker_shutdown").await.unwrap();
        assert_eq!(requeued, vec![mine.id]);
        assert_eq!(store.get(mine.id).await.unwrap().unwrap().status, TaskStatus::Queued);

        let other = store.get(theirs.id).await.unwrap().unwrap();
        assert_eq!(other.status, TaskStatus::Running);
        assert_eq!(other.claiming_worker_id.as_deref(), Some("w2"));
    }

    #[tokio::test]
    async fn test_stale_and_expired_sweeps() {
        let store = setup_test_store().await;
        let running = store.submit(NewTask::new("web", "running")).await.unwrap();
        let claimed = store.submit(NewTask::new("web", "claimed")).await.unwrap();
        store.claim("w1", None, None).await.unwrap();
        store.claim("w1", None, None).await.unwrap();
        store.mark_running(running.id, "s", "claude", "t").await.unwrap();

        let later = Utc::now() + chrono::Duration::hours(5);
        assert_eq!(store.fail_stale_running(later).await.unwrap(), vec![running.id]);
        assert_eq!(store.requeue_expired_claims(later).await.unwrap(), vec![claimed.id]);

        let task = store.get(running.id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.error_reason.as_deref(), Some(STALE_RECOVERY_REASON));

        assert!(store.fail_stale_running(later).await.unwrap().is_empty());
        assert!(store.requeue_expired_claims(later).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_deadline_sweep() {
        let store = setup_test_store().await;
        let task = store.submit(NewTask::new("web", "x").with_timeout_secs(60)).await.unwrap();
        store.claim("w1", None, None).await.unwrap();
        store.mark_running(task.id, "s", "claude", "t").await.unwrap();

        assert!(store.time_out_expired(Utc::now()).await.unwrap().is_empty());
        let later = Utc::now() + chrono::Duration::seconds(61);
        assert_eq!(store.time_out_expired(later).await.unwrap(), vec![task.id]);
        let loaded = store.get(task.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, TaskStatus::Timeout);
        assert_eq!(loaded.error_reason.as_deref(), Some(DEADLINE_EXCEEDED_REASON));
    }

    #[tokio::test]
    async fn test_update_session_and_handoffs() {
        let store = setup_test_store().await;
        let task = store.submit(NewTask::new("web", "x")).await.unwrap();
        store.claim("w1", None, None).await.unwrap();
        store.mark_running(task.id, "s1", "claude", "t").await.unwrap();
        store.update_session(task.id, "s2", "codex").await.unwrap();

        let loaded = store.get(task.id).await.unwrap().unwrap();
        assert_eq!(loaded.session_id.as_deref(), Some("s2"));
        assert_eq!(loaded.engine.as_deref(), Some("codex"));
        assert_eq!(loaded.attempt, 2);

        let record = HandoffRecord::new(Some(task.id), "t", "claude", "codex", "rate_limited", "[user] hi");
        store.record_handoff(&record).await.unwrap();
        let handoffs = store.handoffs(task.id).await.unwrap();
        assert_eq!(handoffs.len(), 1);
        assert_eq!(handoffs[0].engine_to, "codex");
    }

    #[tokio::test]
    async fn test_list_filters() {
        let store = setup_test_store().await;
        store.submit(NewTask::new("web", "a")).await.unwrap();
        store.submit(NewTask::new("api", "b")).await.unwrap();
        store.submit(NewTask::new("api", "c")).await.unwrap();

        let api = store
            .list(TaskFilter { project: Some("api".into()), ..Default::default() })
            .await
            .unwrap();
        assert_eq!(api.len(), 2);

        let limited = store.list(TaskFilter { limit: Some(1), ..Default::default() }).await.unwrap();
        assert_eq!(limited.len(), 1);
        assert_eq!(limited[0].description, "c");

        let claimed = store
            .list(TaskFilter { status: Some(TaskStatus::Claimed), ..Default::default() })
            .await
            .unwrap();
        assert!(claimed.is_empty());
    }
}
