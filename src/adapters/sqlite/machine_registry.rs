//! SQLite implementation of the MachineRegistry.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use tracing::{info, warn};

use super::{format_datetime, parse_datetime, parse_json_or_default, with_busy_retry};
use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{Heartbeat, Machine, MachineStatus};
use crate::domain::ports::MachineRegistry;

#[derive(Clone)]
pub struct SqliteMachineRegistry {
    pool: SqlitePool,
}

impl SqliteMachineRegistry {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl MachineRegistry for SqliteMachineRegistry {
    async fn heartbeat(&self, heartbeat: &Heartbeat) -> DomainResult<Machine> {
        let now = format_datetime(&Utc::now());
        let engines = serde_json::to_string(&heartbeat.engine_priority)?;

        let was_offline = matches!(
            self.get(&heartbeat.machine_id).await?,
            Some(Machine { status: MachineStatus::Offline, .. })
        );

        with_busy_retry(|| async {
            sqlx::query(
                r#"INSERT INTO machines (id, status, last_heartbeat, active_task_count, max_concurrency,
                   engine_priority, registered_at)
                   VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?3)
                   ON CONFLICT(id) DO UPDATE SET
                       status = excluded.status,
                       last_heartbeat = excluded.last_heartbeat,
                       active_task_count = excluded.active_task_count,
                       max_concurrency = excluded.max_concurrency,
                       engine_priority = excluded.engine_priority"#,
            )
            .bind(&heartbeat.machine_id)
            .bind(heartbeat.status.as_str())
            .bind(&now)
            .bind(i64::from(heartbeat.active_tasks))
            .bind(i64::from(heartbeat.capacity))
            .bind(&engines)
            .execute(&self.pool)
            .await?;
            Ok(())
        })
        .await?;

        if was_offline {
            info!(machine_id = %heartbeat.machine_id, "machine back online");
        }

        self.get(&heartbeat.machine_id)
            .await?
            .ok_or_else(|| DomainError::MachineNotFound(heartbeat.machine_id.clone()))
    }

    async fn get(&self, id: &str) -> DomainResult<Option<Machine>> {
        let row: Option<MachineRow> = sqlx::query_as("SELECT * FROM machines WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Machine::try_from).transpose()
    }

    async fn list(&self) -> DomainResult<Vec<Machine>> {
        let rows: Vec<MachineRow> = sqlx::query_as("SELECT * FROM machines ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(Machine::try_from).collect()
    }

    async fn list_by_status(&self, status: MachineStatus) -> DomainResult<Vec<Machine>> {
        let rows: Vec<MachineRow> = sqlx::query_as("SELECT * FROM machines WHERE status = ? ORDER BY id")
            .bind(status.as_str())
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(Machine::try_from).collect()
    }

    async fn mark_stale_offline(&self, cutoff: DateTime<Utc>) -> DomainResult<Vec<String>> {
        let cutoff = format_datetime(&cutoff);
        let rows: Vec<(String,)> = with_busy_retry(|| async {
            Ok(sqlx::query_as(
                r#"UPDATE machines SET status = 'offline', active_task_count = 0
                   WHERE status != 'offline' AND last_heartbeat < ?
                   RETURNING id"#,
            )
            .bind(&cutoff)
            .fetch_all(&self.pool)
            .await?)
        })
        .await?;

        let ids: Vec<String> = rows.into_iter().map(|(id,)| id).collect();
        for id in &ids {
            warn!(machine_id = %id, "machine heartbeat stale, marked offline");
        }
        Ok(ids)
    }
}

#[derive(sqlx::FromRow)]
struct MachineRow {
    id: String,
    status: String,
    last_heartbeat: String,
    active_task_count: i64,
    max_concurrency: i64,
    engine_priority: Option<String>,
    registered_at: String,
}

impl TryFrom<MachineRow> for Machine {
    type Error = DomainError;

    fn try_from(row: MachineRow) -> Result<Self, Self::Error> {
        let status = MachineStatus::from_str(&row.status)
            .ok_or_else(|| DomainError::SerializationError(format!("Invalid machine status: {}", row.status)))?;
        Ok(Machine {
            id: row.id,
            status,
            last_heartbeat: parse_datetime(&row.last_heartbeat)?,
            active_task_count: u32::try_from(row.active_task_count).unwrap_or(0),
            max_concurrency: u32::try_from(row.max_concurrency).unwrap_or(0),
            engine_priority: parse_json_or_default(row.engine_priority)?,
            registered_at: parse_datetime(&row.registered_at)?,
        })
    }
}
