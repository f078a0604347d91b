//! Machine domain model.
//!
//! A machine hosts one worker process. It registers on its first heartbeat and
//! is kept alive by periodic heartbeats; the recovery sweep marks it offline
//! when heartbeats stop.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Liveness status of a machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MachineStatus {
    Online,
    Offline,
    Busy,
}

impl Default for MachineStatus {
    fn default() -> Self {
        Self::Online
    }
}

impl std::fmt::Display for MachineStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl MachineStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Online => "online",
            Self::Offline => "offline",
            Self::Busy => "busy",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "online" => Some(Self::Online),
            "offline" => Some(Self::Offline),
            "busy" => Some(Self::Busy),
            _ => None,
        }
    }
}

/// A registered worker host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Machine {
    pub id: String,
    pub status: MachineStatus,
    pub last_heartbeat: DateTime<Utc>,
    pub active_task_count: u32,
    pub max_concurrency: u32,
    /// Execution engines in order of preference
    pub engine_priority: Vec<String>,
    pub registered_at: DateTime<Utc>,
}

impl Machine {
    /// Age of the last heartbeat at `now`.
    pub fn heartbeat_age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.last_heartbeat
    }

    pub fn is_stale(&self, now: DateTime<Utc>, threshold: std::time::Duration) -> bool {
        let threshold = chrono::Duration::from_std(threshold).unwrap_or(chrono::Duration::MAX);
        self.heartbeat_age(now) > threshold
    }

    pub fn has_capacity(&self) -> bool {
        self.status != MachineStatus::Offline && self.active_task_count < self.max_concurrency
    }
}

/// Periodic liveness report sent by a worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub machine_id: String,
    pub status: MachineStatus,
    pub active_tasks: u32,
    pub capacity: u32,
    pub engine_priority: Vec<String>,
}

impl Heartbeat {
    /// Derive the reported status from load: busy when at capacity.
    pub fn from_load(
        machine_id: impl Into<String>,
        active_tasks: u32,
        capacity: u32,
        engine_priority: Vec<String>,
    ) -> Self {
        let status = if active_tasks >= capacity {
            MachineStatus::Busy
        } else {
            MachineStatus::Online
        };
        Self {
            machine_id: machine_id.into(),
            status,
            active_tasks,
            capacity,
            engine_priority,
        }
    }
}
