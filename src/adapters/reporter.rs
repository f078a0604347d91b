//! Result reporting adapters.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;

use crate::domain::errors::DomainResult;
use crate::domain::ports::{ResultReporter, TaskReport};

/// Logs each report; commit and PR creation live outside this process.
#[derive(Debug, Default)]
pub struct LoggingResultReporter;

#[async_trait]
impl ResultReporter for LoggingResultReporter {
    async fn report(&self, report: &TaskReport) -> DomainResult<()> {
        info!(
            task_id = %report.task_id,
            status = %report.status,
            files_changed = report.files_changed.len(),
            pr_url = ?report.pr_url,
            summary = ?report.summary,
            "task result"
        );
        Ok(())
    }
}

/// Keeps reports in memory.
#[derive(Debug, Clone, Default)]
pub struct RecordingResultReporter {
    reports: Arc<RwLock<Vec<TaskReport>>>,
}

impl RecordingResultReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn reports(&self) -> Vec<TaskReport> {
        self.reports.read().await.clone()
    }
}

#[async_trait]
impl ResultReporter for RecordingResultReporter {
    async fn report(&self, report: &TaskReport) -> DomainResult<()> {
        self.reports.write().await.push(report.clone());
        Ok(())
    }
}
