//! The task variants behind [`TaskFunction`]. Each one watches its run's
//! cancellation token and returns [`TaskError::Cancelled`] as soon as it fires.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use tracing::{debug, info, warn};

use warden_core::config::TasksConfig;
use warden_core::types::TaskKind;
use warden_scheduler::{TaskContext, TaskError, TaskFunction};

use crate::error::OpsError;
use crate::ops::{DatabaseOps, ReportOps};

/// Window of the weekly performance report.
pub const PERFORMANCE_REPORT_DAYS: u32 = 7;

/// Drive `op` unless the run is cancelled first.
async fn guarded<T>(
    ctx: &TaskContext,
    op: impl Future<Output = Result<T, OpsError>>,
) -> Result<T, TaskError> {
    tokio::select! {
        biased;
        _ = ctx.cancel.cancelled() => Err(TaskError::Cancelled),
        res = op => res.map_err(|e| TaskError::failed(e.to_string())),
    }
}

pub struct BackupTask {
    db: Arc<dyn DatabaseOps>,
    dir: PathBuf,
}

impl BackupTask {
    pub fn new(db: Arc<dyn DatabaseOps>, dir: impl Into<PathBuf>) -> Self {
        Self { db, dir: dir.into() }
    }
}

#[async_trait]
impl TaskFunction for BackupTask {
    async fn execute(&self, ctx: TaskContext) -> Result<Option<String>, TaskError> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let file = self
            .dir
            .join(format!("backup_{}.sql", ctx.started_at.format("%Y%m%d_%H%M%S")));
        guarded(&ctx, self.db.backup(&file)).await?;
        info!(task_id = %ctx.task_id, run_id = %ctx.run_id, path = %file.display(), "backup written");
        Ok(Some(format!("backup written to {}", file.display())))
    }
}

pub struct HealthReportTask {
    reports: Arc<dyn ReportOps>,
    dir: PathBuf,
}

impl HealthReportTask {
    pub fn new(reports: Arc<dyn ReportOps>, dir: impl Into<PathBuf>) -> Self {
        Self {
            reports,
            dir: dir.into(),
        }
    }
}

#[async_trait]
impl TaskFunction for HealthReportTask {
    async fn execute(&self, ctx: TaskContext) -> Result<Option<String>, TaskError> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = guarded(&ctx, self.reports.health_report(&self.dir)).await?;
        Ok(Some(format!("health report generated: {}", path.display())))
    }
}

pub struct PerformanceReportTask {
    reports: Arc<dyn ReportOps>,
    dir: PathBuf,
    days: u32,
}

impl PerformanceReportTask {
    pub fn new(reports: Arc<dyn ReportOps>, dir: impl Into<PathBuf>) -> Self {
        Self {
            reports,
            dir: dir.into(),
            days: PERFORMANCE_REPORT_DAYS,
        }
    }
}

#[async_trait]
impl TaskFunction for PerformanceReportTask {
    async fn execute(&self, ctx: TaskContext) -> Result<Option<String>, TaskError> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = guarded(&ctx, self.reports.performance_report(&self.dir, self.days)).await?;
        Ok(Some(format!(
            "performance report ({} days) generated: {}",
            self.days,
            path.display()
        )))
    }
}

pub struct OptimizeTask {
    db: Arc<dyn DatabaseOps>,
}

impl OptimizeTask {
    pub fn new(db: Arc<dyn DatabaseOps>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl TaskFunction for OptimizeTask {
    async fn execute(&self, ctx: TaskContext) -> Result<Option<String>, TaskError> {
        let results = guarded(&ctx, self.db.optimize_tables()).await?;
        let ok = results.iter().filter(|r| r.ok).count();
        let summary = format!("{ok}/{} tables optimized", results.len());

        let failed: Vec<&str> = results
            .iter()
            .filter(|r| !r.ok)
            .map(|r| r.table.as_str())
            .collect();
        if failed.is_empty() {
            Ok(Some(summary))
        } else {
            Err(TaskError::failed(format!("{summary}; failed: {}", failed.join(", "))))
        }
    }
}

/// Removes backups and reports whose modification time is older than the
/// retention window. Subdirectories are left alone.
pub struct CleanupTask {
    dirs: Vec<PathBuf>,
    retention: Duration,
}

impl CleanupTask {
    pub fn new(dirs: Vec<PathBuf>, retention_days: u32) -> Self {
        Self {
            dirs,
            retention: Duration::from_secs(u64::from(retention_days) * 86_400),
        }
    }

    async fn sweep(&self, dir: &Path, cutoff: SystemTime, ctx: &TaskContext) -> Result<usize, TaskError> {
        let mut entries = match tokio::fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(dir = %dir.display(), "cleanup directory missing, skipping");
                return Ok(0);
            }
            Err(e) => return Err(e.into()),
        };

        let mut removed = 0;
        while let Some(entry) = entries.next_entry().await? {
            if ctx.cancel.is_cancelled() {
                return Err(TaskError::Cancelled);
            }
            let meta = entry.metadata().await?;
            if !meta.is_file() {
                continue;
            }
            let stale = meta.modified().map(|m| m < cutoff).unwrap_or(false);
            if !stale {
                continue;
            }
            match tokio::fs::remove_file(entry.path()).await {
                Ok(()) => {
                    debug!(path = %entry.path().display(), "removed old file");
                    removed += 1;
                }
                Err(e) => warn!(path = %entry.path().display(), error = %e, "failed to remove old file"),
            }
        }
        Ok(removed)
    }
}

#[async_trait]
impl TaskFunction for CleanupTask {
    async fn execute(&self, ctx: TaskContext) -> Result<Option<String>, TaskError> {
        let cutoff = SystemTime::now()
            .checked_sub(self.retention)
            .unwrap_or(SystemTime::UNIX_EPOCH);
        let mut removed = 0;
        for dir in &self.dirs {
            removed += self.sweep(dir, cutoff, &ctx).await?;
        }
        Ok(Some(format!("{removed} old files removed")))
    }
}

pub struct ConnectionCheckTask {
    db: Arc<dyn DatabaseOps>,
}

impl ConnectionCheckTask {
    pub fn new(db: Arc<dyn DatabaseOps>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl TaskFunction for ConnectionCheckTask {
    async fn execute(&self, ctx: TaskContext) -> Result<Option<String>, TaskError> {
        if guarded(&ctx, self.db.test_connection()).await? {
            Ok(Some("database connection ok".into()))
        } else {
            Err(TaskError::failed("database connection lost"))
        }
    }
}

/// Builds the task function for each [`TaskKind`] from one shared set of
/// capabilities and directories.
#[derive(Clone)]
pub struct TaskFactory {
    db: Arc<dyn DatabaseOps>,
    reports: Arc<dyn ReportOps>,
    backup_dir: PathBuf,
    reports_dir: PathBuf,
    retention_days: u32,
}

impl TaskFactory {
    pub fn from_config(
        config: &TasksConfig,
        db: Arc<dyn DatabaseOps>,
        reports: Arc<dyn ReportOps>,
    ) -> Self {
        Self {
            db,
            reports,
            backup_dir: PathBuf::from(&config.backup_dir),
            reports_dir: PathBuf::from(&config.reports_dir),
            retention_days: config.retention_days,
        }
    }

    pub fn build(&self, kind: TaskKind) -> Arc<dyn TaskFunction> {
        match kind {
            TaskKind::Backup => Arc::new(BackupTask::new(self.db.clone(), &self.backup_dir)),
            TaskKind::HealthReport => {
                Arc::new(HealthReportTask::new(self.reports.clone(), &self.reports_dir))
            }
            TaskKind::PerformanceReport => {
                Arc::new(PerformanceReportTask::new(self.reports.clone(), &self.reports_dir))
            }
            TaskKind::Optimize => Arc::new(OptimizeTask::new(self.db.clone())),
            TaskKind::Cleanup => Arc::new(CleanupTask::new(
                vec![self.backup_dir.clone(), self.reports_dir.clone()],
                self.retention_days,
            )),
            TaskKind::ConnectionCheck => Arc::new(ConnectionCheckTask::new(self.db.clone())),
        }
    }
}
