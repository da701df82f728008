//! Capabilities the tasks act through. The daemon supplies a command-driven
//! implementation ([`ShellOps`](crate::shell::ShellOps)); tests supply fakes.

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::error::Result;

/// Outcome of optimizing one table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableResult {
    pub table: String,
    pub ok: bool,
}

#[async_trait]
pub trait DatabaseOps: Send + Sync {
    /// Write a full dump to `dest`.
    async fn backup(&self, dest: &Path) -> Result<()>;

    async fn optimize_tables(&self) -> Result<Vec<TableResult>>;

    /// `Ok(false)` means the database answered that it is not reachable;
    /// `Err` means the check itself could not run.
    async fn test_connection(&self) -> Result<bool>;
}

#[async_trait]
pub trait ReportOps: Send + Sync {
    /// Render a health report into `out_dir`; returns the file written.
    async fn health_report(&self, out_dir: &Path) -> Result<PathBuf>;

    /// Render a performance report covering the last `days` days.
    async fn performance_report(&self, out_dir: &Path, days: u32) -> Result<PathBuf>;
}
