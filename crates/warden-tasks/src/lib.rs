//! `warden-tasks`: the automated maintenance work the scheduler runs.
//!
//! Every variant implements [`warden_scheduler::TaskFunction`] and reaches the
//! database and report renderer only through [`DatabaseOps`] and [`ReportOps`].
//! [`TaskFactory`] maps a configured [`TaskKind`](warden_core::TaskKind) to
//! its variant.

pub mod error;
pub mod ops;
pub mod shell;
pub mod tasks;

pub use error::{OpsError, Result};
pub use ops::{DatabaseOps, ReportOps, TableResult};
pub use shell::ShellOps;
pub use tasks::{
    BackupTask, CleanupTask, ConnectionCheckTask, HealthReportTask, OptimizeTask,
    PerformanceReportTask, TaskFactory, PERFORMANCE_REPORT_DAYS,
};
