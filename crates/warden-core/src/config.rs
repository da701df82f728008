use chrono::Weekday;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::types::{Comparison, ScheduleSpec, Severity, TaskKind, Threshold};

pub const DEFAULT_TICK_SECS: u64 = 2;
pub const DEFAULT_WORKERS: usize = 6; // one slot per default task
pub const DEFAULT_FAILURE_CEILING: u32 = 5;
pub const DEFAULT_MONITOR_INTERVAL_SECS: u64 = 300;
pub const DEFAULT_HYSTERESIS_RATIO: f64 = 0.10;
pub const DEFAULT_HISTORY_CAPACITY: usize = 1000;

/// Top-level config (warden.toml + WARDEN_* env overrides).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WardenConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub notify: NotifyConfig,
    #[serde(default)]
    pub tasks: TasksConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite file holding task and alert state between restarts.
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_tick_secs")]
    pub tick_secs: u64,
    /// Maximum number of task functions running at once.
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Consecutive failures after which a task is disabled.
    #[serde(default = "default_failure_ceiling")]
    pub failure_ceiling: u32,
    #[serde(default = "default_task_timeout_secs")]
    pub task_timeout_secs: u64,
    /// How long shutdown waits for in-flight runs before abandoning them.
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
    /// How long a cancelled run may take to observe its cancellation signal.
    #[serde(default = "default_cancel_grace_secs")]
    pub cancel_grace_secs: u64,
    /// A process owning the state database that has not renewed its lease
    /// for this long is considered dead.
    #[serde(default = "default_lease_ttl_secs")]
    pub lease_ttl_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_secs: DEFAULT_TICK_SECS,
            workers: DEFAULT_WORKERS,
            failure_ceiling: DEFAULT_FAILURE_CEILING,
            task_timeout_secs: default_task_timeout_secs(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
            cancel_grace_secs: default_cancel_grace_secs(),
            lease_ttl_secs: default_lease_ttl_secs(),
        }
    }
}

/// A metric the monitor samples each tick, and the shell command producing it.
///
/// The last line the command prints on stdout must be a number.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricSource {
    pub name: String,
    pub command: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    #[serde(default = "bool_true")]
    pub enabled: bool,
    #[serde(default = "default_monitor_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_sample_timeout_secs")]
    pub sample_timeout_secs: u64,
    /// Fraction of a boundary's magnitude a value must recede by before an
    /// alert resolves.
    #[serde(default = "default_hysteresis_ratio")]
    pub hysteresis_ratio: f64,
    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,
    #[serde(default)]
    pub metrics: Vec<MetricSource>,
    #[serde(default = "default_thresholds")]
    pub thresholds: Vec<Threshold>,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: DEFAULT_MONITOR_INTERVAL_SECS,
            sample_timeout_secs: default_sample_timeout_secs(),
            hysteresis_ratio: DEFAULT_HYSTERESIS_RATIO,
            history_capacity: DEFAULT_HISTORY_CAPACITY,
            metrics: Vec::new(),
            thresholds: default_thresholds(),
        }
    }
}

/// An outbound webhook notification target.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookTarget {
    /// Channel name used in logs, e.g. "ops-slack".
    pub name: String,
    pub url: String,
    /// When set, the body is signed with HMAC-SHA256.
    pub secret: Option<String>,
    #[serde(default = "default_webhook_timeout_secs")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifyConfig {
    /// Always log alert events through tracing.
    #[serde(default = "bool_true")]
    pub log: bool,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Per-channel queue depth; events beyond it are dropped with a warning.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default)]
    pub webhooks: Vec<WebhookTarget>,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            log: true,
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            queue_capacity: default_queue_capacity(),
            webhooks: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupCadence {
    Daily,
    Weekly,
}

/// Shell commands backing the database and report capabilities.
///
/// `{path}` in a command is replaced by the output file path.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskCommands {
    pub backup: Option<String>,
    pub optimize: Option<String>,
    pub health_check: Option<String>,
    pub health_report: Option<String>,
    pub performance_report: Option<String>,
}

/// One entry of the task table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobConfig {
    pub id: String,
    pub name: String,
    pub kind: TaskKind,
    pub schedule: ScheduleSpec,
}

impl JobConfig {
    pub fn new(id: &str, name: &str, kind: TaskKind, schedule: ScheduleSpec) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            kind,
            schedule,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TasksConfig {
    #[serde(default = "bool_true")]
    pub reports_enabled: bool,
    #[serde(default = "bool_true")]
    pub backup_enabled: bool,
    #[serde(default = "default_backup_cadence")]
    pub backup_schedule: BackupCadence,
    #[serde(default = "default_backup_dir")]
    pub backup_dir: String,
    #[serde(default = "default_reports_dir")]
    pub reports_dir: String,
    /// Backups and reports older than this are removed by the cleanup task.
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
    #[serde(default)]
    pub commands: TaskCommands,
    /// Replaces the built-in task table when present.
    pub jobs: Option<Vec<JobConfig>>,
}

impl Default for TasksConfig {
    fn default() -> Self {
        Self {
            reports_enabled: true,
            backup_enabled: true,
            backup_schedule: BackupCadence::Daily,
            backup_dir: default_backup_dir(),
            reports_dir: default_reports_dir(),
            retention_days: default_retention_days(),
            commands: TaskCommands::default(),
            jobs: None,
        }
    }
}

impl TasksConfig {
    /// The task table in effect: the configured `jobs`, or the built-in
    /// defaults shaped by the `reports_enabled` / `backup_*` switches.
    pub fn effective_jobs(&self) -> Vec<JobConfig> {
        if let Some(jobs) = &self.jobs {
            return jobs.clone();
        }

        let mut jobs = Vec::new();
        if self.reports_enabled {
            jobs.push(JobConfig::new(
                "daily_health_report",
                "Daily health report",
                TaskKind::HealthReport,
                ScheduleSpec::Daily { hour: 8, minute: 0 },
            ));
            jobs.push(JobConfig::new(
                "weekly_performance_report",
                "Weekly performance report",
                TaskKind::PerformanceReport,
                ScheduleSpec::Weekly {
                    day: Weekday::Mon,
                    hour: 8,
                    minute: 0,
                },
            ));
        }
        if self.backup_enabled {
            jobs.push(match self.backup_schedule {
                BackupCadence::Daily => JobConfig::new(
                    "daily_backup",
                    "Daily backup",
                    TaskKind::Backup,
                    ScheduleSpec::Daily { hour: 2, minute: 0 },
                ),
                BackupCadence::Weekly => JobConfig::new(
                    "weekly_backup",
                    "Weekly backup",
                    TaskKind::Backup,
                    ScheduleSpec::Weekly {
                        day: Weekday::Sun,
                        hour: 2,
                        minute: 0,
                    },
                ),
            });
        }
        jobs.push(JobConfig::new(
            "weekly_optimization",
            "Weekly table optimization",
            TaskKind::Optimize,
            ScheduleSpec::Weekly {
                day: Weekday::Sun,
                hour: 4,
                minute: 0,
            },
        ));
        jobs.push(JobConfig::new(
            "cleanup_old_files",
            "Old file cleanup",
            TaskKind::Cleanup,
            ScheduleSpec::Daily { hour: 3, minute: 0 },
        ));
        jobs.push(JobConfig::new(
            "connection_check",
            "Database connection check",
            TaskKind::ConnectionCheck,
            ScheduleSpec::Interval { every_secs: 300 },
        ));
        jobs
    }
}

/// Built-in severity table.
pub fn default_thresholds() -> Vec<Threshold> {
    let mut table = vec![
        Threshold::new("cpu_usage", Comparison::Ge, 80.0, Severity::High),
        Threshold::new("cpu_usage", Comparison::Ge, 95.0, Severity::Critical),
        Threshold::new("memory_usage", Comparison::Ge, 85.0, Severity::High),
        Threshold::new("memory_usage", Comparison::Ge, 95.0, Severity::Critical),
        Threshold::new("disk_usage", Comparison::Ge, 90.0, Severity::High),
        Threshold::new("disk_usage", Comparison::Ge, 97.0, Severity::Critical),
    ];
    table.extend(Threshold::banded("connection_count", 100.0));
    table.extend(Threshold::banded("slow_queries_count", 10.0));
    table
}

fn bool_true() -> bool {
    true
}
fn default_tick_secs() -> u64 {
    DEFAULT_TICK_SECS
}
fn default_workers() -> usize {
    DEFAULT_WORKERS
}
fn default_failure_ceiling() -> u32 {
    DEFAULT_FAILURE_CEILING
}
fn default_task_timeout_secs() -> u64 {
    3600
}
fn default_shutdown_grace_secs() -> u64 {
    30
}
fn default_cancel_grace_secs() -> u64 {
    5
}
fn default_lease_ttl_secs() -> u64 {
    30
}
fn default_monitor_interval_secs() -> u64 {
    DEFAULT_MONITOR_INTERVAL_SECS
}
fn default_sample_timeout_secs() -> u64 {
    30
}
fn default_hysteresis_ratio() -> f64 {
    DEFAULT_HYSTERESIS_RATIO
}
fn default_history_capacity() -> usize {
    DEFAULT_HISTORY_CAPACITY
}
fn default_webhook_timeout_secs() -> u64 {
    10
}
fn default_max_attempts() -> u32 {
    5
}
fn default_base_delay_ms() -> u64 {
    1_000
}
fn default_max_delay_ms() -> u64 {
    60_000
}
fn default_queue_capacity() -> usize {
    256
}
fn default_backup_cadence() -> BackupCadence {
    BackupCadence::Daily
}
fn default_backup_dir() -> String {
    "backups".to_string()
}
fn default_reports_dir() -> String {
    "reports".to_string()
}
fn default_retention_days() -> u32 {
    30
}
fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.warden/warden.db", home)
}

impl WardenConfig {
    /// Load config from a TOML file with WARDEN_* env var overrides.
    ///
    /// Nested keys use a double underscore: `WARDEN_SCHEDULER__TICK_SECS=5`.
    /// A missing file is not an error; every section has defaults.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        let config: WardenConfig = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("WARDEN_").split("__"))
            .extract()
            .map_err(|e| crate::error::WardenError::Config {
                path: path.clone(),
                reason: e.to_string(),
            })?;

        Ok(config)
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.warden/warden.toml", home)
}
