use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use warden_core::types::ScheduleSpec;

/// Lifecycle state of a task slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Waiting for its next_run_at.
    Idle,
    /// An execution is in flight.
    Running,
    /// Stopped after too many consecutive failures, or by an operator.
    Disabled,
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskState::Idle => "idle",
            TaskState::Running => "running",
            TaskState::Disabled => "disabled",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for TaskState {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "idle" => Ok(TaskState::Idle),
            "running" => Ok(TaskState::Running),
            "disabled" => Ok(TaskState::Disabled),
            other => Err(format!("unknown task state: {other}")),
        }
    }
}

/// Why an execution started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunTrigger {
    /// The schedule came due on time.
    Scheduled,
    /// The schedule came due long ago (e.g. the process was down).
    CatchUp,
    /// An operator forced the run; the schedule is left untouched.
    Manual,
}

impl std::fmt::Display for RunTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunTrigger::Scheduled => "scheduled",
            RunTrigger::CatchUp => "catch_up",
            RunTrigger::Manual => "manual",
        };
        write!(f, "{s}")
    }
}

/// Why an execution counts as failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum TaskFailure {
    /// The task function reported failure.
    #[error("{0}")]
    Execution(String),
    /// The run exceeded its time budget and was cancelled.
    #[error("timed out after {secs}s")]
    Timeout { secs: u64 },
    /// The task function panicked.
    #[error("panicked: {0}")]
    Panicked(String),
    /// The run was abandoned at shutdown.
    #[error("abandoned at shutdown")]
    Shutdown,
}

/// Result of one execution, as recorded on the task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Succeeded { message: Option<String> },
    Failed(TaskFailure),
}

impl RunOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, RunOutcome::Succeeded { .. })
    }
}

/// Static description of a task, as registered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskDefinition {
    pub id: String,
    pub name: String,
    pub schedule: ScheduleSpec,
}

impl TaskDefinition {
    pub fn new(id: impl Into<String>, name: impl Into<String>, schedule: ScheduleSpec) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            schedule,
        }
    }
}

/// Point-in-time view of a task's runtime state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSnapshot {
    pub id: String,
    pub name: String,
    pub schedule: ScheduleSpec,
    pub state: TaskState,
    pub last_run_at: Option<DateTime<Utc>>,
    pub next_run_at: DateTime<Utc>,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
    /// Total number of finished runs, successful or not.
    pub run_count: u64,
    /// An operator asked for a disable while a run was in flight.
    pub disable_requested: bool,
}

/// The subset of a task's state carried across restarts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedTask {
    pub id: String,
    pub state: TaskState,
    pub next_run_at: DateTime<Utc>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
    pub run_count: u64,
    /// The schedule `next_run_at` was computed from. `None` for rows saved
    /// before schedules were recorded.
    #[serde(default)]
    pub schedule: Option<ScheduleSpec>,
}

impl From<&TaskSnapshot> for PersistedTask {
    fn from(s: &TaskSnapshot) -> Self {
        Self {
            id: s.id.clone(),
            state: s.state,
            next_run_at: s.next_run_at,
            last_run_at: s.last_run_at,
            consecutive_failures: s.consecutive_failures,
            last_error: s.last_error.clone(),
            run_count: s.run_count,
            schedule: Some(s.schedule.clone()),
        }
    }
}
