use thiserror::Error;

/// Errors that can occur within the scheduler subsystem.
///
/// Task failures are not errors here: they are recorded on the task as a
/// [`TaskFailure`](crate::types::TaskFailure) and never propagate to callers.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Underlying SQLite / rusqlite error.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// The provided schedule definition is invalid.
    #[error("Invalid schedule: {0}")]
    InvalidSchedule(String),

    /// No task with the given ID is registered.
    #[error("Task not found: {id}")]
    TaskNotFound { id: String },

    /// A task with the same ID is already registered.
    #[error("Task already registered: {id}")]
    DuplicateTask { id: String },

    /// The task has an execution in flight; runs never overlap.
    #[error("Task already running: {id}")]
    AlreadyRunning { id: String },

    /// The task was disabled and must be re-enabled first.
    #[error("Task disabled: {id}")]
    TaskDisabled { id: String },

    /// Another live process owns the task state database.
    #[error("Task state is owned by another warden process (pid {pid}); stop it first")]
    LeaseHeld { owner: String, pid: u32 },

    /// The executor has stopped admitting work.
    #[error("Scheduler is shutting down")]
    ShuttingDown,
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
