use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use crate::types::RunTrigger;

/// Error returned by a task function. Recorded on the task, never fatal to
/// the scheduler.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("{0}")]
    Failed(String),

    /// The function noticed its cancellation signal and stopped early.
    #[error("cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TaskError {
    pub fn failed(msg: impl Into<String>) -> Self {
        TaskError::Failed(msg.into())
    }
}

/// Everything a task function gets to know about the run it is serving.
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub task_id: String,
    /// UUIDv7, for correlating log lines of a single run.
    pub run_id: String,
    pub trigger: RunTrigger,
    /// The due time that caused this run (the admission time for manual runs).
    pub scheduled_for: DateTime<Utc>,
    /// When the run actually began; later than `scheduled_for` for catch-up runs.
    pub started_at: DateTime<Utc>,
    /// Fires on timeout or forced shutdown. Long-running functions must
    /// watch it and return promptly.
    pub cancel: CancellationToken,
}

/// The executable capability behind every task.
///
/// Implementations must be `Send + Sync`: one instance serves every run of
/// its task, and runs happen on the executor's worker tasks.
#[async_trait]
pub trait TaskFunction: Send + Sync {
    /// Perform the work. `Ok` carries an optional human-readable message.
    async fn execute(&self, ctx: TaskContext) -> Result<Option<String>, TaskError>;
}
