use thiserror::Error;

/// Errors that can occur within the monitoring subsystem.
///
/// Sampling failures are not errors here: they become a synthetic
/// connectivity alert and the loop carries on.
#[derive(Debug, Error)]
pub enum MonitorError {
    /// Underlying SQLite / rusqlite error.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Alert not found: {id}")]
    AlertNotFound { id: String },

    #[error("Alert already resolved: {id}")]
    AlertNotActive { id: String },
}

pub type Result<T> = std::result::Result<T, MonitorError>;

/// Why a metric could not be read this tick.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SamplingError {
    /// The source is down or unreachable (e.g. lost database connection).
    #[error("metric source unavailable: {0}")]
    Unavailable(String),

    #[error("sampling timed out after {ms}ms")]
    Timeout { ms: u64 },

    /// The source answered with something that is not a number.
    #[error("malformed metric value: {0}")]
    Malformed(String),
}
