use thiserror::Error;

/// Failures of the database and report capabilities.
#[derive(Debug, Error)]
pub enum OpsError {
    /// No command is configured for this operation.
    #[error("{0} is not configured")]
    NotConfigured(&'static str),

    #[error("failed to launch `{command}`: {source}")]
    Launch {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("`{command}` exited with status {code}: {stderr}")]
    CommandFailed {
        command: String,
        code: i32,
        stderr: String,
    },

    #[error("unexpected output: {0}")]
    BadOutput(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, OpsError>;
