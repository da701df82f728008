use thiserror::Error;

#[derive(Debug, Error)]
pub enum WardenError {
    /// The config file or a `WARDEN_*` override could not be parsed.
    #[error("invalid configuration ({path}): {reason}")]
    Config { path: String, reason: String },
}

pub type Result<T> = std::result::Result<T, WardenError>;
