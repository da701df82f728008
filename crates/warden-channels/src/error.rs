use thiserror::Error;

/// Outcome of a failed delivery attempt, as reported by a channel.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeliveryError {
    /// Worth retrying: timeouts, connection resets, 5xx responses.
    #[error("transient delivery failure: {0}")]
    Transient(String),

    /// Retrying cannot help: rejected payload, bad credentials, 4xx responses.
    #[error("permanent delivery failure: {0}")]
    Permanent(String),
}

impl DeliveryError {
    pub fn is_transient(&self) -> bool {
        matches!(self, DeliveryError::Transient(_))
    }
}

/// Errors raised while building a channel adapter.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// The channel-specific configuration is invalid or missing.
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),
}

pub type Result<T> = std::result::Result<T, ChannelError>;
