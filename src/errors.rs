use thiserror::Error;

/// Typed error hierarchy for concierge.
///
/// Use at module boundaries (provider calls, tool dispatch, store access).
/// Internal/leaf functions can continue using `anyhow::Result`; the `Internal`
/// variant allows seamless conversion via the `?` operator.
#[derive(Debug, Error)]
pub enum ConciergeError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Provider error: {message}")]
    Provider { message: String, retryable: bool },

    #[error("Rate limit exceeded")]
    RateLimit { retry_after: Option<u64> },

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Tool error: {tool}: {message}")]
    Tool { tool: String, message: String },

    #[error("Store error: {0}")]
    Store(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

/// Convenience alias for results using ConciergeError.
pub type ConciergeResult<T> = std::result::Result<T, ConciergeError>;

impl ConciergeError {
    /// Whether this error is retryable (rate limits, transient provider errors).
    pub fn is_retryable(&self) -> bool {
        match self {
            ConciergeError::RateLimit { .. } => true,
            ConciergeError::Provider { retryable, .. } => *retryable,
            _ => false,
        }
    }
}
