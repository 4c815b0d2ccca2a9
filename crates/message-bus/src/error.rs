use thiserror::Error;

/// Errors raised by bus clients.
#[derive(Debug, Error)]
pub enum BusError {
    /// The broker did not acknowledge a send.
    #[error("Failed to publish to {topic}: {reason}")]
    Publish { topic: String, reason: String },

    /// A consumer could not be created or subscribed.
    #[error("Failed to subscribe to {topic}: {reason}")]
    Subscribe { topic: String, reason: String },

    /// Committing or rewinding an offset failed.
    #[error("Offset commit failed: {0}")]
    Commit(String),

    /// Receiving from the broker failed.
    #[error("Receive failed: {0}")]
    Receive(String),
}

/// Result type for bus operations.
pub type Result<T> = std::result::Result<T, BusError>;

/// Outcome of a handler invocation, as seen by the consumer runtime.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum HandlerError {
    /// May succeed if retried (storage, cache, gateway timeouts).
    #[error("transient: {0}")]
    Transient(String),

    /// Will never succeed; dead-letter without retrying.
    #[error("fatal: {0}")]
    Fatal(String),
}

impl HandlerError {
    pub fn transient(message: impl Into<String>) -> Self {
        HandlerError::Transient(message.into())
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        HandlerError::Fatal(message.into())
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, HandlerError::Transient(_))
    }
}
