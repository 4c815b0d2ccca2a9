use thiserror::Error;

/// Errors raised by the stock ledger and the reservation map.
#[derive(Debug, Error)]
pub enum LedgerError {
    /// The counter holds less than the requested quantity. Business rejection.
    #[error("Insufficient stock for {key}: requested {requested}")]
    InsufficientStock { key: String, requested: u32 },

    /// No counter exists for the key. A configuration error, never retried.
    #[error("Stock key not found: {0}")]
    KeyNotFound(String),

    /// Quantities must be positive.
    #[error("Invalid quantity {0}")]
    InvalidQuantity(u32),

    /// The cache could not be reached or rejected the command.
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// A stored mapping could not be (de)serialized.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl LedgerError {
    /// Returns true for failures that may succeed on retry.
    pub fn is_transient(&self) -> bool {
        matches!(self, LedgerError::Redis(_))
    }
}

/// Result type for ledger operations.
pub type Result<T> = std::result::Result<T, LedgerError>;
