use common::EnvelopeError;
use thiserror::Error;

/// Errors that can occur when writing or relaying outbox records.
#[derive(Debug, Error)]
pub enum OutboxError {
    /// A database error occurred.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// The record could not be turned into an envelope.
    #[error("Envelope error: {0}")]
    Envelope(#[from] EnvelopeError),

    /// A stored row holds a value this build cannot interpret.
    #[error("Corrupt outbox row {event_id}: {reason}")]
    Corrupt { event_id: String, reason: String },
}

/// Result type for outbox operations.
pub type Result<T> = std::result::Result<T, OutboxError>;
