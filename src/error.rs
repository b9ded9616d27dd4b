//! Error types for the outbox library.

use thiserror::Error;

/// Result type alias for outbox operations.
pub type OutboxResult<T> = Result<T, OutboxError>;

/// Errors that can occur during outbox operations.
#[derive(Error, Debug)]
pub enum OutboxError {
    /// Building an outbox record failed (identifier extraction or payload
    /// serialization). Must propagate to the host transaction so the
    /// business write rolls back with it.
    #[error("Outbox record creation failed: {0}")]
    Creation(String),

    /// Database operation failed
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Failed to publish an envelope to the message broker
    #[error("Publish failed: {0}")]
    Publish(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invalid relay configuration (e.g. an unparseable cron expression)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Generic error with context
    #[error("Outbox error: {0}")]
    Other(#[from] anyhow::Error),
}
