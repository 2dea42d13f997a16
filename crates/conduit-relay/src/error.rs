//! Error types for the relay layer.

use conduit_core::BusError;
use thiserror::Error;

/// Failures raised by outbox, inbox, and drainer operations.
#[derive(Debug, Error)]
pub enum RelayError {
    /// Underlying storage failed.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Payload or envelope encoding failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The bus rejected an operation.
    #[error(transparent)]
    Bus(#[from] BusError),

    /// An outbox row referenced by id does not exist.
    #[error("outbox entry {0} not found")]
    EntryNotFound(i64),

    /// A stored row failed to decode.
    #[error("corrupt relay row: {0}")]
    Corrupt(String),
}

/// Convenience alias for relay results.
pub type Result<T> = std::result::Result<T, RelayError>;
