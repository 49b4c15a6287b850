//! Error model shared by the queue, the dead-letter store and the storage port.

use thiserror::Error;

use crate::id::RequestId;

/// Result type used by queue and dead-letter operations.
pub type QueueResult<T> = Result<T, QueueError>;

/// Distinguishable outcomes of a failed queue operation.
///
/// Soft "not found" outcomes are not errors: `remove`, `get` and `update`
/// report them through `bool`/`Option` return values instead.
#[derive(Debug, Error)]
pub enum QueueError {
    /// The collection has not been initialized (or has been disposed).
    #[error("queue is not initialized")]
    NotInitialized,

    /// The main queue already holds `max_size` requests.
    #[error("queue capacity exceeded (max {max_size} requests)")]
    CapacityExceeded { max_size: usize },

    /// A request with the same id is already queued.
    #[error("request already queued: {0}")]
    DuplicateId(RequestId),

    /// The snapshot write failed. The in-memory mutation has already been applied.
    #[error("failed to persist snapshot: {0}")]
    PersistenceFailure(#[from] StoreError),
}

impl QueueError {
    pub fn capacity_exceeded(max_size: usize) -> Self {
        Self::CapacityExceeded { max_size }
    }

    /// Whether the in-memory state was changed despite the error.
    pub fn is_persistence_failure(&self) -> bool {
        matches!(self, Self::PersistenceFailure(_))
    }
}

/// Failure of the external key-value store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The backend refused the operation (offline, quota, injected failure, ...).
    #[error("storage unavailable: {0}")]
    Unavailable(String),

    #[error("invalid storage key: {0}")]
    InvalidKey(String),
}

impl StoreError {
    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::Unavailable(msg.into())
    }
}
