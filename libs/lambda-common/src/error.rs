//! Error types for the queue, the record store and the submission path.

use thiserror::Error;
use uuid::Uuid;

use crate::types::TransitionError;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue backend unreachable: {0}")]
    Backend(#[from] redis::RedisError),

    #[error("malformed queue entry {id}: {source}")]
    Corrupt {
        id: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("queue entry {0} not found")]
    NotFound(Uuid),

    #[error("serialize queue entry: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("job store unreachable: {0}")]
    Backend(#[from] redis::RedisError),

    #[error("job {0} not found")]
    NotFound(Uuid),

    #[error("malformed job record {id}: {source}")]
    Corrupt {
        id: Uuid,
        #[source]
        source: serde_json::Error,
    },

    #[error("job {0} changed concurrently")]
    Conflict(Uuid),

    #[error("job {id}: {source}")]
    Transition {
        id: Uuid,
        #[source]
        source: TransitionError,
    },

    #[error("serialize job record: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("Code cannot be empty")]
    Empty,

    #[error("Code is too long (max {max} characters, got {len})")]
    TooLarge { len: usize, max: usize },

    #[error("Code contains potentially dangerous operations")]
    Dangerous { pattern: String },
}

#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("invalid submission: {0}")]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("job {job_id} created but not queued: {source}")]
    Queue {
        job_id: Uuid,
        #[source]
        source: QueueError,
    },
}

/// Result type for record store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Result type for queue operations.
pub type QueueResult<T> = std::result::Result<T, QueueError>;
