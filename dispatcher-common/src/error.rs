use thiserror::Error;

/// Errors raised by a work store while dequeueing, stamping, or resolving a record.
/// These wrap the underlying `sqlx` failure with enough context to log usefully.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("connection failed: {error}")]
    Connection { error: sqlx::Error },
    #[error("{command} query failed: {error}")]
    Query { command: String, error: sqlx::Error },
    #[error("could not serialize payload: {error}")]
    Serialization { error: serde_json::Error },
    #[error("cancel handle's transaction was already closed")]
    TransactionAlreadyClosed,
}

impl StoreError {
    pub fn query(command: &str, error: sqlx::Error) -> Self {
        StoreError::Query {
            command: command.to_owned(),
            error,
        }
    }
}

/// A transformer turned a `Record` into a job payload and failed. The record it was
/// given is returned so the caller can mark it `failed` without re-fetching it.
#[derive(Error, Debug)]
#[error("failed to transform record: {message}")]
pub struct TransformError {
    pub message: String,
}

impl TransformError {
    pub fn new(message: impl Into<String>) -> Self {
        TransformError {
            message: message.into(),
        }
    }
}

/// Error surfaced by `QueueStore::dequeue`: either the store itself failed, or it
/// succeeded but the queue's transformer rejected the record.
#[derive(Error, Debug)]
pub enum DequeueError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Transform(#[from] TransformError),
}
