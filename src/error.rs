//! Error types for the subscription store.

use thiserror::Error;

/// Main error type for store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Store is locked by another process")]
    Locked,

    #[error("Invalid store format: {0}")]
    InvalidFormat(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Schema version mismatch: expected {expected}, found {found}")]
    SchemaVersionMismatch { expected: i64, found: i64 },

    #[error("Subscription set version not found: {0}")]
    VersionNotFound(i64),

    #[error("Transaction is not in the writing stage")]
    WrongTransactionStage,

    #[error("Illegal state transition: {0}")]
    IllegalStateTransition(String),

    #[error("Subscription set is no longer attached to a store")]
    StoreGone,

    #[error("Notification was dropped before it resolved")]
    BrokenPromise,

    #[error("{0}")]
    Runtime(String),
}

impl From<rmp_serde::encode::Error> for StoreError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for StoreError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        StoreError::Deserialization(e.to_string())
    }
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
