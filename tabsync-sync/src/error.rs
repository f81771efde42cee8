//! Error types for the sync layer.

use tabsync_types::ConflictId;
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur in sync operations.
#[derive(Debug, Error)]
pub enum SyncError {
    /// The remote key-value store failed a get or set.
    #[error("store error: {0}")]
    Store(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The identity provider failed.
    #[error("identity error: {0}")]
    Identity(String),

    /// Operation requires connectivity.
    #[error("offline")]
    Offline,

    /// No conflict with this id exists.
    #[error("conflict not found: {0}")]
    ConflictNotFound(ConflictId),

    /// The conflict was already resolved or ignored.
    #[error("conflict already settled: {0}")]
    ConflictAlreadySettled(ConflictId),

    /// Manual resolution was requested without a value.
    #[error("manual resolution requires a custom value")]
    MissingCustomValue,
}
