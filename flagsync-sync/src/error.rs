//! Error types for the sync engine.

use thiserror::Error;

/// Errors that can occur in the sync engine.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Error from the HTTP API layer.
    #[error("API error: {0}")]
    Api(#[from] flagsync_api::ApiError),

    /// Error from the storage layer.
    #[error("storage error: {0}")]
    Storage(#[from] flagsync_storage::StorageError),

    /// Error establishing or reading the streaming connection.
    #[error("streaming error: {0}")]
    Streaming(String),

    /// The manager loop is no longer running.
    #[error("channel closed")]
    ChannelClosed,
}

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;
