use thiserror::Error;

/// Errors surfaced by cache backends.
///
/// The bundled in-memory caches never produce these; the variants exist so
/// that pluggable backends (external key-value stores, IPC bridges) can
/// report faults through the same trait surface.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("backend error: {0}")]
    Backend(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type StorageResult<T> = Result<T, StorageError>;
