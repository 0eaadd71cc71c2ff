//! Error types for the indexing pipeline.

use outbox_storage::StorageError;
use outbox_types::OutboxError;
use thiserror::Error;

use crate::sink::SinkError;

/// Errors that can occur in the indexing pipeline
#[derive(Error, Debug)]
pub enum IndexingError {
    /// Storage operation failed
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Storage temporarily unreadable; the poll cycle is retried later
    #[error("Transient read error: {0}")]
    TransientRead(String),

    /// The sink rejected a batch
    #[error("Sink error: {0}")]
    Sink(#[from] SinkError),

    /// JSON encoding/decoding errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Checkpoint load/save issues
    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    /// Routing descriptor could not be resolved or is inconsistent
    #[error("Routing error: {0}")]
    Routing(String),
}

impl IndexingError {
    /// Whether the next poll cycle may succeed without intervention.
    pub fn is_transient(&self) -> bool {
        matches!(self, IndexingError::TransientRead(_) | IndexingError::Sink(_))
    }
}

impl From<serde_json::Error> for IndexingError {
    fn from(err: serde_json::Error) -> Self {
        IndexingError::Serialization(err.to_string())
    }
}

impl From<OutboxError> for IndexingError {
    fn from(err: OutboxError) -> Self {
        match err {
            OutboxError::Serialization(e) => IndexingError::Serialization(e.to_string()),
            OutboxError::UnsupportedVersion(v) => {
                IndexingError::Serialization(format!("unsupported routes schema version {}", v))
            }
            other => IndexingError::Routing(other.to_string()),
        }
    }
}
