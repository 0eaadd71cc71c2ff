//! Failures raised while reading or mutating the outbox tables.

use outbox_types::OutboxError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("rocksdb: {0}")]
    RocksDb(#[from] rocksdb::Error),

    /// The database was opened without one of the outbox column families.
    #[error("missing column family '{0}'")]
    ColumnFamilyNotFound(String),

    /// An outbox or route key did not decode to the expected layout.
    #[error("malformed key: {0}")]
    Key(String),

    /// A stored row could not be encoded or decoded.
    #[error("row encoding: {0}")]
    Encoding(String),

    /// An appended event carried a descriptor that repeats a route.
    #[error("route descriptor rejected for {0}")]
    InvalidRoutes(String),

    #[error("{0} not found")]
    NotFound(String),
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Encoding(err.to_string())
    }
}

// Versioned route records surface their decode failures as domain errors.
impl From<OutboxError> for StorageError {
    fn from(err: OutboxError) -> Self {
        StorageError::Encoding(err.to_string())
    }
}
