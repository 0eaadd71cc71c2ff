//! Errors raised by the outbox domain types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum OutboxError {
    /// Settings failed to load or carry an out-of-range value.
    #[error("invalid settings: {0}")]
    Config(String),

    #[error("json: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A route record was written by a newer schema than this build reads.
    #[error("route record schema version {0} is not supported")]
    UnsupportedVersion(u64),

    /// Caller passed an entity key, state or routing field that cannot be used.
    #[error("invalid input: {0}")]
    InvalidInput(String),
}
