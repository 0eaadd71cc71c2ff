//! Storage layer for the outbox indexing pipeline.
//!
//! Provides RocksDB-backed storage with:
//! - Column family isolation for entity rows, route history and outbox rows
//! - Zero-padded outbox keys so forward scans return events oldest first
//! - Atomic unit-of-work commits via WriteBatch (mutation + outbox append)
//! - Lease-guarded claim, commit and retry updates
//! - Checkpoints for dispatcher progress

pub mod batch;
pub mod claims;
pub mod column_families;
pub mod db;
pub mod error;
pub mod keys;

pub use batch::{MutationBatch, RouteUpdate};
pub use claims::{select_in_order, ClaimRequest, OutboxLag, RetryUpdate};
pub use db::{Storage, StorageStats};
pub use error::StorageError;
pub use keys::{CheckpointKey, EntityRowKey, OutboxKey};
