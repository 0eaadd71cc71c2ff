//! Per-worker dispatch checkpoints.
//!
//! The outbox itself is the source of truth for what is left to do; a
//! checkpoint only records how far a worker has got, for operators and for
//! resuming counters after a restart.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use outbox_types::{EventId, WorkerId};

use crate::error::IndexingError;

/// Progress of one dispatcher worker.
///
/// Persisted to storage under [`DispatchCheckpoint::checkpoint_key`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchCheckpoint {
    /// Worker this checkpoint belongs to
    pub worker: WorkerId,

    /// Highest event id this worker has committed
    pub last_committed: Option<EventId>,

    /// Timestamp of last commit (milliseconds since epoch for JSON compatibility)
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub last_processed_time: DateTime<Utc>,

    /// Total events committed
    pub processed_count: u64,

    /// Total events moved to `FAILED`
    #[serde(default)]
    pub failed_count: u64,

    /// When this checkpoint was first created (milliseconds since epoch)
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
}

impl DispatchCheckpoint {
    /// Create a new checkpoint for the given worker
    pub fn new(worker: WorkerId) -> Self {
        let now = Utc::now();
        Self {
            worker,
            last_committed: None,
            last_processed_time: now,
            processed_count: 0,
            failed_count: 0,
            created_at: now,
        }
    }

    /// Storage key for a worker's checkpoint
    pub fn key_for(worker: &WorkerId) -> String {
        format!("dispatch_{}", worker)
    }

    /// Get the checkpoint key for storage
    pub fn checkpoint_key(&self) -> String {
        Self::key_for(&self.worker)
    }

    /// Update checkpoint after committing a batch
    pub fn record_commit(&mut self, last_event: Option<EventId>, events: u64) {
        if let Some(id) = last_event {
            self.last_committed = Some(self.last_committed.map_or(id, |prev| prev.max(id)));
        }
        self.last_processed_time = Utc::now();
        self.processed_count += events;
    }

    /// Count events parked as failed
    pub fn record_failed(&mut self, events: u64) {
        self.failed_count += events;
    }

    /// Serialize to JSON bytes for storage
    pub fn to_bytes(&self) -> Result<Vec<u8>, IndexingError> {
        serde_json::to_vec(self).map_err(IndexingError::from)
    }

    /// Deserialize from JSON bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, IndexingError> {
        serde_json::from_slice(bytes)
            .map_err(|e| IndexingError::Checkpoint(format!("corrupt checkpoint: {}", e)))
    }
}
