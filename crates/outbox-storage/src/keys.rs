//! Key encoding and decoding for storage layer.
//!
//! Outbox keys are `outbox:{id:020}`: zero-padding makes lexicographic
//! RocksDB order equal to identifier order, so a forward scan returns events
//! oldest first.

use outbox_types::{EntityKey, EventId};

use crate::error::StorageError;

/// Key for outbox rows
/// Format: outbox:{sequence:020}
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutboxKey {
    /// Monotonic sequence number
    pub sequence: u64,
}

impl OutboxKey {
    /// Create a new outbox key with given sequence
    pub fn new(sequence: u64) -> Self {
        Self { sequence }
    }

    /// Key for an event id
    pub fn for_event(id: EventId) -> Self {
        Self { sequence: id.0 }
    }

    /// Event id encoded by this key
    pub fn event_id(&self) -> EventId {
        EventId(self.sequence)
    }

    /// Encode key to bytes
    pub fn to_bytes(&self) -> Vec<u8> {
        format!("outbox:{:020}", self.sequence).into_bytes()
    }

    /// Decode key from bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, StorageError> {
        let s = std::str::from_utf8(bytes)
            .map_err(|e| StorageError::Key(format!("Invalid UTF-8: {}", e)))?;

        let parts: Vec<&str> = s.split(':').collect();
        if parts.len() != 2 || parts[0] != "outbox" {
            return Err(StorageError::Key(format!("Invalid outbox key format: {}", s)));
        }

        let sequence: u64 = parts[1]
            .parse()
            .map_err(|e| StorageError::Key(format!("Invalid sequence: {}", e)))?;

        Ok(Self { sequence })
    }
}

/// Key for primary entity rows and their route history
/// Format: entity:{entity_type}:{entity_id}
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityRowKey {
    pub entity_type: String,
    pub entity_id: String,
}

impl EntityRowKey {
    pub fn new(entity_type: impl Into<String>, entity_id: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        format!("entity:{}:{}", self.entity_type, self.entity_id).into_bytes()
    }
}

impl From<&EntityKey> for EntityRowKey {
    fn from(key: &EntityKey) -> Self {
        Self::new(&key.entity_type, &key.entity_id)
    }
}

/// Key for checkpoint entries
/// Format: checkpoint:{job_name}
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointKey {
    /// Job name (e.g., "dispatcher-worker-1")
    pub job_name: String,
}

impl CheckpointKey {
    pub fn new(job_name: impl Into<String>) -> Self {
        Self {
            job_name: job_name.into(),
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        format!("checkpoint:{}", self.job_name).into_bytes()
    }
}

/// Meta key holding the next outbox sequence to assign.
pub const NEXT_SEQUENCE_KEY: &[u8] = b"meta:next_sequence";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outbox_key_roundtrip() {
        let key = OutboxKey::new(12345);
        let bytes = key.to_bytes();
        let decoded = OutboxKey::from_bytes(&bytes).unwrap();
        assert_eq!(key.sequence, decoded.sequence);
        assert_eq!(decoded.event_id(), EventId(12345));
    }

    #[test]
    fn test_outbox_key_lexicographic_order() {
        let key1 = OutboxKey::new(9);
        let key2 = OutboxKey::new(10);
        assert!(key1.to_bytes() < key2.to_bytes());
    }

    #[test]
    fn test_outbox_key_rejects_garbage() {
        assert!(OutboxKey::from_bytes(b"evt:1").is_err());
        assert!(OutboxKey::from_bytes(b"outbox:abc").is_err());
    }

    #[test]
    fn test_entity_row_key_format() {
        let key = EntityRowKey::new("Book", "42");
        assert_eq!(key.to_bytes(), b"entity:Book:42".to_vec());
    }
}
