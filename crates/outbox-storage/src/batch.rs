//! Unit of work combining primary mutations with their outbox events.
//!
//! The mutation-detection side stages entity writes and outbox appends into
//! one [`MutationBatch`]; [`Storage::commit_batch`] persists all of them in a
//! single RocksDB `WriteBatch`, so an outbox event exists if and only if its
//! mutation does.
//!
//! Tracked appends leave the routing descriptor open until commit. The
//! entity's recorded route history is read and advanced under the storage
//! write lock, so two writers racing on one entity cannot both start from the
//! same history and lose a route.
//!
//! [`Storage::commit_batch`]: crate::Storage::commit_batch

use outbox_types::{DocumentRoute, EntityKey, MutationType, NewOutboxEvent};

/// How a tracked append changes the entity's route history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteUpdate {
    /// The entity now lives under this route
    MoveTo(DocumentRoute),
    /// Carry the recorded routes unchanged (deletes)
    Keep,
}

/// A staged write.
#[derive(Debug, Clone)]
pub(crate) enum BatchOp {
    PutEntity { key: EntityKey, value: Vec<u8> },
    DeleteEntity { key: EntityKey },
    Append(NewOutboxEvent),
    AppendTracked {
        key: EntityKey,
        mutation: MutationType,
        update: RouteUpdate,
    },
}

/// Staged mutations and outbox appends, committed atomically.
#[derive(Debug, Default, Clone)]
pub struct MutationBatch {
    pub(crate) ops: Vec<BatchOp>,
}

impl MutationBatch {
    /// Create an empty batch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Stage a primary entity write.
    pub fn put_entity(&mut self, key: EntityKey, value: Vec<u8>) -> &mut Self {
        self.ops.push(BatchOp::PutEntity { key, value });
        self
    }

    /// Stage a primary entity removal.
    pub fn delete_entity(&mut self, key: EntityKey) -> &mut Self {
        self.ops.push(BatchOp::DeleteEntity { key });
        self
    }

    /// Stage an outbox append with a fixed descriptor.
    pub fn append_event(&mut self, event: NewOutboxEvent) -> &mut Self {
        self.ops.push(BatchOp::Append(event));
        self
    }

    /// Stage an outbox append whose descriptor is derived at commit from the
    /// entity's recorded route history, which is then updated to match.
    pub fn append_tracked(
        &mut self,
        key: EntityKey,
        mutation: MutationType,
        update: RouteUpdate,
    ) -> &mut Self {
        self.ops.push(BatchOp::AppendTracked {
            key,
            mutation,
            update,
        });
        self
    }

    /// Number of outbox events staged.
    pub fn appended_count(&self) -> usize {
        self.ops
            .iter()
            .filter(|op| matches!(op, BatchOp::Append(_) | BatchOp::AppendTracked { .. }))
            .count()
    }

    /// Total staged operations.
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Whether nothing is staged.
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}
