//! Append side of the outbox.
//!
//! [`OutboxWriter`] is what the mutation-detection layer calls. It stages the
//! entity write and a tracked outbox append in one [`MutationBatch`]. The
//! strategy picks the route while staging; storage merges it into the
//! entity's route history at commit, so the entity row, the history and the
//! event land in the same RocksDB write or none do.

use std::sync::Arc;

use serde_json::Value;
use tracing::debug;

use outbox_storage::{MutationBatch, RouteUpdate, Storage};
use outbox_types::{EntityKey, EventId, MutationType};

use crate::error::IndexingError;
use crate::routing::RoutingResolver;

/// Stages primary mutations together with their outbox events.
pub struct OutboxWriter {
    storage: Arc<Storage>,
    resolver: RoutingResolver,
}

impl OutboxWriter {
    pub fn new(storage: Arc<Storage>, resolver: RoutingResolver) -> Self {
        Self { storage, resolver }
    }

    /// Start a unit of work.
    pub fn begin(&self) -> MutationBatch {
        self.storage.begin()
    }

    /// Commit a unit of work. Returns the ids of the appended events.
    pub fn commit(&self, batch: MutationBatch) -> Result<Vec<EventId>, IndexingError> {
        Ok(self.storage.commit_batch(batch)?)
    }

    fn stage_write(
        &self,
        batch: &mut MutationBatch,
        entity_type: &str,
        entity_id: &str,
        state: &Value,
        mutation: MutationType,
    ) -> Result<(), IndexingError> {
        let key = EntityKey::new(entity_type, entity_id);
        let route = self.resolver.route_for(entity_type, entity_id, state)?;

        debug!(entity = %key, mutation = %mutation, route = %route, "Staging outbox event");
        batch
            .put_entity(key.clone(), serde_json::to_vec(state)?)
            .append_tracked(key, mutation, RouteUpdate::MoveTo(route));
        Ok(())
    }

    /// Stage creation of an entity.
    pub fn stage_insert(
        &self,
        batch: &mut MutationBatch,
        entity_type: &str,
        entity_id: &str,
        state: &Value,
    ) -> Result<(), IndexingError> {
        self.stage_write(batch, entity_type, entity_id, state, MutationType::Add)
    }

    /// Stage an update of an entity.
    pub fn stage_update(
        &self,
        batch: &mut MutationBatch,
        entity_type: &str,
        entity_id: &str,
        state: &Value,
    ) -> Result<(), IndexingError> {
        self.stage_write(batch, entity_type, entity_id, state, MutationType::AddOrUpdate)
    }

    /// Stage removal of an entity. The event carries the recorded routes,
    /// which stay on record for a later recreation.
    pub fn stage_delete(
        &self,
        batch: &mut MutationBatch,
        entity_type: &str,
        entity_id: &str,
    ) -> Result<(), IndexingError> {
        let key = EntityKey::new(entity_type, entity_id);

        debug!(entity = %key, "Staging outbox delete");
        batch
            .delete_entity(key.clone())
            .append_tracked(key, MutationType::Delete, RouteUpdate::Keep);
        Ok(())
    }

    /// Insert an entity in its own unit of work.
    pub fn insert(&self, entity_type: &str, entity_id: &str, state: &Value) -> Result<EventId, IndexingError> {
        let mut batch = self.begin();
        self.stage_insert(&mut batch, entity_type, entity_id, state)?;
        self.commit_single(batch)
    }

    /// Update an entity in its own unit of work.
    pub fn update(&self, entity_type: &str, entity_id: &str, state: &Value) -> Result<EventId, IndexingError> {
        let mut batch = self.begin();
        self.stage_update(&mut batch, entity_type, entity_id, state)?;
        self.commit_single(batch)
    }

    /// Delete an entity in its own unit of work.
    pub fn delete(&self, entity_type: &str, entity_id: &str) -> Result<EventId, IndexingError> {
        let mut batch = self.begin();
        self.stage_delete(&mut batch, entity_type, entity_id)?;
        self.commit_single(batch)
    }

    fn commit_single(&self, batch: MutationBatch) -> Result<EventId, IndexingError> {
        self.commit(batch)?
            .into_iter()
            .next()
            .ok_or_else(|| IndexingError::Serialization("commit appended no event".to_string()))
    }
}
