//! Routing resolution.
//!
//! A [`RoutingStrategy`] maps an entity's state to the routing key of the
//! index partition its document belongs in. [`RoutingResolver`] picks the
//! strategy per entity type and checks its answer. Merging the route with
//! the entity's recorded history happens in storage, at commit.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use outbox_types::DocumentRoute;

use crate::error::IndexingError;

/// Per-entity-type routing rule.
pub trait RoutingStrategy: Send + Sync {
    /// Routing key for the entity in its current state, `None` for the
    /// default partition.
    fn current_route(&self, entity_type: &str, entity_id: &str, state: &Value) -> Option<String>;
}

/// Every document goes to the default partition.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoRouting;

impl RoutingStrategy for NoRouting {
    fn current_route(&self, _entity_type: &str, _entity_id: &str, _state: &Value) -> Option<String> {
        None
    }
}

/// Route by a top-level string field of the entity state.
#[derive(Debug, Clone)]
pub struct FieldRouting {
    field: String,
}

impl FieldRouting {
    pub fn new(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
        }
    }
}

impl RoutingStrategy for FieldRouting {
    fn current_route(&self, _entity_type: &str, _entity_id: &str, state: &Value) -> Option<String> {
        state
            .get(&self.field)
            .and_then(Value::as_str)
            .map(str::to_string)
    }
}

/// Resolves routing descriptors for appended events.
#[derive(Clone)]
pub struct RoutingResolver {
    strategies: HashMap<String, Arc<dyn RoutingStrategy>>,
    fallback: Arc<dyn RoutingStrategy>,
}

impl Default for RoutingResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl RoutingResolver {
    /// Resolver that leaves every entity type unrouted.
    pub fn new() -> Self {
        Self {
            strategies: HashMap::new(),
            fallback: Arc::new(NoRouting),
        }
    }

    /// Register the strategy for an entity type.
    pub fn with_strategy(
        mut self,
        entity_type: impl Into<String>,
        strategy: Arc<dyn RoutingStrategy>,
    ) -> Self {
        self.strategies.insert(entity_type.into(), strategy);
        self
    }

    fn strategy_for(&self, entity_type: &str) -> &Arc<dyn RoutingStrategy> {
        self.strategies.get(entity_type).unwrap_or(&self.fallback)
    }

    /// Route the entity belongs under in `state`.
    ///
    /// Writers call this while staging; the history merge happens at commit,
    /// under the storage write lock.
    pub fn route_for(
        &self,
        entity_type: &str,
        entity_id: &str,
        state: &Value,
    ) -> Result<DocumentRoute, IndexingError> {
        let key = self
            .strategy_for(entity_type)
            .current_route(entity_type, entity_id, state);
        if matches!(key.as_deref(), Some("")) {
            return Err(IndexingError::Routing(format!(
                "empty routing key for {}#{}",
                entity_type, entity_id
            )));
        }
        Ok(DocumentRoute::from_key(key))
    }
}
