//! Index operations handed to the sink.
//!
//! An index operation is the coalesced net effect of every event for one
//! entity in one dispatch batch. It is transient: built by the dispatcher,
//! handed to the sink, then dropped.

use serde::{Deserialize, Serialize};

use crate::outbox::{EntityKey, EventId, MutationType};
use crate::routes::DocumentRoute;

/// What the sink must do with the document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IndexOperationKind {
    /// Index a document that is not expected to exist yet
    Add,
    /// Index or overwrite a document
    AddOrUpdate,
    /// Remove a document
    Delete,
}

impl From<MutationType> for IndexOperationKind {
    fn from(mutation: MutationType) -> Self {
        match mutation {
            MutationType::Add => IndexOperationKind::Add,
            MutationType::AddOrUpdate => IndexOperationKind::AddOrUpdate,
            MutationType::Delete => IndexOperationKind::Delete,
        }
    }
}

impl std::fmt::Display for IndexOperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IndexOperationKind::Add => write!(f, "ADD"),
            IndexOperationKind::AddOrUpdate => write!(f, "ADD_OR_UPDATE"),
            IndexOperationKind::Delete => write!(f, "DELETE"),
        }
    }
}

/// One coalesced unit of work for the sink.
///
/// Operations carry identity and routing only; the sink loads the document
/// body from the primary store when it writes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexOperation {
    /// Entity type name
    pub entity_type: String,
    /// Entity identifier
    pub entity_id: String,
    /// Operation kind
    pub kind: IndexOperationKind,
    /// Route the document belongs to after this operation
    pub current_route: DocumentRoute,
    /// Every other route the document may still be present under
    pub previous_routes: Vec<DocumentRoute>,
    /// Events folded into this operation, in append order
    pub source_events: Vec<EventId>,
}

impl IndexOperation {
    /// Entity this operation targets.
    pub fn entity_key(&self) -> EntityKey {
        EntityKey::new(&self.entity_type, &self.entity_id)
    }

    /// Routes from which the document must be removed.
    ///
    /// For deletes this is every known route; for adds it is the previous
    /// routes only, since the document is (re)written under the current one.
    pub fn purge_routes(&self) -> Vec<DocumentRoute> {
        match self.kind {
            IndexOperationKind::Delete => {
                let mut routes = vec![self.current_route.clone()];
                for route in &self.previous_routes {
                    if !routes.contains(route) {
                        routes.push(route.clone());
                    }
                }
                routes
            }
            IndexOperationKind::Add | IndexOperationKind::AddOrUpdate => self
                .previous_routes
                .iter()
                .filter(|r| **r != self.current_route)
                .cloned()
                .collect(),
        }
    }

    /// Highest event id folded into this operation.
    pub fn last_event(&self) -> Option<EventId> {
        self.source_events.iter().max().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn op(kind: IndexOperationKind) -> IndexOperation {
        IndexOperation {
            entity_type: "RoutedIndexedEntity".into(),
            entity_id: "1".into(),
            kind,
            current_route: DocumentRoute::of("B"),
            previous_routes: vec![DocumentRoute::of("A"), DocumentRoute::of("B")],
            source_events: vec![EventId(3), EventId(1)],
        }
    }

    #[test]
    fn test_delete_purges_every_route() {
        let routes = op(IndexOperationKind::Delete).purge_routes();
        assert_eq!(routes, vec![DocumentRoute::of("B"), DocumentRoute::of("A")]);
    }

    #[test]
    fn test_update_purges_previous_only() {
        let routes = op(IndexOperationKind::AddOrUpdate).purge_routes();
        assert_eq!(routes, vec![DocumentRoute::of("A")]);
    }

    #[test]
    fn test_last_event() {
        assert_eq!(op(IndexOperationKind::Add).last_event(), Some(EventId(3)));
    }

    #[test]
    fn test_kind_from_mutation() {
        assert_eq!(
            IndexOperationKind::from(MutationType::AddOrUpdate),
            IndexOperationKind::AddOrUpdate
        );
        assert_eq!(IndexOperationKind::Delete.to_string(), "DELETE");
    }

    #[test]
    fn test_operation_json_format() {
        let json = serde_json::to_value(op(IndexOperationKind::AddOrUpdate)).unwrap();
        assert_eq!(json["kind"], "ADD_OR_UPDATE");
        assert_eq!(json["current_route"]["routing_key"], "B");
    }
}
