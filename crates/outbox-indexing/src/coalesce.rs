//! Event coalescing.
//!
//! Folds every claimed event of one entity into a single [`IndexOperation`].
//! Intermediate states never reach the index, only the net effect does, but
//! route history is never dropped: every route any folded event mentioned
//! stays purgeable, or a re-route followed by a delete would orphan the
//! document in its old partition.
//!
//! Fold rules, in identifier order:
//! - a lone event maps to its own kind
//! - add/update followed by add/update collapses to `ADD_OR_UPDATE` with the
//!   latest current route
//! - anything followed by `DELETE` becomes `DELETE` carrying every route seen
//! - `DELETE` followed by add/update is a fresh add: folding restarts at the
//!   recreating event and only the routes carried from there on are kept.
//!   Writers keep route history across deletes, so the recreating event
//!   already lists the partitions the deleted document occupied.

use std::collections::HashMap;

use tracing::trace;

use outbox_types::{
    DocumentRoute, EntityKey, IndexOperation, IndexOperationKind, MutationType, OutboxEvent,
};

/// Turns claimed events into index operations.
#[derive(Debug, Default, Clone, Copy)]
pub struct Coalescer;

impl Coalescer {
    pub fn new() -> Self {
        Self
    }

    /// One operation per entity, in order of each entity's first event.
    pub fn coalesce(&self, events: &[OutboxEvent]) -> Vec<IndexOperation> {
        let mut order: Vec<EntityKey> = Vec::new();
        let mut groups: HashMap<EntityKey, Vec<&OutboxEvent>> = HashMap::new();

        for event in events {
            let key = event.entity_key();
            groups
                .entry(key.clone())
                .or_insert_with(|| {
                    order.push(key);
                    Vec::new()
                })
                .push(event);
        }

        order
            .into_iter()
            .filter_map(|key| {
                let mut group = groups.remove(&key)?;
                group.sort_by_key(|e| e.id);
                let op = fold(&key, &group)?;
                trace!(entity = %key, events = group.len(), kind = %op.kind, "Coalesced entity");
                Some(op)
            })
            .collect()
    }
}

/// Fold one entity's events. `None` only for an empty group.
fn fold(key: &EntityKey, events: &[&OutboxEvent]) -> Option<IndexOperation> {
    let start = events
        .windows(2)
        .rposition(|pair| {
            pair[0].mutation == MutationType::Delete && pair[1].mutation != MutationType::Delete
        })
        .map_or(0, |i| i + 1);
    let (first, rest) = events[start..].split_first()?;

    let mut kind = IndexOperationKind::from(first.mutation);
    let mut current = first.routes.current.clone();
    let mut seen: Vec<DocumentRoute> = Vec::new();
    remember(&mut seen, first);

    for event in rest {
        kind = match (kind, event.mutation) {
            (_, MutationType::Delete) => IndexOperationKind::Delete,
            (_, MutationType::Add | MutationType::AddOrUpdate) => IndexOperationKind::AddOrUpdate,
        };
        current = event.routes.current.clone();
        remember(&mut seen, event);
    }

    let previous_routes = match kind {
        IndexOperationKind::Delete => seen,
        IndexOperationKind::Add | IndexOperationKind::AddOrUpdate => {
            seen.into_iter().filter(|r| *r != current).collect()
        }
    };

    Some(IndexOperation {
        entity_type: key.entity_type.clone(),
        entity_id: key.entity_id.clone(),
        kind,
        current_route: current,
        previous_routes,
        // Events before a recreation are resolved by this operation too
        source_events: events.iter().map(|e| e.id).collect(),
    })
}

/// Record an event's routes, oldest history first.
fn remember(seen: &mut Vec<DocumentRoute>, event: &OutboxEvent) {
    let routes = event
        .routes
        .previous
        .iter()
        .chain(std::iter::once(&event.routes.current));
    for route in routes {
        if !seen.contains(route) {
            seen.push(route.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::InMemoryIndex;
    use outbox_types::{DocumentRoutes, EventId, NewOutboxEvent};
    use proptest::prelude::*;

    fn event(id: u64, entity: &str, mutation: MutationType, routes: DocumentRoutes) -> OutboxEvent {
        OutboxEvent::from_new(
            EventId(id),
            NewOutboxEvent::new("RoutedIndexedEntity", entity, mutation, routes),
            0,
        )
    }

    fn routed(current: &str, previous: &[&str]) -> DocumentRoutes {
        DocumentRoutes::new(DocumentRoute::of(current))
            .with_previous(previous.iter().map(|r| DocumentRoute::of(*r)))
    }

    #[test]
    fn test_single_add() {
        let ops = Coalescer::new().coalesce(&[event(1, "1", MutationType::Add, routed("A", &[]))]);
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].kind, IndexOperationKind::Add);
        assert_eq!(ops[0].current_route, DocumentRoute::of("A"));
        assert!(ops[0].previous_routes.is_empty());
    }

    #[test]
    fn test_add_then_update_collapses() {
        let ops = Coalescer::new().coalesce(&[
            event(1, "1", MutationType::Add, DocumentRoutes::unrouted()),
            event(2, "1", MutationType::AddOrUpdate, DocumentRoutes::unrouted()),
        ]);
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].kind, IndexOperationKind::AddOrUpdate);
        assert_eq!(ops[0].source_events, vec![EventId(1), EventId(2)]);
    }

    #[test]
    fn test_updates_keep_latest_route_and_union_of_previous() {
        let ops = Coalescer::new().coalesce(&[
            event(1, "1", MutationType::AddOrUpdate, routed("B", &["A"])),
            event(2, "1", MutationType::AddOrUpdate, routed("C", &["A", "B"])),
        ]);
        assert_eq!(ops[0].current_route, DocumentRoute::of("C"));
        assert_eq!(
            ops[0].previous_routes,
            vec![DocumentRoute::of("A"), DocumentRoute::of("B")]
        );
    }

    #[test]
    fn test_route_change_then_delete_carries_all_routes() {
        let ops = Coalescer::new().coalesce(&[
            event(1, "1", MutationType::Add, routed("A", &[])),
            event(2, "1", MutationType::AddOrUpdate, routed("B", &["A"])),
            event(3, "1", MutationType::Delete, routed("B", &["A"])),
        ]);
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].kind, IndexOperationKind::Delete);
        assert_eq!(
            ops[0].previous_routes,
            vec![DocumentRoute::of("A"), DocumentRoute::of("B")]
        );
    }

    #[test]
    fn test_delete_then_add_is_a_fresh_add() {
        let ops = Coalescer::new().coalesce(&[
            event(1, "1", MutationType::Delete, routed("A", &[])),
            event(2, "1", MutationType::Add, routed("B", &[])),
        ]);
        assert_eq!(ops[0].kind, IndexOperationKind::Add);
        assert_eq!(ops[0].current_route, DocumentRoute::of("B"));
        assert!(ops[0].previous_routes.is_empty());
        assert_eq!(ops[0].source_events, vec![EventId(1), EventId(2)]);
    }

    #[test]
    fn test_recreation_keeps_only_routes_it_carries() {
        let ops = Coalescer::new().coalesce(&[
            event(1, "1", MutationType::AddOrUpdate, routed("B", &["A"])),
            event(2, "1", MutationType::Delete, routed("B", &["A"])),
            event(3, "1", MutationType::Add, routed("C", &["B"])),
            event(4, "1", MutationType::AddOrUpdate, routed("D", &["B", "C"])),
        ]);
        assert_eq!(ops[0].kind, IndexOperationKind::AddOrUpdate);
        assert_eq!(ops[0].current_route, DocumentRoute::of("D"));
        assert_eq!(
            ops[0].previous_routes,
            vec![DocumentRoute::of("B"), DocumentRoute::of("C")]
        );
        assert_eq!(ops[0].last_event(), Some(EventId(4)));
        assert_eq!(ops[0].source_events.len(), 4);
    }

    #[test]
    fn test_delete_after_recreation_carries_recreated_routes() {
        let ops = Coalescer::new().coalesce(&[
            event(1, "1", MutationType::Delete, routed("A", &[])),
            event(2, "1", MutationType::Add, routed("B", &["A"])),
            event(3, "1", MutationType::Delete, routed("B", &["A"])),
        ]);
        assert_eq!(ops[0].kind, IndexOperationKind::Delete);
        let mut purged = ops[0].purge_routes();
        purged.sort();
        assert_eq!(purged, vec![DocumentRoute::of("A"), DocumentRoute::of("B")]);
    }

    #[test]
    fn test_groups_in_first_appearance_order() {
        let ops = Coalescer::new().coalesce(&[
            event(1, "2", MutationType::Add, DocumentRoutes::unrouted()),
            event(2, "1", MutationType::Add, DocumentRoutes::unrouted()),
            event(3, "2", MutationType::Delete, DocumentRoutes::unrouted()),
        ]);
        let ids: Vec<&str> = ops.iter().map(|o| o.entity_id.as_str()).collect();
        assert_eq!(ids, vec!["2", "1"]);
        assert_eq!(ops[0].kind, IndexOperationKind::Delete);
    }

    #[test]
    fn test_empty_input() {
        assert!(Coalescer::new().coalesce(&[]).is_empty());
    }

    /// A mutation issued against one entity.
    #[derive(Debug, Clone)]
    enum Step {
        Upsert(u8),
        Delete,
    }

    fn step() -> impl Strategy<Value = Step> {
        prop_oneof![
            3 => (0u8..3).prop_map(Step::Upsert),
            1 => Just(Step::Delete),
        ]
    }

    fn route(idx: u8) -> DocumentRoute {
        DocumentRoute::of(["A", "B", "C"][idx as usize])
    }

    /// Produce the events the mutation side would append, starting from an
    /// optional pre-existing indexed state. Route history outlives deletes,
    /// as it does in storage.
    fn simulate(initial: Option<u8>, steps: &[Step]) -> Vec<OutboxEvent> {
        let mut recorded = initial.map(|r| DocumentRoutes::new(route(r)));
        let mut exists = initial.is_some();
        let mut events = Vec::new();

        for step in steps {
            let id = events.len() as u64 + 1;
            match step {
                Step::Upsert(r) => {
                    let routes = DocumentRoutes::advance(recorded.as_ref(), route(*r));
                    let mutation = if exists {
                        MutationType::AddOrUpdate
                    } else {
                        MutationType::Add
                    };
                    events.push(event(id, "1", mutation, routes.clone()));
                    recorded = Some(routes);
                    exists = true;
                }
                Step::Delete if exists => {
                    let routes = recorded.clone().unwrap_or_else(DocumentRoutes::unrouted);
                    events.push(event(id, "1", MutationType::Delete, routes));
                    exists = false;
                }
                Step::Delete => {}
            }
        }
        events
    }

    fn seeded(initial: Option<u8>) -> InMemoryIndex {
        let index = InMemoryIndex::new();
        if let Some(r) = initial {
            index.seed(route(r), EntityKey::new("RoutedIndexedEntity", "1"));
        }
        index
    }

    proptest! {
        #[test]
        fn prop_coalesced_equals_sequential(
            initial in proptest::option::of(0u8..3),
            steps in proptest::collection::vec(step(), 1..12),
        ) {
            let events = simulate(initial, &steps);
            prop_assume!(!events.is_empty());
            let coalescer = Coalescer::new();

            let sequential = seeded(initial);
            for e in &events {
                sequential.apply_now(&coalescer.coalesce(std::slice::from_ref(e))).unwrap();
            }

            let batched = seeded(initial);
            let ops = coalescer.coalesce(&events);
            prop_assert_eq!(ops.len(), 1);
            batched.apply_now(&ops).unwrap();

            prop_assert_eq!(batched.snapshot(), sequential.snapshot());
        }

        #[test]
        fn prop_delete_carries_every_route_seen(
            routes in proptest::collection::vec(0u8..3, 1..8),
        ) {
            let mut steps: Vec<Step> = routes.iter().copied().map(Step::Upsert).collect();
            steps.push(Step::Delete);
            let events = simulate(None, &steps);

            let ops = Coalescer::new().coalesce(&events);
            prop_assert_eq!(ops[0].kind, IndexOperationKind::Delete);
            let purged = ops[0].purge_routes();
            for r in &routes {
                prop_assert!(purged.contains(&route(*r)));
            }
        }
    }
}
