//! Inspection helpers for outbox contents.
//!
//! Flattens stored events into plain summaries so tests and operator tools
//! can assert on them without caring about processing fields.

use outbox_types::{DocumentRoute, EventStatus, MutationType, OutboxEvent};

/// What an event says about its entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventSummary {
    pub entity_type: String,
    pub entity_id: String,
    pub mutation: MutationType,
    pub current_route: DocumentRoute,
    pub previous_routes: Vec<DocumentRoute>,
    pub status: EventStatus,
    pub retry_count: u32,
}

impl From<&OutboxEvent> for EventSummary {
    fn from(event: &OutboxEvent) -> Self {
        Self {
            entity_type: event.entity_type.clone(),
            entity_id: event.entity_id.clone(),
            mutation: event.mutation,
            current_route: event.routes.current.clone(),
            previous_routes: event.routes.previous.clone(),
            status: event.status,
            retry_count: event.retry_count,
        }
    }
}

/// Summaries in identifier order.
pub fn summarize(events: &[OutboxEvent]) -> Vec<EventSummary> {
    let mut sorted: Vec<&OutboxEvent> = events.iter().collect();
    sorted.sort_by_key(|e| e.id);
    sorted.into_iter().map(EventSummary::from).collect()
}

/// Summaries of events for one entity.
pub fn events_for<'a>(
    events: &'a [OutboxEvent],
    entity_type: &'a str,
    entity_id: &'a str,
) -> impl Iterator<Item = EventSummary> + 'a {
    events
        .iter()
        .filter(move |e| e.entity_type == entity_type && e.entity_id == entity_id)
        .map(EventSummary::from)
}
