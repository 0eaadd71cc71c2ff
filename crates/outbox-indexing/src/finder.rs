//! Event selection.
//!
//! An [`EventFinder`] proposes the next batch of outbox events, oldest first.
//! Proposals are only candidates: the dispatcher still has to claim them,
//! and the claim re-checks everything under the storage lock.
//!
//! Both finders here keep per-entity ordering. An event is never proposed
//! while an older event of the same entity is owned by another worker,
//! backing off, or hidden by a filter. `FAILED` events never hold back their
//! successors.

use std::collections::HashSet;
use std::sync::{Arc, PoisonError, RwLock};

use tracing::debug;

use outbox_storage::{select_in_order, Storage};
use outbox_types::{EventId, OutboxEvent};

use crate::error::IndexingError;

/// Source of candidate events.
pub trait EventFinder: Send + Sync {
    /// Up to `batch_size` claimable events at `now_ms`, in identifier order.
    ///
    /// An empty result is not an error. Storage failures are reported as
    /// [`IndexingError::TransientRead`].
    fn select(&self, batch_size: usize, now_ms: i64) -> Result<Vec<OutboxEvent>, IndexingError>;
}

fn read_all(storage: &Storage) -> Result<Vec<OutboxEvent>, IndexingError> {
    storage
        .all_events()
        .map_err(|e| IndexingError::TransientRead(e.to_string()))
}

/// Finder reading straight from storage.
pub struct DefaultEventFinder {
    storage: Arc<Storage>,
}

impl DefaultEventFinder {
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }
}

impl EventFinder for DefaultEventFinder {
    fn select(&self, batch_size: usize, now_ms: i64) -> Result<Vec<OutboxEvent>, IndexingError> {
        let rows = read_all(&self.storage)?;
        let selected: Vec<OutboxEvent> = select_in_order(&rows, now_ms, batch_size, |_| true)
            .into_iter()
            .cloned()
            .collect();
        debug!(scanned = rows.len(), selected = selected.len(), "Selected outbox events");
        Ok(selected)
    }
}

/// Decides which events a [`FilteringEventFinder`] may propose.
pub trait EventFilter: Send + Sync {
    fn accepts(&self, event: &OutboxEvent) -> bool;
}

/// Filter that can hide all events or show only a chosen set.
///
/// Used to hold events back while a test inspects the outbox.
#[derive(Debug, Default)]
pub struct SuppressionFilter {
    visible: RwLock<Visibility>,
}

#[derive(Debug, Default, Clone)]
enum Visibility {
    #[default]
    All,
    Nothing,
    Only(HashSet<EventId>),
}

impl SuppressionFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn show_all(&self) {
        self.set(Visibility::All);
    }

    pub fn hide_all(&self) {
        self.set(Visibility::Nothing);
    }

    pub fn show_only(&self, ids: impl IntoIterator<Item = EventId>) {
        self.set(Visibility::Only(ids.into_iter().collect()));
    }

    fn set(&self, visibility: Visibility) {
        *self.visible.write().unwrap_or_else(PoisonError::into_inner) = visibility;
    }
}

impl EventFilter for SuppressionFilter {
    fn accepts(&self, event: &OutboxEvent) -> bool {
        match &*self.visible.read().unwrap_or_else(PoisonError::into_inner) {
            Visibility::All => true,
            Visibility::Nothing => false,
            Visibility::Only(ids) => ids.contains(&event.id),
        }
    }
}

/// Finder that applies an [`EventFilter`] on top of storage reads.
pub struct FilteringEventFinder {
    storage: Arc<Storage>,
    filter: Arc<dyn EventFilter>,
}

impl FilteringEventFinder {
    pub fn new(storage: Arc<Storage>, filter: Arc<dyn EventFilter>) -> Self {
        Self { storage, filter }
    }

    /// Every outbox row regardless of filter or status.
    pub fn find_no_filter(&self) -> Result<Vec<OutboxEvent>, IndexingError> {
        read_all(&self.storage)
    }
}

impl EventFinder for FilteringEventFinder {
    fn select(&self, batch_size: usize, now_ms: i64) -> Result<Vec<OutboxEvent>, IndexingError> {
        let rows = read_all(&self.storage)?;
        Ok(
            select_in_order(&rows, now_ms, batch_size, |e| self.filter.accepts(e))
                .into_iter()
                .cloned()
                .collect(),
        )
    }
}
