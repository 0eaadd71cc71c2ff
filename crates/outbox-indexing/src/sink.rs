//! Index-operation sink seam.
//!
//! The dispatcher hands each coalesced batch to an [`IndexSink`] as one unit.
//! Acknowledgement is per batch: any error fails every operation in it.
//! Sinks must be idempotent per entity and operation, since a crash between
//! a successful submit and the outbox commit replays the batch.
//!
//! [`InMemoryIndex`] is the reference implementation used by tests and the
//! coalescer oracle.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;

use outbox_types::{DocumentRoute, EntityKey, EventId, IndexOperation, IndexOperationKind};

/// Batch-level sink failure.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SinkError {
    /// The backend refused the batch
    #[error("Batch rejected: {0}")]
    Rejected(String),

    /// The backend could not be reached
    #[error("Sink unavailable: {0}")]
    Unavailable(String),
}

/// Consumer of coalesced index operations.
#[async_trait]
pub trait IndexSink: Send + Sync {
    /// Durably apply the whole batch, or fail it as a whole.
    async fn apply(&self, batch: &[IndexOperation]) -> Result<(), SinkError>;

    /// Name used in logs.
    fn name(&self) -> &str;
}

/// A document as stored by [`InMemoryIndex`].
#[derive(Debug, Clone, PartialEq)]
pub struct IndexedDocument {
    /// Last event folded into the write
    pub version: Option<EventId>,
}

#[derive(Debug, Default)]
struct IndexState {
    documents: BTreeMap<(DocumentRoute, EntityKey), IndexedDocument>,
    batches: Vec<Vec<IndexOperation>>,
}

/// In-memory, route-partitioned index.
///
/// Applying the same batch twice leaves the same documents behind.
#[derive(Debug, Default)]
pub struct InMemoryIndex {
    state: RwLock<IndexState>,
    fail_next: AtomicUsize,
    attempts: AtomicUsize,
}

impl InMemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` batches with [`SinkError::Rejected`].
    pub fn fail_next(&self, n: usize) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Apply a batch synchronously.
    pub fn apply_now(&self, batch: &[IndexOperation]) -> Result<(), SinkError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let should_fail = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if should_fail {
            return Err(SinkError::Rejected("injected failure".to_string()));
        }

        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        for op in batch {
            Self::apply_one(&mut state.documents, op);
        }
        state.batches.push(batch.to_vec());
        Ok(())
    }

    fn apply_one(
        documents: &mut BTreeMap<(DocumentRoute, EntityKey), IndexedDocument>,
        op: &IndexOperation,
    ) {
        let key = op.entity_key();
        for route in op.purge_routes() {
            documents.remove(&(route, key.clone()));
        }
        match op.kind {
            IndexOperationKind::Add | IndexOperationKind::AddOrUpdate => {
                documents.insert(
                    (op.current_route.clone(), key),
                    IndexedDocument {
                        version: op.last_event(),
                    },
                );
            }
            IndexOperationKind::Delete => {}
        }
    }

    /// Successfully applied batches, oldest first.
    pub fn batches(&self) -> Vec<Vec<IndexOperation>> {
        self.read().batches.clone()
    }

    /// Every successfully applied operation, flattened.
    pub fn operations(&self) -> Vec<IndexOperation> {
        self.read().batches.iter().flatten().cloned().collect()
    }

    /// Number of `apply` calls, including failed ones.
    pub fn attempt_count(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Routes the entity currently has a document under.
    pub fn routes_of(&self, key: &EntityKey) -> Vec<DocumentRoute> {
        self.read()
            .documents
            .keys()
            .filter(|(_, k)| k == key)
            .map(|(route, _)| route.clone())
            .collect()
    }

    /// Whether a document exists under the route.
    pub fn contains(&self, route: &DocumentRoute, key: &EntityKey) -> bool {
        self.read()
            .documents
            .contains_key(&(route.clone(), key.clone()))
    }

    /// Every `(route, entity)` pair with a document.
    pub fn snapshot(&self) -> Vec<(DocumentRoute, EntityKey)> {
        self.read().documents.keys().cloned().collect()
    }

    /// Seed a document, bypassing the batch log.
    pub fn seed(&self, route: DocumentRoute, key: EntityKey) {
        self.state
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .documents
            .insert((route, key), IndexedDocument { version: None });
    }

    pub fn document_count(&self) -> usize {
        self.read().documents.len()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, IndexState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl IndexSink for InMemoryIndex {
    async fn apply(&self, batch: &[IndexOperation]) -> Result<(), SinkError> {
        let result = self.apply_now(batch);
        debug!(operations = batch.len(), ok = result.is_ok(), "In-memory index apply");
        result
    }

    fn name(&self) -> &str {
        "in-memory"
    }
}
