//! Outbox indexing pipeline.
//!
//! This crate turns outbox events into index operations and keeps the
//! search index consistent with the primary store.
//!
//! ## Key Components
//!
//! - [`OutboxWriter`]: stages entity mutations with their outbox events
//! - [`RoutingResolver`]: computes current and previous routes per entity
//! - [`EventFinder`]: proposes claimable events, oldest first
//! - [`Coalescer`]: folds each entity's events into one [`IndexOperation`]
//! - [`IndexSink`]: batch-atomic consumer of index operations
//! - [`RetryController`]: exponential backoff and the `FAILED` ceiling
//! - [`Dispatcher`]: claim, coalesce, submit, commit or retry
//! - [`DispatchCheckpoint`]: per-worker progress
//!
//! ## Architecture
//!
//! 1. Mutations are committed together with their outbox events
//! 2. A dispatcher claims a batch under a lease token
//! 3. Claimed events are coalesced per entity and submitted as one batch
//! 4. On success the events are deleted; on failure they back off
//! 5. Events that keep failing are parked as `FAILED` for an operator
//!
//! ## Example
//!
//! ```ignore
//! use outbox_indexing::{Dispatcher, InMemoryIndex};
//!
//! let dispatcher = Dispatcher::new(worker, storage, Arc::new(InMemoryIndex::new()), settings);
//! dispatcher.load_checkpoint()?;
//!
//! // Process until caught up
//! let outcomes = dispatcher.run_until_idle(&cancel, 100).await;
//! ```
//!
//! [`IndexOperation`]: outbox_types::IndexOperation

pub mod checkpoint;
pub mod coalesce;
pub mod dispatcher;
pub mod error;
pub mod finder;
pub mod retry;
pub mod routing;
pub mod sink;
pub mod verify;
pub mod writer;

pub use checkpoint::DispatchCheckpoint;
pub use coalesce::Coalescer;
pub use dispatcher::{
    now_ms, CycleOutcome, Dispatcher, DispatcherState, DispatcherStats, StatsSnapshot,
};
pub use error::IndexingError;
pub use finder::{
    DefaultEventFinder, EventFilter, EventFinder, FilteringEventFinder, SuppressionFilter,
};
pub use retry::{RetryController, RetryDecision, RetryPolicy};
pub use routing::{FieldRouting, NoRouting, RoutingResolver, RoutingStrategy};
pub use sink::{InMemoryIndex, IndexSink, IndexedDocument, SinkError};
pub use verify::{events_for, summarize, EventSummary};
pub use writer::OutboxWriter;
