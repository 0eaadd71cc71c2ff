//! # outbox-types
//!
//! Shared domain types for the search outbox pipeline.
//!
//! This crate defines the core data structures used throughout the system:
//! - Outbox events: immutable mutation facts with processing state
//! - Document routes: current and previous routing keys, versioned on disk
//! - Index operations: coalesced work handed to the index sink
//! - Settings: layered configuration
//!
//! ## Usage
//!
//! ```rust
//! use outbox_types::{DocumentRoute, DocumentRoutes, MutationType, NewOutboxEvent};
//!
//! let event = NewOutboxEvent::new(
//!     "Book",
//!     "42",
//!     MutationType::Add,
//!     DocumentRoutes::new(DocumentRoute::of("shard-a")),
//! );
//! assert_eq!(event.entity_id, "42");
//! ```

pub mod config;
pub mod error;
pub mod operation;
pub mod outbox;
pub mod routes;

pub use config::{DispatchSettings, Settings};
pub use error::OutboxError;
pub use operation::{IndexOperation, IndexOperationKind};
pub use outbox::{
    EntityKey, EventId, EventStatus, Lease, LeaseToken, MutationType, NewOutboxEvent,
    OutboxEvent, WorkerId,
};
pub use routes::{DocumentRoute, DocumentRoutes, ROUTES_SCHEMA_VERSION};
