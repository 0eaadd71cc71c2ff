//! Outbox event records.
//!
//! An outbox event is an immutable fact describing one entity mutation. It is
//! appended in the same write batch as the mutation itself; only the
//! processing fields (status, retry count, lease, eligibility) change
//! afterwards, and the row is deleted once the index has durably applied it.

use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::routes::DocumentRoutes;

/// Monotonic outbox identifier. Never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(pub u64);

impl EventId {
    /// Raw sequence value.
    pub fn value(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:020}", self.0)
    }
}

/// Kind of mutation recorded by an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MutationType {
    /// Entity was created
    Add,
    /// Entity was updated (or may not be indexed yet)
    AddOrUpdate,
    /// Entity was removed
    Delete,
}

impl std::fmt::Display for MutationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MutationType::Add => write!(f, "ADD"),
            MutationType::AddOrUpdate => write!(f, "ADD_OR_UPDATE"),
            MutationType::Delete => write!(f, "DELETE"),
        }
    }
}

/// Processing status of an event row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventStatus {
    /// Waiting for a dispatcher
    #[default]
    Pending,
    /// Claimed by a dispatcher holding a lease
    Processing,
    /// Retry ceiling exceeded; kept for operator inspection
    Failed,
}

impl std::fmt::Display for EventStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventStatus::Pending => write!(f, "PENDING"),
            EventStatus::Processing => write!(f, "PROCESSING"),
            EventStatus::Failed => write!(f, "FAILED"),
        }
    }
}

/// Identity of a dispatcher worker.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(pub String);

impl WorkerId {
    /// Create a worker id from a name.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Create a unique worker id with the given prefix.
    pub fn generate(prefix: &str) -> Self {
        Self(format!("{}-{}", prefix, Ulid::new()))
    }

    /// Borrow as str.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Token identifying one claim. A fresh token is minted per claim so a worker
/// whose lease expired cannot commit rows another worker has since reclaimed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LeaseToken(pub Ulid);

impl LeaseToken {
    /// Mint a new token.
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for LeaseToken {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for LeaseToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Time-bounded ownership of an event row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    /// Worker holding the lease
    pub owner: WorkerId,
    /// Claim token
    pub token: LeaseToken,
    /// Expiry, milliseconds since epoch
    pub expires_at_ms: i64,
}

impl Lease {
    /// Whether the lease has lapsed at `now_ms`.
    pub fn is_expired(&self, now_ms: i64) -> bool {
        now_ms >= self.expires_at_ms
    }
}

/// Payload of the append interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewOutboxEvent {
    /// Entity type name
    pub entity_type: String,
    /// String-encoded entity identifier
    pub entity_id: String,
    /// Mutation kind
    pub mutation: MutationType,
    /// Routing descriptor at mutation time
    pub routes: DocumentRoutes,
}

impl NewOutboxEvent {
    /// Create a new append payload.
    pub fn new(
        entity_type: impl Into<String>,
        entity_id: impl Into<String>,
        mutation: MutationType,
        routes: DocumentRoutes,
    ) -> Self {
        Self {
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
            mutation,
            routes,
        }
    }
}

/// A persisted outbox event row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxEvent {
    /// Monotonic identifier (ordering key)
    pub id: EventId,

    /// Entity type name
    pub entity_type: String,

    /// String-encoded entity identifier
    pub entity_id: String,

    /// Mutation kind
    pub mutation: MutationType,

    /// Routing descriptor (versioned schema)
    pub routes: DocumentRoutes,

    /// Number of failed processing attempts
    #[serde(default)]
    pub retry_count: u32,

    /// Processing status
    #[serde(default)]
    pub status: EventStatus,

    /// Current claim, if any
    #[serde(default)]
    pub lease: Option<Lease>,

    /// Earliest time the event may be claimed again (ms since epoch)
    #[serde(default)]
    pub next_eligible_ms: i64,

    /// Append time (ms since epoch)
    pub created_at_ms: i64,

    /// Last sink error message, kept for operators
    #[serde(default)]
    pub last_error: Option<String>,
}

impl OutboxEvent {
    /// Build a fresh pending row from an append payload.
    pub fn from_new(id: EventId, new: NewOutboxEvent, created_at_ms: i64) -> Self {
        Self {
            id,
            entity_type: new.entity_type,
            entity_id: new.entity_id,
            mutation: new.mutation,
            routes: new.routes,
            retry_count: 0,
            status: EventStatus::Pending,
            lease: None,
            next_eligible_ms: 0,
            created_at_ms,
            last_error: None,
        }
    }

    /// Key grouping events of the same entity.
    pub fn entity_key(&self) -> EntityKey {
        EntityKey::new(&self.entity_type, &self.entity_id)
    }

    /// Whether a dispatcher may claim this row at `now_ms`.
    ///
    /// Pending rows must be past their backoff; processing rows only become
    /// claimable again once their lease has expired.
    pub fn is_claimable(&self, now_ms: i64) -> bool {
        match self.status {
            EventStatus::Pending => self.next_eligible_ms <= now_ms,
            EventStatus::Processing => self
                .lease
                .as_ref()
                .map(|lease| lease.is_expired(now_ms))
                .unwrap_or(true),
            EventStatus::Failed => false,
        }
    }

    /// Whether the row is currently leased under `token`.
    pub fn is_leased_by(&self, token: &LeaseToken) -> bool {
        self.status == EventStatus::Processing
            && self.lease.as_ref().map(|l| &l.token) == Some(token)
    }

    /// Serialize to JSON bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Deserialize from JSON bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

/// `(entity type, entity id)` pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityKey {
    /// Entity type name
    pub entity_type: String,
    /// Entity identifier
    pub entity_id: String,
}

impl EntityKey {
    /// Create an entity key.
    pub fn new(entity_type: impl Into<String>, entity_id: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
        }
    }
}

impl std::fmt::Display for EntityKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.entity_type, self.entity_id)
    }
}
