//! Document routing descriptors.
//!
//! A document route names the index partition a document lives in. Every
//! outbox event carries the entity's current route plus the routes it was
//! previously observed under, so that a later delete or re-route can purge
//! stale copies from partitions the entity has moved out of.
//!
//! Descriptors are persisted with an explicit, versioned schema:
//!
//! ```json
//! {"version":1,"current":{"routing_key":"B"},"previous":[{"routing_key":"A"}]}
//! ```
//!
//! Readers dispatch on `version`; an unknown version is a hard error rather
//! than a silent misread.

use serde::{Deserialize, Serialize};

use crate::error::OutboxError;

/// Current schema version written by this build.
pub const ROUTES_SCHEMA_VERSION: u32 = 1;

/// A single routing target. `routing_key == None` is the default partition.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
pub struct DocumentRoute {
    /// Routing key, or `None` for the index's default routing
    pub routing_key: Option<String>,
}

impl DocumentRoute {
    /// Route with an explicit routing key.
    pub fn of(routing_key: impl Into<String>) -> Self {
        Self {
            routing_key: Some(routing_key.into()),
        }
    }

    /// The default (unrouted) partition.
    pub fn default_route() -> Self {
        Self { routing_key: None }
    }

    /// Route from an optional key.
    pub fn from_key(routing_key: Option<String>) -> Self {
        Self { routing_key }
    }
}

impl std::fmt::Display for DocumentRoute {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.routing_key {
            Some(key) => write!(f, "{}", key),
            None => write!(f, "<default>"),
        }
    }
}

/// Current route plus the ordered, deduplicated set of previous routes.
///
/// `previous` never contains `current`; insertion order is preserved.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DocumentRoutes {
    /// Route the document belongs to now
    pub current: DocumentRoute,
    /// Routes the document may still be present under
    pub previous: Vec<DocumentRoute>,
}

impl DocumentRoutes {
    /// Descriptor with no route history.
    pub fn new(current: DocumentRoute) -> Self {
        Self {
            current,
            previous: Vec::new(),
        }
    }

    /// Descriptor on the default route with no history.
    pub fn unrouted() -> Self {
        Self::new(DocumentRoute::default_route())
    }

    /// Add previous routes (builder form).
    pub fn with_previous(mut self, routes: impl IntoIterator<Item = DocumentRoute>) -> Self {
        for route in routes {
            self.add_previous(route);
        }
        self
    }

    /// Record a previous route, ignoring duplicates and the current route.
    ///
    /// Returns `true` if the route was not already tracked.
    pub fn add_previous(&mut self, route: DocumentRoute) -> bool {
        if route == self.current || self.previous.contains(&route) {
            return false;
        }
        self.previous.push(route);
        true
    }

    /// Descriptor for an entity now living under `current`, given the
    /// routes recorded for it so far. Earlier routes stay in `previous` in
    /// the order the entity left them.
    pub fn advance(recorded: Option<&DocumentRoutes>, current: DocumentRoute) -> Self {
        let mut routes = Self::new(current);
        if let Some(recorded) = recorded {
            for route in &recorded.previous {
                routes.add_previous(route.clone());
            }
            routes.add_previous(recorded.current.clone());
        }
        routes
    }

    /// Union another descriptor's routes (current and previous) into this
    /// descriptor's previous routes.
    pub fn absorb(&mut self, other: &DocumentRoutes) {
        for route in other.all_routes() {
            self.add_previous(route);
        }
    }

    /// Current route followed by previous routes, deduplicated.
    pub fn all_routes(&self) -> Vec<DocumentRoute> {
        let mut routes = Vec::with_capacity(self.previous.len() + 1);
        routes.push(self.current.clone());
        for route in &self.previous {
            if !routes.contains(route) {
                routes.push(route.clone());
            }
        }
        routes
    }

    /// Whether this descriptor holds its invariants (no duplicates, current
    /// route absent from `previous`).
    pub fn is_normalized(&self) -> bool {
        if self.previous.contains(&self.current) {
            return false;
        }
        let mut seen = std::collections::HashSet::new();
        self.previous.iter().all(|r| seen.insert(r))
    }

    /// Serialize with the versioned schema.
    pub fn to_bytes(&self) -> Result<Vec<u8>, OutboxError> {
        Ok(serde_json::to_vec(&RoutesV1::from(self))?)
    }

    /// Deserialize from the versioned schema.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, OutboxError> {
        let raw: serde_json::Value = serde_json::from_slice(bytes)?;
        decode_value(raw)
    }
}

/// Version 1 of the on-disk routes layout.
#[derive(Serialize, Deserialize)]
struct RoutesV1 {
    version: u32,
    current: DocumentRoute,
    #[serde(default)]
    previous: Vec<DocumentRoute>,
}

impl From<&DocumentRoutes> for RoutesV1 {
    fn from(routes: &DocumentRoutes) -> Self {
        Self {
            version: ROUTES_SCHEMA_VERSION,
            current: routes.current.clone(),
            previous: routes.previous.clone(),
        }
    }
}

fn decode_value(raw: serde_json::Value) -> Result<DocumentRoutes, OutboxError> {
    let version = raw
        .get("version")
        .and_then(serde_json::Value::as_u64)
        .ok_or_else(|| OutboxError::InvalidInput("routes descriptor has no version".into()))?;

    match version {
        1 => {
            let v1: RoutesV1 = serde_json::from_value(raw)?;
            // Older writers may have stored un-normalized history; rebuild
            // through add_previous so invariants hold on read.
            Ok(DocumentRoutes::new(v1.current).with_previous(v1.previous))
        }
        other => Err(OutboxError::UnsupportedVersion(other)),
    }
}

impl Serialize for DocumentRoutes {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        RoutesV1::from(self).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for DocumentRoutes {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = serde_json::Value::deserialize(deserializer)?;
        decode_value(raw).map_err(serde::de::Error::custom)
    }
}
