//! End-to-end test infrastructure for the outbox pipeline.
//!
//! Provides a shared TestHarness that wires storage, the outbox writer and
//! an in-memory index together, plus helpers for driving dispatchers on a
//! controlled clock.

use std::sync::{Arc, Once};

use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use outbox_indexing::{
    CycleOutcome, Dispatcher, FieldRouting, InMemoryIndex, OutboxWriter, RoutingResolver,
};
use outbox_storage::Storage;
use outbox_types::{DispatchSettings, DocumentRoute, EntityKey, WorkerId};

/// Entity type routed by its `route` field.
pub const ROUTED: &str = "RoutedIndexedEntity";

/// Entity type that always lands in the default partition.
pub const PLAIN: &str = "PlainIndexedEntity";

static TRACING: Once = Once::new();

/// Install a fmt subscriber once per test binary. `RUST_LOG` overrides
/// the default `warn` level.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}

/// Shared test harness for E2E tests.
pub struct TestHarness {
    /// Keeps temp dir alive for the lifetime of the harness
    pub _temp_dir: tempfile::TempDir,
    pub storage: Arc<Storage>,
    pub index: Arc<InMemoryIndex>,
    pub writer: OutboxWriter,
}

impl TestHarness {
    pub fn new() -> Self {
        init_tracing();
        let temp_dir = tempfile::TempDir::new().expect("Failed to create temp dir");
        let storage =
            Arc::new(Storage::open(temp_dir.path()).expect("Failed to open test storage"));
        let writer = OutboxWriter::new(storage.clone(), resolver());

        Self {
            _temp_dir: temp_dir,
            storage,
            index: Arc::new(InMemoryIndex::new()),
            writer,
        }
    }

    /// Dispatcher over the harness storage and index.
    pub fn dispatcher(&self, worker: &str, settings: DispatchSettings) -> Dispatcher {
        Dispatcher::new(
            WorkerId::new(worker),
            self.storage.clone(),
            self.index.clone(),
            settings,
        )
    }

    /// Number of rows still in the outbox, any status.
    pub fn outbox_len(&self) -> usize {
        self.storage
            .all_events()
            .expect("Failed to read outbox")
            .len()
    }

    /// Routes under which the index holds a document for the entity.
    pub fn indexed_routes(&self, entity_type: &str, entity_id: &str) -> Vec<DocumentRoute> {
        self.index
            .routes_of(&EntityKey::new(entity_type, entity_id))
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}

/// Resolver used by every harness: [`ROUTED`] by field, the rest unrouted.
pub fn resolver() -> RoutingResolver {
    RoutingResolver::new().with_strategy(ROUTED, Arc::new(FieldRouting::new("route")))
}

/// Entity state that routes to `route`.
pub fn routed(route: &str) -> Value {
    json!({ "route": route, "title": format!("document in {}", route) })
}

/// Entity state for an unrouted entity.
pub fn plain(title: &str) -> Value {
    json!({ "title": title })
}

/// Settings with no backoff jitter and a small batch, for predictable tests.
pub fn test_settings() -> DispatchSettings {
    DispatchSettings::default()
        .with_batch_size(10)
        .with_backoff(100, 10_000, 0.0)
        .with_lease_duration_ms(5_000)
}

/// Run cycles at a fixed clock until one makes no progress.
pub async fn drain_at(dispatcher: &Dispatcher, now_ms: i64, max_cycles: usize) -> Vec<CycleOutcome> {
    let cancel = CancellationToken::new();
    let mut outcomes = Vec::new();
    for _ in 0..max_cycles {
        let outcome = dispatcher.run_cycle_at(now_ms, &cancel).await;
        let progressed = outcome.made_progress();
        outcomes.push(outcome);
        if !progressed {
            break;
        }
    }
    outcomes
}
