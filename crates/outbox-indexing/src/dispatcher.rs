//! Outbox dispatcher.
//!
//! One cycle walks `Idle → Claiming → Coalescing → Submitting → Committing
//! | Retrying → Idle`:
//!
//! 1. the finder proposes a batch and the dispatcher claims it under a fresh
//!    lease token (zero rows claimed means another worker won; the cycle
//!    ends quietly)
//! 2. the claimed events are coalesced into one operation per entity
//! 3. the operations go to the sink as one batch
//! 4. on success the claimed rows are deleted; on failure each row gets its
//!    retry count bumped, or is parked as `FAILED` at the ceiling
//!
//! Transient errors stop at this boundary: they are logged, counted in
//! [`DispatcherStats`], and reported as [`CycleOutcome::TransientFailure`].
//! Cancellation observed before submission releases the claim; once the
//! batch is handed to the sink the cycle runs to completion.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use outbox_storage::{ClaimRequest, OutboxLag, Storage};
use outbox_types::{DispatchSettings, EventId, IndexOperation, OutboxEvent, WorkerId};

use crate::checkpoint::DispatchCheckpoint;
use crate::coalesce::Coalescer;
use crate::error::IndexingError;
use crate::finder::{DefaultEventFinder, EventFinder};
use crate::retry::{RetryController, RetryPolicy};
use crate::sink::IndexSink;

/// Current wall-clock time in milliseconds since epoch.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Where a dispatcher is in its cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DispatcherState {
    #[default]
    Idle,
    Claiming,
    Coalescing,
    Submitting,
    Committing,
    Retrying,
}

/// Result of one cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Nothing to do (or processing disabled)
    Idle,
    /// Every candidate was taken by another worker
    ClaimConflict,
    /// Batch applied and its events deleted
    Committed { events: usize, operations: usize },
    /// Sink rejected the batch; `failed` events reached the retry ceiling
    Retried { retried: usize, failed: usize },
    /// Storage trouble; retried on a later cycle
    TransientFailure(String),
    /// Cancelled before submission; claim released
    Aborted,
}

impl CycleOutcome {
    /// Whether another cycle straight away could make progress.
    pub fn made_progress(&self) -> bool {
        matches!(self, CycleOutcome::Committed { .. } | CycleOutcome::Retried { .. })
    }
}

/// Running counters for one dispatcher, readable for metrics.
#[derive(Debug, Default)]
pub struct DispatcherStats {
    cycles: AtomicU64,
    committed_events: AtomicU64,
    submitted_operations: AtomicU64,
    retried_events: AtomicU64,
    failed_events: AtomicU64,
    transient_errors: AtomicU64,
    claim_conflicts: AtomicU64,
    aborted: AtomicU64,
}

/// Point-in-time copy of [`DispatcherStats`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub cycles: u64,
    pub committed_events: u64,
    pub submitted_operations: u64,
    pub retried_events: u64,
    pub failed_events: u64,
    pub transient_errors: u64,
    pub claim_conflicts: u64,
    pub aborted: u64,
}

impl DispatcherStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            cycles: self.cycles.load(Ordering::Relaxed),
            committed_events: self.committed_events.load(Ordering::Relaxed),
            submitted_operations: self.submitted_operations.load(Ordering::Relaxed),
            retried_events: self.retried_events.load(Ordering::Relaxed),
            failed_events: self.failed_events.load(Ordering::Relaxed),
            transient_errors: self.transient_errors.load(Ordering::Relaxed),
            claim_conflicts: self.claim_conflicts.load(Ordering::Relaxed),
            aborted: self.aborted.load(Ordering::Relaxed),
        }
    }

    fn add(counter: &AtomicU64, n: usize) {
        counter.fetch_add(n as u64, Ordering::Relaxed);
    }
}

/// Claims, coalesces, submits and retires outbox events.
pub struct Dispatcher {
    worker: WorkerId,
    storage: Arc<Storage>,
    finder: Arc<dyn EventFinder>,
    sink: Arc<dyn IndexSink>,
    coalescer: Coalescer,
    retry: RetryController,
    settings: DispatchSettings,
    state: Mutex<DispatcherState>,
    checkpoint: Mutex<DispatchCheckpoint>,
    stats: DispatcherStats,
}

impl Dispatcher {
    /// Create a dispatcher reading candidates straight from storage.
    pub fn new(
        worker: WorkerId,
        storage: Arc<Storage>,
        sink: Arc<dyn IndexSink>,
        settings: DispatchSettings,
    ) -> Self {
        let finder: Arc<dyn EventFinder> = Arc::new(DefaultEventFinder::new(storage.clone()));
        Self {
            checkpoint: Mutex::new(DispatchCheckpoint::new(worker.clone())),
            retry: RetryController::new(RetryPolicy::from_settings(&settings)),
            worker,
            storage,
            finder,
            sink,
            coalescer: Coalescer::new(),
            settings,
            state: Mutex::new(DispatcherState::Idle),
            stats: DispatcherStats::default(),
        }
    }

    /// Replace the event finder.
    pub fn with_finder(mut self, finder: Arc<dyn EventFinder>) -> Self {
        self.finder = finder;
        self
    }

    pub fn worker(&self) -> &WorkerId {
        &self.worker
    }

    pub fn settings(&self) -> &DispatchSettings {
        &self.settings
    }

    pub fn state(&self) -> DispatcherState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn checkpoint(&self) -> DispatchCheckpoint {
        self.checkpoint
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Indexing lag as seen from storage.
    pub fn lag(&self) -> Result<OutboxLag, IndexingError> {
        Ok(self.storage.lag_stats(now_ms())?)
    }

    fn set_state(&self, state: DispatcherState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
        debug!(worker = %self.worker, state = ?state, "Dispatcher state");
    }

    /// Load this worker's checkpoint from storage.
    pub fn load_checkpoint(&self) -> Result<(), IndexingError> {
        let key = DispatchCheckpoint::key_for(&self.worker);
        if let Some(bytes) = self.storage.get_checkpoint(&key)? {
            let checkpoint = DispatchCheckpoint::from_bytes(&bytes)?;
            info!(
                worker = %self.worker,
                last_committed = ?checkpoint.last_committed,
                processed = checkpoint.processed_count,
                "Loaded checkpoint"
            );
            *self.checkpoint.lock().unwrap_or_else(PoisonError::into_inner) = checkpoint;
        } else {
            debug!(worker = %self.worker, "No existing checkpoint");
        }
        Ok(())
    }

    fn save_checkpoint(&self, update: impl FnOnce(&mut DispatchCheckpoint)) {
        let bytes = {
            let mut checkpoint = self.checkpoint.lock().unwrap_or_else(PoisonError::into_inner);
            update(&mut checkpoint);
            checkpoint.to_bytes()
        };
        let result = bytes.and_then(|bytes| {
            self.storage
                .put_checkpoint(&DispatchCheckpoint::key_for(&self.worker), &bytes)
                .map_err(IndexingError::from)
        });
        if let Err(e) = result {
            // The outbox is authoritative; a stale checkpoint only skews reporting
            warn!(worker = %self.worker, error = %e, "Failed to save checkpoint");
        }
    }

    /// Run one cycle at the current time.
    pub async fn run_cycle(&self, cancel: &CancellationToken) -> CycleOutcome {
        self.run_cycle_at(now_ms(), cancel).await
    }

    /// Run one cycle as if the clock read `now_ms`.
    pub async fn run_cycle_at(&self, now_ms: i64, cancel: &CancellationToken) -> CycleOutcome {
        if !self.settings.processing_enabled {
            return CycleOutcome::Idle;
        }
        if cancel.is_cancelled() {
            return CycleOutcome::Aborted;
        }

        self.stats.cycles.fetch_add(1, Ordering::Relaxed);
        let outcome = self.cycle(now_ms, cancel).await;
        self.set_state(DispatcherState::Idle);

        match &outcome {
            CycleOutcome::TransientFailure(reason) => {
                self.stats.transient_errors.fetch_add(1, Ordering::Relaxed);
                warn!(worker = %self.worker, reason = %reason, "Dispatch cycle hit a transient error");
            }
            CycleOutcome::ClaimConflict => {
                self.stats.claim_conflicts.fetch_add(1, Ordering::Relaxed);
                debug!(worker = %self.worker, "Batch taken by another worker");
            }
            CycleOutcome::Aborted => {
                self.stats.aborted.fetch_add(1, Ordering::Relaxed);
            }
            _ => {}
        }
        outcome
    }

    async fn cycle(&self, now_ms: i64, cancel: &CancellationToken) -> CycleOutcome {
        self.set_state(DispatcherState::Claiming);
        let candidates = match self.finder.select(self.settings.batch_size, now_ms) {
            Ok(candidates) => candidates,
            Err(e) => return CycleOutcome::TransientFailure(e.to_string()),
        };
        if candidates.is_empty() {
            return CycleOutcome::Idle;
        }

        let ids: Vec<EventId> = candidates.iter().map(|e| e.id).collect();
        let request = ClaimRequest::new(
            self.worker.clone(),
            now_ms,
            self.settings.lease_duration_ms as i64,
        );
        let claimed = match self.storage.claim(&ids, &request) {
            Ok(claimed) => claimed,
            Err(e) => return CycleOutcome::TransientFailure(e.to_string()),
        };
        if claimed.is_empty() {
            return CycleOutcome::ClaimConflict;
        }
        let claimed_ids: Vec<EventId> = claimed.iter().map(|e| e.id).collect();

        if cancel.is_cancelled() {
            return self.abort(&claimed_ids, &request);
        }

        self.set_state(DispatcherState::Coalescing);
        let operations = self.coalescer.coalesce(&claimed);

        if cancel.is_cancelled() {
            return self.abort(&claimed_ids, &request);
        }

        self.set_state(DispatcherState::Submitting);
        debug!(
            worker = %self.worker,
            sink = self.sink.name(),
            events = claimed.len(),
            operations = operations.len(),
            "Submitting batch"
        );
        match self.sink.apply(&operations).await {
            Ok(()) => self.commit(&claimed_ids, &operations, &request),
            Err(e) => self.reschedule(&claimed, &request, now_ms, &e.to_string()),
        }
    }

    fn abort(&self, ids: &[EventId], request: &ClaimRequest) -> CycleOutcome {
        match self.storage.release(ids, &request.token) {
            Ok(released) => {
                info!(worker = %self.worker, released, "Cycle cancelled, claim released");
                CycleOutcome::Aborted
            }
            // The lease still expires on its own
            Err(e) => CycleOutcome::TransientFailure(e.to_string()),
        }
    }

    fn commit(
        &self,
        ids: &[EventId],
        operations: &[IndexOperation],
        request: &ClaimRequest,
    ) -> CycleOutcome {
        self.set_state(DispatcherState::Committing);
        let deleted = match self.storage.complete(ids, &request.token) {
            Ok(deleted) => deleted,
            // Rows stay leased; once the lease expires they are resubmitted
            Err(e) => return CycleOutcome::TransientFailure(e.to_string()),
        };
        if deleted < ids.len() {
            warn!(
                worker = %self.worker,
                claimed = ids.len(),
                deleted,
                "Lease lost before commit, remaining events will be resubmitted"
            );
        }

        DispatcherStats::add(&self.stats.committed_events, deleted);
        DispatcherStats::add(&self.stats.submitted_operations, operations.len());
        self.save_checkpoint(|c| c.record_commit(ids.iter().max().copied(), deleted as u64));

        info!(
            worker = %self.worker,
            events = deleted,
            operations = operations.len(),
            "Committed batch"
        );
        CycleOutcome::Committed {
            events: deleted,
            operations: operations.len(),
        }
    }

    fn reschedule(
        &self,
        claimed: &[OutboxEvent],
        request: &ClaimRequest,
        now_ms: i64,
        error: &str,
    ) -> CycleOutcome {
        self.set_state(DispatcherState::Retrying);
        warn!(worker = %self.worker, events = claimed.len(), error = %error, "Sink rejected batch");

        let updates = self.retry.updates_for(claimed, now_ms, error);
        let failed = updates.iter().filter(|u| u.failed).count();
        if let Err(e) = self.storage.release_for_retry(&updates, &request.token) {
            return CycleOutcome::TransientFailure(e.to_string());
        }

        let retried = updates.len() - failed;
        DispatcherStats::add(&self.stats.retried_events, retried);
        DispatcherStats::add(&self.stats.failed_events, failed);
        if failed > 0 {
            self.save_checkpoint(|c| c.record_failed(failed as u64));
        }
        CycleOutcome::Retried { retried, failed }
    }

    /// Run cycles until one makes no progress, or `max_cycles` have run.
    pub async fn run_until_idle(
        &self,
        cancel: &CancellationToken,
        max_cycles: usize,
    ) -> Vec<CycleOutcome> {
        let mut outcomes = Vec::new();
        for _ in 0..max_cycles {
            let outcome = self.run_cycle(cancel).await;
            let progressed = outcome.made_progress();
            outcomes.push(outcome);
            if !progressed {
                break;
            }
        }
        outcomes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::InMemoryIndex;
    use outbox_types::{
        DocumentRoutes, EventStatus, IndexOperationKind, MutationType, NewOutboxEvent,
    };
    use tempfile::TempDir;

    struct Fixture {
        storage: Arc<Storage>,
        index: Arc<InMemoryIndex>,
        _temp: TempDir,
    }

    fn fixture() -> Fixture {
        let temp = TempDir::new().unwrap();
        let storage = Arc::new(Storage::open(temp.path()).unwrap());
        Fixture {
            storage,
            index: Arc::new(InMemoryIndex::new()),
            _temp: temp,
        }
    }

    fn settings() -> DispatchSettings {
        DispatchSettings::default()
            .with_backoff(0, 0, 0.0)
            .with_lease_duration_ms(1_000)
    }

    fn dispatcher(f: &Fixture, settings: DispatchSettings) -> Dispatcher {
        Dispatcher::new(
            WorkerId::new("w1"),
            f.storage.clone(),
            f.index.clone(),
            settings,
        )
    }

    fn append(storage: &Storage, id: &str, mutation: MutationType) -> EventId {
        storage
            .append_event(NewOutboxEvent::new(
                "IndexedEntity",
                id,
                mutation,
                DocumentRoutes::unrouted(),
            ))
            .unwrap()
    }

    struct BrokenFinder;

    impl EventFinder for BrokenFinder {
        fn select(&self, _: usize, _: i64) -> Result<Vec<OutboxEvent>, IndexingError> {
            Err(IndexingError::TransientRead("storage offline".to_string()))
        }
    }

    #[tokio::test]
    async fn test_empty_outbox_is_idle() {
        let f = fixture();
        let d = dispatcher(&f, settings());
        assert_eq!(d.run_cycle(&CancellationToken::new()).await, CycleOutcome::Idle);
        assert_eq!(d.state(), DispatcherState::Idle);
    }

    #[tokio::test]
    async fn test_commit_deletes_events() {
        let f = fixture();
        append(&f.storage, "1", MutationType::Add);
        append(&f.storage, "1", MutationType::AddOrUpdate);
        append(&f.storage, "2", MutationType::Add);

        let d = dispatcher(&f, settings());
        let outcome = d.run_cycle(&CancellationToken::new()).await;
        assert_eq!(
            outcome,
            CycleOutcome::Committed {
                events: 3,
                operations: 2
            }
        );
        assert!(f.storage.all_events().unwrap().is_empty());

        let ops = f.index.operations();
        assert_eq!(ops[0].kind, IndexOperationKind::AddOrUpdate);
        assert_eq!(ops[1].kind, IndexOperationKind::Add);

        let stats = d.stats();
        assert_eq!(stats.committed_events, 3);
        assert_eq!(stats.submitted_operations, 2);
        assert_eq!(d.checkpoint().last_committed, Some(EventId(2)));
    }

    #[tokio::test]
    async fn test_sink_failure_retries_then_fails() {
        let f = fixture();
        let id = append(&f.storage, "1", MutationType::Add);
        f.index.fail_next(usize::MAX);

        let d = dispatcher(&f, settings().with_retry_ceiling(3));
        let cancel = CancellationToken::new();

        assert_eq!(
            d.run_cycle_at(0, &cancel).await,
            CycleOutcome::Retried { retried: 1, failed: 0 }
        );
        assert_eq!(
            d.run_cycle_at(1, &cancel).await,
            CycleOutcome::Retried { retried: 1, failed: 0 }
        );
        assert_eq!(
            d.run_cycle_at(2, &cancel).await,
            CycleOutcome::Retried { retried: 0, failed: 1 }
        );
        assert_eq!(d.run_cycle_at(3, &cancel).await, CycleOutcome::Idle);

        let row = f.storage.get_event(id).unwrap().unwrap();
        assert_eq!(row.status, EventStatus::Failed);
        assert_eq!(row.retry_count, 3);
        assert_eq!(row.last_error.as_deref(), Some("Batch rejected: injected failure"));
        assert_eq!(d.stats().failed_events, 1);
    }

    #[tokio::test]
    async fn test_backoff_delays_next_claim() {
        let f = fixture();
        append(&f.storage, "1", MutationType::Add);
        f.index.fail_next(1);

        let d = dispatcher(&f, settings().with_backoff(500, 500, 0.0));
        let cancel = CancellationToken::new();

        assert!(matches!(d.run_cycle_at(0, &cancel).await, CycleOutcome::Retried { .. }));
        assert_eq!(d.run_cycle_at(499, &cancel).await, CycleOutcome::Idle);
        assert!(matches!(
            d.run_cycle_at(500, &cancel).await,
            CycleOutcome::Committed { events: 1, .. }
        ));
    }

    #[tokio::test]
    async fn test_processing_disabled_leaves_events() {
        let f = fixture();
        append(&f.storage, "1", MutationType::Add);

        let d = dispatcher(&f, settings().with_processing_enabled(false));
        assert_eq!(d.run_cycle(&CancellationToken::new()).await, CycleOutcome::Idle);
        assert_eq!(f.storage.all_events().unwrap().len(), 1);
        assert_eq!(f.index.attempt_count(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_before_start_is_aborted() {
        let f = fixture();
        append(&f.storage, "1", MutationType::Add);

        let d = dispatcher(&f, settings());
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert_eq!(d.run_cycle(&cancel).await, CycleOutcome::Aborted);

        let row = &f.storage.all_events().unwrap()[0];
        assert_eq!(row.status, EventStatus::Pending);
        assert!(row.lease.is_none());
    }

    #[tokio::test]
    async fn test_transient_read_error_is_swallowed() {
        let f = fixture();
        let d = dispatcher(&f, settings()).with_finder(Arc::new(BrokenFinder));

        let outcome = d.run_cycle(&CancellationToken::new()).await;
        assert!(matches!(outcome, CycleOutcome::TransientFailure(_)));
        assert_eq!(d.stats().transient_errors, 1);
        assert_eq!(d.state(), DispatcherState::Idle);
    }

    #[tokio::test]
    async fn test_run_until_idle_drains_in_batches() {
        let f = fixture();
        for i in 0..5 {
            append(&f.storage, &i.to_string(), MutationType::Add);
        }

        let d = dispatcher(&f, settings().with_batch_size(2));
        let outcomes = d.run_until_idle(&CancellationToken::new(), 10).await;

        assert_eq!(outcomes.len(), 4);
        assert_eq!(outcomes.last(), Some(&CycleOutcome::Idle));
        assert_eq!(f.index.batches().len(), 3);
        assert!(f.storage.all_events().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_checkpoint_persisted_and_reloaded() {
        let f = fixture();
        append(&f.storage, "1", MutationType::Add);

        let d = dispatcher(&f, settings());
        d.run_cycle(&CancellationToken::new()).await;

        let reloaded = dispatcher(&f, settings());
        reloaded.load_checkpoint().unwrap();
        assert_eq!(reloaded.checkpoint().processed_count, 1);
        assert_eq!(reloaded.checkpoint().last_committed, Some(EventId(0)));
    }
}
