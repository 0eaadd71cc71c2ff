//! Failure paths: sink rejections, retry ceiling, crashes between submit
//! and commit, operator resets.

use std::sync::Arc;

use pretty_assertions::assert_eq;

use e2e_tests::{drain_at, routed, test_settings, TestHarness, ROUTED};
use outbox_indexing::{
    Coalescer, CycleOutcome, FilteringEventFinder, SuppressionFilter,
};
use outbox_storage::ClaimRequest;
use outbox_types::{DocumentRoute, EventStatus, IndexOperationKind, WorkerId};
use tokio_util::sync::CancellationToken;

/// A sink that keeps failing parks the event as FAILED after the ceiling,
/// and FAILED events are never claimed again.
#[tokio::test]
async fn test_retry_ceiling_parks_event() {
    let harness = TestHarness::new();
    let id = harness.writer.insert(ROUTED, "1", &routed("A")).unwrap();
    harness.index.fail_next(100);

    let dispatcher = harness.dispatcher("w1", test_settings().with_retry_ceiling(3));
    let cancel = CancellationToken::new();

    assert_eq!(
        dispatcher.run_cycle_at(0, &cancel).await,
        CycleOutcome::Retried { retried: 1, failed: 0 }
    );
    let row = harness.storage.get_event(id).unwrap().unwrap();
    assert_eq!(row.retry_count, 1);
    assert_eq!(row.status, EventStatus::Pending);
    assert_eq!(row.next_eligible_ms, 100);
    assert_eq!(row.last_error.as_deref(), Some("Batch rejected: injected failure"));

    // Still backing off
    assert_eq!(dispatcher.run_cycle_at(50, &cancel).await, CycleOutcome::Idle);

    assert_eq!(
        dispatcher.run_cycle_at(1_000, &cancel).await,
        CycleOutcome::Retried { retried: 1, failed: 0 }
    );
    assert_eq!(
        harness.storage.get_event(id).unwrap().unwrap().next_eligible_ms,
        1_200
    );

    assert_eq!(
        dispatcher.run_cycle_at(2_000, &cancel).await,
        CycleOutcome::Retried { retried: 0, failed: 1 }
    );
    let row = harness.storage.get_event(id).unwrap().unwrap();
    assert_eq!(row.status, EventStatus::Failed);
    assert_eq!(row.retry_count, 3);
    assert!(row.lease.is_none());

    // Fourth attempt never happens
    let attempts = harness.index.attempt_count();
    assert_eq!(dispatcher.run_cycle_at(1_000_000, &cancel).await, CycleOutcome::Idle);
    assert_eq!(harness.index.attempt_count(), attempts);

    let lag = dispatcher.lag().unwrap();
    assert_eq!(lag.failed, 1);
    assert_eq!(lag.backlog(), 0);

    let stats = dispatcher.stats();
    assert_eq!(stats.retried_events, 2);
    assert_eq!(stats.failed_events, 1);
    assert_eq!(dispatcher.checkpoint().failed_count, 1);
}

/// A FAILED event does not hold back later events of its entity.
#[tokio::test]
async fn test_failed_event_does_not_block_entity() {
    let harness = TestHarness::new();
    harness.writer.insert(ROUTED, "1", &routed("A")).unwrap();
    harness.index.fail_next(1);

    let dispatcher = harness.dispatcher("w1", test_settings().with_retry_ceiling(1));
    assert_eq!(
        drain_at(&dispatcher, 0, 5).await,
        vec![
            CycleOutcome::Retried { retried: 0, failed: 1 },
            CycleOutcome::Idle
        ]
    );

    harness.writer.update(ROUTED, "1", &routed("B")).unwrap();
    let outcomes = drain_at(&dispatcher, 10, 5).await;
    assert_eq!(
        outcomes[0],
        CycleOutcome::Committed { events: 1, operations: 1 }
    );

    // The later event still carries A as history, so the index is clean
    assert_eq!(harness.indexed_routes(ROUTED, "1"), vec![DocumentRoute::of("B")]);
    assert_eq!(harness.storage.events_with_status(EventStatus::Failed).unwrap().len(), 1);
}

/// Operator reset gives FAILED events a fresh budget.
#[tokio::test]
async fn test_reset_failed_requeues() {
    let harness = TestHarness::new();
    harness.writer.insert(ROUTED, "1", &routed("A")).unwrap();
    harness.writer.insert(ROUTED, "2", &routed("A")).unwrap();
    harness.index.fail_next(1);

    let dispatcher = harness.dispatcher("w1", test_settings().with_retry_ceiling(1));
    drain_at(&dispatcher, 0, 5).await;
    assert_eq!(harness.storage.events_with_status(EventStatus::Failed).unwrap().len(), 2);

    assert_eq!(harness.storage.reset_failed(&[]).unwrap(), 2);
    let pending = harness.storage.events_with_status(EventStatus::Pending).unwrap();
    assert_eq!(pending.len(), 2);
    assert!(pending.iter().all(|e| e.retry_count == 0 && e.last_error.is_none()));

    drain_at(&dispatcher, 10, 5).await;
    assert_eq!(harness.outbox_len(), 0);
    assert_eq!(harness.index.document_count(), 2);
}

/// Resetting an event that a newer one already superseded must not bring
/// the old document back next to the current one.
#[tokio::test]
async fn test_reset_failed_after_newer_commit() {
    let harness = TestHarness::new();
    let stale = harness.writer.insert(ROUTED, "1", &routed("A")).unwrap();
    harness.index.fail_next(1);

    let dispatcher = harness.dispatcher("w1", test_settings().with_retry_ceiling(1));
    drain_at(&dispatcher, 0, 5).await;
    assert_eq!(
        harness.storage.get_event(stale).unwrap().unwrap().status,
        EventStatus::Failed
    );

    harness.writer.update(ROUTED, "1", &routed("B")).unwrap();
    drain_at(&dispatcher, 10, 5).await;
    assert_eq!(harness.indexed_routes(ROUTED, "1"), vec![DocumentRoute::of("B")]);

    assert_eq!(harness.storage.reset_failed(&[]).unwrap(), 1);
    let outcomes = drain_at(&dispatcher, 20, 5).await;
    assert_eq!(
        outcomes[0],
        CycleOutcome::Committed { events: 1, operations: 1 }
    );

    let last = harness.index.operations().pop().unwrap();
    assert_eq!(last.kind, IndexOperationKind::AddOrUpdate);
    assert_eq!(last.current_route, DocumentRoute::of("B"));
    assert_eq!(harness.indexed_routes(ROUTED, "1"), vec![DocumentRoute::of("B")]);
    assert_eq!(harness.index.document_count(), 1);
    assert_eq!(harness.outbox_len(), 0);
}

/// A reset event of an entity deleted in the meantime replays as a delete.
#[tokio::test]
async fn test_reset_failed_after_delete() {
    let harness = TestHarness::new();
    harness.writer.insert(ROUTED, "1", &routed("A")).unwrap();
    harness.index.fail_next(1);

    let dispatcher = harness.dispatcher("w1", test_settings().with_retry_ceiling(1));
    drain_at(&dispatcher, 0, 5).await;

    harness.writer.delete(ROUTED, "1").unwrap();
    drain_at(&dispatcher, 10, 5).await;

    harness.storage.reset_failed(&[]).unwrap();
    drain_at(&dispatcher, 20, 5).await;

    let last = harness.index.operations().pop().unwrap();
    assert_eq!(last.kind, IndexOperationKind::Delete);
    assert_eq!(harness.index.document_count(), 0);
    assert_eq!(harness.outbox_len(), 0);
}

/// A worker that dies after the sink applied its batch but before commit
/// leaves the rows leased. Once the lease expires another worker resubmits
/// them, and the index ends up the same.
#[tokio::test]
async fn test_crash_between_submit_and_commit() {
    let harness = TestHarness::new();
    harness.writer.insert(ROUTED, "1", &routed("A")).unwrap();
    harness.writer.update(ROUTED, "1", &routed("B")).unwrap();
    let ids: Vec<_> = harness.storage.all_events().unwrap().iter().map(|e| e.id).collect();

    // The doomed worker claims and submits, then never commits
    let request = ClaimRequest::new(WorkerId::new("crashed"), 1_000, 5_000);
    let claimed = harness.storage.claim(&ids, &request).unwrap();
    assert_eq!(claimed.len(), 2);
    let ops = Coalescer::new().coalesce(&claimed);
    harness.index.apply_now(&ops).unwrap();
    let after_first = harness.index.snapshot();

    let survivor = harness.dispatcher("survivor", test_settings());
    assert_eq!(drain_at(&survivor, 3_000, 5).await, vec![CycleOutcome::Idle]);
    assert_eq!(harness.outbox_len(), 2);

    let outcomes = drain_at(&survivor, 6_000, 5).await;
    assert_eq!(
        outcomes[0],
        CycleOutcome::Committed { events: 2, operations: 1 }
    );
    assert_eq!(harness.index.snapshot(), after_first);
    assert_eq!(harness.index.batches().len(), 2);
    assert_eq!(harness.outbox_len(), 0);

    // The stale token can no longer commit anything
    assert_eq!(harness.storage.complete(&ids, &request.token).unwrap(), 0);
}

/// Cancellation before submission hands the claim back untouched.
#[tokio::test]
async fn test_cancelled_cycle_leaves_event_pending() {
    let harness = TestHarness::new();
    harness.writer.insert(ROUTED, "1", &routed("A")).unwrap();

    let dispatcher = harness.dispatcher("w1", test_settings());
    let cancel = CancellationToken::new();
    cancel.cancel();
    assert_eq!(dispatcher.run_cycle_at(1_000, &cancel).await, CycleOutcome::Aborted);

    let row = &harness.storage.all_events().unwrap()[0];
    assert_eq!(row.status, EventStatus::Pending);
    assert_eq!(row.retry_count, 0);
    assert_eq!(harness.index.attempt_count(), 0);
}

/// Suppressed events hold back their entity but not others.
#[tokio::test]
async fn test_suppressed_event_blocks_its_entity() {
    let harness = TestHarness::new();
    let hidden = harness.writer.insert(ROUTED, "1", &routed("A")).unwrap();
    let behind = harness.writer.update(ROUTED, "1", &routed("B")).unwrap();
    let other = harness.writer.insert(ROUTED, "2", &routed("A")).unwrap();

    let filter = Arc::new(SuppressionFilter::new());
    filter.show_only([behind, other]);
    let finder = Arc::new(FilteringEventFinder::new(harness.storage.clone(), filter.clone()));
    let dispatcher = harness
        .dispatcher("w1", test_settings())
        .with_finder(finder);

    drain_at(&dispatcher, 1_000, 5).await;
    let ops = harness.index.operations();
    assert_eq!(ops.len(), 1);
    assert_eq!(ops[0].entity_id, "2");
    assert_eq!(ops[0].kind, IndexOperationKind::Add);

    let remaining: Vec<_> = harness.storage.all_events().unwrap().iter().map(|e| e.id).collect();
    assert_eq!(remaining, vec![hidden, behind]);

    filter.show_all();
    drain_at(&dispatcher, 2_000, 5).await;
    assert_eq!(harness.outbox_len(), 0);
    assert_eq!(harness.indexed_routes(ROUTED, "1"), vec![DocumentRoute::of("B")]);
}
