//! Claim, commit and retry operations on outbox rows.
//!
//! Every operation here is a conditional read-modify-write executed under the
//! storage write lock and persisted with a single `WriteBatch`, so two
//! dispatchers sharing a [`Storage`] can never both own the same row.
//!
//! Ownership is checked by [`LeaseToken`]: a dispatcher whose lease has
//! expired and whose rows were re-claimed by someone else can no longer
//! delete or reschedule them.

use std::collections::{HashMap, HashSet};

use rocksdb::WriteBatch;
use tracing::{debug, info, warn};

use outbox_types::{
    EntityKey, EventId, EventStatus, Lease, LeaseToken, MutationType, OutboxEvent, WorkerId,
};

use crate::column_families::CF_OUTBOX;
use crate::db::Storage;
use crate::error::StorageError;
use crate::keys::OutboxKey;

/// Parameters of one claim attempt.
#[derive(Debug, Clone)]
pub struct ClaimRequest {
    /// Worker taking ownership
    pub owner: WorkerId,
    /// Token minted for this claim
    pub token: LeaseToken,
    /// Claim time, milliseconds since epoch
    pub now_ms: i64,
    /// Lease length in milliseconds
    pub lease_duration_ms: i64,
}

impl ClaimRequest {
    pub fn new(owner: WorkerId, now_ms: i64, lease_duration_ms: i64) -> Self {
        Self {
            owner,
            token: LeaseToken::new(),
            now_ms,
            lease_duration_ms,
        }
    }
}

/// Retry state to write back for one failed row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryUpdate {
    pub id: EventId,
    pub retry_count: u32,
    /// `true` moves the row to `FAILED`
    pub failed: bool,
    pub next_eligible_ms: i64,
    pub last_error: Option<String>,
}

/// Indexing lag snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutboxLag {
    pub pending: u64,
    pub processing: u64,
    pub failed: u64,
    /// Age of the oldest `PENDING` row, `None` when none is pending
    pub oldest_pending_age_ms: Option<i64>,
}

impl OutboxLag {
    /// Rows still waiting to reach the index.
    pub fn backlog(&self) -> u64 {
        self.pending + self.processing
    }
}

/// Select rows in identifier order, keeping per-entity ordering.
///
/// A row is selected when `accept` returns true, it is claimable at `now_ms`
/// and no older row of the same entity was left behind. Any other row that is
/// not `FAILED` blocks its entity for the rest of the scan, so a later event
/// can never overtake an earlier one that is still owned, backing off, or
/// filtered out. Stops once `limit` rows are selected.
pub fn select_in_order<'a, I, F>(rows: I, now_ms: i64, limit: usize, accept: F) -> Vec<&'a OutboxEvent>
where
    I: IntoIterator<Item = &'a OutboxEvent>,
    F: Fn(&OutboxEvent) -> bool,
{
    let mut blocked: HashSet<EntityKey> = HashSet::new();
    let mut selected = Vec::new();

    for row in rows {
        if selected.len() >= limit {
            break;
        }
        let key = row.entity_key();
        if !blocked.contains(&key) && accept(row) && row.is_claimable(now_ms) {
            selected.push(row);
        } else if row.status != EventStatus::Failed {
            blocked.insert(key);
        }
    }

    selected
}

impl Storage {
    /// Atomically claim the given rows.
    ///
    /// Only rows that are still claimable and not blocked by an older,
    /// unclaimable row of the same entity are taken. An empty result means
    /// another worker won the race.
    pub fn claim(
        &self,
        candidates: &[EventId],
        request: &ClaimRequest,
    ) -> Result<Vec<OutboxEvent>, StorageError> {
        let Some(max_id) = candidates.iter().max().copied() else {
            return Ok(Vec::new());
        };
        let wanted: HashSet<EventId> = candidates.iter().copied().collect();
        let cf = self.cf(CF_OUTBOX)?;

        let _guard = self.lock_writes();
        let rows: Vec<OutboxEvent> = self
            .all_events()?
            .into_iter()
            .take_while(|e| e.id <= max_id)
            .collect();

        let selected = select_in_order(&rows, request.now_ms, usize::MAX, |e| {
            wanted.contains(&e.id)
        });

        let mut claimed = Vec::with_capacity(selected.len());
        let mut batch = WriteBatch::default();
        for row in selected {
            let mut row = row.clone();
            if row.status == EventStatus::Processing {
                debug!(event_id = %row.id, "Reclaiming row with expired lease");
            }
            row.status = EventStatus::Processing;
            row.lease = Some(Lease {
                owner: request.owner.clone(),
                token: request.token,
                expires_at_ms: request.now_ms + request.lease_duration_ms,
            });
            batch.put_cf(&cf, OutboxKey::for_event(row.id).to_bytes(), row.to_bytes()?);
            claimed.push(row);
        }

        if !claimed.is_empty() {
            self.db.write(batch)?;
        }

        debug!(
            worker = %request.owner,
            requested = candidates.len(),
            claimed = claimed.len(),
            "Claim attempt"
        );
        Ok(claimed)
    }

    /// Delete rows still leased by `token`. Returns how many were deleted.
    pub fn complete(&self, ids: &[EventId], token: &LeaseToken) -> Result<usize, StorageError> {
        let cf = self.cf(CF_OUTBOX)?;
        let _guard = self.lock_writes();

        let mut batch = WriteBatch::default();
        let mut deleted = 0;
        for id in ids {
            match self.get_event(*id)? {
                Some(row) if row.is_leased_by(token) => {
                    batch.delete_cf(&cf, OutboxKey::for_event(*id).to_bytes());
                    deleted += 1;
                }
                _ => debug!(event_id = %id, "Skipping commit of row no longer leased"),
            }
        }

        if deleted > 0 {
            self.db.write(batch)?;
        }
        Ok(deleted)
    }

    /// Write retry state back to rows still leased by `token` and drop their
    /// lease.
    pub fn release_for_retry(
        &self,
        updates: &[RetryUpdate],
        token: &LeaseToken,
    ) -> Result<usize, StorageError> {
        let cf = self.cf(CF_OUTBOX)?;
        let _guard = self.lock_writes();

        let mut batch = WriteBatch::default();
        let mut updated = 0;
        for update in updates {
            let Some(mut row) = self.get_event(update.id)? else {
                continue;
            };
            if !row.is_leased_by(token) {
                debug!(event_id = %update.id, "Skipping retry update of row no longer leased");
                continue;
            }
            row.retry_count = update.retry_count;
            row.next_eligible_ms = update.next_eligible_ms;
            row.last_error = update.last_error.clone();
            row.lease = None;
            row.status = if update.failed {
                warn!(
                    event_id = %row.id,
                    entity = %row.entity_key(),
                    retry_count = row.retry_count,
                    "Outbox event exceeded retry ceiling"
                );
                EventStatus::Failed
            } else {
                EventStatus::Pending
            };
            batch.put_cf(&cf, OutboxKey::for_event(row.id).to_bytes(), row.to_bytes()?);
            updated += 1;
        }

        if updated > 0 {
            self.db.write(batch)?;
        }
        Ok(updated)
    }

    /// Give rows back without touching their retry state.
    pub fn release(&self, ids: &[EventId], token: &LeaseToken) -> Result<usize, StorageError> {
        let cf = self.cf(CF_OUTBOX)?;
        let _guard = self.lock_writes();

        let mut batch = WriteBatch::default();
        let mut released = 0;
        for id in ids {
            let Some(mut row) = self.get_event(*id)? else {
                continue;
            };
            if !row.is_leased_by(token) {
                continue;
            }
            row.status = EventStatus::Pending;
            row.lease = None;
            batch.put_cf(&cf, OutboxKey::for_event(row.id).to_bytes(), row.to_bytes()?);
            released += 1;
        }

        if released > 0 {
            self.db.write(batch)?;
        }
        Ok(released)
    }

    /// Move `FAILED` rows back to `PENDING` with a fresh retry budget.
    ///
    /// Newer events of the entity may already have been applied, so a reset
    /// row is rewritten to the entity's recorded state rather than replayed:
    /// an upsert of the live entity or a delete of a removed one, carrying
    /// the recorded route history plus the row's own routes. Rows of
    /// entities with no recorded history are requeued as they are.
    ///
    /// An empty `ids` slice resets every failed row.
    pub fn reset_failed(&self, ids: &[EventId]) -> Result<usize, StorageError> {
        let cf = self.cf(CF_OUTBOX)?;
        let _guard = self.lock_writes();

        let only: HashSet<EventId> = ids.iter().copied().collect();
        let mut batch = WriteBatch::default();
        let mut reset = 0;
        for mut row in self.all_events()? {
            if row.status != EventStatus::Failed || (!only.is_empty() && !only.contains(&row.id)) {
                continue;
            }
            let key = row.entity_key();
            if let Some(mut routes) = self.get_entity_routes(&key)? {
                routes.absorb(&row.routes);
                row.routes = routes;
                row.mutation = if self.get_entity(&key)?.is_some() {
                    MutationType::AddOrUpdate
                } else {
                    MutationType::Delete
                };
                debug!(
                    event_id = %row.id,
                    entity = %key,
                    mutation = %row.mutation,
                    route = %row.routes.current,
                    "Rebased failed event on recorded entity state"
                );
            }
            row.status = EventStatus::Pending;
            row.retry_count = 0;
            row.next_eligible_ms = 0;
            row.last_error = None;
            batch.put_cf(&cf, OutboxKey::for_event(row.id).to_bytes(), row.to_bytes()?);
            reset += 1;
        }

        if reset > 0 {
            self.db.write(batch)?;
            info!(count = reset, "Reset failed outbox events");
        }
        Ok(reset)
    }

    /// Count rows per status and the age of the oldest pending row.
    pub fn lag_stats(&self, now_ms: i64) -> Result<OutboxLag, StorageError> {
        let mut lag = OutboxLag::default();
        let mut oldest: Option<i64> = None;

        for row in self.all_events()? {
            match row.status {
                EventStatus::Pending => {
                    lag.pending += 1;
                    oldest = Some(oldest.map_or(row.created_at_ms, |o| o.min(row.created_at_ms)));
                }
                EventStatus::Processing => lag.processing += 1,
                EventStatus::Failed => lag.failed += 1,
            }
        }

        lag.oldest_pending_age_ms = oldest.map(|created| (now_ms - created).max(0));
        Ok(lag)
    }

    /// Per-status row counts, keyed by status.
    pub fn status_counts(&self) -> Result<HashMap<EventStatus, u64>, StorageError> {
        let mut counts = HashMap::new();
        for row in self.all_events()? {
            *counts.entry(row.status).or_insert(0) += 1;
        }
        Ok(counts)
    }
}
