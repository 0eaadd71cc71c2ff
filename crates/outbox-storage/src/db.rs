//! RocksDB wrapper for outbox storage.
//!
//! Provides:
//! - Database open/close with column family setup
//! - Atomic mutation batches (entity rows + outbox appends in one WriteBatch)
//! - Monotonic, never-reused outbox identifiers
//! - Single-key and range reads

use rocksdb::{ColumnFamily, Direction, IteratorMode, Options, WriteBatch, DB};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{debug, info};

use outbox_types::{DocumentRoutes, EntityKey, EventId, EventStatus, NewOutboxEvent, OutboxEvent};

use crate::batch::{BatchOp, MutationBatch, RouteUpdate};
use crate::column_families::{
    build_cf_descriptors, ALL_CF_NAMES, CF_CHECKPOINTS, CF_ENTITIES, CF_ENTITY_ROUTES, CF_OUTBOX,
    CF_OUTBOX_META,
};
use crate::error::StorageError;
use crate::keys::{CheckpointKey, EntityRowKey, OutboxKey, NEXT_SEQUENCE_KEY};

/// Main storage interface for the outbox pipeline.
///
/// All read-modify-write operations on outbox rows (append, claim, commit,
/// retry) run under `writes`, which makes each of them an atomic
/// conditional update from the point of view of every dispatcher sharing
/// this instance.
pub struct Storage {
    pub(crate) db: DB,
    /// Next outbox sequence to assign
    next_sequence: AtomicU64,
    writes: Mutex<()>,
}

impl Storage {
    /// Open storage at the given path, creating if necessary
    pub fn open(path: &Path) -> Result<Self, StorageError> {
        info!("Opening outbox storage at {:?}", path);

        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_background_jobs(4);

        let cf_descriptors = build_cf_descriptors();
        let db = DB::open_cf_descriptors(&db_opts, path, cf_descriptors)?;

        let next_sequence = Self::load_next_sequence(&db)?;
        debug!(next_sequence, "Restored outbox sequence");

        Ok(Self {
            db,
            next_sequence: AtomicU64::new(next_sequence),
            writes: Mutex::new(()),
        })
    }

    /// Load the next outbox sequence from the persisted high-water mark and
    /// the highest surviving key, whichever is larger.
    fn load_next_sequence(db: &DB) -> Result<u64, StorageError> {
        let meta = db
            .cf_handle(CF_OUTBOX_META)
            .ok_or_else(|| StorageError::ColumnFamilyNotFound(CF_OUTBOX_META.to_string()))?;
        let persisted = match db.get_cf(&meta, NEXT_SEQUENCE_KEY)? {
            Some(b) if b.len() == 8 => {
                let mut buf = [0u8; 8];
                buf.copy_from_slice(&b);
                u64::from_be_bytes(buf)
            }
            _ => 0,
        };

        let cf = db
            .cf_handle(CF_OUTBOX)
            .ok_or_else(|| StorageError::ColumnFamilyNotFound(CF_OUTBOX.to_string()))?;
        let mut iter = db.iterator_cf(&cf, IteratorMode::End);
        let from_keys = match iter.next() {
            Some(result) => {
                let (key, _) = result?;
                OutboxKey::from_bytes(&key)?.sequence + 1
            }
            None => 0,
        };

        Ok(persisted.max(from_keys))
    }

    pub(crate) fn cf(&self, name: &str) -> Result<&ColumnFamily, StorageError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StorageError::ColumnFamilyNotFound(name.to_string()))
    }

    pub(crate) fn lock_writes(&self) -> MutexGuard<'_, ()> {
        // The guard protects no data, so a poisoned lock is still usable.
        self.writes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start a new unit of work.
    pub fn begin(&self) -> MutationBatch {
        MutationBatch::new()
    }

    /// Commit a mutation batch atomically.
    ///
    /// Identifiers are assigned here, under the write lock, so they follow
    /// commit order rather than the order transactions were started in.
    /// Tracked appends read and advance route history under the same lock;
    /// later appends in the batch see what earlier ones recorded.
    /// Returns the ids of the appended outbox events in staging order.
    pub fn commit_batch(&self, batch: MutationBatch) -> Result<Vec<EventId>, StorageError> {
        if batch.is_empty() {
            return Ok(Vec::new());
        }

        let entities_cf = self.cf(CF_ENTITIES)?;
        let routes_cf = self.cf(CF_ENTITY_ROUTES)?;
        let outbox_cf = self.cf(CF_OUTBOX)?;
        let meta_cf = self.cf(CF_OUTBOX_META)?;

        let _guard = self.lock_writes();
        let now_ms = chrono::Utc::now().timestamp_millis();
        let mut next = self.next_sequence.load(Ordering::SeqCst);
        let mut ids = Vec::new();
        let mut write = WriteBatch::default();
        let mut staged_routes: HashMap<EntityKey, DocumentRoutes> = HashMap::new();

        for op in batch.ops {
            match op {
                BatchOp::PutEntity { key, value } => {
                    write.put_cf(&entities_cf, EntityRowKey::from(&key).to_bytes(), value);
                }
                BatchOp::DeleteEntity { key } => {
                    write.delete_cf(&entities_cf, EntityRowKey::from(&key).to_bytes());
                }
                BatchOp::Append(new_event) => {
                    if !new_event.routes.is_normalized() {
                        return Err(StorageError::InvalidRoutes(format!(
                            "{}#{}",
                            new_event.entity_type, new_event.entity_id
                        )));
                    }
                    let id = EventId(next);
                    next += 1;
                    let event = OutboxEvent::from_new(id, new_event, now_ms);
                    write.put_cf(&outbox_cf, OutboxKey::for_event(id).to_bytes(), event.to_bytes()?);
                    ids.push(id);
                }
                BatchOp::AppendTracked {
                    key,
                    mutation,
                    update,
                } => {
                    let recorded = match staged_routes.remove(&key) {
                        Some(routes) => Some(routes),
                        None => self.get_entity_routes(&key)?,
                    };
                    // History survives deletes so a recreated entity still
                    // purges the partitions it used to occupy.
                    let routes = match update {
                        RouteUpdate::MoveTo(current) => DocumentRoutes::advance(recorded.as_ref(), current),
                        RouteUpdate::Keep => recorded.unwrap_or_else(DocumentRoutes::unrouted),
                    };
                    write.put_cf(&routes_cf, EntityRowKey::from(&key).to_bytes(), routes.to_bytes()?);

                    let id = EventId(next);
                    next += 1;
                    let new_event =
                        NewOutboxEvent::new(&key.entity_type, &key.entity_id, mutation, routes.clone());
                    let event = OutboxEvent::from_new(id, new_event, now_ms);
                    write.put_cf(&outbox_cf, OutboxKey::for_event(id).to_bytes(), event.to_bytes()?);
                    ids.push(id);
                    staged_routes.insert(key, routes);
                }
            }
        }

        if !ids.is_empty() {
            write.put_cf(&meta_cf, NEXT_SEQUENCE_KEY, next.to_be_bytes());
        }

        self.db.write(write)?;
        self.next_sequence.store(next, Ordering::SeqCst);

        debug!(appended = ids.len(), next_sequence = next, "Committed mutation batch");
        Ok(ids)
    }

    /// Append a single outbox event in its own batch.
    pub fn append_event(&self, event: NewOutboxEvent) -> Result<EventId, StorageError> {
        let mut batch = MutationBatch::new();
        batch.append_event(event);
        self.commit_batch(batch)?
            .into_iter()
            .next()
            .ok_or_else(|| StorageError::NotFound("appended event id".to_string()))
    }

    // ==================== Outbox Reads ====================

    /// Get an outbox event by id.
    pub fn get_event(&self, id: EventId) -> Result<Option<OutboxEvent>, StorageError> {
        let cf = self.cf(CF_OUTBOX)?;
        match self.db.get_cf(&cf, OutboxKey::for_event(id).to_bytes())? {
            Some(bytes) => Ok(Some(OutboxEvent::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Get outbox events starting from an id, oldest first.
    pub fn scan_outbox(&self, start: EventId, limit: usize) -> Result<Vec<OutboxEvent>, StorageError> {
        let cf = self.cf(CF_OUTBOX)?;
        let start_key = OutboxKey::for_event(start);
        let iter = self.db.iterator_cf(
            &cf,
            IteratorMode::From(&start_key.to_bytes(), Direction::Forward),
        );

        let mut results = Vec::new();
        for item in iter.take(limit) {
            let (_, value) = item?;
            results.push(OutboxEvent::from_bytes(&value)?);
        }
        Ok(results)
    }

    /// Every outbox row, oldest first.
    pub fn all_events(&self) -> Result<Vec<OutboxEvent>, StorageError> {
        self.scan_outbox(EventId(0), usize::MAX)
    }

    /// Outbox rows with the given status, oldest first.
    pub fn events_with_status(&self, status: EventStatus) -> Result<Vec<OutboxEvent>, StorageError> {
        Ok(self
            .all_events()?
            .into_iter()
            .filter(|e| e.status == status)
            .collect())
    }

    /// Next identifier that will be assigned.
    pub fn next_event_id(&self) -> EventId {
        EventId(self.next_sequence.load(Ordering::SeqCst))
    }

    // ==================== Entity Reads ====================

    /// Get a primary entity row.
    pub fn get_entity(&self, key: &EntityKey) -> Result<Option<Vec<u8>>, StorageError> {
        let cf = self.cf(CF_ENTITIES)?;
        Ok(self.db.get_cf(&cf, EntityRowKey::from(key).to_bytes())?)
    }

    /// Get the last recorded route history of an entity.
    pub fn get_entity_routes(&self, key: &EntityKey) -> Result<Option<DocumentRoutes>, StorageError> {
        let cf = self.cf(CF_ENTITY_ROUTES)?;
        match self.db.get_cf(&cf, EntityRowKey::from(key).to_bytes())? {
            Some(bytes) => Ok(Some(DocumentRoutes::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    // ==================== Checkpoints ====================

    /// Store a checkpoint
    pub fn put_checkpoint(&self, job_name: &str, checkpoint_bytes: &[u8]) -> Result<(), StorageError> {
        let cf = self.cf(CF_CHECKPOINTS)?;
        let key = CheckpointKey::new(job_name);
        self.db.put_cf(&cf, key.to_bytes(), checkpoint_bytes)?;
        Ok(())
    }

    /// Get a checkpoint
    pub fn get_checkpoint(&self, job_name: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let cf = self.cf(CF_CHECKPOINTS)?;
        let key = CheckpointKey::new(job_name);
        Ok(self.db.get_cf(&cf, key.to_bytes())?)
    }

    // ===== Admin Operations =====

    /// Flush all column families to disk
    pub fn flush(&self) -> Result<(), StorageError> {
        for cf_name in ALL_CF_NAMES {
            if let Some(cf) = self.db.cf_handle(cf_name) {
                self.db.flush_cf(&cf)?;
            }
        }
        Ok(())
    }

    /// Trigger manual compaction on all column families.
    pub fn compact(&self) -> Result<(), StorageError> {
        info!("Starting full compaction...");
        for cf_name in ALL_CF_NAMES {
            if let Some(cf) = self.db.cf_handle(cf_name) {
                self.db.compact_range_cf::<&[u8], &[u8]>(&cf, None, None);
            }
        }
        info!("Compaction complete");
        Ok(())
    }

    /// Get database statistics.
    pub fn get_stats(&self) -> Result<StorageStats, StorageError> {
        let mut stats = StorageStats::default();

        if let Some(cf) = self.db.cf_handle(CF_ENTITIES) {
            stats.entity_count = self.count_cf_entries(cf)?;
        }
        if let Some(cf) = self.db.cf_handle(CF_OUTBOX) {
            stats.outbox_count = self.count_cf_entries(cf)?;
        }
        stats.next_event_id = self.next_event_id().0;
        stats.disk_usage_bytes = self.get_disk_usage();

        Ok(stats)
    }

    fn count_cf_entries(&self, cf: &ColumnFamily) -> Result<u64, StorageError> {
        let mut count = 0u64;
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            item?;
            count += 1;
        }
        Ok(count)
    }

    fn get_disk_usage(&self) -> u64 {
        let mut total_size = 0u64;
        if let Ok(entries) = std::fs::read_dir(self.db.path()) {
            for entry in entries.flatten() {
                if let Ok(metadata) = entry.metadata() {
                    total_size += metadata.len();
                }
            }
        }
        total_size
    }
}

/// Statistics about the storage.
#[derive(Debug, Default)]
pub struct StorageStats {
    /// Number of primary entity rows
    pub entity_count: u64,
    /// Number of outbox rows (any status)
    pub outbox_count: u64,
    /// Next identifier to be assigned
    pub next_event_id: u64,
    /// Total disk usage in bytes
    pub disk_usage_bytes: u64,
}
