//! Column family definitions for RocksDB.
//!
//! Each column family isolates data with different access patterns:
//! - entities: primary entity rows written by the mutating side
//! - entity_routes: last recorded routing descriptor per entity
//! - outbox: pending/processing/failed outbox events keyed by id
//! - outbox_meta: sequence high-water mark
//! - checkpoints: dispatcher progress checkpoints

use rocksdb::{ColumnFamilyDescriptor, Options};

/// Column family name for primary entity rows
pub const CF_ENTITIES: &str = "entities";

/// Column family name for per-entity route history
pub const CF_ENTITY_ROUTES: &str = "entity_routes";

/// Column family name for outbox events
pub const CF_OUTBOX: &str = "outbox";

/// Column family name for outbox metadata
pub const CF_OUTBOX_META: &str = "outbox_meta";

/// Column family name for dispatcher checkpoints
pub const CF_CHECKPOINTS: &str = "checkpoints";

/// All column family names
pub const ALL_CF_NAMES: &[&str] = &[
    CF_ENTITIES,
    CF_ENTITY_ROUTES,
    CF_OUTBOX,
    CF_OUTBOX_META,
    CF_CHECKPOINTS,
];

/// Create column family options for entity rows (compressed)
fn entities_options() -> Options {
    let mut opts = Options::default();
    opts.set_compression_type(rocksdb::DBCompressionType::Zstd);
    opts
}

/// Create column family options for the outbox.
///
/// Rows are rewritten on every claim and retry, and FAILED rows must survive
/// indefinitely, so the outbox uses level compaction rather than FIFO.
fn outbox_options() -> Options {
    let mut opts = Options::default();
    opts.set_compaction_style(rocksdb::DBCompactionStyle::Level);
    opts
}

/// Build all column family descriptors
pub fn build_cf_descriptors() -> Vec<ColumnFamilyDescriptor> {
    vec![
        ColumnFamilyDescriptor::new(CF_ENTITIES, entities_options()),
        ColumnFamilyDescriptor::new(CF_ENTITY_ROUTES, Options::default()),
        ColumnFamilyDescriptor::new(CF_OUTBOX, outbox_options()),
        ColumnFamilyDescriptor::new(CF_OUTBOX_META, Options::default()),
        ColumnFamilyDescriptor::new(CF_CHECKPOINTS, Options::default()),
    ]
}
