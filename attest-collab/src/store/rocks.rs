//! RocksDB-backed durable record store.
//!
//! Column families:
//! - `records` — current requirement records (LZ4 compressed, keyed by id)
//! - `events`  — activity-event log (keyed by org_id:seq, uncompressed)
//! - `meta`    — per-organization metadata (last event seq, counts)
//!
//! RocksDB has no conditional put, so the compare-and-swap holds an internal
//! mutex across get-check-apply. Event rows are keyed by their feed sequence,
//! which makes the durable log ordered regardless of write timing.

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Mutex;
use uuid::Uuid;

use crate::feed::ActivityEvent;
use crate::record::{unix_now, FieldUpdates, Requirement};
use crate::store::{RecordStore, StoreError, WriteOutcome};

/// Column family names.
const CF_RECORDS: &str = "records";
const CF_EVENTS: &str = "events";
const CF_META: &str = "meta";

const COLUMN_FAMILIES: &[&str] = &[CF_RECORDS, CF_EVENTS, CF_META];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 128MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// Enable fsync on every write (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 32MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("attest_data"),
            block_cache_size: 128 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 512,
            write_buffer_size: 32 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Create config for testing (small caches, temp directory).
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024,
        }
    }
}

/// Per-organization metadata stored alongside the event log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrgMetadata {
    pub org_id: Uuid,
    /// Highest event sequence appended for this organization.
    pub last_seq: u64,
    /// Total events appended.
    pub event_count: u64,
    /// Last modified timestamp (seconds since epoch).
    pub updated_at: u64,
}

impl OrgMetadata {
    fn new(org_id: Uuid) -> Self {
        Self {
            org_id,
            last_seq: 0,
            event_count: 0,
            updated_at: unix_now(),
        }
    }

    fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::SerializationError(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let (meta, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
        Ok(meta)
    }
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::DatabaseError(e.to_string())
    }
}

/// RocksDB-backed record store with an ordered durable event log.
pub struct RocksStore {
    /// RocksDB instance (single-threaded mode — concurrency via tokio)
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
    /// Serializes compare-and-swap sections (no conditional put in RocksDB).
    cas: Mutex<()>,
}

impl RocksStore {
    /// Open the store at the configured path, creating it if missing.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.increase_parallelism(num_cpus());

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| {
                let cf_opts = Self::cf_options(name, &config);
                ColumnFamilyDescriptor::new(*name, cf_opts)
            })
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        Ok(Self {
            db,
            config,
            cas: Mutex::new(()),
        })
    }

    /// Build column-family-specific options.
    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        block_opts.set_block_size(16 * 1024);
        opts.set_block_based_table_factory(&block_opts);

        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_RECORDS => {
                // Point lookups by record id dominate.
                opts.set_compression_type(DBCompressionType::Lz4);
                opts.set_max_write_buffer_number(2);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            CF_EVENTS => {
                // Small sequential appends, prefix-scanned by org_id.
                opts.set_compression_type(DBCompressionType::None);
                opts.set_max_write_buffer_number(4);
                opts.set_prefix_extractor(rocksdb::SliceTransform::create_fixed_prefix(16));
            }
            CF_META => {
                opts.set_compression_type(DBCompressionType::Lz4);
                opts.set_max_write_buffer_number(2);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            _ => {}
        }

        opts
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::DatabaseError(format!("missing column family: {name}")))
    }

    /// Event key: `org_id (16 bytes) ‖ seq (8 bytes big-endian)`.
    fn event_key(org_id: Uuid, seq: u64) -> [u8; 24] {
        let mut key = [0u8; 24];
        key[..16].copy_from_slice(org_id.as_bytes());
        key[16..].copy_from_slice(&seq.to_be_bytes());
        key
    }

    fn put_record(&self, record: &Requirement) -> Result<(), StoreError> {
        let cf = self.cf(CF_RECORDS)?;
        let encoded = record
            .encode()
            .map_err(StoreError::SerializationError)?;
        let compressed = lz4_flex::compress_prepend_size(&encoded);

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db
            .put_cf_opt(&cf, record.id.as_bytes(), &compressed, &write_opts)?;
        Ok(())
    }

    /// Per-organization metadata (last event sequence, counts).
    pub fn org_metadata(&self, org_id: Uuid) -> Result<OrgMetadata, StoreError> {
        let cf = self.cf(CF_META)?;
        match self.db.get_cf(&cf, org_id.as_bytes())? {
            Some(bytes) => OrgMetadata::decode(&bytes),
            None => Err(StoreError::NotFound(org_id)),
        }
    }

    /// Organizations with persisted events.
    pub fn list_orgs(&self) -> Result<Vec<Uuid>, StoreError> {
        let cf = self.cf(CF_META)?;
        let mut orgs = Vec::new();
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (key, _) = item.map_err(|e| StoreError::DatabaseError(e.to_string()))?;
            if key.len() == 16 {
                let mut buf = [0u8; 16];
                buf.copy_from_slice(&key);
                orgs.push(Uuid::from_bytes(buf));
            }
        }
        Ok(orgs)
    }
}

impl RecordStore for RocksStore {
    fn get(&self, record_id: Uuid) -> Result<Requirement, StoreError> {
        let cf = self.cf(CF_RECORDS)?;
        match self.db.get_cf(&cf, record_id.as_bytes())? {
            Some(compressed) => {
                let encoded = lz4_flex::decompress_size_prepended(&compressed)
                    .map_err(|e| StoreError::CompressionError(e.to_string()))?;
                Requirement::decode(&encoded).map_err(StoreError::DeserializationError)
            }
            None => Err(StoreError::NotFound(record_id)),
        }
    }

    fn create(&self, record: Requirement) -> Result<(), StoreError> {
        let _guard = self.cas.lock().unwrap_or_else(|e| e.into_inner());
        let cf = self.cf(CF_RECORDS)?;
        if self.db.get_cf(&cf, record.id.as_bytes())?.is_some() {
            return Err(StoreError::AlreadyExists(record.id));
        }
        self.put_record(&record)?;
        log::debug!("Created record {} for org {}", record.id, record.org_id);
        Ok(())
    }

    fn write(
        &self,
        record_id: Uuid,
        expected_version: u64,
        updates: &FieldUpdates,
        actor_id: Uuid,
    ) -> Result<WriteOutcome, StoreError> {
        let _guard = self.cas.lock().unwrap_or_else(|e| e.into_inner());

        let mut stored = self.get(record_id)?;
        if stored.version != expected_version {
            log::debug!(
                "CAS rejected for record {record_id}: expected v{expected_version}, stored v{}",
                stored.version
            );
            return Ok(WriteOutcome::Conflict { current: stored });
        }

        stored.apply(updates, actor_id);
        self.put_record(&stored)?;
        Ok(WriteOutcome::Committed { record: stored })
    }

    fn append_event(&self, event: &ActivityEvent) -> Result<(), StoreError> {
        let cf_events = self.cf(CF_EVENTS)?;
        let cf_meta = self.cf(CF_META)?;

        let mut meta = self
            .org_metadata(event.org_id)
            .unwrap_or_else(|_| OrgMetadata::new(event.org_id));
        meta.last_seq = meta.last_seq.max(event.seq);
        meta.event_count += 1;
        meta.updated_at = unix_now();

        // Atomic batch: event row + org metadata.
        let mut batch = WriteBatch::default();
        let key = Self::event_key(event.org_id, event.seq);
        batch.put_cf(&cf_events, key, event.encode().map_err(StoreError::SerializationError)?);
        batch.put_cf(&cf_meta, event.org_id.as_bytes(), meta.encode()?);

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;
        Ok(())
    }

    fn recent_events(&self, org_id: Uuid, limit: usize) -> Result<Vec<ActivityEvent>, StoreError> {
        let cf = self.cf(CF_EVENTS)?;
        let start = Self::event_key(org_id, 0);

        let mut events = Vec::new();
        let iter = self.db.iterator_cf(
            &cf,
            IteratorMode::From(&start, rocksdb::Direction::Forward),
        );
        for item in iter {
            let (key, value) = item.map_err(|e| StoreError::DatabaseError(e.to_string()))?;
            if key.len() < 24 || &key[..16] != org_id.as_bytes() {
                break;
            }
            events.push(ActivityEvent::decode(&value).map_err(StoreError::DeserializationError)?);
        }

        let skip = events.len().saturating_sub(limit);
        Ok(events.into_iter().skip(skip).collect())
    }

    fn load_all_events(&self) -> Result<Vec<ActivityEvent>, StoreError> {
        let cf = self.cf(CF_EVENTS)?;
        let mut events = Vec::new();
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (_, value) = item.map_err(|e| StoreError::DatabaseError(e.to_string()))?;
            events.push(ActivityEvent::decode(&value).map_err(StoreError::DeserializationError)?);
        }
        Ok(events)
    }
}

fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}
