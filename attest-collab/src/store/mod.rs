//! Versioned record storage.
//!
//! The store is the single synchronization point of the subsystem: every
//! record mutation goes through `RecordStore::write`, an atomic
//! compare-and-swap keyed on the record's version counter. There is no lock a
//! writer can hold across requests and no cross-record transaction.
//!
//! ```text
//! write(record_id, expected_version, updates)
//!        │
//!        ▼
//! stored.version == expected_version ?
//!        │                      │
//!       yes                     no
//!        │                      │
//!        ▼                      ▼
//! apply + version+1      Conflict { current }
//! Committed { record }   (full record, nothing applied)
//! ```
//!
//! Two implementations: `MemoryStore` for tests and embedded use,
//! `RocksStore` for durable deployments. The durable store also carries the
//! append-only activity-event log (see `feed`).

pub mod memory;
pub mod rocks;

pub use memory::MemoryStore;
pub use rocks::{OrgMetadata, RocksStore, StoreConfig};

use uuid::Uuid;

use crate::feed::ActivityEvent;
use crate::record::{FieldUpdates, Requirement};

/// Result of a compare-and-swap write.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOutcome {
    /// The stored version matched; updates applied, version bumped by 1.
    Committed { record: Requirement },
    /// The stored version differed; nothing was applied. The full current
    /// record is returned so the losing writer can be shown both sides.
    Conflict { current: Requirement },
}

/// Storage errors.
///
/// A `Conflict` is not an error — it is a normal `WriteOutcome`. These are
/// the failures that mean the store itself misbehaved or was misused.
#[derive(Debug, Clone)]
pub enum StoreError {
    /// Backend failure (I/O, database internals).
    DatabaseError(String),
    /// Record not found.
    NotFound(Uuid),
    /// Create attempted for an id that already exists.
    AlreadyExists(Uuid),
    SerializationError(String),
    DeserializationError(String),
    CompressionError(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::DatabaseError(e) => write!(f, "database error: {e}"),
            StoreError::NotFound(id) => write!(f, "record not found: {id}"),
            StoreError::AlreadyExists(id) => write!(f, "record already exists: {id}"),
            StoreError::SerializationError(e) => write!(f, "serialization error: {e}"),
            StoreError::DeserializationError(e) => write!(f, "deserialization error: {e}"),
            StoreError::CompressionError(e) => write!(f, "compression error: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

/// The persistent-store seam.
///
/// `get` and `write` are the two primitives the collaboration layer consumes
/// (record-get-by-id and the atomic conditional update); the event methods
/// carry the durable activity-feed projection.
pub trait RecordStore: Send + Sync {
    /// Fetch a record by id.
    fn get(&self, record_id: Uuid) -> Result<Requirement, StoreError>;

    /// Insert a fresh record (version 0). Errors if the id already exists.
    fn create(&self, record: Requirement) -> Result<(), StoreError>;

    /// Atomic compare-and-swap write.
    ///
    /// Applies `updates` and bumps the version by exactly 1 iff the stored
    /// version equals `expected_version`; otherwise returns the current
    /// record as a `Conflict` with nothing applied.
    fn write(
        &self,
        record_id: Uuid,
        expected_version: u64,
        updates: &FieldUpdates,
        actor_id: Uuid,
    ) -> Result<WriteOutcome, StoreError>;

    /// Append one activity event to the durable log.
    fn append_event(&self, event: &ActivityEvent) -> Result<(), StoreError>;

    /// Most recent events for an organization, ascending by sequence.
    fn recent_events(&self, org_id: Uuid, limit: usize) -> Result<Vec<ActivityEvent>, StoreError>;

    /// Full event log across all organizations (startup recovery).
    fn load_all_events(&self) -> Result<Vec<ActivityEvent>, StoreError>;
}
