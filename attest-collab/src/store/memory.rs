//! In-memory record store for tests and embedded single-process use.

use std::collections::HashMap;
use std::sync::{Mutex, RwLock};
use uuid::Uuid;

use crate::feed::ActivityEvent;
use crate::record::{FieldUpdates, Requirement};
use crate::store::{RecordStore, StoreError, WriteOutcome};

/// HashMap-backed store. The compare-and-swap runs under the map's write
/// lock, which makes get-check-apply a single atomic step.
pub struct MemoryStore {
    records: RwLock<HashMap<Uuid, Requirement>>,
    events: Mutex<Vec<ActivityEvent>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            events: Mutex::new(Vec::new()),
        }
    }

    /// Number of stored records.
    pub fn record_count(&self) -> usize {
        self.records.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Number of logged events.
    pub fn event_count(&self) -> usize {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordStore for MemoryStore {
    fn get(&self, record_id: Uuid) -> Result<Requirement, StoreError> {
        self.records
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&record_id)
            .cloned()
            .ok_or(StoreError::NotFound(record_id))
    }

    fn create(&self, record: Requirement) -> Result<(), StoreError> {
        let mut records = self.records.write().unwrap_or_else(|e| e.into_inner());
        if records.contains_key(&record.id) {
            return Err(StoreError::AlreadyExists(record.id));
        }
        records.insert(record.id, record);
        Ok(())
    }

    fn write(
        &self,
        record_id: Uuid,
        expected_version: u64,
        updates: &FieldUpdates,
        actor_id: Uuid,
    ) -> Result<WriteOutcome, StoreError> {
        let mut records = self.records.write().unwrap_or_else(|e| e.into_inner());
        let stored = records
            .get_mut(&record_id)
            .ok_or(StoreError::NotFound(record_id))?;

        if stored.version != expected_version {
            return Ok(WriteOutcome::Conflict {
                current: stored.clone(),
            });
        }

        stored.apply(updates, actor_id);
        Ok(WriteOutcome::Committed {
            record: stored.clone(),
        })
    }

    fn append_event(&self, event: &ActivityEvent) -> Result<(), StoreError> {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event.clone());
        Ok(())
    }

    fn recent_events(&self, org_id: Uuid, limit: usize) -> Result<Vec<ActivityEvent>, StoreError> {
        let events = self.events.lock().unwrap_or_else(|e| e.into_inner());
        let mut org_events: Vec<ActivityEvent> = events
            .iter()
            .filter(|e| e.org_id == org_id)
            .cloned()
            .collect();
        org_events.sort_by_key(|e| e.seq);
        let skip = org_events.len().saturating_sub(limit);
        Ok(org_events.into_iter().skip(skip).collect())
    }

    fn load_all_events(&self) -> Result<Vec<ActivityEvent>, StoreError> {
        Ok(self
            .events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone())
    }
}
