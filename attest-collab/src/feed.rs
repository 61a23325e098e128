//! Ordered, append-only activity feed.
//!
//! Every accepted mutation and presence transition appends exactly one
//! `ActivityEvent`. Events are sequenced per organization; the sequence is
//! assigned under the same lock that fans the event out to subscribers, so
//! delivery order always equals commit order. The in-memory feed keeps a
//! bounded tail per organization; the durable projection lives in the record
//! store, keyed by the same sequence.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, RwLock};
use uuid::Uuid;

use crate::record::unix_now;

/// What a feed entry describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeKind {
    RecordCreated,
    RecordUpdated,
    /// An accepted write that closed out a version conflict.
    ConflictResolved,
    SessionStarted,
    SessionEnded,
    /// Session evicted by the liveness sweep rather than an explicit end.
    SessionExpired,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::RecordCreated => "record_created",
            ChangeKind::RecordUpdated => "record_updated",
            ChangeKind::ConflictResolved => "conflict_resolved",
            ChangeKind::SessionStarted => "session_started",
            ChangeKind::SessionEnded => "session_ended",
            ChangeKind::SessionExpired => "session_expired",
        }
    }
}

/// One entry in an organization's activity feed. Never mutated after append.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityEvent {
    /// Per-organization sequence number, strictly increasing and gap-free.
    pub seq: u64,
    pub org_id: Uuid,
    /// Record the change touched; `None` for browsing-only presence events.
    pub record_id: Option<Uuid>,
    pub actor_id: Uuid,
    pub kind: ChangeKind,
    /// Committed record version for record events. Consumers replaying an
    /// already-applied version must treat it as a no-op.
    pub version: Option<u64>,
    pub at: u64,
}

impl ActivityEvent {
    /// Encode for the durable event log (bincode).
    pub fn encode(&self) -> Result<Vec<u8>, String> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| e.to_string())
    }

    /// Decode from durable log bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self, String> {
        let (event, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| e.to_string())?;
        Ok(event)
    }
}

// ─── Feed ───────────────────────────────────────────────────────────

struct OrgFeed {
    next_seq: u64,
    events: VecDeque<ActivityEvent>,
}

impl OrgFeed {
    fn new() -> Self {
        Self {
            next_seq: 1,
            events: VecDeque::new(),
        }
    }
}

/// In-memory, per-organization ordered event log.
pub struct ActivityFeed {
    orgs: RwLock<HashMap<Uuid, Arc<Mutex<OrgFeed>>>>,
    /// Max events retained in memory per organization.
    retain: usize,
}

impl ActivityFeed {
    pub fn new(retain: usize) -> Self {
        Self {
            orgs: RwLock::new(HashMap::new()),
            retain: retain.max(1),
        }
    }

    fn org_feed(&self, org_id: Uuid) -> Arc<Mutex<OrgFeed>> {
        {
            let orgs = self.orgs.read().unwrap_or_else(|e| e.into_inner());
            if let Some(feed) = orgs.get(&org_id) {
                return feed.clone();
            }
        }
        let mut orgs = self.orgs.write().unwrap_or_else(|e| e.into_inner());
        orgs.entry(org_id)
            .or_insert_with(|| Arc::new(Mutex::new(OrgFeed::new())))
            .clone()
    }

    /// Append an event and hand it to `publish` before releasing the org
    /// lock. Sequencing and fan-out share the lock — that is the invariant
    /// that keeps subscriber delivery order equal to commit order.
    pub fn append_with<F>(
        &self,
        org_id: Uuid,
        record_id: Option<Uuid>,
        actor_id: Uuid,
        kind: ChangeKind,
        version: Option<u64>,
        publish: F,
    ) -> ActivityEvent
    where
        F: FnOnce(&ActivityEvent),
    {
        let feed = self.org_feed(org_id);
        let mut feed = feed.lock().unwrap_or_else(|e| e.into_inner());

        let event = ActivityEvent {
            seq: feed.next_seq,
            org_id,
            record_id,
            actor_id,
            kind,
            version,
            at: unix_now(),
        };
        feed.next_seq += 1;
        feed.events.push_back(event.clone());
        while feed.events.len() > self.retain {
            feed.events.pop_front();
        }

        publish(&event);
        event
    }

    /// Most recent events for an organization, ascending by sequence.
    pub fn snapshot(&self, org_id: Uuid, limit: usize) -> Vec<ActivityEvent> {
        let orgs = self.orgs.read().unwrap_or_else(|e| e.into_inner());
        let Some(feed) = orgs.get(&org_id) else {
            return Vec::new();
        };
        let feed = feed.lock().unwrap_or_else(|e| e.into_inner());
        let skip = feed.events.len().saturating_sub(limit);
        feed.events.iter().skip(skip).cloned().collect()
    }

    /// Last assigned sequence for an organization (0 if none yet).
    pub fn last_seq(&self, org_id: Uuid) -> u64 {
        let orgs = self.orgs.read().unwrap_or_else(|e| e.into_inner());
        match orgs.get(&org_id) {
            Some(feed) => {
                let feed = feed.lock().unwrap_or_else(|e| e.into_inner());
                feed.next_seq - 1
            }
            None => 0,
        }
    }

    /// Number of retained events for an organization.
    pub fn len(&self, org_id: Uuid) -> usize {
        let orgs = self.orgs.read().unwrap_or_else(|e| e.into_inner());
        match orgs.get(&org_id) {
            Some(feed) => feed.lock().unwrap_or_else(|e| e.into_inner()).events.len(),
            None => 0,
        }
    }

    /// Restore sequence counters and retained tails from the durable log.
    ///
    /// Called once on startup, before any live appends for the orgs involved.
    pub fn hydrate(&self, events: Vec<ActivityEvent>) {
        let mut by_org: HashMap<Uuid, Vec<ActivityEvent>> = HashMap::new();
        for event in events {
            by_org.entry(event.org_id).or_default().push(event);
        }

        for (org_id, mut org_events) in by_org {
            org_events.sort_by_key(|e| e.seq);
            let feed = self.org_feed(org_id);
            let mut feed = feed.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(last) = org_events.last() {
                feed.next_seq = last.seq + 1;
            }
            let skip = org_events.len().saturating_sub(self.retain);
            feed.events = org_events.into_iter().skip(skip).collect();
        }
        log::debug!("Activity feed hydrated");
    }
}
