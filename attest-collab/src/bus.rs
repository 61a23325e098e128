//! Per-organization change bus — fan-out of accepted writes and presence
//! transitions to every connected session.
//!
//! Built on tokio broadcast channels: one channel per organization, O(1) send
//! to all subscribers, each subscriber buffering up to `capacity` events.
//! Delivery is at-least-once in commit order (the activity feed publishes
//! under its sequencing lock). A subscriber that lags past its buffer is
//! disconnected rather than handed a gapped stream — the replay-free
//! contract: reconnect for a fresh snapshot, never a backlog.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use crate::feed::ActivityEvent;
use crate::record::Requirement;
use crate::session::Session;

/// One event on an organization's change bus.
///
/// Every variant carries its activity-feed entry; `event.seq` is the
/// organization-wide ordering and idempotency token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ChangeEvent {
    /// An accepted write — the full new record, so subscribers can refresh
    /// caches without a read-back.
    Committed {
        record: Requirement,
        event: ActivityEvent,
    },
    SessionStarted {
        session: Session,
        event: ActivityEvent,
    },
    SessionEnded {
        session: Session,
        event: ActivityEvent,
    },
    SessionExpired {
        session: Session,
        event: ActivityEvent,
    },
}

impl ChangeEvent {
    pub fn activity(&self) -> &ActivityEvent {
        match self {
            ChangeEvent::Committed { event, .. }
            | ChangeEvent::SessionStarted { event, .. }
            | ChangeEvent::SessionEnded { event, .. }
            | ChangeEvent::SessionExpired { event, .. } => event,
        }
    }

    pub fn org_id(&self) -> Uuid {
        self.activity().org_id
    }

    /// The record this event concerns, for target-scoped subscriptions.
    pub fn target_id(&self) -> Option<Uuid> {
        match self {
            ChangeEvent::Committed { record, .. } => Some(record.id),
            ChangeEvent::SessionStarted { session, .. }
            | ChangeEvent::SessionEnded { session, .. }
            | ChangeEvent::SessionExpired { session, .. } => session.target_id,
        }
    }
}

// ─── Bus ────────────────────────────────────────────────────────────

/// Bus statistics snapshot.
#[derive(Debug, Clone, Default)]
pub struct BusStats {
    pub events_published: u64,
    pub active_subscribers: usize,
}

/// One organization's broadcast channel.
///
/// Publishing never acquires a lock: tokio broadcast send plus an atomic
/// counter.
pub struct ChangeBus {
    sender: broadcast::Sender<Arc<ChangeEvent>>,
    capacity: usize,
    published: AtomicU64,
}

impl ChangeBus {
    /// Create a bus. `capacity` is the per-subscriber buffer; a subscriber
    /// falling further behind than this is disconnected.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            capacity,
            published: AtomicU64::new(0),
        }
    }

    /// Publish an event to all subscribers. Returns the receiver count.
    pub fn publish(&self, event: ChangeEvent) -> usize {
        let count = self.sender.send(Arc::new(event)).unwrap_or(0);
        self.published.fetch_add(1, Ordering::Relaxed);
        count
    }

    /// Raw receiver for this bus.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<ChangeEvent>> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> BusStats {
        BusStats {
            events_published: self.published.load(Ordering::Relaxed),
            active_subscribers: self.sender.receiver_count(),
        }
    }
}

/// Maps organizations to their change buses.
pub struct BusManager {
    buses: RwLock<HashMap<Uuid, Arc<ChangeBus>>>,
    default_capacity: usize,
}

impl BusManager {
    pub fn new(default_capacity: usize) -> Self {
        Self {
            buses: RwLock::new(HashMap::new()),
            default_capacity,
        }
    }

    /// Get or create the bus for an organization.
    pub async fn get_or_create(&self, org_id: Uuid) -> Arc<ChangeBus> {
        // Fast path: read lock
        {
            let buses = self.buses.read().await;
            if let Some(bus) = buses.get(&org_id) {
                return bus.clone();
            }
        }

        // Slow path: write lock, double-check
        let mut buses = self.buses.write().await;
        if let Some(bus) = buses.get(&org_id) {
            return bus.clone();
        }

        let bus = Arc::new(ChangeBus::new(self.default_capacity));
        buses.insert(org_id, bus.clone());
        bus
    }

    /// Remove a bus with no subscribers left.
    pub async fn remove_if_idle(&self, org_id: Uuid) -> bool {
        let mut buses = self.buses.write().await;
        if let Some(bus) = buses.get(&org_id) {
            if bus.subscriber_count() == 0 {
                buses.remove(&org_id);
                return true;
            }
        }
        false
    }

    pub async fn bus_count(&self) -> usize {
        self.buses.read().await.len()
    }

    pub async fn active_orgs(&self) -> Vec<Uuid> {
        self.buses.read().await.keys().cloned().collect()
    }
}

// ─── Subscription ───────────────────────────────────────────────────

/// A live subscription to an organization's change stream.
///
/// Carries the presence/feed snapshot taken at subscribe time plus the live
/// receiver. `connected` flips to false when the stream can no longer be
/// delivered gap-free (lag or bus teardown); the subscriber is expected to
/// resubscribe and receive a fresh snapshot, not a replay.
pub struct Subscription {
    org_id: Uuid,
    target_id: Option<Uuid>,
    /// Sessions active at subscribe time.
    pub active_sessions: Vec<Session>,
    /// Recent feed tail at subscribe time, ascending by sequence.
    pub recent_events: Vec<ActivityEvent>,
    receiver: broadcast::Receiver<Arc<ChangeEvent>>,
    connected: bool,
}

impl Subscription {
    pub(crate) fn new(
        org_id: Uuid,
        target_id: Option<Uuid>,
        active_sessions: Vec<Session>,
        recent_events: Vec<ActivityEvent>,
        receiver: broadcast::Receiver<Arc<ChangeEvent>>,
    ) -> Self {
        Self {
            org_id,
            target_id,
            active_sessions,
            recent_events,
            receiver,
            connected: true,
        }
    }

    pub fn org_id(&self) -> Uuid {
        self.org_id
    }

    pub fn target_id(&self) -> Option<Uuid> {
        self.target_id
    }

    /// Liveness of this subscription itself.
    pub fn connected(&self) -> bool {
        self.connected
    }

    fn matches(&self, event: &ChangeEvent) -> bool {
        match self.target_id {
            Some(target) => event.target_id() == Some(target),
            None => true,
        }
    }

    /// Next event in commit order, or `None` once disconnected.
    ///
    /// A lagged receiver has lost events; delivering the remainder would
    /// violate the ordered, replay-free contract, so the subscription
    /// disconnects instead.
    pub async fn next(&mut self) -> Option<Arc<ChangeEvent>> {
        loop {
            if !self.connected {
                return None;
            }
            match self.receiver.recv().await {
                Ok(event) => {
                    if self.matches(&event) {
                        return Some(event);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    log::warn!(
                        "Subscription for org {} lagged by {n} events, disconnecting",
                        self.org_id
                    );
                    self.connected = false;
                    return None;
                }
                Err(broadcast::error::RecvError::Closed) => {
                    self.connected = false;
                    return None;
                }
            }
        }
    }
}
