//! The collaboration service — the surface the UI layer consumes.
//!
//! Wires the pieces together: presence sessions, the compare-and-swap record
//! store, conflict detection/resolution, the per-organization change bus and
//! the activity feed.
//!
//! ```text
//! start_collaboration ──► SessionRegistry ──┐
//!                                           │ presence events
//! update_with_conflict_detection            ▼
//!        │                            ActivityFeed ──► ChangeBus ──► subscribers
//!        ▼                                  ▲
//! RecordStore (CAS) ── Committed ───────────┘
//!        │
//!        └── Conflict ──► ConflictResolver ──► resolve_conflict
//! ```
//!
//! Write outcomes are explicit result variants (`Committed | Conflict`), not
//! callbacks: the UI must branch on them, and the conflict machine stays
//! testable without one.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

use crate::bus::{BusManager, ChangeBus, ChangeEvent, Subscription};
use crate::conflict::{ConflictRecord, ConflictResolver, Resolution, ResolutionKind};
use crate::feed::{ActivityEvent, ActivityFeed, ChangeKind};
use crate::record::{validate_updates, FieldUpdates, Requirement, ValidationError};
use crate::session::{ActionKind, Session, SessionRegistry};
use crate::store::{RecordStore, StoreError, WriteOutcome};

/// Service configuration.
#[derive(Debug, Clone)]
pub struct CollabConfig {
    /// A session with no heartbeat for longer than this is expired.
    pub liveness_window: Duration,
    /// Interval of the background eviction sweep.
    pub sweep_interval: Duration,
    /// Per-subscriber change-bus buffer.
    pub bus_capacity: usize,
    /// In-memory activity events retained per organization.
    pub feed_retain: usize,
    /// Feed tail handed out with each new subscription.
    pub snapshot_events: usize,
}

impl Default for CollabConfig {
    fn default() -> Self {
        Self {
            liveness_window: Duration::from_secs(45),
            sweep_interval: Duration::from_secs(15),
            bus_capacity: 256,
            feed_retain: 512,
            snapshot_events: 64,
        }
    }
}

impl CollabConfig {
    /// Short windows for tests.
    pub fn for_testing() -> Self {
        Self {
            liveness_window: Duration::from_millis(50),
            sweep_interval: Duration::from_millis(20),
            bus_capacity: 64,
            feed_retain: 128,
            snapshot_events: 32,
        }
    }
}

// ─── Errors and outcomes ────────────────────────────────────────────

/// Failures of collaboration calls.
///
/// Version conflicts are deliberately absent: a conflict is a normal
/// `UpdateOutcome`/`ResolveOutcome` variant, never an error, because the UI
/// routes it into resolution rather than an error path.
#[derive(Debug)]
pub enum CollabError {
    /// Field values rejected before the compare-and-swap was attempted.
    Validation(ValidationError),
    /// Heartbeat lapsed past the liveness window (or the session is gone).
    /// Presence-only and non-fatal.
    SessionExpired(Uuid),
    /// The live stream can no longer be delivered gap-free; resubscribe for
    /// a fresh snapshot.
    SubscriptionDisconnected,
    /// Actor lacks rights to the organization/record. Fatal for the call.
    AuthorizationDenied(String),
    /// Resolve called with nothing pending for the (record, actor) pair.
    NoPendingConflict { record_id: Uuid, actor_id: Uuid },
    /// Store failure.
    Store(StoreError),
}

impl std::fmt::Display for CollabError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CollabError::Validation(e) => write!(f, "validation failure: {e}"),
            CollabError::SessionExpired(id) => write!(f, "session expired: {id}"),
            CollabError::SubscriptionDisconnected => write!(f, "subscription disconnected"),
            CollabError::AuthorizationDenied(msg) => write!(f, "authorization denied: {msg}"),
            CollabError::NoPendingConflict { record_id, actor_id } => {
                write!(f, "no pending conflict for record {record_id} and actor {actor_id}")
            }
            CollabError::Store(e) => write!(f, "store error: {e}"),
        }
    }
}

impl std::error::Error for CollabError {}

impl From<StoreError> for CollabError {
    fn from(e: StoreError) -> Self {
        CollabError::Store(e)
    }
}

impl From<ValidationError> for CollabError {
    fn from(e: ValidationError) -> Self {
        CollabError::Validation(e)
    }
}

/// Outcome of a conflict-detected write.
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateOutcome {
    /// The write committed; the record carries the new version.
    Committed { record: Requirement },
    /// The expected version was stale; the writer now holds this pending
    /// conflict and must resolve it before writing again.
    Conflict(ConflictRecord),
}

/// Outcome of applying a resolution.
#[derive(Debug, Clone, PartialEq)]
pub enum ResolveOutcome {
    /// Resolution applied. For `keep_remote` this is the untouched remote
    /// record; for `keep_local`/`merge` it is the newly committed version.
    Resolved { record: Requirement },
    /// The retried write lost another race; a fresh conflict is now pending.
    Conflict(ConflictRecord),
}

// ─── Stats ──────────────────────────────────────────────────────────

/// Service statistics snapshot.
#[derive(Debug, Clone, Default)]
pub struct ServiceStats {
    pub records_created: u64,
    pub writes_committed: u64,
    pub conflicts_detected: u64,
    pub conflicts_resolved: u64,
    pub sessions_started: u64,
    pub sessions_ended: u64,
    pub sessions_expired: u64,
}

/// Lock-free counters behind the snapshot.
#[derive(Default)]
struct AtomicServiceStats {
    records_created: AtomicU64,
    writes_committed: AtomicU64,
    conflicts_detected: AtomicU64,
    conflicts_resolved: AtomicU64,
    sessions_started: AtomicU64,
    sessions_ended: AtomicU64,
    sessions_expired: AtomicU64,
}

// ─── Service ────────────────────────────────────────────────────────

/// Multi-user collaboration over org-scoped requirement records.
pub struct CollabService {
    store: Arc<dyn RecordStore>,
    sessions: SessionRegistry,
    buses: BusManager,
    feed: ActivityFeed,
    resolver: ConflictResolver,
    config: CollabConfig,
    stats: AtomicServiceStats,
    /// Per-organization commit section. The CAS and the feed sequencing of
    /// its result must be one atomic step, otherwise two racing commits can
    /// reach subscribers in the wrong order.
    commit_locks: Mutex<HashMap<Uuid, Arc<Mutex<()>>>>,
}

impl CollabService {
    pub fn new(store: Arc<dyn RecordStore>, config: CollabConfig) -> Self {
        Self {
            sessions: SessionRegistry::new(config.liveness_window),
            buses: BusManager::new(config.bus_capacity),
            feed: ActivityFeed::new(config.feed_retain),
            resolver: ConflictResolver::new(),
            store,
            config,
            stats: AtomicServiceStats::default(),
            commit_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_defaults(store: Arc<dyn RecordStore>) -> Self {
        Self::new(store, CollabConfig::default())
    }

    pub fn config(&self) -> &CollabConfig {
        &self.config
    }

    /// Rebuild feed sequence counters from the durable event log.
    ///
    /// Call once on startup, before serving traffic. Returns the number of
    /// recovered events.
    pub fn recover(&self) -> Result<usize, CollabError> {
        let events = self.store.load_all_events()?;
        let recovered = events.len();
        self.feed.hydrate(events);
        if recovered > 0 {
            log::info!("Recovered {recovered} activity events from storage");
        }
        Ok(recovered)
    }

    // ─── Records ────────────────────────────────────────────────────

    /// Create a requirement record at version 0.
    pub async fn create_record(
        &self,
        org_id: Uuid,
        actor_id: Uuid,
        fields: FieldUpdates,
    ) -> Result<Requirement, CollabError> {
        validate_updates(&fields)?;
        let record = Requirement::new(org_id, actor_id, fields);
        let bus = self.buses.get_or_create(org_id).await;

        let event = {
            let lock = self.commit_lock(org_id);
            let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());
            self.store.create(record.clone())?;
            self.sequence_commit(&bus, &record, actor_id, ChangeKind::RecordCreated)
        };

        self.stats.records_created.fetch_add(1, Ordering::Relaxed);
        self.persist_event(&event);
        Ok(record)
    }

    /// Fetch a record, org-scoped.
    pub async fn get_record(&self, org_id: Uuid, record_id: Uuid) -> Result<Requirement, CollabError> {
        let record = self.store.get(record_id)?;
        self.authorize(org_id, &record)?;
        Ok(record)
    }

    /// Write with optimistic concurrency control.
    ///
    /// Validation failures and authorization denials come back as errors;
    /// a stale `expected_version` comes back as `UpdateOutcome::Conflict`
    /// with a pending `ConflictRecord` — never an error, and never a silent
    /// retry.
    pub async fn update_with_conflict_detection(
        &self,
        org_id: Uuid,
        record_id: Uuid,
        updates: FieldUpdates,
        expected_version: u64,
        actor_id: Uuid,
    ) -> Result<UpdateOutcome, CollabError> {
        validate_updates(&updates)?;

        // A pair with a pending conflict may not compound it; re-raise.
        if let Some(pending) = self.resolver.pending(record_id, actor_id).await {
            log::debug!(
                "Write rejected: conflict already pending for record {record_id} / actor {actor_id}"
            );
            return Ok(UpdateOutcome::Conflict(pending));
        }

        let current = self.store.get(record_id)?;
        self.authorize(org_id, &current)?;

        let bus = self.buses.get_or_create(org_id).await;
        let (outcome, event) = {
            let lock = self.commit_lock(org_id);
            let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());
            let outcome = self
                .store
                .write(record_id, expected_version, &updates, actor_id)?;
            let event = match &outcome {
                WriteOutcome::Committed { record } => Some(self.sequence_commit(
                    &bus,
                    record,
                    actor_id,
                    ChangeKind::RecordUpdated,
                )),
                WriteOutcome::Conflict { .. } => None,
            };
            (outcome, event)
        };

        match outcome {
            WriteOutcome::Committed { record } => {
                self.stats.writes_committed.fetch_add(1, Ordering::Relaxed);
                if let Some(event) = event {
                    self.persist_event(&event);
                }
                Ok(UpdateOutcome::Committed { record })
            }
            WriteOutcome::Conflict { current } => {
                self.stats.conflicts_detected.fetch_add(1, Ordering::Relaxed);
                let conflict =
                    ConflictRecord::detect(org_id, actor_id, updates, expected_version, current);
                let pending = self.resolver.register(conflict).await;
                Ok(UpdateOutcome::Conflict(pending))
            }
        }
    }

    /// Apply a resolution to the pending conflict of (record, actor).
    pub async fn resolve_conflict(
        &self,
        org_id: Uuid,
        record_id: Uuid,
        actor_id: Uuid,
        resolution: Resolution,
    ) -> Result<ResolveOutcome, CollabError> {
        let pending = self
            .resolver
            .pending(record_id, actor_id)
            .await
            .ok_or(CollabError::NoPendingConflict { record_id, actor_id })?;
        if pending.org_id != org_id {
            return Err(CollabError::AuthorizationDenied(format!(
                "conflict on record {record_id} belongs to another organization"
            )));
        }

        match resolution {
            Resolution::KeepRemote => {
                // Discard the local edit; no write. The caller refreshes its
                // cache from the returned remote value.
                self.resolver
                    .complete(record_id, actor_id, ResolutionKind::KeepRemote)
                    .await;
                self.stats.conflicts_resolved.fetch_add(1, Ordering::Relaxed);
                Ok(ResolveOutcome::Resolved {
                    record: pending.remote,
                })
            }
            Resolution::KeepLocal => {
                let local = pending.local.clone();
                self.retry_resolution(pending, local, ResolutionKind::KeepLocal, actor_id)
                    .await
            }
            Resolution::Merge(reconciled) => {
                validate_updates(&reconciled)?;
                self.retry_resolution(pending, reconciled, ResolutionKind::Merge, actor_id)
                    .await
            }
        }
    }

    /// Abandon a pending conflict without writing (the editor was closed).
    pub async fn abandon_conflict(&self, record_id: Uuid, actor_id: Uuid) -> bool {
        self.resolver.abandon(record_id, actor_id).await.is_some()
    }

    /// One retried compare-and-swap on the now-current base.
    async fn retry_resolution(
        &self,
        pending: ConflictRecord,
        updates: FieldUpdates,
        kind: ResolutionKind,
        actor_id: Uuid,
    ) -> Result<ResolveOutcome, CollabError> {
        let bus = self.buses.get_or_create(pending.org_id).await;
        let (outcome, event) = {
            let lock = self.commit_lock(pending.org_id);
            let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());
            let outcome = self.store.write(
                pending.record_id,
                pending.remote.version,
                &updates,
                actor_id,
            )?;
            let event = match &outcome {
                WriteOutcome::Committed { record } => Some(self.sequence_commit(
                    &bus,
                    record,
                    actor_id,
                    ChangeKind::ConflictResolved,
                )),
                WriteOutcome::Conflict { .. } => None,
            };
            (outcome, event)
        };

        match outcome {
            WriteOutcome::Committed { record } => {
                self.resolver
                    .complete(pending.record_id, actor_id, kind)
                    .await;
                self.stats.conflicts_resolved.fetch_add(1, Ordering::Relaxed);
                self.stats.writes_committed.fetch_add(1, Ordering::Relaxed);
                if let Some(event) = event {
                    self.persist_event(&event);
                }
                Ok(ResolveOutcome::Resolved { record })
            }
            WriteOutcome::Conflict { current } => {
                // Another writer intervened during resolution — loop back to
                // Detected with a fresh capture of both sides.
                self.stats.conflicts_detected.fetch_add(1, Ordering::Relaxed);
                let fresh = ConflictRecord::detect(
                    pending.org_id,
                    actor_id,
                    updates,
                    pending.remote.version,
                    current,
                );
                let pending = self.resolver.register(fresh).await;
                Ok(ResolveOutcome::Conflict(pending))
            }
        }
    }

    // ─── Presence ───────────────────────────────────────────────────

    /// Open a collaboration session. Re-entry for the same (actor, target)
    /// replaces the prior session.
    pub async fn start_collaboration(
        &self,
        org_id: Uuid,
        target_id: Option<Uuid>,
        actor_id: Uuid,
        action: ActionKind,
    ) -> Result<Session, CollabError> {
        if let Some(target) = target_id {
            let record = self.store.get(target)?;
            self.authorize(org_id, &record)?;
        }

        let (session, replaced) = self.sessions.start(org_id, target_id, actor_id, action).await;
        if replaced.is_none() {
            self.stats.sessions_started.fetch_add(1, Ordering::Relaxed);
        }
        self.publish_presence(&session, ChangeKind::SessionStarted)
            .await;
        Ok(session)
    }

    /// Refresh a session's liveness.
    pub async fn heartbeat(&self, session_id: Uuid) -> Result<(), CollabError> {
        self.sessions
            .heartbeat(session_id)
            .await
            .map(|_| ())
            .ok_or(CollabError::SessionExpired(session_id))
    }

    /// End a session — the normal exit path. Idempotent: ending an unknown
    /// or already-swept session is a no-op, never an error.
    pub async fn end_collaboration(&self, session_id: Uuid) -> Result<(), CollabError> {
        if let Some(session) = self.sessions.end(session_id).await {
            self.stats.sessions_ended.fetch_add(1, Ordering::Relaxed);
            self.publish_presence(&session, ChangeKind::SessionEnded)
                .await;
        }
        Ok(())
    }

    /// Active sessions for an organization, optionally scoped to a record.
    pub async fn list_active(&self, org_id: Uuid, target_id: Option<Uuid>) -> Vec<Session> {
        self.sessions.list_active(org_id, target_id).await
    }

    /// Evict sessions past the liveness window, announcing each eviction.
    pub async fn sweep_expired(&self) -> usize {
        let evicted = self.sessions.sweep_expired().await;
        let count = evicted.len();
        for session in evicted {
            self.stats.sessions_expired.fetch_add(1, Ordering::Relaxed);
            self.publish_presence(&session, ChangeKind::SessionExpired)
                .await;
        }
        count
    }

    /// Background sweep loop at the configured interval.
    pub fn spawn_sweeper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let service = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(service.config.sweep_interval);
            loop {
                ticker.tick().await;
                service.sweep_expired().await;
            }
        })
    }

    // ─── Subscriptions ──────────────────────────────────────────────

    /// Subscribe to an organization's change stream, optionally scoped to
    /// one record.
    ///
    /// The receiver is registered before the snapshot is taken: the overlap
    /// can duplicate an event across snapshot and stream but never lose one,
    /// and consumers are version-idempotent.
    pub async fn subscribe(
        &self,
        org_id: Uuid,
        target_id: Option<Uuid>,
    ) -> Result<Subscription, CollabError> {
        if let Some(target) = target_id {
            let record = self.store.get(target)?;
            self.authorize(org_id, &record)?;
        }

        let bus = self.buses.get_or_create(org_id).await;
        let receiver = bus.subscribe();
        let active_sessions = self.sessions.list_active(org_id, target_id).await;
        let recent_events = self.feed.snapshot(org_id, self.config.snapshot_events);

        Ok(Subscription::new(
            org_id,
            target_id,
            active_sessions,
            recent_events,
            receiver,
        ))
    }

    /// Stats snapshot.
    pub fn stats(&self) -> ServiceStats {
        ServiceStats {
            records_created: self.stats.records_created.load(Ordering::Relaxed),
            writes_committed: self.stats.writes_committed.load(Ordering::Relaxed),
            conflicts_detected: self.stats.conflicts_detected.load(Ordering::Relaxed),
            conflicts_resolved: self.stats.conflicts_resolved.load(Ordering::Relaxed),
            sessions_started: self.stats.sessions_started.load(Ordering::Relaxed),
            sessions_ended: self.stats.sessions_ended.load(Ordering::Relaxed),
            sessions_expired: self.stats.sessions_expired.load(Ordering::Relaxed),
        }
    }

    // ─── Internal ───────────────────────────────────────────────────

    fn authorize(&self, org_id: Uuid, record: &Requirement) -> Result<(), CollabError> {
        if record.org_id != org_id {
            return Err(CollabError::AuthorizationDenied(format!(
                "record {} belongs to another organization",
                record.id
            )));
        }
        Ok(())
    }

    /// The per-organization lock held across a CAS and the sequencing of its
    /// committed result. Never held across an await.
    fn commit_lock(&self, org_id: Uuid) -> Arc<Mutex<()>> {
        let mut locks = self.commit_locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.entry(org_id).or_default().clone()
    }

    /// Sequence an accepted write into the feed and fan it out. The bus send
    /// happens under the feed's org lock, and the caller holds the commit
    /// lock, so delivery order equals commit order. The durable projection is
    /// seq-keyed, so its write can trail (see `persist_event`).
    fn sequence_commit(
        &self,
        bus: &ChangeBus,
        record: &Requirement,
        actor_id: Uuid,
        kind: ChangeKind,
    ) -> ActivityEvent {
        self.feed.append_with(
            record.org_id,
            Some(record.id),
            actor_id,
            kind,
            Some(record.version),
            |event| {
                bus.publish(ChangeEvent::Committed {
                    record: record.clone(),
                    event: event.clone(),
                });
            },
        )
    }

    fn persist_event(&self, event: &ActivityEvent) {
        if let Err(e) = self.store.append_event(event) {
            log::error!("Failed to persist activity event {}: {e}", event.seq);
        }
    }

    async fn publish_presence(&self, session: &Session, kind: ChangeKind) {
        let bus = self.buses.get_or_create(session.org_id).await;
        let event = self.feed.append_with(
            session.org_id,
            session.target_id,
            session.actor_id,
            kind,
            None,
            |event| {
                let change = match kind {
                    ChangeKind::SessionEnded => ChangeEvent::SessionEnded {
                        session: session.clone(),
                        event: event.clone(),
                    },
                    ChangeKind::SessionExpired => ChangeEvent::SessionExpired {
                        session: session.clone(),
                        event: event.clone(),
                    },
                    _ => ChangeEvent::SessionStarted {
                        session: session.clone(),
                        event: event.clone(),
                    },
                };
                bus.publish(change);
            },
        );
        self.persist_event(&event);
    }
}
