//! Conflict detection and the resolution state machine.
//!
//! A `ConflictRecord` is created the instant a compare-and-swap fails,
//! capturing the writer's in-flight edit and the server's current record.
//! Per (record, losing actor) the resolver holds at most one conflict and
//! walks it through:
//!
//! ```text
//! (none) ──detect──► Detected ──expose──► PendingResolution
//!                       ▲                        │
//!                       │ retry lost             │ resolve
//!                       └────────────────────────┴──► Resolved ──► (none)
//! ```
//!
//! While a conflict is pending, further writes to that record from the same
//! actor are not accepted — the pending conflict is re-raised instead, so
//! conflicts never compound.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::record::{unix_now, FieldUpdates, Requirement};

/// How a write diverged. Only version mismatches exist today.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConflictKind {
    VersionMismatch,
}

impl ConflictKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictKind::VersionMismatch => "version_mismatch",
        }
    }
}

/// Which resolution strategy was chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResolutionKind {
    KeepLocal,
    KeepRemote,
    Merge,
}

impl ResolutionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResolutionKind::KeepLocal => "keep_local",
            ResolutionKind::KeepRemote => "keep_remote",
            ResolutionKind::Merge => "merge",
        }
    }
}

/// A resolution request from the losing writer.
///
/// `Merge` carries the caller's reconciled field set verbatim — the resolver
/// transports it into a retry and applies no field precedence of its own.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Resolution {
    KeepLocal,
    KeepRemote,
    Merge(FieldUpdates),
}

impl Resolution {
    pub fn kind(&self) -> ResolutionKind {
        match self {
            Resolution::KeepLocal => ResolutionKind::KeepLocal,
            Resolution::KeepRemote => ResolutionKind::KeepRemote,
            Resolution::Merge(_) => ResolutionKind::Merge,
        }
    }
}

/// A detected write conflict, captured at the moment the CAS failed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictRecord {
    pub record_id: Uuid,
    pub org_id: Uuid,
    /// The losing writer.
    pub actor_id: Uuid,
    pub kind: ConflictKind,
    /// The writer's in-flight edit, exactly as submitted.
    pub local: FieldUpdates,
    /// The server's current record at detection time.
    pub remote: Requirement,
    /// The version the writer believed it was editing.
    pub expected_version: u64,
    pub detected_at: u64,
    /// Set once a resolution has been applied.
    pub resolution: Option<ResolutionKind>,
}

impl ConflictRecord {
    /// Capture a failed write as a conflict.
    pub fn detect(
        org_id: Uuid,
        actor_id: Uuid,
        local: FieldUpdates,
        expected_version: u64,
        remote: Requirement,
    ) -> Self {
        Self {
            record_id: remote.id,
            org_id,
            actor_id,
            kind: ConflictKind::VersionMismatch,
            local,
            remote,
            expected_version,
            detected_at: unix_now(),
            resolution: None,
        }
    }

    /// True when the writer raced its own earlier commit (double-submit).
    /// `keep_remote` is then usually the trivial resolution.
    pub fn is_self_conflict(&self) -> bool {
        self.remote.updated_by == self.actor_id
    }
}

// ─── Resolver state machine ─────────────────────────────────────────

/// Lifecycle phase of a held conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictPhase {
    /// Captured, not yet handed to the losing writer.
    Detected,
    /// Exposed to the losing writer; blocks further writes from the pair.
    PendingResolution,
}

struct HeldConflict {
    conflict: ConflictRecord,
    phase: ConflictPhase,
}

/// Holds pending conflicts per (record, losing actor) and drives the
/// `Detected → PendingResolution → Resolved` transitions.
pub struct ConflictResolver {
    held: RwLock<HashMap<(Uuid, Uuid), HeldConflict>>,
}

impl ConflictResolver {
    pub fn new() -> Self {
        Self {
            held: RwLock::new(HashMap::new()),
        }
    }

    /// Record a freshly detected conflict (phase `Detected`).
    ///
    /// A conflict already held for the same (record, actor) pair is replaced,
    /// never queued behind.
    pub async fn detect(&self, conflict: ConflictRecord) {
        let key = (conflict.record_id, conflict.actor_id);
        let mut held = self.held.write().await;
        if held.insert(
            key,
            HeldConflict {
                conflict,
                phase: ConflictPhase::Detected,
            },
        )
        .is_some()
        {
            log::debug!(
                "Replaced pending conflict for record {} / actor {}",
                key.0,
                key.1
            );
        }
    }

    /// Transition `Detected → PendingResolution` and return the conflict for
    /// the losing writer. Idempotent if already pending.
    pub async fn begin_resolution(&self, record_id: Uuid, actor_id: Uuid) -> Option<ConflictRecord> {
        let mut held = self.held.write().await;
        let entry = held.get_mut(&(record_id, actor_id))?;
        entry.phase = ConflictPhase::PendingResolution;
        Some(entry.conflict.clone())
    }

    /// Detect and immediately expose: the common path, since a conflict is
    /// handed to the losing writer in the same call that records it.
    pub async fn register(&self, conflict: ConflictRecord) -> ConflictRecord {
        log::info!(
            "Version conflict on record {} (actor {}, expected v{}, current v{})",
            conflict.record_id,
            conflict.actor_id,
            conflict.expected_version,
            conflict.remote.version
        );
        self.detect(conflict.clone()).await;
        self.begin_resolution(conflict.record_id, conflict.actor_id)
            .await
            .unwrap_or(conflict)
    }

    /// The conflict currently held for a pair, if any.
    pub async fn pending(&self, record_id: Uuid, actor_id: Uuid) -> Option<ConflictRecord> {
        self.held
            .read()
            .await
            .get(&(record_id, actor_id))
            .map(|h| h.conflict.clone())
    }

    /// Whether the pair is blocked from further writes.
    pub async fn has_pending(&self, record_id: Uuid, actor_id: Uuid) -> bool {
        self.held.read().await.contains_key(&(record_id, actor_id))
    }

    /// Phase of the held conflict, if any.
    pub async fn phase(&self, record_id: Uuid, actor_id: Uuid) -> Option<ConflictPhase> {
        self.held
            .read()
            .await
            .get(&(record_id, actor_id))
            .map(|h| h.phase)
    }

    /// Transition `PendingResolution → Resolved` and drop the conflict.
    ///
    /// Returns the resolved record with `resolution` stamped, or `None` if
    /// nothing was held for the pair.
    pub async fn complete(
        &self,
        record_id: Uuid,
        actor_id: Uuid,
        kind: ResolutionKind,
    ) -> Option<ConflictRecord> {
        let mut held = self.held.write().await;
        let entry = held.remove(&(record_id, actor_id))?;
        let mut conflict = entry.conflict;
        conflict.resolution = Some(kind);
        log::info!(
            "Conflict on record {record_id} resolved with {} by actor {actor_id}",
            kind.as_str()
        );
        Some(conflict)
    }

    /// Drop a held conflict without resolving (the writer abandoned the edit).
    pub async fn abandon(&self, record_id: Uuid, actor_id: Uuid) -> Option<ConflictRecord> {
        let mut held = self.held.write().await;
        held.remove(&(record_id, actor_id)).map(|h| h.conflict)
    }

    /// Number of held conflicts.
    pub async fn count(&self) -> usize {
        self.held.read().await.len()
    }
}

impl Default for ConflictResolver {
    fn default() -> Self {
        Self::new()
    }
}
