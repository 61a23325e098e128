//! Collaboration session registry — who is present, on what, doing what.
//!
//! A session is created when an actor enters a collaborative view, refreshed
//! by heartbeats, and destroyed on navigation away. Abrupt exits are
//! recovered by the liveness sweep: a session whose last heartbeat is older
//! than the liveness window drops out of `list_active` immediately and is
//! evicted by the next sweep. Presence is display-only — an expired session
//! never fails an in-flight write.
//!
//! Sessions are exclusively owned by their creating actor; the registry only
//! indexes them for presence queries.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::record::unix_now;

/// What the actor is doing in the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActionKind {
    Viewing,
    Editing,
    Commenting,
}

impl ActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::Viewing => "viewing",
            ActionKind::Editing => "editing",
            ActionKind::Commenting => "commenting",
        }
    }
}

/// One active collaboration session.
///
/// `target_id = None` means a general/browsing session not tied to a record.
/// Timestamps are epoch seconds for the wire; liveness itself is tracked
/// monotonically inside the registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: Uuid,
    pub org_id: Uuid,
    pub actor_id: Uuid,
    pub target_id: Option<Uuid>,
    pub action: ActionKind,
    pub started_at: u64,
    pub last_heartbeat_at: u64,
}

struct SessionEntry {
    session: Session,
    last_beat: Instant,
}

impl SessionEntry {
    fn expired(&self, window: Duration) -> bool {
        self.last_beat.elapsed() > window
    }
}

/// Registry of active sessions with heartbeat liveness.
pub struct SessionRegistry {
    sessions: RwLock<HashMap<Uuid, SessionEntry>>,
    liveness_window: Duration,
}

impl SessionRegistry {
    pub fn new(liveness_window: Duration) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            liveness_window,
        }
    }

    pub fn liveness_window(&self) -> Duration {
        self.liveness_window
    }

    /// Start a session.
    ///
    /// Re-entry is idempotent: if the actor already holds a session for the
    /// same target in the same organization, that session is replaced rather
    /// than accumulating a duplicate. Returns the new session and the one it
    /// replaced, if any.
    pub async fn start(
        &self,
        org_id: Uuid,
        target_id: Option<Uuid>,
        actor_id: Uuid,
        action: ActionKind,
    ) -> (Session, Option<Session>) {
        let mut sessions = self.sessions.write().await;

        let replaced_id = sessions
            .values()
            .find(|e| {
                e.session.org_id == org_id
                    && e.session.actor_id == actor_id
                    && e.session.target_id == target_id
            })
            .map(|e| e.session.id);
        let replaced = replaced_id.and_then(|id| sessions.remove(&id)).map(|e| e.session);

        let now = unix_now();
        let session = Session {
            id: Uuid::new_v4(),
            org_id,
            actor_id,
            target_id,
            action,
            started_at: now,
            last_heartbeat_at: now,
        };
        sessions.insert(
            session.id,
            SessionEntry {
                session: session.clone(),
                last_beat: Instant::now(),
            },
        );

        log::debug!(
            "Session {} started: actor {actor_id} {} {:?} in org {org_id}",
            session.id,
            action.as_str(),
            target_id,
        );
        (session, replaced)
    }

    /// Refresh a session's liveness.
    ///
    /// Returns the refreshed session, or `None` when the session is unknown
    /// or already past the liveness window — an expired session cannot be
    /// revived by a late heartbeat, only by a fresh `start`.
    pub async fn heartbeat(&self, session_id: Uuid) -> Option<Session> {
        let mut sessions = self.sessions.write().await;
        let expired = sessions
            .get(&session_id)
            .map(|e| e.expired(self.liveness_window))?;

        if expired {
            sessions.remove(&session_id);
            log::debug!("Heartbeat for expired session {session_id}, evicting");
            return None;
        }

        let entry = sessions.get_mut(&session_id)?;
        entry.last_beat = Instant::now();
        entry.session.last_heartbeat_at = unix_now();
        Some(entry.session.clone())
    }

    /// End a session (the normal exit path). Returns the ended session.
    pub async fn end(&self, session_id: Uuid) -> Option<Session> {
        let mut sessions = self.sessions.write().await;
        let entry = sessions.remove(&session_id)?;
        log::debug!("Session {session_id} ended");
        Some(entry.session)
    }

    /// Look up a session (live or not yet swept).
    pub async fn get(&self, session_id: Uuid) -> Option<Session> {
        self.sessions
            .read()
            .await
            .get(&session_id)
            .map(|e| e.session.clone())
    }

    /// Active (non-expired) sessions for an organization, optionally
    /// filtered to one target record.
    pub async fn list_active(&self, org_id: Uuid, target_id: Option<Uuid>) -> Vec<Session> {
        let sessions = self.sessions.read().await;
        let mut active: Vec<Session> = sessions
            .values()
            .filter(|e| !e.expired(self.liveness_window))
            .filter(|e| e.session.org_id == org_id)
            .filter(|e| match target_id {
                Some(target) => e.session.target_id == Some(target),
                None => true,
            })
            .map(|e| e.session.clone())
            .collect();
        active.sort_by_key(|s| (s.started_at, s.id));
        active
    }

    /// Evict every session past the liveness window. Returns the evicted
    /// sessions so callers can announce the presence transitions.
    pub async fn sweep_expired(&self) -> Vec<Session> {
        let mut sessions = self.sessions.write().await;
        let stale: Vec<Uuid> = sessions
            .iter()
            .filter(|(_, e)| e.expired(self.liveness_window))
            .map(|(id, _)| *id)
            .collect();

        let mut evicted = Vec::with_capacity(stale.len());
        for id in stale {
            if let Some(entry) = sessions.remove(&id) {
                evicted.push(entry.session);
            }
        }
        if !evicted.is_empty() {
            log::info!("Liveness sweep evicted {} session(s)", evicted.len());
        }
        evicted
    }

    /// Total tracked sessions, expired-but-unswept included.
    pub async fn count(&self) -> usize {
        self.sessions.read().await.len()
    }
}
