//! Binary wire protocol between the collaboration gateway and UI clients.
//!
//! Messages are bincode-encoded enums. A connection speaks request/response
//! for its own calls and receives pushed `Event` frames for everything the
//! subscribed organization does. Error frames carry a typed kind mirroring
//! the service error taxonomy so the UI can branch without string matching.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::bus::ChangeEvent;
use crate::conflict::{ConflictRecord, Resolution};
use crate::feed::ActivityEvent;
use crate::record::{FieldUpdates, Requirement};
use crate::service::CollabError;
use crate::session::{ActionKind, Session};

/// Requests a client may send.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ClientRequest {
    /// Subscribe this connection to an organization's change stream.
    /// Usually the first frame on a connection.
    Subscribe {
        org_id: Uuid,
        target_id: Option<Uuid>,
    },
    OpenSession {
        org_id: Uuid,
        target_id: Option<Uuid>,
        actor_id: Uuid,
        action: ActionKind,
    },
    Heartbeat {
        session_id: Uuid,
    },
    CloseSession {
        session_id: Uuid,
    },
    CreateRecord {
        org_id: Uuid,
        actor_id: Uuid,
        fields: FieldUpdates,
    },
    Write {
        org_id: Uuid,
        record_id: Uuid,
        expected_version: u64,
        actor_id: Uuid,
        updates: FieldUpdates,
    },
    Resolve {
        org_id: Uuid,
        record_id: Uuid,
        actor_id: Uuid,
        resolution: Resolution,
    },
    Ping,
}

/// Frames the server sends back (replies and pushed events).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ServerMessage {
    /// Subscription accepted: presence + feed snapshot as of now.
    Subscribed {
        sessions: Vec<Session>,
        events: Vec<ActivityEvent>,
    },
    SessionOpened {
        session: Session,
    },
    SessionClosed {
        session_id: Uuid,
    },
    RecordCreated {
        record: Requirement,
    },
    WriteCommitted {
        record: Requirement,
    },
    WriteConflict {
        conflict: ConflictRecord,
    },
    Resolved {
        record: Requirement,
    },
    /// The retried write lost another race; a fresh conflict is pending.
    ResolveConflict {
        conflict: ConflictRecord,
    },
    /// Pushed change-stream event.
    Event {
        event: ChangeEvent,
    },
    Error {
        kind: ErrorKind,
        message: String,
    },
    Pong,
}

/// Wire error kinds, mirroring `CollabError`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    Validation,
    SessionExpired,
    SubscriptionDisconnected,
    AuthorizationDenied,
    NoPendingConflict,
    Store,
}

impl From<&CollabError> for ErrorKind {
    fn from(e: &CollabError) -> Self {
        match e {
            CollabError::Validation(_) => ErrorKind::Validation,
            CollabError::SessionExpired(_) => ErrorKind::SessionExpired,
            CollabError::SubscriptionDisconnected => ErrorKind::SubscriptionDisconnected,
            CollabError::AuthorizationDenied(_) => ErrorKind::AuthorizationDenied,
            CollabError::NoPendingConflict { .. } => ErrorKind::NoPendingConflict,
            CollabError::Store(_) => ErrorKind::Store,
        }
    }
}

impl ServerMessage {
    /// Build an error frame from a service error.
    pub fn error(e: &CollabError) -> Self {
        ServerMessage::Error {
            kind: ErrorKind::from(e),
            message: e.to_string(),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(msg)
    }
}

/// Protocol errors.
#[derive(Debug, Clone)]
pub enum ProtocolError {
    SerializationError(String),
    DeserializationError(String),
    ConnectionClosed,
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SerializationError(e) => write!(f, "serialization error: {e}"),
            Self::DeserializationError(e) => write!(f, "deserialization error: {e}"),
            Self::ConnectionClosed => write!(f, "connection closed"),
        }
    }
}

impl std::error::Error for ProtocolError {}

impl ClientRequest {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(msg)
    }
}
